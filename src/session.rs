//! Per-client lifecycle engine: crediting time, the 1 Hz tick, and the
//! pause/resume/block transitions.
//!
//! The tick is the single place time advances, and it is monotonic: a
//! delayed tick still decrements by exactly one second, never by the
//! elapsed wall clock. Operators tolerate drift; they do not tolerate a
//! client revoked a minute early.
//!
//! Ordering rule for every transition: commit the database first, then
//! dispatch firewall/shaper side effects, then publish. The packet filter
//! defaults to drop, so a reader observing the new state before the rule
//! lands is safe, and a failed kernel call leaves the database as truth
//! for the reconciliation task.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::db::{self, Client, NewClient, NewTransaction};
use crate::error::{CoreError, CoreResult};
use crate::events::{EventBus, GatewayEvent};
use crate::firewall::Firewall;
use crate::identity::{fingerprint_user_agent, Identity};
use crate::metrics;
use crate::net::{NeighborTable, UNKNOWN_MAC};
use crate::shaper::{ClientLimits, Shaper};
use crate::slots::SlotManager;
use crate::types::{ClientStatus, DisconnectReason, PaymentMethod};

/// A client is considered gone from the LAN after this long without a
/// neighbor-table sighting.
const ABSENCE_THRESHOLD_SECS: i64 = 30;
/// Housekeeping (stale-client deletion, slot sweeps) runs every Nth tick.
const HOUSEKEEPING_EVERY_TICKS: u64 = 30;
/// Disconnected clients are deleted after this long off the network.
const STALE_CLIENT_AGE_SECS: i64 = 300;
/// Queued coins older than this expire during housekeeping.
const STALE_QUEUE_AGE: Duration = Duration::from_secs(3600);

pub struct SessionEngine {
    db: SqlitePool,
    firewall: Arc<dyn Firewall>,
    shaper: Arc<dyn Shaper>,
    neighbors: Arc<dyn NeighborTable>,
    bus: EventBus,
    slots: SlotManager,
    tick_count: AtomicU64,
}

impl SessionEngine {
    pub fn new(
        db: SqlitePool,
        firewall: Arc<dyn Firewall>,
        shaper: Arc<dyn Shaper>,
        neighbors: Arc<dyn NeighborTable>,
        bus: EventBus,
        slots: SlotManager,
    ) -> Self {
        Self {
            db,
            firewall,
            shaper,
            neighbors,
            bus,
            slots,
            tick_count: AtomicU64::new(0),
        }
    }

    /// Locate or create the client row for a portal visitor. The MAC wins
    /// when it resolves (it is unique); otherwise the cookie token carries
    /// identity and the MAC is learned later.
    pub async fn ensure_client(
        &self,
        identity: &Identity,
        user_agent: Option<&str>,
    ) -> CoreResult<Client> {
        let now = Utc::now();
        let ip = identity.ip_string();

        if identity.mac != UNKNOWN_MAC {
            if let Some(client) = db::get_client_by_mac(&self.db, &identity.mac).await? {
                db::touch_client(&self.db, client.id, ip.as_deref(), now).await?;
                if let Some(token) = &identity.token {
                    if client.session_token.as_deref() != Some(token.as_str()) {
                        db::set_client_token(&self.db, client.id, token).await?;
                    }
                }
                return db::get_client(&self.db, client.id)
                    .await?
                    .ok_or_else(|| CoreError::Io("client vanished".into()));
            }
        }

        if let Some(token) = &identity.token {
            if let Some(client) = db::get_client_by_token(&self.db, token).await? {
                // The MAC check above found no row, so adopting it here
                // cannot violate the unique index.
                if client.mac_address == UNKNOWN_MAC && identity.mac != UNKNOWN_MAC {
                    db::set_client_mac(&self.db, client.id, &identity.mac).await?;
                }
                db::touch_client(&self.db, client.id, ip.as_deref(), now).await?;
                return db::get_client(&self.db, client.id)
                    .await?
                    .ok_or_else(|| CoreError::Io("client vanished".into()));
            }
        }

        let (device_os, device_browser) = fingerprint_user_agent(user_agent);
        let id = db::insert_client(
            &self.db,
            &NewClient {
                mac_address: identity.mac.clone(),
                ip_address: ip,
                session_token: identity.token.clone(),
                device_os,
                device_browser,
                user_agent: user_agent.map(String::from),
            },
            now,
        )
        .await?;
        db::get_client(&self.db, id)
            .await?
            .ok_or_else(|| CoreError::Io("client vanished after insert".into()))
    }

    /// Grant `duration` seconds of access. One transaction credits the
    /// time, creates or extends the ACTIVE session, and appends the
    /// Transaction row; side effects run after commit.
    pub async fn authenticate(
        &self,
        client_id: i64,
        duration_secs: i64,
        method: PaymentMethod,
        rate_id: Option<i64>,
        amount_paid: &str,
        coins_used: i64,
    ) -> CoreResult<Client> {
        if duration_secs <= 0 {
            return Err(CoreError::InvalidInput(format!(
                "grant duration must be positive, got {duration_secs}"
            )));
        }
        let client = db::get_client(&self.db, client_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("client {client_id}")))?;
        if ClientStatus::parse(&client.status)? == ClientStatus::Blocked {
            return Err(CoreError::Forbidden(format!(
                "client {} is blocked",
                client.mac_address
            )));
        }

        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        db::credit_client_time(&mut *tx, client_id, duration_secs, amount_paid, now).await?;
        let session_id = match db::get_active_session(&mut *tx, client_id).await? {
            Some(session) => {
                db::extend_session(&mut *tx, session.id, duration_secs).await?;
                session.id
            }
            None => db::insert_session(&mut *tx, &client, duration_secs, now).await?,
        };
        db::insert_transaction(
            &mut *tx,
            &NewTransaction {
                client_id,
                session_id: Some(session_id),
                rate_id,
                amount_paid: amount_paid.to_string(),
                coins_used,
                payment_method: method.as_str().to_string(),
            },
            now,
        )
        .await?;
        tx.commit().await.map_err(CoreError::from)?;

        let client = db::get_client(&self.db, client_id)
            .await?
            .ok_or_else(|| CoreError::Io("client vanished".into()))?;
        self.open_access(&client).await;

        metrics::SESSIONS_STARTED.inc();
        self.bus.publish(GatewayEvent::ClientAuthenticated {
            mac: client.mac_address.clone(),
            ip: client.ip_address.clone(),
            time_remaining: client.time_remaining,
        });
        info!(
            mac = %client.mac_address,
            duration_secs,
            time_remaining = client.time_remaining,
            method = method.as_str(),
            "client authenticated"
        );
        Ok(client)
    }

    pub async fn disconnect(&self, client_id: i64, reason: DisconnectReason) -> CoreResult<Client> {
        let client = db::get_client(&self.db, client_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("client {client_id}")))?;

        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        db::set_client_status(&mut *tx, client_id, ClientStatus::Disconnected.as_str()).await?;
        db::zero_client_time(&mut *tx, client_id).await?;
        db::set_client_paused_until(&mut *tx, client_id, None).await?;
        db::end_active_sessions(&mut *tx, client_id, now).await?;
        tx.commit().await.map_err(CoreError::from)?;

        self.close_access(&client).await;
        self.bus.publish(GatewayEvent::ClientDisconnected {
            mac: client.mac_address.clone(),
            reason: reason.as_str().to_string(),
        });
        info!(mac = %client.mac_address, reason = reason.as_str(), "client disconnected");
        db::get_client(&self.db, client_id)
            .await?
            .ok_or_else(|| CoreError::Io("client vanished".into()))
    }

    /// CONNECTED → PAUSED, keeping the remaining time.
    pub async fn pause(&self, client_id: i64, resume_at_minutes: Option<i64>) -> CoreResult<Client> {
        let client = db::get_client(&self.db, client_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("client {client_id}")))?;
        if ClientStatus::parse(&client.status)? != ClientStatus::Connected {
            return Err(CoreError::Conflict(format!(
                "client {} is not connected",
                client.mac_address
            )));
        }

        let until = resume_at_minutes
            .filter(|m| *m > 0)
            .map(|m| Utc::now() + chrono::Duration::minutes(m));
        let mut tx = self.db.begin().await?;
        db::set_client_status(&mut *tx, client_id, ClientStatus::Paused.as_str()).await?;
        db::set_client_paused_until(&mut *tx, client_id, until).await?;
        tx.commit().await.map_err(CoreError::from)?;

        self.close_access(&client).await;
        self.bus.publish(GatewayEvent::ClientPaused {
            mac: client.mac_address.clone(),
        });
        info!(mac = %client.mac_address, "client paused");
        db::get_client(&self.db, client_id)
            .await?
            .ok_or_else(|| CoreError::Io("client vanished".into()))
    }

    /// PAUSED → CONNECTED. Requires remaining time.
    pub async fn resume(&self, client_id: i64) -> CoreResult<Client> {
        let client = db::get_client(&self.db, client_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("client {client_id}")))?;
        if ClientStatus::parse(&client.status)? != ClientStatus::Paused {
            return Err(CoreError::Conflict(format!(
                "client {} is not paused",
                client.mac_address
            )));
        }
        if client.time_remaining <= 0 {
            return Err(CoreError::Conflict(format!(
                "client {} has no time remaining",
                client.mac_address
            )));
        }

        let mut tx = self.db.begin().await?;
        db::set_client_status(&mut *tx, client_id, ClientStatus::Connected.as_str()).await?;
        db::set_client_paused_until(&mut *tx, client_id, None).await?;
        tx.commit().await.map_err(CoreError::from)?;

        let client = db::get_client(&self.db, client_id)
            .await?
            .ok_or_else(|| CoreError::Io("client vanished".into()))?;
        self.open_access(&client).await;
        self.bus.publish(GatewayEvent::ClientResumed {
            mac: client.mac_address.clone(),
        });
        info!(mac = %client.mac_address, "client resumed");
        Ok(client)
    }

    /// Permanent: revoked now, and every later authenticate fails.
    pub async fn block(&self, client_id: i64) -> CoreResult<Client> {
        let client = db::get_client(&self.db, client_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("client {client_id}")))?;

        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        db::set_client_status(&mut *tx, client_id, ClientStatus::Blocked.as_str()).await?;
        db::zero_client_time(&mut *tx, client_id).await?;
        db::set_client_whitelisted(&mut *tx, client_id, false).await?;
        db::end_active_sessions(&mut *tx, client_id, now).await?;
        tx.commit().await.map_err(CoreError::from)?;

        self.close_access(&client).await;
        self.bus.publish(GatewayEvent::ClientBlocked {
            mac: client.mac_address.clone(),
        });
        warn!(mac = %client.mac_address, "client blocked");
        db::get_client(&self.db, client_id)
            .await?
            .ok_or_else(|| CoreError::Io("client vanished".into()))
    }

    /// Whitelisted clients are granted indefinitely without a Session row
    /// and the tick never meters them.
    pub async fn set_whitelist(&self, client_id: i64, whitelisted: bool) -> CoreResult<Client> {
        let client = db::get_client(&self.db, client_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("client {client_id}")))?;
        db::set_client_whitelisted(&self.db, client_id, whitelisted).await?;
        if whitelisted {
            if let Err(e) = self.grant_mac(&client.mac_address).await {
                warn!(mac = %client.mac_address, error = %e, "whitelist grant failed; reconciliation will retry");
            }
            info!(mac = %client.mac_address, "client whitelisted");
        } else {
            self.close_access(&client).await;
            info!(mac = %client.mac_address, "client removed from whitelist");
        }
        db::get_client(&self.db, client_id)
            .await?
            .ok_or_else(|| CoreError::Io("client vanished".into()))
    }

    /// One full pass of the 1 Hz control loop, steps in fixed order.
    pub async fn tick(&self) -> CoreResult<()> {
        let now = Utc::now();
        let settings = db::get_portal_settings(&self.db).await?;
        let present = self.neighbors.present_macs().await;

        // 1. Auto-pause clients that left the LAN mid-session.
        if settings.auto_pause_on_disconnect {
            let cutoff = now - chrono::Duration::seconds(ABSENCE_THRESHOLD_SECS);
            for client in db::select_autopause_candidates(&self.db, cutoff).await? {
                let until = (settings.auto_resume_on_pause && settings.pause_resume_minutes > 0)
                    .then(|| now + chrono::Duration::minutes(settings.pause_resume_minutes));
                let mut tx = self.db.begin().await?;
                db::set_client_status(&mut *tx, client.id, ClientStatus::Paused.as_str()).await?;
                db::set_client_paused_until(&mut *tx, client.id, until).await?;
                tx.commit().await.map_err(CoreError::from)?;
                self.close_access(&client).await;
                self.bus.publish(GatewayEvent::ClientPaused {
                    mac: client.mac_address.clone(),
                });
                info!(mac = %client.mac_address, "auto-paused (device absent)");
            }
        }

        // 2. Auto-resume clients whose pause window elapsed.
        if settings.auto_resume_on_pause {
            for client in db::select_autoresume_candidates(&self.db, now).await? {
                if client.time_remaining <= 0 {
                    // Nothing left to resume into; finish the disconnect.
                    let _ = self.disconnect(client.id, DisconnectReason::TimeExpired).await;
                    continue;
                }
                let mut tx = self.db.begin().await?;
                db::set_client_status(&mut *tx, client.id, ClientStatus::Connected.as_str())
                    .await?;
                db::set_client_paused_until(&mut *tx, client.id, None).await?;
                tx.commit().await.map_err(CoreError::from)?;
                self.open_access(&client).await;
                self.bus.publish(GatewayEvent::ClientResumed {
                    mac: client.mac_address.clone(),
                });
                info!(mac = %client.mac_address, "auto-resumed");
            }
        }

        // 3. The metered second: decrement every connected client, refresh
        //    last_seen only for devices still visible on the LAN.
        db::decrement_connected_time(&self.db).await?;
        db::refresh_last_seen(&self.db, &present, now).await?;

        // 4. Expire clients that crossed zero.
        for client in db::select_connected_out_of_time(&self.db).await? {
            let mut tx = self.db.begin().await?;
            db::set_client_status(&mut *tx, client.id, ClientStatus::Disconnected.as_str())
                .await?;
            db::zero_client_time(&mut *tx, client.id).await?;
            db::end_active_sessions(&mut *tx, client.id, now).await?;
            tx.commit().await.map_err(CoreError::from)?;
            self.close_access(&client).await;
            metrics::SESSIONS_EXPIRED.inc();
            self.bus.publish(GatewayEvent::ClientDisconnected {
                mac: client.mac_address.clone(),
                reason: DisconnectReason::TimeExpired.as_str().to_string(),
            });
            info!(mac = %client.mac_address, "session expired");
        }

        // 5. Periodic housekeeping.
        let ticks = self.tick_count.fetch_add(1, Ordering::Relaxed) + 1;
        if ticks % HOUSEKEEPING_EVERY_TICKS == 0 {
            self.housekeeping(&present, now).await?;
        }

        let connected =
            db::count_clients_by_status(&self.db, ClientStatus::Connected.as_str()).await?;
        metrics::CLIENTS_CONNECTED.set(connected as f64);
        Ok(())
    }

    async fn housekeeping(&self, present: &[String], now: chrono::DateTime<Utc>) -> CoreResult<()> {
        let cutoff = now - chrono::Duration::seconds(STALE_CLIENT_AGE_SECS);
        for client in db::select_stale_disconnected(&self.db, cutoff).await? {
            if present.iter().any(|mac| *mac == client.mac_address) {
                continue;
            }
            db::delete_client(&self.db, client.id).await?;
            self.bus.publish(GatewayEvent::ClientRemoved {
                mac: client.mac_address.clone(),
            });
            info!(mac = %client.mac_address, "stale client removed");
        }
        self.slots.release_expired().await?;
        self.slots.cleanup_stale_queues(STALE_QUEUE_AGE).await?;
        Ok(())
    }

    /// Run the tick loop. A tick that overruns one second finishes, and the
    /// next tick is scheduled immediately with no pile-up.
    pub async fn run(self: Arc<Self>) -> eyre::Result<()> {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("session engine tick started");
        loop {
            interval.tick().await;
            let timer = metrics::TICK_DURATION.start_timer();
            if let Err(e) = self.tick().await {
                error!(error = %e, "tick failed; database unchanged for this second");
            }
            timer.observe_duration();
        }
    }

    /// Post-commit side effects for a newly connected client. Kernel
    /// failures are logged, never propagated: the database is truth and
    /// reconciliation heals drift.
    async fn open_access(&self, client: &Client) {
        if let Err(e) = self.grant_mac(&client.mac_address).await {
            warn!(mac = %client.mac_address, error = %e, "grant failed; reconciliation will retry");
        }
        if let Some(ip) = client_ip(client) {
            match self.per_client_limits(client).await {
                Ok(Some(limits)) => {
                    if let Err(e) = self.shaper.set_client(ip, limits).await {
                        warn!(%ip, error = %e, "shaper set_client failed");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "failed to read bandwidth config"),
            }
        }
    }

    async fn close_access(&self, client: &Client) {
        if client.mac_address != UNKNOWN_MAC {
            if let Err(e) = self.firewall.revoke(&client.mac_address).await {
                warn!(mac = %client.mac_address, error = %e, "revoke failed; reconciliation will retry");
            }
        }
        if let Some(ip) = client_ip(client) {
            if let Err(e) = self.shaper.clear_client(ip).await {
                warn!(%ip, error = %e, "shaper clear_client failed");
            }
        }
    }

    async fn grant_mac(&self, mac: &str) -> CoreResult<()> {
        if mac == UNKNOWN_MAC {
            // Nothing the kernel can match yet; the grant happens once the
            // neighbor table learns the MAC and reconciliation runs.
            return Ok(());
        }
        self.firewall.grant(mac).await
    }

    /// Effective per-client limits: the client's own override when set,
    /// else the global per-client defaults when enabled.
    async fn per_client_limits(&self, client: &Client) -> CoreResult<Option<ClientLimits>> {
        if client.download_limit > 0 || client.upload_limit > 0 {
            return Ok(Some(ClientLimits {
                download_kbps: client.download_limit.clamp(0, u32::MAX as i64) as u32,
                upload_kbps: client.upload_limit.clamp(0, u32::MAX as i64) as u32,
            }));
        }
        let config = db::get_network_config(&self.db).await?;
        if config.per_client_bandwidth_enabled
            && (config.per_client_download_limit > 0 || config.per_client_upload_limit > 0)
        {
            return Ok(Some(ClientLimits {
                download_kbps: config.per_client_download_limit.clamp(0, u32::MAX as i64) as u32,
                upload_kbps: config.per_client_upload_limit.clamp(0, u32::MAX as i64) as u32,
            }));
        }
        Ok(None)
    }
}

fn client_ip(client: &Client) -> Option<Ipv4Addr> {
    client.ip_address.as_deref().and_then(|ip| ip.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::MemoryFirewall;
    use crate::net::StaticNeighborTable;
    use crate::shaper::MemoryShaper;

    struct Harness {
        engine: Arc<SessionEngine>,
        pool: SqlitePool,
        firewall: Arc<MemoryFirewall>,
        neighbors: Arc<StaticNeighborTable>,
    }

    async fn setup() -> Harness {
        let pool = db::create_pool("sqlite::memory:").await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        let firewall = Arc::new(MemoryFirewall::new());
        let shaper = Arc::new(MemoryShaper::new());
        let neighbors = Arc::new(StaticNeighborTable::new());
        let bus = EventBus::new();
        let slots = SlotManager::new(pool.clone(), bus.clone());
        let engine = Arc::new(SessionEngine::new(
            pool.clone(),
            firewall.clone(),
            shaper,
            neighbors.clone(),
            bus,
            slots,
        ));
        Harness {
            engine,
            pool,
            firewall,
            neighbors,
        }
    }

    async fn make_client(h: &Harness, mac: &str, ip: &str, token: &str) -> Client {
        let id = db::insert_client(
            &h.pool,
            &NewClient {
                mac_address: mac.to_string(),
                ip_address: Some(ip.to_string()),
                session_token: Some(token.to_string()),
                device_os: None,
                device_browser: None,
                user_agent: None,
            },
            Utc::now(),
        )
        .await
        .unwrap();
        h.neighbors.insert(ip.parse().unwrap(), mac).await;
        db::get_client(&h.pool, id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_authenticate_credits_time_and_grants() {
        let h = setup().await;
        let client = make_client(&h, "AA:BB:CC:11:22:33", "10.0.0.12", "t1").await;

        let updated = h
            .engine
            .authenticate(client.id, 900, PaymentMethod::Coin, Some(1), "5", 1)
            .await
            .unwrap();
        assert_eq!(updated.status, "CONNECTED");
        assert_eq!(updated.time_remaining, 900);
        assert!(h.firewall.is_granted("AA:BB:CC:11:22:33"));

        let session = db::get_active_session(&h.pool, client.id).await.unwrap().unwrap();
        assert_eq!(session.granted_duration, 900);
        let txs = db::list_recent_transactions(&h.pool, 10).await.unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].amount_paid, "5");
    }

    #[tokio::test]
    async fn test_authenticate_extends_active_session() {
        let h = setup().await;
        let client = make_client(&h, "AA:BB:CC:11:22:33", "10.0.0.12", "t1").await;
        h.engine
            .authenticate(client.id, 900, PaymentMethod::Coin, Some(1), "5", 1)
            .await
            .unwrap();
        let updated = h
            .engine
            .authenticate(client.id, 900, PaymentMethod::Coin, Some(1), "5", 1)
            .await
            .unwrap();
        assert_eq!(updated.time_remaining, 1800);
        let session = db::get_active_session(&h.pool, client.id).await.unwrap().unwrap();
        assert_eq!(session.granted_duration, 1800);
    }

    #[tokio::test]
    async fn test_blocked_client_cannot_authenticate() {
        let h = setup().await;
        let client = make_client(&h, "AA:BB:CC:11:22:33", "10.0.0.12", "t1").await;
        h.engine.block(client.id).await.unwrap();
        let err = h
            .engine
            .authenticate(client.id, 900, PaymentMethod::Coin, None, "5", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Forbidden(_)));
        assert!(!h.firewall.is_granted("AA:BB:CC:11:22:33"));
    }

    #[tokio::test]
    async fn test_tick_decrements_exactly_one() {
        let h = setup().await;
        let client = make_client(&h, "AA:BB:CC:11:22:33", "10.0.0.12", "t1").await;
        h.engine
            .authenticate(client.id, 10, PaymentMethod::Admin, None, "0", 0)
            .await
            .unwrap();

        h.engine.tick().await.unwrap();
        let after = db::get_client(&h.pool, client.id).await.unwrap().unwrap();
        assert_eq!(after.time_remaining, 9);
        h.engine.tick().await.unwrap();
        let after = db::get_client(&h.pool, client.id).await.unwrap().unwrap();
        assert_eq!(after.time_remaining, 8);
    }

    #[tokio::test]
    async fn test_expiry_disconnects_and_revokes_once() {
        let h = setup().await;
        let client = make_client(&h, "AA:BB:CC:11:22:33", "10.0.0.12", "t1").await;
        h.engine
            .authenticate(client.id, 2, PaymentMethod::Coin, Some(1), "5", 1)
            .await
            .unwrap();

        h.engine.tick().await.unwrap(); // 1 left
        h.engine.tick().await.unwrap(); // 0 left, expired in same pass
        let after = db::get_client(&h.pool, client.id).await.unwrap().unwrap();
        assert_eq!(after.status, "DISCONNECTED");
        assert_eq!(after.time_remaining, 0);
        assert_eq!(h.firewall.revoke_calls("AA:BB:CC:11:22:33"), 1);
        assert!(!h.firewall.is_granted("AA:BB:CC:11:22:33"));
        assert!(db::get_active_session(&h.pool, client.id).await.unwrap().is_none());

        // Further ticks change nothing.
        h.engine.tick().await.unwrap();
        let again = db::get_client(&h.pool, client.id).await.unwrap().unwrap();
        assert_eq!(again.status, "DISCONNECTED");
        assert_eq!(h.firewall.revoke_calls("AA:BB:CC:11:22:33"), 1);
    }

    #[tokio::test]
    async fn test_never_connected_below_zero() {
        let h = setup().await;
        let client = make_client(&h, "AA:BB:CC:11:22:33", "10.0.0.12", "t1").await;
        h.engine
            .authenticate(client.id, 3, PaymentMethod::Coin, Some(1), "5", 1)
            .await
            .unwrap();
        for _ in 0..10 {
            h.engine.tick().await.unwrap();
            let c = db::get_client(&h.pool, client.id).await.unwrap().unwrap();
            assert!(c.time_remaining >= 0);
            if c.time_remaining == 0 {
                assert_ne!(c.status, "CONNECTED");
            }
        }
    }

    #[tokio::test]
    async fn test_pause_keeps_time_and_revokes() {
        let h = setup().await;
        let client = make_client(&h, "AA:BB:CC:11:22:33", "10.0.0.12", "t1").await;
        h.engine
            .authenticate(client.id, 600, PaymentMethod::Coin, Some(1), "5", 1)
            .await
            .unwrap();

        let paused = h.engine.pause(client.id, None).await.unwrap();
        assert_eq!(paused.status, "PAUSED");
        assert_eq!(paused.time_remaining, 600);
        assert!(!h.firewall.is_granted("AA:BB:CC:11:22:33"));

        // Paused clients are not decremented.
        h.engine.tick().await.unwrap();
        let still = db::get_client(&h.pool, client.id).await.unwrap().unwrap();
        assert_eq!(still.time_remaining, 600);

        let resumed = h.engine.resume(client.id).await.unwrap();
        assert_eq!(resumed.status, "CONNECTED");
        assert!(h.firewall.is_granted("AA:BB:CC:11:22:33"));
    }

    #[tokio::test]
    async fn test_auto_pause_when_device_absent() {
        let h = setup().await;
        let client = make_client(&h, "AA:BB:CC:11:22:33", "10.0.0.12", "t1").await;
        h.engine
            .authenticate(client.id, 600, PaymentMethod::Coin, Some(1), "5", 1)
            .await
            .unwrap();

        // Device drops off the LAN and last_seen goes stale.
        h.neighbors.remove("10.0.0.12".parse().unwrap()).await;
        let stale = Utc::now() - chrono::Duration::seconds(60);
        sqlx::query("UPDATE clients SET last_seen = ? WHERE id = ?")
            .bind(stale)
            .bind(client.id)
            .execute(&h.pool)
            .await
            .unwrap();

        h.engine.tick().await.unwrap();
        let after = db::get_client(&h.pool, client.id).await.unwrap().unwrap();
        assert_eq!(after.status, "PAUSED");
        assert_eq!(after.time_remaining, 600);
        assert!(!h.firewall.is_granted("AA:BB:CC:11:22:33"));
    }

    #[tokio::test]
    async fn test_auto_resume_after_pause_window() {
        let h = setup().await;
        let client = make_client(&h, "AA:BB:CC:11:22:33", "10.0.0.12", "t1").await;
        h.engine
            .authenticate(client.id, 600, PaymentMethod::Coin, Some(1), "5", 1)
            .await
            .unwrap();
        h.engine.pause(client.id, Some(1)).await.unwrap();

        // Pretend the window elapsed.
        let past = Utc::now() - chrono::Duration::seconds(5);
        sqlx::query("UPDATE clients SET paused_until = ? WHERE id = ?")
            .bind(past)
            .bind(client.id)
            .execute(&h.pool)
            .await
            .unwrap();

        h.engine.tick().await.unwrap();
        let after = db::get_client(&h.pool, client.id).await.unwrap().unwrap();
        assert_eq!(after.status, "CONNECTED");
        assert!(h.firewall.is_granted("AA:BB:CC:11:22:33"));
    }

    #[tokio::test]
    async fn test_whitelisted_client_not_metered() {
        let h = setup().await;
        let client = make_client(&h, "AA:BB:CC:11:22:33", "10.0.0.12", "t1").await;
        h.engine
            .authenticate(client.id, 5, PaymentMethod::Admin, None, "0", 0)
            .await
            .unwrap();
        h.engine.set_whitelist(client.id, true).await.unwrap();

        for _ in 0..8 {
            h.engine.tick().await.unwrap();
        }
        let after = db::get_client(&h.pool, client.id).await.unwrap().unwrap();
        assert_eq!(after.time_remaining, 5, "whitelisted time must not decrement");
        assert_eq!(after.status, "CONNECTED");
        assert!(h.firewall.is_granted("AA:BB:CC:11:22:33"));
    }

    #[tokio::test]
    async fn test_ensure_client_learns_mac_for_token_row() {
        let h = setup().await;
        let identity_unknown = Identity {
            ip: Some("10.0.0.40".parse().unwrap()),
            mac: UNKNOWN_MAC.to_string(),
            token: Some("tok-x".to_string()),
            minted: false,
        };
        let created = h.engine.ensure_client(&identity_unknown, None).await.unwrap();
        assert_eq!(created.mac_address, UNKNOWN_MAC);

        let identity_known = Identity {
            ip: Some("10.0.0.40".parse().unwrap()),
            mac: "AA:BB:CC:77:88:99".to_string(),
            token: Some("tok-x".to_string()),
            minted: false,
        };
        let found = h.engine.ensure_client(&identity_known, None).await.unwrap();
        assert_eq!(found.id, created.id);
        assert_eq!(found.mac_address, "AA:BB:CC:77:88:99");
    }
}
