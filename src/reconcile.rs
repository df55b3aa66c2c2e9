//! Periodic drift correction between the store and the kernel.
//!
//! The database is truth: a grant or revoke that failed mid-flight (or an
//! operator poking iptables by hand) leaves the packet filter diverged.
//! Every pass compares `Firewall::list_authorized()` against the clients
//! that should be forwarding and corrects both directions, then re-asserts
//! the per-client shaping tree.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tracing::{error, info, warn};

use crate::db;
use crate::error::CoreResult;
use crate::firewall::Firewall;
use crate::metrics;
use crate::net::UNKNOWN_MAC;
use crate::shaper::{ClientLimits, Shaper};

const RECONCILE_PERIOD: Duration = Duration::from_secs(60);

pub struct Reconciler {
    db: SqlitePool,
    firewall: Arc<dyn Firewall>,
    shaper: Arc<dyn Shaper>,
}

impl Reconciler {
    pub fn new(db: SqlitePool, firewall: Arc<dyn Firewall>, shaper: Arc<dyn Shaper>) -> Self {
        Self {
            db,
            firewall,
            shaper,
        }
    }

    pub async fn run(self: Arc<Self>) -> eyre::Result<()> {
        let mut interval = tokio::time::interval(RECONCILE_PERIOD);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("reconciliation task started");
        loop {
            interval.tick().await;
            if let Err(e) = self.pass().await {
                error!(error = %e, "reconciliation pass failed");
            }
        }
    }

    /// One compare-and-correct pass. Returns the number of corrections.
    pub async fn pass(&self) -> CoreResult<u64> {
        let authorized_clients = db::select_authorized_clients(&self.db).await?;
        let wanted: BTreeSet<String> = authorized_clients
            .iter()
            .map(|c| c.mac_address.clone())
            .filter(|mac| mac != UNKNOWN_MAC)
            .collect();
        let actual: BTreeSet<String> = self.firewall.list_authorized().await?.into_iter().collect();

        let mut corrections = 0u64;
        for mac in wanted.difference(&actual) {
            warn!(mac = %mac, "kernel missing grant; re-applying");
            if self.firewall.grant(mac).await.is_ok() {
                corrections += 1;
            }
        }
        for mac in actual.difference(&wanted) {
            warn!(mac = %mac, "kernel holds stray grant; revoking");
            if self.firewall.revoke(mac).await.is_ok() {
                corrections += 1;
            }
        }

        // Re-assert shaping for the clients that carry limits.
        let config = db::get_network_config(&self.db).await?;
        let mut shaped: Vec<(std::net::Ipv4Addr, ClientLimits)> = Vec::new();
        for client in &authorized_clients {
            let ip = match client.ip_address.as_deref().and_then(|ip| ip.parse().ok()) {
                Some(ip) => ip,
                None => continue,
            };
            let limits = if client.download_limit > 0 || client.upload_limit > 0 {
                ClientLimits {
                    download_kbps: client.download_limit.clamp(0, u32::MAX as i64) as u32,
                    upload_kbps: client.upload_limit.clamp(0, u32::MAX as i64) as u32,
                }
            } else if config.per_client_bandwidth_enabled
                && (config.per_client_download_limit > 0 || config.per_client_upload_limit > 0)
            {
                ClientLimits {
                    download_kbps: config.per_client_download_limit.clamp(0, u32::MAX as i64)
                        as u32,
                    upload_kbps: config.per_client_upload_limit.clamp(0, u32::MAX as i64) as u32,
                }
            } else {
                continue;
            };
            shaped.push((ip, limits));
        }
        if let Err(e) = self.shaper.reconcile(&shaped).await {
            warn!(error = %e, "shaper reconcile failed");
        }

        if corrections > 0 {
            metrics::RECONCILE_CORRECTIONS.inc_by(corrections as f64);
            info!(corrections, "kernel state corrected");
        }
        Ok(corrections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewClient;
    use crate::events::EventBus;
    use crate::firewall::MemoryFirewall;
    use crate::net::StaticNeighborTable;
    use crate::session::SessionEngine;
    use crate::shaper::MemoryShaper;
    use crate::slots::SlotManager;
    use crate::types::PaymentMethod;
    use chrono::Utc;

    #[tokio::test]
    async fn test_pass_heals_missing_and_stray_grants() {
        let pool = db::create_pool("sqlite::memory:").await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        let firewall = Arc::new(MemoryFirewall::new());
        let shaper = Arc::new(MemoryShaper::new());
        let neighbors = Arc::new(StaticNeighborTable::new());
        let bus = EventBus::new();
        let slots = SlotManager::new(pool.clone(), bus.clone());
        let engine = SessionEngine::new(
            pool.clone(),
            firewall.clone(),
            shaper.clone(),
            neighbors,
            bus,
            slots,
        );

        let id = db::insert_client(
            &pool,
            &NewClient {
                mac_address: "AA:BB:CC:11:22:33".into(),
                ip_address: Some("10.0.0.12".into()),
                session_token: Some("t1".into()),
                device_os: None,
                device_browser: None,
                user_agent: None,
            },
            Utc::now(),
        )
        .await
        .unwrap();
        engine
            .authenticate(id, 900, PaymentMethod::Coin, Some(1), "5", 1)
            .await
            .unwrap();

        // Simulate a flushed kernel plus a stray rule someone added by hand.
        firewall.force_remove("AA:BB:CC:11:22:33");
        firewall.grant("DE:AD:BE:EF:00:99").await.unwrap();

        let reconciler = Reconciler::new(pool, firewall.clone(), shaper);
        let corrections = reconciler.pass().await.unwrap();
        assert_eq!(corrections, 2);
        assert!(firewall.is_granted("AA:BB:CC:11:22:33"));
        assert!(!firewall.is_granted("DE:AD:BE:EF:00:99"));
    }
}
