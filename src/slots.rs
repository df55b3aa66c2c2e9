//! The coin-slot claim protocol.
//!
//! Coin pulses arrive asynchronously and belong to whoever is standing at
//! the machine, not to any logged-in client. The portal therefore claims a
//! slot first (a bounded exclusive lease); pulses arriving during the lease
//! land in that slot's queue; redeem converts queue to time. Preserve-on-
//! release keeps the queue rows bound to the client identifiers so a page
//! reload mid-insertion loses nothing.

use std::str::FromStr;
use std::time::Duration;

use bigdecimal::BigDecimal;
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::db::{self, CoinQueueEntry, CoinSlot, Rate};
use crate::error::{CoreError, CoreResult};
use crate::events::{EventBus, GatewayEvent};
use crate::identity::Identity;
use crate::metrics;
use crate::net::UNKNOWN_MAC;

pub const MAX_SLOT_NUMBER: i64 = 10;
pub const MAX_COIN_VALUE: i64 = 1000;
pub const MAX_COIN_COUNT: i64 = 1000;

/// The identifier triple a slot operation matches on. A queue entry or
/// claim "belongs" to a client when any of (ip, mac, token) matches, with
/// the literal `Unknown` MAC never matching anything.
#[derive(Debug, Clone)]
pub struct Claimant {
    pub ip: Option<String>,
    pub mac: String,
    pub token: Option<String>,
}

impl From<&Identity> for Claimant {
    fn from(identity: &Identity) -> Self {
        Claimant {
            ip: identity.ip_string(),
            mac: identity.mac.clone(),
            token: identity.token.clone(),
        }
    }
}

impl Claimant {
    fn owns_slot(&self, slot: &CoinSlot) -> bool {
        let ip_match = matches!(
            (&slot.claimed_by_ip, &self.ip),
            (Some(a), Some(b)) if a == b
        );
        let token_match = matches!(
            (&slot.claimed_by_session_token, &self.token),
            (Some(a), Some(b)) if a == b
        );
        let mac_match =
            self.mac != UNKNOWN_MAC && slot.claimed_by_mac.as_deref() == Some(self.mac.as_str());
        ip_match || token_match || mac_match
    }
}

/// Read-only snapshot returned by `my_slot`.
#[derive(Debug, Clone)]
pub struct SlotView {
    pub claim: Option<CoinSlot>,
    pub queued_total: BigDecimal,
}

/// Result of a successful redeem.
#[derive(Debug, Clone)]
pub struct Redemption {
    pub granted_duration: i64,
    pub amount_charged: BigDecimal,
    pub change: BigDecimal,
    pub coins_used: i64,
    pub rate_id: i64,
}

pub fn parse_money(raw: &str) -> CoreResult<BigDecimal> {
    BigDecimal::from_str(raw.trim())
        .map_err(|_| CoreError::InvalidInput(format!("malformed decimal amount: {raw:?}")))
}

fn sum_entries(entries: &[CoinQueueEntry]) -> CoreResult<BigDecimal> {
    let mut total = BigDecimal::from(0);
    for entry in entries {
        total += parse_money(&entry.total_value)
            .map_err(|_| CoreError::Io(format!("corrupt queue entry {}", entry.id)))?;
    }
    Ok(total)
}

fn validate_slot_number(slot_number: i64) -> CoreResult<i64> {
    if (1..=MAX_SLOT_NUMBER).contains(&slot_number) {
        Ok(slot_number)
    } else {
        Err(CoreError::InvalidInput(format!(
            "slot number out of range 1..{MAX_SLOT_NUMBER}: {slot_number}"
        )))
    }
}

#[derive(Clone)]
pub struct SlotManager {
    db: SqlitePool,
    bus: EventBus,
}

impl SlotManager {
    pub fn new(db: SqlitePool, bus: EventBus) -> Self {
        Self { db, bus }
    }

    /// Exclusive claim of a coin acceptor. Expired leases are swept first
    /// so a stale claim never blocks the next buyer.
    pub async fn claim(&self, slot_number: i64, claimant: &Claimant) -> CoreResult<CoinSlot> {
        validate_slot_number(slot_number)?;
        self.check_abuse(claimant).await?;
        self.release_expired().await?;

        let settings = db::get_portal_settings(&self.db).await?;
        let now = Utc::now();
        let expires_at = now + chrono::Duration::seconds(settings.coin_timeout.max(1));

        let mut tx = self.db.begin().await?;
        let claimed = db::try_claim_slot(
            &mut *tx,
            slot_number,
            claimant.ip.as_deref(),
            &claimant.mac,
            claimant.token.as_deref(),
            now,
            expires_at,
        )
        .await?;
        if !claimed {
            let slot = db::get_slot(&mut *tx, slot_number).await?;
            tx.rollback().await.map_err(CoreError::from)?;
            return match slot {
                None => Err(CoreError::NotFound(format!("slot {slot_number}"))),
                Some(_) => Err(CoreError::Conflict(format!(
                    "slot {slot_number} is claimed by another user"
                ))),
            };
        }
        let slot = db::get_slot(&mut *tx, slot_number)
            .await?
            .ok_or_else(|| CoreError::Io("claimed slot vanished".into()))?;
        tx.commit().await.map_err(CoreError::from)?;

        self.bus.publish(GatewayEvent::SlotClaimed {
            slot_number,
            ip: claimant.ip.clone(),
        });
        info!(slot_number, ip = ?claimant.ip, mac = %claimant.mac, "slot claimed");
        Ok(slot)
    }

    /// Release a slot. Identity divergence is logged but still releases;
    /// this is the cleanup path for crashed portal pages. With
    /// `preserve_queue` the queued coins detach from the slot and stay
    /// bound to the client identifiers.
    pub async fn release(
        &self,
        slot_number: i64,
        claimant: &Claimant,
        preserve_queue: bool,
    ) -> CoreResult<()> {
        validate_slot_number(slot_number)?;

        let mut tx = self.db.begin().await?;
        let slot = db::get_slot(&mut *tx, slot_number)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("slot {slot_number}")))?;

        if slot.status == "claimed" && !claimant.owns_slot(&slot) {
            warn!(
                slot_number,
                claimed_by_ip = ?slot.claimed_by_ip,
                releasing_ip = ?claimant.ip,
                "releasing a slot claimed by a different identity"
            );
        }
        if preserve_queue {
            db::detach_entries_for_slot(&mut *tx, slot.id).await?;
        }
        db::release_slot(&mut *tx, slot_number).await?;
        tx.commit().await.map_err(CoreError::from)?;

        self.bus.publish(GatewayEvent::SlotReleased { slot_number });
        Ok(())
    }

    /// Record an accepted coin. The caller must hold the slot claim; any
    /// preserved queue entries of the same client are re-attached first so
    /// the returned total covers everything the client has paid.
    pub async fn add_coin(
        &self,
        slot_number: i64,
        claimant: &Claimant,
        coin_value: &BigDecimal,
        coin_count: i64,
    ) -> CoreResult<BigDecimal> {
        validate_slot_number(slot_number)?;
        if coin_value <= &BigDecimal::from(0) || coin_value > &BigDecimal::from(MAX_COIN_VALUE) {
            return Err(CoreError::InvalidInput(format!(
                "coin value out of range (0, {MAX_COIN_VALUE}]: {coin_value}"
            )));
        }
        if !(1..=MAX_COIN_COUNT).contains(&coin_count) {
            return Err(CoreError::InvalidInput(format!(
                "coin count out of range 1..{MAX_COIN_COUNT}: {coin_count}"
            )));
        }
        self.check_abuse(claimant).await?;

        let now = Utc::now();
        let total_value = coin_value * BigDecimal::from(coin_count);

        let mut tx = self.db.begin().await?;
        let slot = db::get_slot(&mut *tx, slot_number)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("slot {slot_number}")))?;
        if slot.status != "claimed" || !claimant.owns_slot(&slot) {
            tx.rollback().await.map_err(CoreError::from)?;
            return Err(CoreError::Forbidden(format!(
                "slot {slot_number} is not claimed by this client"
            )));
        }

        db::attach_preserved_entries(
            &mut *tx,
            slot.id,
            claimant.ip.as_deref(),
            &claimant.mac,
            claimant.token.as_deref(),
        )
        .await?;
        db::insert_queue_entry(
            &mut *tx,
            Some(slot.id),
            claimant.ip.as_deref(),
            &claimant.mac,
            claimant.token.as_deref(),
            &coin_value.to_string(),
            coin_count,
            &total_value.to_string(),
            now,
        )
        .await?;
        let entries = db::queued_entries_for(
            &mut *tx,
            claimant.ip.as_deref(),
            &claimant.mac,
            claimant.token.as_deref(),
        )
        .await?;
        let queued_total = sum_entries(&entries)?;
        tx.commit().await.map_err(CoreError::from)?;

        metrics::COINS_INSERTED.inc();
        if let Some(value) = bigdecimal::ToPrimitive::to_f64(&total_value) {
            metrics::COIN_VALUE.inc_by(value);
        }
        self.bus.publish(GatewayEvent::CoinsInserted {
            slot_number,
            value: total_value.to_string(),
            queued_total: queued_total.to_string(),
        });
        info!(slot_number, value = %total_value, total = %queued_total, "coin accepted");
        Ok(queued_total)
    }

    /// Read-only snapshot: the slot held by this client (if any) and the
    /// queued total across all identifiers.
    pub async fn my_slot(&self, claimant: &Claimant) -> CoreResult<SlotView> {
        let slots = db::list_slots(&self.db).await?;
        let claim = slots
            .into_iter()
            .filter(|s| s.status == "claimed")
            .find(|s| claimant.owns_slot(s));
        let entries = db::queued_entries_for(
            &self.db,
            claimant.ip.as_deref(),
            &claimant.mac,
            claimant.token.as_deref(),
        )
        .await?;
        Ok(SlotView {
            claim,
            queued_total: sum_entries(&entries)?,
        })
    }

    /// Atomically exchange the queued total for time at the given rate.
    /// Change is pocketed as a fresh slot-less queue entry for the next
    /// purchase; every slot held by the client is released.
    pub async fn redeem(&self, claimant: &Claimant, rate: &Rate) -> CoreResult<Redemption> {
        let price = parse_money(&rate.price)?;
        let now = Utc::now();

        let mut tx = self.db.begin().await?;
        let entries = db::queued_entries_for(
            &mut *tx,
            claimant.ip.as_deref(),
            &claimant.mac,
            claimant.token.as_deref(),
        )
        .await?;
        let total = sum_entries(&entries)?;
        if total < price {
            tx.rollback().await.map_err(CoreError::from)?;
            return Err(CoreError::InsufficientFunds {
                have: total.to_string(),
                need: price.to_string(),
            });
        }

        let ids: Vec<i64> = entries.iter().map(|e| e.id).collect();
        db::mark_entries_redeemed(&mut *tx, &ids).await?;

        let change = &total - &price;
        if change > BigDecimal::from(0) {
            db::insert_queue_entry(
                &mut *tx,
                None,
                claimant.ip.as_deref(),
                &claimant.mac,
                claimant.token.as_deref(),
                &change.to_string(),
                1,
                &change.to_string(),
                now,
            )
            .await?;
        }
        db::release_slots_claimed_by(
            &mut *tx,
            claimant.ip.as_deref(),
            &claimant.mac,
            claimant.token.as_deref(),
        )
        .await?;
        tx.commit().await.map_err(CoreError::from)?;

        let coins_used: i64 = entries.iter().map(|e| e.coin_count).sum();
        metrics::REDEEMS.inc();
        self.bus.publish(GatewayEvent::CoinsRedeemed {
            mac: claimant.mac.clone(),
            amount: price.to_string(),
            duration_secs: rate.duration,
            change: change.to_string(),
        });
        info!(
            mac = %claimant.mac,
            charged = %price,
            change = %change,
            duration = rate.duration,
            "coins redeemed"
        );
        Ok(Redemption {
            granted_duration: rate.duration,
            amount_charged: price,
            change,
            coins_used,
            rate_id: rate.id,
        })
    }

    /// Sweep claims whose lease expired. Queue entries are untouched; they
    /// remain queued and findable by identifier.
    pub async fn release_expired(&self) -> CoreResult<u64> {
        let released = db::release_expired_slots(&self.db, Utc::now()).await?;
        if released > 0 {
            info!(released, "expired slot claims released");
        }
        Ok(released)
    }

    /// Expire queued coins older than `max_age`. This is the only way a
    /// paid coin loses value; the default horizon is one hour.
    pub async fn cleanup_stale_queues(&self, max_age: Duration) -> CoreResult<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::hours(1));
        let expired = db::expire_stale_queue_entries(&self.db, cutoff).await?;
        if expired > 0 {
            warn!(expired, "stale queued coins expired");
        }
        Ok(expired)
    }

    /// Advisory per-(ip, mac) attempt guard. Exceeding the limit blocks the
    /// source for a configured duration but never revokes existing credits.
    async fn check_abuse(&self, claimant: &Claimant) -> CoreResult<()> {
        let settings = db::get_portal_settings(&self.db).await?;
        if !settings.coin_abuse_protection {
            return Ok(());
        }
        let ip = claimant.ip.as_deref().unwrap_or("unknown");
        let now = Utc::now();

        if let Some(attempt) = db::get_coin_attempt(&self.db, ip, &claimant.mac).await? {
            if let Some(blocked_until) = attempt.blocked_until {
                if blocked_until > now {
                    return Err(CoreError::TooManyAttempts {
                        retry_after_secs: (blocked_until - now).num_seconds().max(1),
                    });
                }
            }
            let window_age = now - attempt.window_start;
            if window_age.num_seconds() >= settings.coin_attempt_window {
                db::reset_coin_attempt(&self.db, ip, &claimant.mac, now).await?;
                return Ok(());
            }
            let attempts = db::bump_coin_attempt(&self.db, ip, &claimant.mac).await?;
            if attempts > settings.coin_attempt_limit {
                let until = now + chrono::Duration::seconds(settings.coin_block_duration.max(1));
                db::block_coin_attempts(&self.db, ip, &claimant.mac, until).await?;
                warn!(ip, mac = %claimant.mac, attempts, "coin abuse guard tripped");
                return Err(CoreError::TooManyAttempts {
                    retry_after_secs: settings.coin_block_duration.max(1),
                });
            }
            Ok(())
        } else {
            db::reset_coin_attempt(&self.db, ip, &claimant.mac, now).await?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> (SlotManager, SqlitePool) {
        let pool = db::create_pool("sqlite::memory:").await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        let manager = SlotManager::new(pool.clone(), EventBus::new());
        (manager, pool)
    }

    fn claimant_a() -> Claimant {
        Claimant {
            ip: Some("10.0.0.12".into()),
            mac: "AA:BB:CC:11:22:33".into(),
            token: Some("t1".into()),
        }
    }

    fn claimant_b() -> Claimant {
        Claimant {
            ip: Some("10.0.0.13".into()),
            mac: "AA:BB:CC:44:55:66".into(),
            token: Some("t2".into()),
        }
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let (manager, _pool) = setup().await;
        manager.claim(1, &claimant_a()).await.unwrap();
        let err = manager.claim(1, &claimant_b()).await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_claim_unknown_slot_is_not_found() {
        let (manager, _pool) = setup().await;
        let err = manager.claim(7, &claimant_a()).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
        let err = manager.claim(0, &claimant_a()).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
        let err = manager.claim(11, &claimant_a()).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_add_coin_requires_ownership() {
        let (manager, _pool) = setup().await;
        manager.claim(1, &claimant_a()).await.unwrap();
        let err = manager
            .add_coin(1, &claimant_b(), &BigDecimal::from(5), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_unknown_mac_never_matches_unknown_claim() {
        let (manager, _pool) = setup().await;
        let anon_a = Claimant {
            ip: Some("10.0.0.20".into()),
            mac: UNKNOWN_MAC.into(),
            token: Some("ta".into()),
        };
        let anon_b = Claimant {
            ip: Some("10.0.0.21".into()),
            mac: UNKNOWN_MAC.into(),
            token: Some("tb".into()),
        };
        manager.claim(1, &anon_a).await.unwrap();
        // Same 'Unknown' MAC is not an identifier match for anyone else.
        let err = manager
            .add_coin(1, &anon_b, &BigDecimal::from(5), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Forbidden(_)));
        // The real claimant still owns the slot via ip/token.
        manager
            .add_coin(1, &anon_a, &BigDecimal::from(5), 1)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_preserve_on_release_keeps_value() {
        let (manager, _pool) = setup().await;
        let a = claimant_a();
        manager.claim(1, &a).await.unwrap();
        manager.add_coin(1, &a, &BigDecimal::from(5), 1).await.unwrap();

        // Page reload: release preserving the queue, then claim again.
        manager.release(1, &a, true).await.unwrap();
        manager.claim(1, &a).await.unwrap();
        let view = manager.my_slot(&a).await.unwrap();
        assert_eq!(view.queued_total, BigDecimal::from(5));
        assert!(view.claim.is_some());

        // Another coin lands on top of the preserved value.
        let total = manager.add_coin(1, &a, &BigDecimal::from(5), 1).await.unwrap();
        assert_eq!(total, BigDecimal::from(10));
    }

    #[tokio::test]
    async fn test_queues_are_isolated_between_clients() {
        let (manager, pool) = setup().await;
        let a = claimant_a();
        let b = claimant_b();
        manager.claim(1, &a).await.unwrap();
        manager.add_coin(1, &a, &BigDecimal::from(5), 1).await.unwrap();
        manager.release(1, &a, true).await.unwrap();

        manager.claim(1, &b).await.unwrap();
        let total_b = manager.add_coin(1, &b, &BigDecimal::from(1), 1).await.unwrap();
        assert_eq!(total_b, BigDecimal::from(1));

        let view_a = manager.my_slot(&a).await.unwrap();
        assert_eq!(view_a.queued_total, BigDecimal::from(5));

        // A's preserved entry must not have been attached to B's claim.
        let entries = db::queued_entries_for(&pool, a.ip.as_deref(), &a.mac, a.token.as_deref())
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].slot_id.is_none());
    }

    #[tokio::test]
    async fn test_redeem_with_change() {
        let (manager, pool) = setup().await;
        let a = claimant_a();
        manager.claim(1, &a).await.unwrap();
        manager.add_coin(1, &a, &BigDecimal::from(5), 1).await.unwrap();
        manager.add_coin(1, &a, &BigDecimal::from(5), 1).await.unwrap();
        manager.add_coin(1, &a, &BigDecimal::from(2), 1).await.unwrap();

        let rate = db::get_active_rate(&pool, 2).await.unwrap().unwrap();
        assert_eq!(rate.price, "10");
        let redemption = manager.redeem(&a, &rate).await.unwrap();
        assert_eq!(redemption.amount_charged, BigDecimal::from(10));
        assert_eq!(redemption.change, BigDecimal::from(2));
        assert_eq!(redemption.granted_duration, 2100);

        // Change is pocketed as a fresh queued entry with no slot.
        let view = manager.my_slot(&a).await.unwrap();
        assert_eq!(view.queued_total, BigDecimal::from(2));
        assert!(view.claim.is_none(), "redeem must release held slots");
    }

    #[tokio::test]
    async fn test_redeem_insufficient_funds() {
        let (manager, pool) = setup().await;
        let a = claimant_a();
        manager.claim(1, &a).await.unwrap();
        manager.add_coin(1, &a, &BigDecimal::from(2), 1).await.unwrap();

        let rate = db::get_active_rate(&pool, 1).await.unwrap().unwrap();
        let err = manager.redeem(&a, &rate).await.unwrap_err();
        match err {
            CoreError::InsufficientFunds { have, need } => {
                assert_eq!(have, "2");
                assert_eq!(need, "5");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // Credits survive a failed redeem.
        let view = manager.my_slot(&a).await.unwrap();
        assert_eq!(view.queued_total, BigDecimal::from(2));
    }

    #[tokio::test]
    async fn test_redeem_total_matches_sum_of_inserts_across_release() {
        let (manager, pool) = setup().await;
        let a = claimant_a();
        manager.claim(1, &a).await.unwrap();
        manager.add_coin(1, &a, &BigDecimal::from(5), 1).await.unwrap();
        manager.release(1, &a, true).await.unwrap();
        manager.claim(1, &a).await.unwrap();
        manager.add_coin(1, &a, &BigDecimal::from(5), 1).await.unwrap();

        let rate = db::get_active_rate(&pool, 2).await.unwrap().unwrap();
        let redemption = manager.redeem(&a, &rate).await.unwrap();
        assert_eq!(redemption.amount_charged, BigDecimal::from(10));
        assert_eq!(redemption.change, BigDecimal::from(0));
        assert_eq!(redemption.coins_used, 2);
    }

    #[tokio::test]
    async fn test_expired_claim_is_swept_before_claiming() {
        let (manager, pool) = setup().await;
        // Force an expired lease directly.
        let past = Utc::now() - chrono::Duration::seconds(30);
        sqlx::query(
            "UPDATE coin_slots SET status = 'claimed', claimed_by_ip = '10.0.0.9',
             claimed_at = ?, expires_at = ? WHERE slot_number = 1",
        )
        .bind(past)
        .bind(past)
        .execute(&pool)
        .await
        .unwrap();

        manager.claim(1, &claimant_a()).await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_stale_queues_expires_old_coins() {
        let (manager, pool) = setup().await;
        let a = claimant_a();
        manager.claim(1, &a).await.unwrap();
        manager.add_coin(1, &a, &BigDecimal::from(5), 1).await.unwrap();
        // Age the entry past the horizon.
        let old = Utc::now() - chrono::Duration::hours(2);
        sqlx::query("UPDATE coin_queues SET created_at = ?")
            .bind(old)
            .execute(&pool)
            .await
            .unwrap();

        let expired = manager
            .cleanup_stale_queues(Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(expired, 1);
        let view = manager.my_slot(&a).await.unwrap();
        assert_eq!(view.queued_total, BigDecimal::from(0));
    }

    #[tokio::test]
    async fn test_abuse_guard_blocks_after_limit() {
        let (manager, pool) = setup().await;
        let mut settings = db::get_portal_settings(&pool).await.unwrap();
        settings.coin_attempt_limit = 2;
        settings.coin_attempt_window = 3600;
        db::update_portal_settings(&pool, &settings).await.unwrap();

        let a = claimant_a();
        manager.claim(1, &a).await.unwrap();
        for _ in 0..2 {
            let _ = manager.add_coin(1, &a, &BigDecimal::from(1), 1).await;
        }
        let err = manager
            .add_coin(1, &a, &BigDecimal::from(1), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::TooManyAttempts { .. }));

        // Advisory only: queued credits are untouched.
        let view = manager.my_slot(&a).await.unwrap();
        assert!(view.queued_total > BigDecimal::from(0));
    }

    #[tokio::test]
    async fn test_coin_bounds() {
        let (manager, _pool) = setup().await;
        let a = claimant_a();
        manager.claim(1, &a).await.unwrap();
        assert!(manager
            .add_coin(1, &a, &BigDecimal::from(0), 1)
            .await
            .is_err());
        assert!(manager
            .add_coin(1, &a, &BigDecimal::from(1001), 1)
            .await
            .is_err());
        assert!(manager
            .add_coin(1, &a, &BigDecimal::from(1), 0)
            .await
            .is_err());
        assert!(manager
            .add_coin(1, &a, &BigDecimal::from(1), 1001)
            .await
            .is_err());
    }
}
