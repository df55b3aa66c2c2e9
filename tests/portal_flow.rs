//! End-to-end scenarios for the coin → time → forwarding pipeline, run
//! against the in-memory store and the fake kernel drivers.

use std::sync::Arc;

use bigdecimal::BigDecimal;

use piso_gateway::db;
use piso_gateway::error::CoreError;
use piso_gateway::events::EventBus;
use piso_gateway::firewall::MemoryFirewall;
use piso_gateway::net::StaticNeighborTable;
use piso_gateway::session::SessionEngine;
use piso_gateway::shaper::MemoryShaper;
use piso_gateway::slots::{Claimant, SlotManager};
use piso_gateway::ttl::TtlDetector;
use piso_gateway::types::PaymentMethod;

mod helpers {
    use super::*;

    pub struct Gateway {
        pub pool: sqlx::SqlitePool,
        pub firewall: Arc<MemoryFirewall>,
        pub shaper: Arc<MemoryShaper>,
        pub neighbors: Arc<StaticNeighborTable>,
        pub bus: EventBus,
        pub slots: SlotManager,
        pub engine: Arc<SessionEngine>,
        pub detector: Arc<TtlDetector>,
    }

    /// A complete gateway over `sqlite::memory:`, fakes instead of kernel.
    pub async fn gateway() -> Gateway {
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
            shaper.clone(),
            neighbors.clone(),
            bus.clone(),
            slots.clone(),
        ));
        let detector = Arc::new(TtlDetector::new(
            pool.clone(),
            firewall.clone(),
            neighbors.clone(),
            bus.clone(),
        ));
        Gateway {
            pool,
            firewall,
            shaper,
            neighbors,
            bus,
            slots,
            engine,
            detector,
        }
    }

    pub fn buyer() -> Claimant {
        Claimant {
            ip: Some("10.0.0.12".into()),
            mac: "AA:BB:CC:11:22:33".into(),
            token: Some("t1".into()),
        }
    }

    /// Register the buyer as a known device on the LAN and in the store.
    pub async fn register_buyer(gw: &Gateway) -> db::Client {
        gw.neighbors
            .insert("10.0.0.12".parse().unwrap(), "AA:BB:CC:11:22:33")
            .await;
        let id = db::insert_client(
            &gw.pool,
            &db::NewClient {
                mac_address: "AA:BB:CC:11:22:33".into(),
                ip_address: Some("10.0.0.12".into()),
                session_token: Some("t1".into()),
                device_os: None,
                device_browser: None,
                user_agent: None,
            },
            chrono::Utc::now(),
        )
        .await
        .unwrap();
        db::get_client(&gw.pool, id).await.unwrap().unwrap()
    }
}

use helpers::{buyer, gateway, register_buyer};

/// Scenario: single-coin purchase, then a minute of metering.
#[tokio::test]
async fn happy_path_single_coin_purchase() {
    let gw = gateway().await;
    let client = register_buyer(&gw).await;
    let claimant = buyer();

    gw.slots.claim(1, &claimant).await.unwrap();
    let total = gw
        .slots
        .add_coin(1, &claimant, &BigDecimal::from(5), 1)
        .await
        .unwrap();
    assert_eq!(total, BigDecimal::from(5));

    // rate 1 seeded as price 5 / 900 s
    let rate = db::get_active_rate(&gw.pool, 1).await.unwrap().unwrap();
    let redemption = gw.slots.redeem(&claimant, &rate).await.unwrap();
    let connected = gw
        .engine
        .authenticate(
            client.id,
            redemption.granted_duration,
            PaymentMethod::Coin,
            Some(rate.id),
            &redemption.amount_charged.to_string(),
            redemption.coins_used,
        )
        .await
        .unwrap();

    assert_eq!(connected.status, "CONNECTED");
    assert_eq!(connected.time_remaining, 900);
    assert!(gw.firewall.is_granted("AA:BB:CC:11:22:33"));

    for _ in 0..60 {
        gw.engine.tick().await.unwrap();
    }
    let after = db::get_client(&gw.pool, client.id).await.unwrap().unwrap();
    assert_eq!(after.time_remaining, 840);
    assert_eq!(after.status, "CONNECTED");
}

/// Scenario: browser reload between insert and purchase loses nothing.
#[tokio::test]
async fn preserve_across_reload() {
    let gw = gateway().await;
    register_buyer(&gw).await;
    let claimant = buyer();

    gw.slots.claim(1, &claimant).await.unwrap();
    gw.slots
        .add_coin(1, &claimant, &BigDecimal::from(5), 1)
        .await
        .unwrap();

    // Refresh: the page releases with preservation, then claims again.
    gw.slots.release(1, &claimant, true).await.unwrap();
    gw.slots.claim(1, &claimant).await.unwrap();

    let view = gw.slots.my_slot(&claimant).await.unwrap();
    assert_eq!(view.queued_total, BigDecimal::from(5));
    assert!(view.claim.is_some());
}

/// Scenario: two clients race for one slot; exactly one wins.
#[tokio::test]
async fn concurrent_claim_exactly_one_winner() {
    let gw = gateway().await;
    let a = buyer();
    let b = Claimant {
        ip: Some("10.0.0.13".into()),
        mac: "AA:BB:CC:44:55:66".into(),
        token: Some("t2".into()),
    };

    let slots_a = gw.slots.clone();
    let slots_b = gw.slots.clone();
    let (ra, rb) = tokio::join!(
        tokio::spawn(async move { slots_a.claim(1, &a).await }),
        tokio::spawn(async move { slots_b.claim(1, &b).await }),
    );
    let results = [ra.unwrap(), rb.unwrap()];

    let winners = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(CoreError::Conflict(_))))
        .count();
    assert_eq!(winners, 1);
    assert_eq!(conflicts, 1);
}

/// Scenario: a 2-second grant expires on the second tick after it.
#[tokio::test]
async fn expiry_revokes_exactly_once() {
    let gw = gateway().await;
    let client = register_buyer(&gw).await;

    gw.engine
        .authenticate(client.id, 2, PaymentMethod::Coin, Some(1), "5", 1)
        .await
        .unwrap();
    assert!(gw.firewall.is_granted("AA:BB:CC:11:22:33"));

    gw.engine.tick().await.unwrap();
    gw.engine.tick().await.unwrap();

    let after = db::get_client(&gw.pool, client.id).await.unwrap().unwrap();
    assert_eq!(after.status, "DISCONNECTED");
    assert_eq!(after.time_remaining, 0);
    assert_eq!(gw.firewall.revoke_calls("AA:BB:CC:11:22:33"), 1);
    assert!(db::get_active_session(&gw.pool, client.id)
        .await
        .unwrap()
        .is_none());
}

/// Scenario: tethered traffic (one hop lost) trips the selective drop
/// without touching the payer's own packets.
#[tokio::test]
async fn ttl_anomaly_installs_selective_drop() {
    let gw = gateway().await;
    gw.neighbors
        .insert("10.0.0.30".parse().unwrap(), "DE:AD:BE:EF:00:01")
        .await;
    let mut settings = db::get_ttl_settings(&gw.pool).await.unwrap();
    settings.enabled = true;
    settings.auto_block = true;
    settings.alert_threshold = 3;
    settings.sensitivity = "medium".into();
    db::update_ttl_settings(&gw.pool, &settings).await.unwrap();

    let ip: std::net::Ipv4Addr = "10.0.0.30".parse().unwrap();
    for ttl in [64u8, 64, 64, 63, 63, 63] {
        gw.detector.handle_packet(ip, ttl).await.unwrap();
    }

    let violation = db::get_ttl_violation(&gw.pool, "DE:AD:BE:EF:00:01")
        .await
        .unwrap()
        .expect("violation recorded after the third decrement packet");
    assert_eq!(violation.status, "pending");
    assert!(gw.firewall.has_ttl_drop("DE:AD:BE:EF:00:01", 64));
    // The drop matches TTL != 64, so the payer's baseline traffic is not
    // represented in the firewall's forwarding revocations.
    assert_eq!(gw.firewall.revoke_calls("DE:AD:BE:EF:00:01"), 0);
}

/// Scenario: overpayment is pocketed as change for the next purchase.
#[tokio::test]
async fn change_is_pocketed_for_next_purchase() {
    let gw = gateway().await;
    register_buyer(&gw).await;
    let claimant = buyer();

    gw.slots.claim(1, &claimant).await.unwrap();
    for _ in 0..2 {
        gw.slots
            .add_coin(1, &claimant, &BigDecimal::from(5), 1)
            .await
            .unwrap();
    }
    gw.slots
        .add_coin(1, &claimant, &BigDecimal::from(2), 1)
        .await
        .unwrap();

    // rate 2 seeded as price 10 / 2100 s
    let rate = db::get_active_rate(&gw.pool, 2).await.unwrap().unwrap();
    let redemption = gw.slots.redeem(&claimant, &rate).await.unwrap();
    assert_eq!(redemption.amount_charged, BigDecimal::from(10));
    assert_eq!(redemption.change, BigDecimal::from(2));

    // The change is visible before any new coin is inserted.
    let view = gw.slots.my_slot(&claimant).await.unwrap();
    assert_eq!(view.queued_total, BigDecimal::from(2));
    assert!(view.claim.is_none());
}

/// Purchases publish coins-redeemed before client-authenticated.
#[tokio::test]
async fn purchase_event_ordering() {
    let gw = gateway().await;
    let client = register_buyer(&gw).await;
    let claimant = buyer();
    let mut events = gw.bus.subscribe();

    gw.slots.claim(1, &claimant).await.unwrap();
    gw.slots
        .add_coin(1, &claimant, &BigDecimal::from(5), 1)
        .await
        .unwrap();
    let rate = db::get_active_rate(&gw.pool, 1).await.unwrap().unwrap();
    let redemption = gw.slots.redeem(&claimant, &rate).await.unwrap();
    gw.engine
        .authenticate(
            client.id,
            redemption.granted_duration,
            PaymentMethod::Coin,
            Some(rate.id),
            "5",
            redemption.coins_used,
        )
        .await
        .unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(serde_json::to_value(&event).unwrap()["type"]
            .as_str()
            .unwrap()
            .to_string());
    }
    let redeemed_at = seen.iter().position(|t| t == "coins-redeemed").unwrap();
    let authed_at = seen
        .iter()
        .position(|t| t == "client-authenticated")
        .unwrap();
    assert!(redeemed_at < authed_at);
}
