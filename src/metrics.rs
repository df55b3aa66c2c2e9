//! Prometheus metrics, exposed on /metrics for scraping.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram, Counter,
    CounterVec, Encoder, Gauge, Histogram, TextEncoder,
};

lazy_static! {
    pub static ref UP: Gauge = register_gauge!(
        "gateway_up",
        "Whether the gateway process is running (1) or not (0)"
    ).unwrap();

    pub static ref CLIENTS_CONNECTED: Gauge = register_gauge!(
        "gateway_clients_connected",
        "Clients currently in CONNECTED state"
    ).unwrap();

    pub static ref COINS_INSERTED: Counter = register_counter!(
        "gateway_coins_inserted_total",
        "Coin events accepted into a claimed slot"
    ).unwrap();

    pub static ref COIN_VALUE: Counter = register_counter!(
        "gateway_coin_value_total",
        "Total coin value accepted (pesos)"
    ).unwrap();

    pub static ref REDEEMS: Counter = register_counter!(
        "gateway_redeems_total",
        "Successful queue-to-time redemptions"
    ).unwrap();

    pub static ref SESSIONS_STARTED: Counter = register_counter!(
        "gateway_sessions_started_total",
        "Sessions started by purchase or admin grant"
    ).unwrap();

    pub static ref SESSIONS_EXPIRED: Counter = register_counter!(
        "gateway_sessions_expired_total",
        "Sessions ended by the tick because time ran out"
    ).unwrap();

    pub static ref FIREWALL_OPS: CounterVec = register_counter_vec!(
        "gateway_firewall_ops_total",
        "Firewall driver operations",
        &["op", "result"]
    ).unwrap();

    pub static ref TICK_DURATION: Histogram = register_histogram!(
        "gateway_tick_duration_seconds",
        "Wall-clock duration of one engine tick",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
    ).unwrap();

    pub static ref TTL_ANOMALIES: CounterVec = register_counter_vec!(
        "gateway_ttl_anomalies_total",
        "TTL anomalies recorded by the detector",
        &["type"]
    ).unwrap();

    pub static ref RECONCILE_CORRECTIONS: Counter = register_counter!(
        "gateway_reconcile_corrections_total",
        "Kernel-state corrections applied by the reconciliation task"
    ).unwrap();

    pub static ref COIN_EVENTS_DROPPED: Counter = register_counter!(
        "gateway_coin_events_dropped_total",
        "Coin events that arrived with no live slot claim"
    ).unwrap();
}

/// Encode the default registry in the Prometheus text format.
pub fn encode() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "failed to encode metrics");
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    // The registry is process-global; serialize against other tests that
    // touch the same statics.
    #[test]
    #[serial]
    fn test_encode_includes_registered_metrics() {
        UP.set(1.0);
        COINS_INSERTED.inc();
        let text = String::from_utf8(encode()).unwrap();
        assert!(text.contains("gateway_up"));
        assert!(text.contains("gateway_coins_inserted_total"));
    }
}
