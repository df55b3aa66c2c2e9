//! In-process publish of state changes. Subscribers are websocket push
//! handlers; a lagged or absent subscriber never blocks a publisher.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 256;

/// State-change notifications pushed to dashboards.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum GatewayEvent {
    ClientAuthenticated {
        mac: String,
        ip: Option<String>,
        time_remaining: i64,
    },
    ClientDisconnected {
        mac: String,
        reason: String,
    },
    ClientPaused {
        mac: String,
    },
    ClientResumed {
        mac: String,
    },
    ClientRemoved {
        mac: String,
    },
    ClientBlocked {
        mac: String,
    },
    CoinsInserted {
        slot_number: i64,
        value: String,
        queued_total: String,
    },
    CoinsRedeemed {
        mac: String,
        amount: String,
        duration_secs: i64,
        change: String,
    },
    SlotClaimed {
        slot_number: i64,
        ip: Option<String>,
    },
    SlotReleased {
        slot_number: i64,
    },
    TtlViolation {
        mac: String,
        anomaly_type: String,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// New receiver for a websocket connection.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }

    /// Fire-and-forget. An Err only means nobody is listening.
    pub fn publish(&self, event: GatewayEvent) {
        debug!(event = ?event, "publishing event");
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
