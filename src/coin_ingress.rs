//! Bridge to the external GPIO process that reads the physical coin
//! acceptor. The bridge publishes each accepted coin as one line of JSON on
//! a local socket; this task owns the connection, reconnects with capped
//! exponential backoff, and forwards each event to the Slot Manager under
//! the current claimant's own identifiers. Coins arriving while the
//! connection is down are lost; the GPIO process buffers nothing either.

use std::str::FromStr;
use std::time::Duration;

use bigdecimal::BigDecimal;
use serde::Deserialize;
use sqlx::SqlitePool;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::db;
use crate::error::CoreResult;
use crate::metrics;
use crate::slots::{Claimant, SlotManager};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const DEFAULT_SLOT: i64 = 1;

/// One coin event on the wire:
/// `{"type":"coin_detected","timestamp":<ms>,"value":<pesos>,"pulses":<n>,"method":"exact|calibrated|raw"}`
#[derive(Debug, Clone, Deserialize)]
pub struct CoinEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    pub value: f64,
    #[serde(default)]
    pub pulses: Option<i64>,
    #[serde(default)]
    pub method: Option<String>,
    /// Slot the acceptor is wired to; almost always absent (slot 1).
    #[serde(default)]
    pub slot: Option<i64>,
}

pub struct CoinBridge {
    addr: String,
    db: SqlitePool,
    slots: SlotManager,
}

impl CoinBridge {
    pub fn new(addr: String, db: SqlitePool, slots: SlotManager) -> Self {
        Self { addr, db, slots }
    }

    pub async fn run(self) -> eyre::Result<()> {
        let mut failures: u32 = 0;
        loop {
            match TcpStream::connect(&self.addr).await {
                Ok(stream) => {
                    info!(addr = %self.addr, "connected to GPIO coin bridge");
                    failures = 0;
                    self.read_events(stream).await;
                    warn!(addr = %self.addr, "GPIO bridge connection closed");
                }
                Err(e) => {
                    if failures == 0 {
                        warn!(addr = %self.addr, error = %e, "GPIO bridge unreachable");
                    }
                    failures = failures.saturating_add(1);
                }
            }
            tokio::time::sleep(backoff_for_attempt(failures)).await;
            failures = failures.saturating_add(1);
        }
    }

    async fn read_events(&self, stream: TcpStream) {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<CoinEvent>(&line) {
                        Ok(event) => {
                            if let Err(e) = self.handle_event(event).await {
                                warn!(error = %e, "coin event not credited");
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, line = %line, "malformed coin event");
                        }
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "GPIO bridge read error");
                    return;
                }
            }
        }
    }

    /// Credit a coin to whoever holds the claim on the indicated slot. A
    /// coin with no live claimant is dropped with a log line; the physical
    /// acceptor has already swallowed it, so this is an operator signal.
    async fn handle_event(&self, event: CoinEvent) -> CoreResult<()> {
        if event.kind != "coin_detected" {
            debug!(kind = %event.kind, "ignoring non-coin bridge event");
            return Ok(());
        }
        let slot_number = event.slot.unwrap_or(DEFAULT_SLOT);
        let value = BigDecimal::from_str(&format!("{}", event.value))
            .unwrap_or_else(|_| BigDecimal::from(0));

        let slot = match db::get_slot(&self.db, slot_number).await? {
            Some(slot) if slot.status == "claimed" => slot,
            _ => {
                metrics::COIN_EVENTS_DROPPED.inc();
                warn!(
                    slot_number,
                    value = event.value,
                    "coin arrived with no live claim; dropped"
                );
                return Ok(());
            }
        };

        // Act as the claimant: the add-coin ownership check then passes on
        // exactly the identifiers recorded at claim time.
        let claimant = Claimant {
            ip: slot.claimed_by_ip.clone(),
            mac: slot
                .claimed_by_mac
                .clone()
                .unwrap_or_else(|| crate::net::UNKNOWN_MAC.to_string()),
            token: slot.claimed_by_session_token.clone(),
        };
        let total = self.slots.add_coin(slot_number, &claimant, &value, 1).await?;
        debug!(
            slot_number,
            value = event.value,
            method = event.method.as_deref().unwrap_or("exact"),
            pulses = event.pulses.unwrap_or(1),
            queued_total = %total,
            "coin credited"
        );
        Ok(())
    }
}

/// Exponential backoff for reconnects, capped at 30 seconds.
pub fn backoff_for_attempt(attempt: u32) -> Duration {
    let secs = INITIAL_BACKOFF
        .as_secs_f64()
        * 2f64.powi(attempt.min(16) as i32);
    Duration::from_secs_f64(secs.min(MAX_BACKOFF.as_secs_f64()))
}
