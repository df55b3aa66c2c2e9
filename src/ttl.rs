//! Passive TTL anti-tethering detector.
//!
//! A packet routed through an intermediate device loses a hop of TTL, and a
//! second device's native stack usually starts from a different initial TTL
//! entirely. Neither signal is proof, so the detector reports anomalies and
//! only installs a *selective* drop (TTL != baseline) that cuts the tethered
//! device without disconnecting the payer.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::db::{self, TtlSettings};
use crate::error::{CoreError, CoreResult};
use crate::events::{EventBus, GatewayEvent};
use crate::firewall::Firewall;
use crate::metrics;
use crate::net::{validate_iface, NeighborTable};
use crate::types::{AnomalyType, TtlSensitivity};

/// Rolling anomaly window per MAC.
const ANOMALY_WINDOW: usize = 100;
/// `multiple_devices` looks at the first this-many packets of a MAC.
const FINGERPRINT_PACKETS: usize = 10;
/// Distinct TTLs within the fingerprint window that imply several stacks.
const MULTIPLE_DEVICE_TTLS: usize = 3;
/// Delay before respawning a dead capture helper.
const RESTART_DELAY: Duration = Duration::from_secs(5);
/// Capture errors are logged at most this often.
const ERROR_LOG_INTERVAL: Duration = Duration::from_secs(300);
/// Cached ttl_settings time-to-live.
const SETTINGS_TTL: Duration = Duration::from_secs(10);
const BASELINE_CONFIDENCE: f64 = 0.8;

/// A lazy stream of (source IP, observed TTL) tuples.
#[async_trait]
pub trait PacketSource: Send {
    async fn next(&mut self) -> Option<(Ipv4Addr, u8)>;
}

/// Spawns tcpdump on the capture interface and parses its verbose output.
pub struct TcpdumpSource {
    _child: Child,
    lines: Lines<BufReader<ChildStdout>>,
    pending_ttl: Option<u8>,
}

impl TcpdumpSource {
    pub fn spawn(iface: &str) -> CoreResult<Self> {
        validate_iface(iface)?;
        let mut child = Command::new("tcpdump")
            .args(["-i", iface, "-n", "-l", "-v", "ip"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CoreError::KernelError(format!("spawn tcpdump: {e}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CoreError::KernelError("tcpdump stdout unavailable".into()))?;
        Ok(Self {
            _child: child,
            lines: BufReader::new(stdout).lines(),
            pending_ttl: None,
        })
    }
}

#[async_trait]
impl PacketSource for TcpdumpSource {
    async fn next(&mut self) -> Option<(Ipv4Addr, u8)> {
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) => {
                    debug!(error = %e, "capture read error");
                    return None;
                }
            };
            if let Some(packet) = parse_capture_line(&mut self.pending_ttl, &line) {
                return Some(packet);
            }
        }
    }
}

/// Test source fed from a channel.
pub struct ChannelSource {
    rx: mpsc::Receiver<(Ipv4Addr, u8)>,
}

impl ChannelSource {
    pub fn new() -> (mpsc::Sender<(Ipv4Addr, u8)>, Self) {
        let (tx, rx) = mpsc::channel(64);
        (tx, Self { rx })
    }
}

#[async_trait]
impl PacketSource for ChannelSource {
    async fn next(&mut self) -> Option<(Ipv4Addr, u8)> {
        self.rx.recv().await
    }
}

/// Parse one line of `tcpdump -v` output. The TTL lives in the IP header
/// line; the source address is either on the same line or the following
/// indented one, so a one-slot state carries the TTL across.
pub fn parse_capture_line(pending_ttl: &mut Option<u8>, line: &str) -> Option<(Ipv4Addr, u8)> {
    if let Some(ttl) = extract_ttl(line) {
        *pending_ttl = Some(ttl);
    }
    let ttl = (*pending_ttl)?;
    let src = extract_src_ip(line)?;
    *pending_ttl = None;
    Some((src, ttl))
}

fn extract_ttl(line: &str) -> Option<u8> {
    let idx = line.find("ttl ")?;
    let rest = &line[idx + 4..];
    let end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    rest[..end].parse().ok()
}

fn extract_src_ip(line: &str) -> Option<Ipv4Addr> {
    let (left, _) = line.split_once(" > ")?;
    let token = left.split_whitespace().next_back()?;
    // "10.0.0.12.51000" (with port) or "10.0.0.12" (ICMP).
    if let Ok(ip) = token.parse::<Ipv4Addr>() {
        return Some(ip);
    }
    let (ip_part, _port) = token.rsplit_once('.')?;
    ip_part.parse().ok()
}

#[derive(Default)]
struct MacWindow {
    first_ttls: Vec<u8>,
    distinct_ttls: BTreeSet<u8>,
    anomaly_times: VecDeque<chrono::DateTime<Utc>>,
    multiple_devices_flagged: bool,
    drop_installed: bool,
    last_verified_write: Option<Instant>,
}

pub struct TtlDetector {
    db: SqlitePool,
    firewall: Arc<dyn Firewall>,
    neighbors: Arc<dyn NeighborTable>,
    bus: EventBus,
    windows: Mutex<HashMap<String, MacWindow>>,
    settings_cache: Mutex<Option<(Instant, TtlSettings)>>,
    last_error_log: std::sync::Mutex<Option<Instant>>,
}

impl TtlDetector {
    pub fn new(
        db: SqlitePool,
        firewall: Arc<dyn Firewall>,
        neighbors: Arc<dyn NeighborTable>,
        bus: EventBus,
    ) -> Self {
        Self {
            db,
            firewall,
            neighbors,
            bus,
            windows: Mutex::new(HashMap::new()),
            settings_cache: Mutex::new(None),
            last_error_log: std::sync::Mutex::new(None),
        }
    }

    /// Supervise the capture helper: respawn it after a bounded delay when
    /// it dies, rate-limiting the error log. Also consumes authentication
    /// events to reset baselines on reconnect, so a legitimate OS change
    /// never leaves a stale baseline behind.
    pub async fn run(self: Arc<Self>, iface: String) -> eyre::Result<()> {
        let mut events = self.bus.subscribe();
        info!(iface = %iface, "TTL detector started");
        loop {
            let mut source = match TcpdumpSource::spawn(&iface) {
                Ok(source) => source,
                Err(e) => {
                    self.log_capture_error(&format!("capture helper failed to start: {e}"));
                    tokio::time::sleep(RESTART_DELAY).await;
                    continue;
                }
            };
            loop {
                tokio::select! {
                    packet = source.next() => match packet {
                        Some((ip, ttl)) => {
                            if let Err(e) = self.handle_packet(ip, ttl).await {
                                warn!(error = %e, "packet handling failed");
                            }
                        }
                        None => {
                            self.log_capture_error("capture helper exited");
                            break;
                        }
                    },
                    event = events.recv() => match event {
                        Ok(GatewayEvent::ClientAuthenticated { mac, .. }) => {
                            self.reset_baseline(&mac).await;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "TTL detector lagged on event bus");
                        }
                        Err(broadcast::error::RecvError::Closed) => {}
                    },
                }
            }
            tokio::time::sleep(RESTART_DELAY).await;
        }
    }

    /// The per-packet algorithm.
    pub async fn handle_packet(&self, source_ip: Ipv4Addr, observed_ttl: u8) -> CoreResult<()> {
        let settings = self.settings().await?;
        if !settings.enabled {
            return Ok(());
        }
        let mac = match self.neighbors.lookup(source_ip).await {
            Some(mac) => mac,
            None => return Ok(()),
        };
        let now = Utc::now();

        let baseline = match db::get_ttl_baseline(&self.db, &mac).await? {
            Some(baseline) => baseline,
            None => {
                db::insert_ttl_baseline(
                    &self.db,
                    &mac,
                    observed_ttl as i64,
                    BASELINE_CONFIDENCE,
                    now,
                )
                .await?;
                let mut windows = self.windows.lock().await;
                let window = windows.entry(mac.clone()).or_default();
                window.first_ttls.push(observed_ttl);
                window.distinct_ttls.insert(observed_ttl);
                debug!(mac = %mac, ttl = observed_ttl, "TTL baseline established");
                return Ok(());
            }
        };

        let delta = observed_ttl as i16 - baseline.baseline_ttl as i16;
        let sensitivity = TtlSensitivity::parse(&settings.sensitivity)
            .unwrap_or(TtlSensitivity::Medium);

        let mut anomalies: Vec<(AnomalyType, String)> = Vec::new();
        {
            let mut windows = self.windows.lock().await;
            let window = windows.entry(mac.clone()).or_default();
            if window.first_ttls.len() < FINGERPRINT_PACKETS {
                window.first_ttls.push(observed_ttl);
                window.distinct_ttls.insert(observed_ttl);
                if window.distinct_ttls.len() >= MULTIPLE_DEVICE_TTLS
                    && !window.multiple_devices_flagged
                {
                    window.multiple_devices_flagged = true;
                    anomalies.push((
                        AnomalyType::MultipleDevices,
                        serde_json::json!({
                            "distinct_ttls": window.distinct_ttls.iter().collect::<Vec<_>>(),
                            "packets_seen": window.first_ttls.len(),
                        })
                        .to_string(),
                    ));
                }
            }
        }

        // A hop lost in transit is the tethering signature; losing more
        // than one hop means a chain of devices and escalates severity.
        if delta < 0 {
            anomalies.push((
                AnomalyType::TtlDecrement,
                serde_json::json!({
                    "baseline": baseline.baseline_ttl,
                    "observed": observed_ttl,
                    "hops_lost": -delta,
                })
                .to_string(),
            ));
        } else if delta.unsigned_abs() as i16 > sensitivity.threshold() {
            anomalies.push((
                AnomalyType::TtlVariance,
                serde_json::json!({
                    "baseline": baseline.baseline_ttl,
                    "observed": observed_ttl,
                    "delta": delta,
                })
                .to_string(),
            ));
        }

        if anomalies.is_empty() {
            self.maybe_touch_baseline(&mac, now).await?;
            return Ok(());
        }

        let severity = if delta < -1 { "high" } else { "medium" };
        for (anomaly_type, details) in &anomalies {
            db::insert_ttl_anomaly(&self.db, &mac, anomaly_type.as_str(), Some(details), now)
                .await?;
            metrics::TTL_ANOMALIES
                .with_label_values(&[anomaly_type.as_str()])
                .inc();
        }

        let (window_count, already_dropped) = {
            let mut windows = self.windows.lock().await;
            let window = windows.entry(mac.clone()).or_default();
            for _ in &anomalies {
                if window.anomaly_times.len() == ANOMALY_WINDOW {
                    window.anomaly_times.pop_front();
                }
                window.anomaly_times.push_back(now);
            }
            (window.anomaly_times.len(), window.drop_installed)
        };

        if settings.auto_block
            && !already_dropped
            && window_count as i64 >= settings.alert_threshold
        {
            db::upsert_ttl_violation(&self.db, &mac, severity, now).await?;
            match self
                .firewall
                .install_ttl_drop(&mac, baseline.baseline_ttl as u8)
                .await
            {
                Ok(()) => {
                    self.windows
                        .lock()
                        .await
                        .entry(mac.clone())
                        .or_default()
                        .drop_installed = true;
                    warn!(
                        mac = %mac,
                        baseline = baseline.baseline_ttl,
                        "tethering suspected; selective TTL drop installed"
                    );
                }
                Err(CoreError::Unsupported(msg)) => {
                    warn!(mac = %mac, %msg, "cannot enforce TTL drop; recording violation only");
                }
                Err(e) => {
                    warn!(mac = %mac, error = %e, "TTL drop installation failed");
                }
            }
            self.bus.publish(GatewayEvent::TtlViolation {
                mac: mac.clone(),
                anomaly_type: anomalies[0].0.as_str().to_string(),
            });
        }
        Ok(())
    }

    /// Forget everything about a MAC: baseline, rolling window, and any
    /// selective drop. Called when the client starts a new session.
    pub async fn reset_baseline(&self, mac: &str) {
        let result: CoreResult<()> = async {
            if let Some(baseline) = db::get_ttl_baseline(&self.db, mac).await? {
                if let Some(violation) = db::get_ttl_violation(&self.db, mac).await? {
                    if violation.status == "pending" {
                        let _ = self
                            .firewall
                            .remove_ttl_drop(mac, baseline.baseline_ttl as u8)
                            .await;
                        db::resolve_ttl_violation(&self.db, mac, Utc::now()).await?;
                    }
                }
                db::delete_ttl_baseline(&self.db, mac).await?;
            }
            Ok(())
        }
        .await;
        if let Err(e) = result {
            warn!(mac = %mac, error = %e, "baseline reset failed");
        }
        self.windows.lock().await.remove(mac);
        debug!(mac = %mac, "TTL baseline reset");
    }

    async fn settings(&self) -> CoreResult<TtlSettings> {
        let mut cache = self.settings_cache.lock().await;
        if let Some((read_at, settings)) = cache.as_ref() {
            if read_at.elapsed() < SETTINGS_TTL {
                return Ok(settings.clone());
            }
        }
        let settings = db::get_ttl_settings(&self.db).await?;
        *cache = Some((Instant::now(), settings.clone()));
        Ok(settings)
    }

    /// Confirm a quiet baseline at most once a minute to avoid a write per
    /// packet.
    async fn maybe_touch_baseline(&self, mac: &str, now: chrono::DateTime<Utc>) -> CoreResult<()> {
        let mut windows = self.windows.lock().await;
        let window = windows.entry(mac.to_string()).or_default();
        let due = window
            .last_verified_write
            .map(|at| at.elapsed() >= Duration::from_secs(60))
            .unwrap_or(true);
        if due {
            window.last_verified_write = Some(Instant::now());
            drop(windows);
            db::touch_ttl_baseline(&self.db, mac, now).await?;
        }
        Ok(())
    }

    fn log_capture_error(&self, msg: &str) {
        let mut last = self.last_error_log.lock().unwrap();
        let due = last
            .map(|at| at.elapsed() >= ERROR_LOG_INTERVAL)
            .unwrap_or(true);
        if due {
            *last = Some(Instant::now());
            error!(msg, "packet capture trouble (log rate-limited)");
        } else {
            debug!(msg, "packet capture trouble");
        }
    }
}
