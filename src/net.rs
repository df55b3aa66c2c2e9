//! Network input validation and neighbor (ARP) table access.
//!
//! Every MAC, IPv4 address, and interface name that could reach an external
//! command is validated here first. Anything that fails validation is
//! rejected as `InvalidInput` before a process is even built.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::{CoreError, CoreResult};

lazy_static! {
    static ref MAC_RE: Regex = Regex::new(r"^([0-9A-F]{2}:){5}[0-9A-F]{2}$").unwrap();
    static ref IFACE_RE: Regex = Regex::new(r"^[a-z][a-z0-9.-]{0,14}$").unwrap();
}

/// Service names the admin restart endpoint may touch. Anything else is
/// rejected before argv construction.
pub const SERVICE_ALLOW_LIST: &[&str] = &["hostapd", "dnsmasq"];

pub const UNKNOWN_MAC: &str = "Unknown";

/// Uppercase a MAC and verify the canonical `AA:BB:CC:DD:EE:FF` form.
/// The literal `Unknown` passes through untouched; it identifies clients
/// whose MAC could not be resolved and never reaches the kernel.
pub fn canonical_mac(raw: &str) -> CoreResult<String> {
    if raw == UNKNOWN_MAC {
        return Ok(UNKNOWN_MAC.to_string());
    }
    let upper = raw.trim().to_ascii_uppercase().replace('-', ":");
    if MAC_RE.is_match(&upper) {
        Ok(upper)
    } else {
        Err(CoreError::InvalidInput(format!("malformed MAC: {raw:?}")))
    }
}

/// A MAC that is allowed into a kernel rule: canonical and not `Unknown`.
pub fn kernel_mac(raw: &str) -> CoreResult<String> {
    let mac = canonical_mac(raw)?;
    if mac == UNKNOWN_MAC {
        return Err(CoreError::InvalidInput(
            "MAC 'Unknown' cannot be used in kernel rules".into(),
        ));
    }
    Ok(mac)
}

pub fn validate_ipv4(raw: &str) -> CoreResult<Ipv4Addr> {
    raw.parse::<Ipv4Addr>()
        .map_err(|_| CoreError::InvalidInput(format!("malformed IPv4 address: {raw:?}")))
}

pub fn validate_iface(raw: &str) -> CoreResult<&str> {
    if IFACE_RE.is_match(raw) {
        Ok(raw)
    } else {
        Err(CoreError::InvalidInput(format!(
            "malformed interface name: {raw:?}"
        )))
    }
}

pub fn validate_service(raw: &str) -> CoreResult<&'static str> {
    SERVICE_ALLOW_LIST
        .iter()
        .copied()
        .find(|s| *s == raw)
        .ok_or_else(|| CoreError::InvalidInput(format!("service not in allow-list: {raw:?}")))
}

/// Bandwidth rates are kilobits per second in [1, 10^7]; 0 means unlimited
/// and is handled by callers before the driver sees it.
pub fn validate_rate_kbps(kbps: u32) -> CoreResult<u32> {
    if (1..=10_000_000).contains(&kbps) {
        Ok(kbps)
    } else {
        Err(CoreError::InvalidInput(format!(
            "rate out of range [1, 10000000] kbps: {kbps}"
        )))
    }
}

/// Deterministic HTB class id for a client IP, in 1000..65000. Stable across
/// restarts so reconciliation can re-derive the same tree.
pub fn class_id_for_ip(ip: Ipv4Addr) -> u16 {
    let n = u32::from(ip).wrapping_mul(2_654_435_761);
    1000 + (n % 64_000) as u16
}

/// Membership test for the LAN subnet, given its network address and prefix.
pub fn in_subnet(ip: Ipv4Addr, network: Ipv4Addr, prefix: u8) -> bool {
    if prefix == 0 {
        return true;
    }
    if prefix > 32 {
        return false;
    }
    let mask = u32::MAX << (32 - prefix as u32);
    (u32::from(ip) & mask) == (u32::from(network) & mask)
}

/// IP → MAC lookup against the host's neighbor table.
#[async_trait]
pub trait NeighborTable: Send + Sync {
    /// Resolve an IP to a canonical uppercase MAC, if present.
    async fn lookup(&self, ip: Ipv4Addr) -> Option<String>;

    /// The set of MACs currently present on the LAN.
    async fn present_macs(&self) -> Vec<String>;
}

/// Reads `/proc/net/arp`, refreshed at most every 30 seconds.
pub struct ProcNeighborTable {
    cache: Mutex<NeighborCache>,
    refresh: Duration,
}

struct NeighborCache {
    read_at: Option<Instant>,
    by_ip: HashMap<Ipv4Addr, String>,
}

impl ProcNeighborTable {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(NeighborCache {
                read_at: None,
                by_ip: HashMap::new(),
            }),
            refresh: Duration::from_secs(30),
        }
    }

    async fn refreshed(&self) -> HashMap<Ipv4Addr, String> {
        let mut cache = self.cache.lock().await;
        let stale = match cache.read_at {
            Some(at) => at.elapsed() >= self.refresh,
            None => true,
        };
        if stale {
            match tokio::fs::read_to_string("/proc/net/arp").await {
                Ok(contents) => {
                    cache.by_ip = parse_proc_arp(&contents);
                    cache.read_at = Some(Instant::now());
                }
                Err(e) => {
                    warn!(error = %e, "failed to read /proc/net/arp; keeping stale table");
                    cache.read_at = Some(Instant::now());
                }
            }
        }
        cache.by_ip.clone()
    }
}

impl Default for ProcNeighborTable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NeighborTable for ProcNeighborTable {
    async fn lookup(&self, ip: Ipv4Addr) -> Option<String> {
        self.refreshed().await.get(&ip).cloned()
    }

    async fn present_macs(&self) -> Vec<String> {
        self.refreshed().await.values().cloned().collect()
    }
}

/// Parse the kernel's `/proc/net/arp` table. Entries with an incomplete
/// hardware address (flags 0x0) or a zero MAC are skipped.
fn parse_proc_arp(contents: &str) -> HashMap<Ipv4Addr, String> {
    let mut table = HashMap::new();
    for line in contents.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        let (ip_raw, flags, mac_raw) = (fields[0], fields[2], fields[3]);
        if flags == "0x0" || mac_raw == "00:00:00:00:00:00" {
            continue;
        }
        let ip = match ip_raw.parse::<Ipv4Addr>() {
            Ok(ip) => ip,
            Err(_) => continue,
        };
        match canonical_mac(mac_raw) {
            Ok(mac) => {
                table.insert(ip, mac);
            }
            Err(_) => {
                warn!(mac = %mac_raw, "skipping neighbor entry with malformed MAC");
            }
        }
    }
    table
}

/// Fixed-content neighbor table for tests and development.
pub struct StaticNeighborTable {
    by_ip: Mutex<HashMap<Ipv4Addr, String>>,
}

impl StaticNeighborTable {
    pub fn new() -> Self {
        Self {
            by_ip: Mutex::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, ip: Ipv4Addr, mac: &str) {
        self.by_ip.lock().await.insert(ip, mac.to_string());
    }

    pub async fn remove(&self, ip: Ipv4Addr) {
        self.by_ip.lock().await.remove(&ip);
    }
}

impl Default for StaticNeighborTable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NeighborTable for StaticNeighborTable {
    async fn lookup(&self, ip: Ipv4Addr) -> Option<String> {
        self.by_ip.lock().await.get(&ip).cloned()
    }

    async fn present_macs(&self) -> Vec<String> {
        self.by_ip.lock().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_canonical_mac_accepts_valid() {
        assert_eq!(
            canonical_mac("aa:bb:cc:11:22:33").unwrap(),
            "AA:BB:CC:11:22:33"
        );
        assert_eq!(
            canonical_mac("AA-BB-CC-11-22-33").unwrap(),
            "AA:BB:CC:11:22:33"
        );
        assert_eq!(canonical_mac("Unknown").unwrap(), "Unknown");
    }

    #[test]
    fn test_hostile_macs_rejected() {
        for bad in ["aa:bb", "zz:zz:zz:zz:zz:zz", "a; rm -rf /", "", "unknown"] {
            assert!(canonical_mac(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_kernel_mac_rejects_unknown() {
        assert!(kernel_mac("Unknown").is_err());
        assert!(kernel_mac("DE:AD:BE:EF:00:01").is_ok());
    }

    #[test]
    fn test_iface_validation() {
        assert!(validate_iface("wlan0").is_ok());
        assert!(validate_iface("br-lan").is_ok());
        assert!(validate_iface("eth0.10").is_ok());
        assert!(validate_iface("wlan0; reboot").is_err());
        assert!(validate_iface("").is_err());
        assert!(validate_iface("0eth").is_err());
    }

    #[test]
    fn test_service_allow_list() {
        assert_eq!(validate_service("dnsmasq").unwrap(), "dnsmasq");
        assert!(validate_service("sshd").is_err());
        assert!(validate_service("dnsmasq; id").is_err());
    }

    #[test]
    fn test_in_subnet() {
        let net = Ipv4Addr::new(10, 0, 0, 0);
        assert!(in_subnet(Ipv4Addr::new(10, 0, 0, 12), net, 24));
        assert!(!in_subnet(Ipv4Addr::new(10, 0, 1, 12), net, 24));
        assert!(in_subnet(Ipv4Addr::new(10, 0, 1, 12), net, 16));
    }

    #[test]
    fn test_parse_proc_arp() {
        let contents = "IP address       HW type     Flags       HW address            Mask     Device\n\
                        10.0.0.12        0x1         0x2         aa:bb:cc:11:22:33     *        wlan0\n\
                        10.0.0.13        0x1         0x0         00:00:00:00:00:00     *        wlan0\n";
        let table = parse_proc_arp(contents);
        assert_eq!(
            table.get(&Ipv4Addr::new(10, 0, 0, 12)).map(String::as_str),
            Some("AA:BB:CC:11:22:33")
        );
        assert!(!table.contains_key(&Ipv4Addr::new(10, 0, 0, 13)));
    }

    proptest! {
        #[test]
        fn prop_class_id_in_range(a in 0u8..=255, b in 0u8..=255, c in 0u8..=255, d in 0u8..=255) {
            let id = class_id_for_ip(Ipv4Addr::new(a, b, c, d));
            prop_assert!((1000..65000).contains(&id));
        }

        #[test]
        fn prop_class_id_deterministic(a in 0u8..=255, b in 0u8..=255, c in 0u8..=255, d in 0u8..=255) {
            let ip = Ipv4Addr::new(a, b, c, d);
            prop_assert_eq!(class_id_for_ip(ip), class_id_for_ip(ip));
        }

        #[test]
        fn prop_random_strings_never_valid_kernel_macs(s in "[ -~]{0,20}") {
            // Only the exact canonical form survives; anything with shell
            // metacharacters is rejected long before argv construction.
            if kernel_mac(&s).is_ok() {
                let upper = s.trim().to_ascii_uppercase().replace('-', ":");
                prop_assert!(MAC_RE.is_match(&upper));
            }
        }
    }
}
