//! Idempotent projection of client state onto the kernel packet filter.
//!
//! Rules are keyed by source MAC on the LAN→WAN path. Arguments are always
//! explicit vectors built from validated fields; a value that fails
//! validation is rejected before any process is spawned. A kernel operation
//! that fails after validation is retried once, then surfaced as
//! `KernelError`; the caller's committed state stands and the
//! reconciliation task re-applies the rule on a later pass.

use std::collections::BTreeSet;
use std::process::Output;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};
use crate::metrics;
use crate::net::{kernel_mac, validate_iface};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait Firewall: Send + Sync {
    /// Open forwarding for a MAC. A second grant is a no-op.
    async fn grant(&self, mac: &str) -> CoreResult<()>;

    /// Close forwarding for a MAC. Idempotent.
    async fn revoke(&self, mac: &str) -> CoreResult<()>;

    /// Drop packets from `mac` whose TTL differs from the expected baseline.
    /// Fails with `Unsupported` when the kernel lacks the TTL match.
    async fn install_ttl_drop(&self, mac: &str, expected_ttl: u8) -> CoreResult<()>;

    async fn remove_ttl_drop(&self, mac: &str, expected_ttl: u8) -> CoreResult<()>;

    /// One-time boot setup: portal DNAT, INPUT allowances, default-drop
    /// FORWARD, WAN masquerade.
    async fn install_portal_redirect(&self) -> CoreResult<()>;

    /// MACs currently granted; used only for reconciliation.
    async fn list_authorized(&self) -> CoreResult<Vec<String>>;
}

/// Production driver speaking to iptables.
pub struct IptablesFirewall {
    lan: String,
    wan: String,
    portal_port: u16,
    ttl_match_supported: bool,
}

impl IptablesFirewall {
    pub async fn new(lan: &str, wan: &str, portal_port: u16) -> CoreResult<Self> {
        validate_iface(lan)?;
        validate_iface(wan)?;
        let ttl_match_supported = probe_ttl_match().await;
        if !ttl_match_supported {
            warn!("kernel TTL match unavailable; anti-tethering drops disabled");
        }
        Ok(Self {
            lan: lan.to_string(),
            wan: wan.to_string(),
            portal_port,
            ttl_match_supported,
        })
    }

    fn forward_rule<'a>(&'a self, mac: &'a str) -> Vec<&'a str> {
        vec![
            "FORWARD", "-i", &self.lan, "-m", "mac", "--mac-source", mac, "-j", "ACCEPT",
        ]
    }

    /// NAT-table bypass so a granted client's packets skip the portal DNAT
    /// and egress through the WAN masquerade.
    fn nat_bypass_rule<'a>(&'a self, mac: &'a str) -> Vec<&'a str> {
        vec![
            "-t", "nat", "PREROUTING", "-i", &self.lan, "-m", "mac", "--mac-source", mac, "-j",
            "ACCEPT",
        ]
    }

    fn ttl_drop_rule<'a>(&'a self, mac: &'a str, ttl: &'a str) -> Vec<&'a str> {
        vec![
            "-t", "mangle", "PREROUTING", "-i", &self.lan, "-m", "mac", "--mac-source", mac,
            "-m", "ttl", "!", "--ttl-eq", ttl, "-j", "DROP",
        ]
    }

    /// Insert `rule` (a chain-prefixed arg vector) with the given action
    /// (`-I`, `-A`, or `-D`), checking with `-C` first so grant/revoke stay
    /// idempotent against the live kernel state.
    async fn apply_rule(&self, op: &str, action: &str, rule: &[&str]) -> CoreResult<()> {
        let exists = self.rule_exists(rule).await;
        match action {
            "-D" if !exists => {
                debug!(op, "rule already absent");
                return Ok(());
            }
            "-I" | "-A" if exists => {
                debug!(op, "rule already present");
                return Ok(());
            }
            _ => {}
        }
        let args = with_action(action, rule);
        self.run_checked(op, &args).await
    }

    async fn rule_exists(&self, rule: &[&str]) -> bool {
        let args = with_action("-C", rule);
        match run_iptables(&args).await {
            Ok(out) => out.status.success(),
            Err(_) => false,
        }
    }

    /// Run iptables with one retry; second failure is a `KernelError`.
    async fn run_checked(&self, op: &str, args: &[String]) -> CoreResult<()> {
        let mut last_err = String::new();
        for attempt in 0..2u32 {
            match run_iptables(args).await {
                Ok(out) if out.status.success() => {
                    metrics::FIREWALL_OPS.with_label_values(&[op, "ok"]).inc();
                    return Ok(());
                }
                Ok(out) => {
                    last_err = String::from_utf8_lossy(&out.stderr).trim().to_string();
                }
                Err(e) => last_err = e.to_string(),
            }
            warn!(op, attempt, error = %last_err, "iptables invocation failed");
        }
        metrics::FIREWALL_OPS.with_label_values(&[op, "error"]).inc();
        Err(CoreError::KernelError(format!("{op}: {last_err}")))
    }
}

/// `-w` serializes on the xtables lock so concurrent invocations queue
/// instead of failing.
async fn run_iptables(args: &[String]) -> CoreResult<Output> {
    let fut = Command::new("iptables")
        .arg("-w")
        .args(args)
        .kill_on_drop(true)
        .output();
    match timeout(COMMAND_TIMEOUT, fut).await {
        Ok(Ok(out)) => Ok(out),
        Ok(Err(e)) => Err(CoreError::KernelError(format!("spawn iptables: {e}"))),
        Err(_) => Err(CoreError::KernelError("iptables timed out".into())),
    }
}

fn with_action(action: &str, rule: &[&str]) -> Vec<String> {
    // Table selector (-t <name>) must precede the action flag.
    let mut args: Vec<String> = Vec::with_capacity(rule.len() + 1);
    let mut rest = rule;
    if rule.first() == Some(&"-t") && rule.len() >= 2 {
        args.push(rule[0].to_string());
        args.push(rule[1].to_string());
        rest = &rule[2..];
    }
    args.push(action.to_string());
    args.extend(rest.iter().map(|s| s.to_string()));
    args
}

async fn probe_ttl_match() -> bool {
    let args = vec!["-m".to_string(), "ttl".to_string(), "--help".to_string()];
    match run_iptables(&args).await {
        Ok(out) => out.status.success(),
        Err(_) => false,
    }
}

/// Extract granted MACs from `iptables -S FORWARD` output.
fn parse_authorized(listing: &str) -> Vec<String> {
    let mut macs = Vec::new();
    for line in listing.lines() {
        if !line.contains("-j ACCEPT") {
            continue;
        }
        let mut fields = line.split_whitespace().peekable();
        while let Some(field) = fields.next() {
            if field == "--mac-source" {
                if let Some(mac) = fields.peek() {
                    if let Ok(mac) = kernel_mac(mac) {
                        macs.push(mac);
                    }
                }
            }
        }
    }
    macs
}

#[async_trait]
impl Firewall for IptablesFirewall {
    async fn grant(&self, mac: &str) -> CoreResult<()> {
        let mac = kernel_mac(mac)?;
        self.apply_rule("grant", "-I", &self.forward_rule(&mac)).await?;
        self.apply_rule("grant", "-I", &self.nat_bypass_rule(&mac)).await?;
        debug!(mac = %mac, "forwarding granted");
        Ok(())
    }

    async fn revoke(&self, mac: &str) -> CoreResult<()> {
        let mac = kernel_mac(mac)?;
        self.apply_rule("revoke", "-D", &self.forward_rule(&mac)).await?;
        self.apply_rule("revoke", "-D", &self.nat_bypass_rule(&mac)).await?;
        debug!(mac = %mac, "forwarding revoked");
        Ok(())
    }

    async fn install_ttl_drop(&self, mac: &str, expected_ttl: u8) -> CoreResult<()> {
        let mac = kernel_mac(mac)?;
        if expected_ttl == 0 {
            return Err(CoreError::InvalidInput("TTL 0 is not a valid baseline".into()));
        }
        if !self.ttl_match_supported {
            return Err(CoreError::Unsupported("kernel TTL match unavailable".into()));
        }
        let ttl = expected_ttl.to_string();
        self.apply_rule("ttl_drop", "-A", &self.ttl_drop_rule(&mac, &ttl)).await
    }

    async fn remove_ttl_drop(&self, mac: &str, expected_ttl: u8) -> CoreResult<()> {
        let mac = kernel_mac(mac)?;
        if !self.ttl_match_supported {
            return Ok(());
        }
        let ttl = expected_ttl.to_string();
        self.apply_rule("ttl_drop", "-D", &self.ttl_drop_rule(&mac, &ttl)).await
    }

    async fn install_portal_redirect(&self) -> CoreResult<()> {
        let port = self.portal_port.to_string();
        let dhcp = "67:68".to_string();

        // Unmetered HTTP lands on the portal.
        self.apply_rule(
            "redirect",
            "-A",
            &[
                "-t", "nat", "PREROUTING", "-i", &self.lan, "-p", "tcp", "--dport", "80", "-j",
                "REDIRECT", "--to-ports", &port,
            ],
        )
        .await?;

        // DHCP, DNS, and the portal itself must reach this host.
        self.apply_rule(
            "redirect",
            "-A",
            &["INPUT", "-i", &self.lan, "-p", "udp", "--dport", &dhcp, "-j", "ACCEPT"],
        )
        .await?;
        self.apply_rule(
            "redirect",
            "-A",
            &["INPUT", "-i", &self.lan, "-p", "udp", "--dport", "53", "-j", "ACCEPT"],
        )
        .await?;
        self.apply_rule(
            "redirect",
            "-A",
            &["INPUT", "-i", &self.lan, "-p", "tcp", "--dport", "53", "-j", "ACCEPT"],
        )
        .await?;
        self.apply_rule(
            "redirect",
            "-A",
            &["INPUT", "-i", &self.lan, "-p", "tcp", "--dport", &port, "-j", "ACCEPT"],
        )
        .await?;

        // Replies to granted clients flow without per-packet MAC matching.
        self.apply_rule(
            "redirect",
            "-A",
            &[
                "FORWARD", "-m", "conntrack", "--ctstate", "ESTABLISHED,RELATED", "-j", "ACCEPT",
            ],
        )
        .await?;

        // Default-drop: only granted MACs get out.
        self.run_checked(
            "redirect",
            &["-P".to_string(), "FORWARD".to_string(), "DROP".to_string()],
        )
        .await?;

        self.apply_rule(
            "redirect",
            "-A",
            &["-t", "nat", "POSTROUTING", "-o", &self.wan, "-j", "MASQUERADE"],
        )
        .await?;

        Ok(())
    }

    async fn list_authorized(&self) -> CoreResult<Vec<String>> {
        let args = vec!["-S".to_string(), "FORWARD".to_string()];
        let out = run_iptables(&args).await?;
        if !out.status.success() {
            return Err(CoreError::KernelError(
                String::from_utf8_lossy(&out.stderr).trim().to_string(),
            ));
        }
        Ok(parse_authorized(&String::from_utf8_lossy(&out.stdout)))
    }
}

/// In-memory fake for tests: records every call, never touches the kernel.
#[derive(Default)]
pub struct MemoryFirewall {
    state: Mutex<MemoryState>,
    /// When false, `install_ttl_drop` reports `Unsupported`.
    pub ttl_match_supported: bool,
}

#[derive(Default)]
struct MemoryState {
    granted: BTreeSet<String>,
    ttl_drops: BTreeSet<(String, u8)>,
    grant_calls: Vec<String>,
    revoke_calls: Vec<String>,
    redirect_installed: bool,
}

impl MemoryFirewall {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            ttl_match_supported: true,
        }
    }

    pub fn granted(&self) -> Vec<String> {
        self.state.lock().unwrap().granted.iter().cloned().collect()
    }

    pub fn is_granted(&self, mac: &str) -> bool {
        self.state.lock().unwrap().granted.contains(mac)
    }

    pub fn grant_calls(&self, mac: &str) -> usize {
        self.state.lock().unwrap().grant_calls.iter().filter(|m| *m == mac).count()
    }

    pub fn revoke_calls(&self, mac: &str) -> usize {
        self.state.lock().unwrap().revoke_calls.iter().filter(|m| *m == mac).count()
    }

    pub fn has_ttl_drop(&self, mac: &str, ttl: u8) -> bool {
        self.state.lock().unwrap().ttl_drops.contains(&(mac.to_string(), ttl))
    }

    pub fn redirect_installed(&self) -> bool {
        self.state.lock().unwrap().redirect_installed
    }

    /// Simulate out-of-band kernel drift for reconciliation tests.
    pub fn force_remove(&self, mac: &str) {
        self.state.lock().unwrap().granted.remove(mac);
    }
}

#[async_trait]
impl Firewall for MemoryFirewall {
    async fn grant(&self, mac: &str) -> CoreResult<()> {
        let mac = kernel_mac(mac)?;
        let mut state = self.state.lock().unwrap();
        state.grant_calls.push(mac.clone());
        state.granted.insert(mac);
        Ok(())
    }

    async fn revoke(&self, mac: &str) -> CoreResult<()> {
        let mac = kernel_mac(mac)?;
        let mut state = self.state.lock().unwrap();
        state.revoke_calls.push(mac.clone());
        state.granted.remove(&mac);
        Ok(())
    }

    async fn install_ttl_drop(&self, mac: &str, expected_ttl: u8) -> CoreResult<()> {
        let mac = kernel_mac(mac)?;
        if !self.ttl_match_supported {
            return Err(CoreError::Unsupported("kernel TTL match unavailable".into()));
        }
        self.state.lock().unwrap().ttl_drops.insert((mac, expected_ttl));
        Ok(())
    }

    async fn remove_ttl_drop(&self, mac: &str, expected_ttl: u8) -> CoreResult<()> {
        let mac = kernel_mac(mac)?;
        self.state.lock().unwrap().ttl_drops.remove(&(mac, expected_ttl));
        Ok(())
    }

    async fn install_portal_redirect(&self) -> CoreResult<()> {
        self.state.lock().unwrap().redirect_installed = true;
        Ok(())
    }

    async fn list_authorized(&self) -> CoreResult<Vec<String>> {
        Ok(self.granted())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_grant_idempotent() {
        let fw = MemoryFirewall::new();
        fw.grant("AA:BB:CC:11:22:33").await.unwrap();
        fw.grant("AA:BB:CC:11:22:33").await.unwrap();
        assert_eq!(fw.granted(), vec!["AA:BB:CC:11:22:33".to_string()]);

        fw.revoke("AA:BB:CC:11:22:33").await.unwrap();
        fw.revoke("AA:BB:CC:11:22:33").await.unwrap();
        assert!(fw.granted().is_empty());
    }

    #[tokio::test]
    async fn test_hostile_macs_never_reach_rules() {
        let fw = MemoryFirewall::new();
        for bad in ["aa:bb", "zz:zz:zz:zz:zz:zz", "a; rm -rf /", "Unknown"] {
            assert!(fw.grant(bad).await.is_err(), "accepted {bad:?}");
            assert!(fw.revoke(bad).await.is_err());
            assert!(fw.install_ttl_drop(bad, 64).await.is_err());
        }
        assert!(fw.granted().is_empty());
    }

    #[tokio::test]
    async fn test_ttl_drop_unsupported_kernel() {
        let mut fw = MemoryFirewall::new();
        fw.ttl_match_supported = false;
        let err = fw.install_ttl_drop("DE:AD:BE:EF:00:01", 64).await.unwrap_err();
        assert!(matches!(err, CoreError::Unsupported(_)));
    }

    #[test]
    fn test_with_action_places_table_selector_first() {
        let rule = ["-t", "nat", "PREROUTING", "-i", "wlan0", "-j", "ACCEPT"];
        let args = with_action("-I", &rule);
        assert_eq!(args[0], "-t");
        assert_eq!(args[1], "nat");
        assert_eq!(args[2], "-I");
        assert_eq!(args[3], "PREROUTING");

        let rule = ["FORWARD", "-j", "ACCEPT"];
        let args = with_action("-D", &rule);
        assert_eq!(args, vec!["-D", "FORWARD", "-j", "ACCEPT"]);
    }

    #[test]
    fn test_parse_authorized() {
        let listing = "\
-P FORWARD DROP
-A FORWARD -m conntrack --ctstate ESTABLISHED,RELATED -j ACCEPT
-A FORWARD -i wlan0 -m mac --mac-source AA:BB:CC:11:22:33 -j ACCEPT
-A FORWARD -i wlan0 -m mac --mac-source DE:AD:BE:EF:00:01 -j DROP
";
        let macs = parse_authorized(listing);
        assert_eq!(macs, vec!["AA:BB:CC:11:22:33".to_string()]);
    }
}
