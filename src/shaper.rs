//! Per-client and global bandwidth limits via a hierarchical token-bucket
//! tree on the LAN interface. Download shapes on the LAN egress directly;
//! upload mirrors ingress to an intermediate functional block (ifb0) and
//! shapes an identical tree there.
//!
//! A missing shaping rule causes over-bandwidth, never incorrect billing,
//! so failures here log and continue.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::process::Output;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};
use crate::net::{class_id_for_ip, validate_iface, validate_rate_kbps};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
const IFB_DEVICE: &str = "ifb0";

/// Per-client limits in kbps; 0 means unlimited (class is skipped).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientLimits {
    pub download_kbps: u32,
    pub upload_kbps: u32,
}

#[async_trait]
pub trait Shaper: Send + Sync {
    async fn set_global(&self, download_kbps: u32, upload_kbps: u32) -> CoreResult<()>;

    async fn clear_global(&self) -> CoreResult<()>;

    /// Install or replace the class and filter for one client. Idempotent.
    async fn set_client(&self, ip: Ipv4Addr, limits: ClientLimits) -> CoreResult<()>;

    async fn clear_client(&self, ip: Ipv4Addr) -> CoreResult<()>;

    /// Ensure exactly the given per-client classes exist.
    async fn reconcile(&self, clients: &[(Ipv4Addr, ClientLimits)]) -> CoreResult<()>;
}

/// Production driver speaking to tc.
pub struct TcShaper {
    lan: String,
    /// Classes this driver installed, by IP. The driver is the only mutator
    /// of the queueing tree, so this mirror is authoritative enough for
    /// reconciliation without parsing `tc class show`.
    installed: Mutex<HashMap<Ipv4Addr, ClientLimits>>,
}

impl TcShaper {
    pub fn new(lan: &str) -> CoreResult<Self> {
        validate_iface(lan)?;
        Ok(Self {
            lan: lan.to_string(),
            installed: Mutex::new(HashMap::new()),
        })
    }

    async fn ensure_root(&self, dev: &str, rate_kbps: Option<u32>) -> CoreResult<()> {
        // Root class carries either the global cap or effectively-unlimited.
        let rate = rate_kbps.unwrap_or(10_000_000);
        run_tc(&[
            "qdisc", "replace", "dev", dev, "root", "handle", "1:", "htb", "default", "999",
        ])
        .await?;
        let rate_arg = format!("{rate}kbit");
        run_tc(&[
            "class", "replace", "dev", dev, "parent", "1:", "classid", "1:1", "htb", "rate",
            &rate_arg, "ceil", &rate_arg,
        ])
        .await?;
        // Unclassified traffic rides the root rate.
        run_tc(&[
            "class", "replace", "dev", dev, "parent", "1:1", "classid", "1:999", "htb", "rate",
            &rate_arg, "ceil", &rate_arg,
        ])
        .await?;
        Ok(())
    }

    async fn ensure_ifb(&self) -> CoreResult<()> {
        // Mirror LAN ingress into the functional block for upload shaping.
        run_tc(&["qdisc", "replace", "dev", &self.lan, "ingress"]).await?;
        run_tc(&[
            "filter", "replace", "dev", &self.lan, "parent", "ffff:", "protocol", "ip", "u32",
            "match", "u32", "0", "0", "action", "mirred", "egress", "redirect", "dev", IFB_DEVICE,
        ])
        .await?;
        Ok(())
    }

    async fn install_class(
        &self,
        dev: &str,
        ip: Ipv4Addr,
        rate_kbps: u32,
        match_dir: &str,
    ) -> CoreResult<()> {
        let class_id = format!("1:{}", class_id_for_ip(ip));
        let rate = format!("{rate_kbps}kbit");
        let ip_arg = format!("{ip}/32");
        run_tc(&[
            "class", "replace", "dev", dev, "parent", "1:1", "classid", &class_id, "htb", "rate",
            &rate, "ceil", &rate,
        ])
        .await?;
        run_tc(&[
            "filter", "replace", "dev", dev, "protocol", "ip", "parent", "1:", "prio", "1", "u32",
            "match", "ip", match_dir, &ip_arg, "flowid", &class_id,
        ])
        .await?;
        Ok(())
    }

    async fn remove_class(&self, dev: &str, ip: Ipv4Addr, match_dir: &str) -> CoreResult<()> {
        let class_id = format!("1:{}", class_id_for_ip(ip));
        let ip_arg = format!("{ip}/32");
        // Filter first; a class with a live filter refuses deletion.
        let _ = run_tc(&[
            "filter", "del", "dev", dev, "protocol", "ip", "parent", "1:", "prio", "1", "u32",
            "match", "ip", match_dir, &ip_arg, "flowid", &class_id,
        ])
        .await;
        let _ = run_tc(&["class", "del", "dev", dev, "classid", &class_id]).await;
        Ok(())
    }
}

async fn run_tc(args: &[&str]) -> CoreResult<Output> {
    let fut = Command::new("tc").args(args).kill_on_drop(true).output();
    let out = match timeout(COMMAND_TIMEOUT, fut).await {
        Ok(Ok(out)) => out,
        Ok(Err(e)) => return Err(CoreError::KernelError(format!("spawn tc: {e}"))),
        Err(_) => return Err(CoreError::KernelError("tc timed out".into())),
    };
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
        return Err(CoreError::KernelError(format!("tc {}: {stderr}", args.join(" "))));
    }
    Ok(out)
}

#[async_trait]
impl Shaper for TcShaper {
    async fn set_global(&self, download_kbps: u32, upload_kbps: u32) -> CoreResult<()> {
        validate_rate_kbps(download_kbps)?;
        validate_rate_kbps(upload_kbps)?;
        self.ensure_root(&self.lan, Some(download_kbps)).await?;
        self.ensure_ifb().await?;
        self.ensure_root(IFB_DEVICE, Some(upload_kbps)).await?;
        debug!(download_kbps, upload_kbps, "global bandwidth caps installed");
        Ok(())
    }

    async fn clear_global(&self) -> CoreResult<()> {
        let _ = run_tc(&["qdisc", "del", "dev", &self.lan, "root"]).await;
        let _ = run_tc(&["qdisc", "del", "dev", &self.lan, "ingress"]).await;
        let _ = run_tc(&["qdisc", "del", "dev", IFB_DEVICE, "root"]).await;
        self.installed.lock().unwrap().clear();
        Ok(())
    }

    async fn set_client(&self, ip: Ipv4Addr, limits: ClientLimits) -> CoreResult<()> {
        if limits.download_kbps > 0 {
            validate_rate_kbps(limits.download_kbps)?;
            self.install_class(&self.lan, ip, limits.download_kbps, "dst").await?;
        }
        if limits.upload_kbps > 0 {
            validate_rate_kbps(limits.upload_kbps)?;
            self.ensure_ifb().await?;
            self.install_class(IFB_DEVICE, ip, limits.upload_kbps, "src").await?;
        }
        self.installed.lock().unwrap().insert(ip, limits);
        debug!(%ip, ?limits, "client shaping installed");
        Ok(())
    }

    async fn clear_client(&self, ip: Ipv4Addr) -> CoreResult<()> {
        self.remove_class(&self.lan, ip, "dst").await?;
        self.remove_class(IFB_DEVICE, ip, "src").await?;
        self.installed.lock().unwrap().remove(&ip);
        Ok(())
    }

    async fn reconcile(&self, clients: &[(Ipv4Addr, ClientLimits)]) -> CoreResult<()> {
        let current: HashMap<Ipv4Addr, ClientLimits> =
            self.installed.lock().unwrap().clone();

        for (ip, limits) in clients {
            if current.get(ip) != Some(limits) {
                if let Err(e) = self.set_client(*ip, *limits).await {
                    warn!(ip = %ip, error = %e, "shaper reconcile: set_client failed");
                }
            }
        }
        let wanted: HashMap<Ipv4Addr, ClientLimits> = clients.iter().copied().collect();
        for ip in current.keys() {
            if !wanted.contains_key(ip) {
                if let Err(e) = self.clear_client(*ip).await {
                    warn!(ip = %ip, error = %e, "shaper reconcile: clear_client failed");
                }
            }
        }
        Ok(())
    }
}

/// In-memory fake for tests.
#[derive(Default)]
pub struct MemoryShaper {
    state: Mutex<MemoryShaperState>,
}

#[derive(Default)]
struct MemoryShaperState {
    global: Option<(u32, u32)>,
    clients: HashMap<Ipv4Addr, ClientLimits>,
}

impl MemoryShaper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_limits(&self, ip: Ipv4Addr) -> Option<ClientLimits> {
        self.state.lock().unwrap().clients.get(&ip).copied()
    }

    pub fn global(&self) -> Option<(u32, u32)> {
        self.state.lock().unwrap().global
    }

    pub fn client_count(&self) -> usize {
        self.state.lock().unwrap().clients.len()
    }
}

#[async_trait]
impl Shaper for MemoryShaper {
    async fn set_global(&self, download_kbps: u32, upload_kbps: u32) -> CoreResult<()> {
        validate_rate_kbps(download_kbps)?;
        validate_rate_kbps(upload_kbps)?;
        self.state.lock().unwrap().global = Some((download_kbps, upload_kbps));
        Ok(())
    }

    async fn clear_global(&self) -> CoreResult<()> {
        self.state.lock().unwrap().global = None;
        Ok(())
    }

    async fn set_client(&self, ip: Ipv4Addr, limits: ClientLimits) -> CoreResult<()> {
        if limits.download_kbps > 0 {
            validate_rate_kbps(limits.download_kbps)?;
        }
        if limits.upload_kbps > 0 {
            validate_rate_kbps(limits.upload_kbps)?;
        }
        self.state.lock().unwrap().clients.insert(ip, limits);
        Ok(())
    }

    async fn clear_client(&self, ip: Ipv4Addr) -> CoreResult<()> {
        self.state.lock().unwrap().clients.remove(&ip);
        Ok(())
    }

    async fn reconcile(&self, clients: &[(Ipv4Addr, ClientLimits)]) -> CoreResult<()> {
        let mut state = self.state.lock().unwrap();
        state.clients = clients.iter().copied().collect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_memory_set_client_replaces() {
        let shaper = MemoryShaper::new();
        shaper
            .set_client(ip("10.0.0.12"), ClientLimits { download_kbps: 2048, upload_kbps: 1024 })
            .await
            .unwrap();
        shaper
            .set_client(ip("10.0.0.12"), ClientLimits { download_kbps: 4096, upload_kbps: 1024 })
            .await
            .unwrap();
        assert_eq!(
            shaper.client_limits(ip("10.0.0.12")),
            Some(ClientLimits { download_kbps: 4096, upload_kbps: 1024 })
        );
        assert_eq!(shaper.client_count(), 1);
    }

    #[tokio::test]
    async fn test_rate_bounds_rejected() {
        let shaper = MemoryShaper::new();
        let err = shaper.set_global(0, 1000).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
        let err = shaper.set_global(1000, 20_000_000).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_reconcile_installs_exact_set() {
        let shaper = MemoryShaper::new();
        shaper
            .set_client(ip("10.0.0.5"), ClientLimits { download_kbps: 512, upload_kbps: 512 })
            .await
            .unwrap();
        shaper
            .reconcile(&[(ip("10.0.0.12"), ClientLimits { download_kbps: 2048, upload_kbps: 1024 })])
            .await
            .unwrap();
        assert!(shaper.client_limits(ip("10.0.0.5")).is_none());
        assert!(shaper.client_limits(ip("10.0.0.12")).is_some());
    }

    #[test]
    fn test_tc_shaper_rejects_bad_iface() {
        assert!(TcShaper::new("wlan0; reboot").is_err());
    }
}
