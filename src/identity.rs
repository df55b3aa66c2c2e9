//! Maps an incoming HTTP request to (MAC, IP, session token).
//!
//! Modern devices rotate MACs per SSID and sometimes per connection, so the
//! session-token cookie is the stable identity across disconnects; the MAC
//! is carried because it is the only key the kernel filter can match.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::http::{HeaderMap, HeaderValue};
use rand::RngCore;

use crate::net::{NeighborTable, UNKNOWN_MAC};

pub const TOKEN_COOKIE: &str = "piso_token";

/// The resolved identity triple threaded through every portal call.
#[derive(Debug, Clone)]
pub struct Identity {
    /// LAN IPv4 of the requester; absent when the request did not arrive
    /// from the LAN subnet.
    pub ip: Option<Ipv4Addr>,
    /// Canonical uppercase MAC, or the literal `Unknown`.
    pub mac: String,
    pub token: Option<String>,
    /// Set when this request minted a fresh token; the response must carry
    /// the Set-Cookie.
    pub minted: bool,
}

impl Identity {
    pub fn ip_string(&self) -> Option<String> {
        self.ip.map(|ip| ip.to_string())
    }

    /// Cookie header value for a newly minted token.
    pub fn set_cookie_value(&self) -> Option<HeaderValue> {
        if !self.minted {
            return None;
        }
        let token = self.token.as_deref()?;
        // The captive LAN is plain HTTP, so no Secure attribute.
        let cookie = format!(
            "{TOKEN_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age=31536000"
        );
        HeaderValue::from_str(&cookie).ok()
    }
}

pub struct IdentityResolver {
    neighbors: Arc<dyn NeighborTable>,
    lan_network: Ipv4Addr,
    lan_prefix: u8,
}

impl IdentityResolver {
    pub fn new(neighbors: Arc<dyn NeighborTable>, lan_network: Ipv4Addr, lan_prefix: u8) -> Self {
        Self {
            neighbors,
            lan_network,
            lan_prefix,
        }
    }

    /// Resolution order is strict: remote IP first, then the neighbor table
    /// for the MAC, then the cookie (minting on first visit).
    pub async fn resolve(&self, remote: SocketAddr, headers: &HeaderMap) -> Identity {
        let ip = normalize_remote_ip(remote.ip())
            .filter(|ip| crate::net::in_subnet(*ip, self.lan_network, self.lan_prefix));

        let mac = match ip {
            Some(ip) => self
                .neighbors
                .lookup(ip)
                .await
                .unwrap_or_else(|| UNKNOWN_MAC.to_string()),
            None => UNKNOWN_MAC.to_string(),
        };

        let (token, minted) = match cookie_value(headers, TOKEN_COOKIE) {
            Some(token) => (Some(token), false),
            None => (Some(mint_token()), true),
        };

        Identity {
            ip,
            mac,
            token,
            minted,
        }
    }
}

/// Strip IPv4-mapped-IPv6 prefixes; reject anything that is not IPv4.
fn normalize_remote_ip(ip: IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    for pair in raw.split(';') {
        let mut parts = pair.trim().splitn(2, '=');
        if parts.next() == Some(name) {
            let value = parts.next()?.trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// 256-bit OS-random token, hex encoded: the 64-char opaque identity that
/// survives MAC rotation.
pub fn mint_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Rough device fingerprint from the User-Agent, carried for the operator
/// dashboard. Never used for authorization.
pub fn fingerprint_user_agent(user_agent: Option<&str>) -> (Option<String>, Option<String>) {
    let ua = match user_agent {
        Some(ua) => ua,
        None => return (None, None),
    };
    let os = if ua.contains("Android") {
        Some("Android")
    } else if ua.contains("iPhone") || ua.contains("iPad") {
        Some("iOS")
    } else if ua.contains("Windows") {
        Some("Windows")
    } else if ua.contains("Mac OS X") {
        Some("macOS")
    } else if ua.contains("Linux") {
        Some("Linux")
    } else {
        None
    };
    let browser = if ua.contains("Firefox/") {
        Some("Firefox")
    } else if ua.contains("Edg/") {
        Some("Edge")
    } else if ua.contains("Chrome/") {
        Some("Chrome")
    } else if ua.contains("Safari/") {
        Some("Safari")
    } else {
        None
    };
    (os.map(String::from), browser.map(String::from))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::StaticNeighborTable;
    use axum::http::header::COOKIE;

    fn lan_resolver(neighbors: Arc<StaticNeighborTable>) -> IdentityResolver {
        IdentityResolver::new(neighbors, Ipv4Addr::new(10, 0, 0, 0), 24)
    }

    #[tokio::test]
    async fn test_resolves_mac_from_neighbor_table() {
        let neighbors = Arc::new(StaticNeighborTable::new());
        neighbors
            .insert(Ipv4Addr::new(10, 0, 0, 12), "AA:BB:CC:11:22:33")
            .await;
        let resolver = lan_resolver(neighbors);

        let identity = resolver
            .resolve("10.0.0.12:51000".parse().unwrap(), &HeaderMap::new())
            .await;
        assert_eq!(identity.ip, Some(Ipv4Addr::new(10, 0, 0, 12)));
        assert_eq!(identity.mac, "AA:BB:CC:11:22:33");
        assert!(identity.minted);
        assert_eq!(identity.token.as_ref().unwrap().len(), 64);
    }

    #[tokio::test]
    async fn test_unresolved_mac_falls_back_to_unknown() {
        let resolver = lan_resolver(Arc::new(StaticNeighborTable::new()));
        let identity = resolver
            .resolve("10.0.0.99:40000".parse().unwrap(), &HeaderMap::new())
            .await;
        assert_eq!(identity.mac, UNKNOWN_MAC);
    }

    #[tokio::test]
    async fn test_ipv4_mapped_ipv6_is_stripped() {
        let neighbors = Arc::new(StaticNeighborTable::new());
        neighbors
            .insert(Ipv4Addr::new(10, 0, 0, 12), "AA:BB:CC:11:22:33")
            .await;
        let resolver = lan_resolver(neighbors);
        let identity = resolver
            .resolve("[::ffff:10.0.0.12]:51000".parse().unwrap(), &HeaderMap::new())
            .await;
        assert_eq!(identity.ip, Some(Ipv4Addr::new(10, 0, 0, 12)));
        assert_eq!(identity.mac, "AA:BB:CC:11:22:33");
    }

    #[tokio::test]
    async fn test_off_subnet_ip_is_rejected() {
        let resolver = lan_resolver(Arc::new(StaticNeighborTable::new()));
        let identity = resolver
            .resolve("192.168.1.50:50000".parse().unwrap(), &HeaderMap::new())
            .await;
        assert_eq!(identity.ip, None);
        assert_eq!(identity.mac, UNKNOWN_MAC);
    }

    #[tokio::test]
    async fn test_existing_cookie_is_kept() {
        let resolver = lan_resolver(Arc::new(StaticNeighborTable::new()));
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, "piso_token=abc123; other=1".parse().unwrap());
        let identity = resolver
            .resolve("10.0.0.12:51000".parse().unwrap(), &headers)
            .await;
        assert_eq!(identity.token.as_deref(), Some("abc123"));
        assert!(!identity.minted);
        assert!(identity.set_cookie_value().is_none());
    }

    #[test]
    fn test_minted_tokens_are_unique() {
        assert_ne!(mint_token(), mint_token());
    }

    #[test]
    fn test_fingerprint_user_agent() {
        let (os, browser) = fingerprint_user_agent(Some(
            "Mozilla/5.0 (Linux; Android 13) AppleWebKit/537.36 Chrome/120.0 Mobile Safari/537.36",
        ));
        assert_eq!(os.as_deref(), Some("Android"));
        assert_eq!(browser.as_deref(), Some("Chrome"));
        assert_eq!(fingerprint_user_agent(None), (None, None));
    }
}
