use std::env;
use std::fmt;
use std::path::Path;

use eyre::{eyre, Result, WrapErr};

use crate::net;

/// Main configuration for the gateway, loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub network: NetworkIfaceConfig,
    pub gpio: GpioConfig,
}

#[derive(Clone)]
pub struct ServerConfig {
    /// HTTP listener port for portal + admin + captive probes.
    pub port: u16,
    /// HS256 secret used to verify admin bearer tokens. Issuance lives in
    /// the dashboard; this process only verifies.
    pub jwt_secret: String,
    /// Development mode: permits an empty JWT secret and logs a warning.
    pub dev_mode: bool,
}

/// Custom Debug that redacts the JWT secret (would otherwise leak via
/// startup logging of the config).
impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("port", &self.port)
            .field("jwt_secret", &"<redacted>")
            .field("dev_mode", &self.dev_mode)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct NetworkIfaceConfig {
    /// LAN interface clients attach to (hostapd side).
    pub lan_interface: String,
    /// WAN egress interface (masquerade target).
    pub wan_interface: String,
    /// Interface the TTL detector captures on; defaults to the LAN side.
    pub ttl_interface: String,
    pub enable_dns_interceptor: bool,
}

#[derive(Debug, Clone)]
pub struct GpioConfig {
    pub coin_pin: u8,
    pub led_pin: u8,
    /// Address of the external GPIO bridge publishing coin pulses as
    /// newline-delimited JSON.
    pub bridge_addr: String,
}

fn default_database_url() -> String {
    "sqlite://piso-gateway.db?mode=rwc".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_lan_interface() -> String {
    "wlan0".to_string()
}

fn default_wan_interface() -> String {
    "eth0".to_string()
}

fn default_bridge_addr() -> String {
    "127.0.0.1:5770".to_string()
}

fn env_bool(name: &str) -> bool {
    env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes"))
        .unwrap_or(false)
}

impl Config {
    /// Load configuration, reading `.env` first when present.
    pub fn load() -> Result<Self> {
        if Path::new(".env").exists() {
            dotenvy::from_filename(".env").wrap_err("failed to load .env file")?;
        }
        Self::load_from_env()
    }

    fn load_from_env() -> Result<Self> {
        let dev_mode = env_bool("PISO_DEV_MODE");
        let jwt_secret = match env::var("JWT_SECRET") {
            Ok(s) => s,
            Err(_) if dev_mode => String::new(),
            Err(_) => {
                return Err(eyre!(
                    "JWT_SECRET environment variable is required (set PISO_DEV_MODE=1 to run without admin auth)"
                ))
            }
        };

        let server = ServerConfig {
            port: env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_port),
            jwt_secret,
            dev_mode,
        };

        let database = DatabaseConfig {
            url: env::var("DATABASE_URL").unwrap_or_else(|_| default_database_url()),
        };

        let lan_interface =
            env::var("PISOWIFI_INTERFACE").unwrap_or_else(|_| default_lan_interface());
        let network = NetworkIfaceConfig {
            ttl_interface: env::var("TTL_INTERFACE").unwrap_or_else(|_| lan_interface.clone()),
            lan_interface,
            wan_interface: env::var("WAN_INTERFACE").unwrap_or_else(|_| default_wan_interface()),
            enable_dns_interceptor: env_bool("ENABLE_DNS_INTERCEPTOR"),
        };

        let gpio = GpioConfig {
            coin_pin: env::var("GPIO_PIN_COIN")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            led_pin: env::var("GPIO_PIN_LED")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            bridge_addr: env::var("GPIO_BRIDGE_ADDR").unwrap_or_else(|_| default_bridge_addr()),
        };

        let config = Config {
            server,
            database,
            network,
            gpio,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration before anything touches the kernel.
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(eyre!("database.url cannot be empty"));
        }
        if self.server.port == 0 {
            return Err(eyre!("PORT cannot be 0"));
        }
        if !self.server.dev_mode && self.server.jwt_secret.len() < 16 {
            return Err(eyre!("JWT_SECRET must be at least 16 bytes in production"));
        }
        net::validate_iface(&self.network.lan_interface)
            .map_err(|e| eyre!("PISOWIFI_INTERFACE: {e}"))?;
        net::validate_iface(&self.network.wan_interface)
            .map_err(|e| eyre!("WAN_INTERFACE: {e}"))?;
        net::validate_iface(&self.network.ttl_interface)
            .map_err(|e| eyre!("TTL_INTERFACE: {e}"))?;
        if self.network.lan_interface == self.network.wan_interface {
            return Err(eyre!(
                "LAN and WAN interfaces cannot both be {}",
                self.network.lan_interface
            ));
        }
        if self.gpio.bridge_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(eyre!(
                "GPIO_BRIDGE_ADDR must be host:port, got {}",
                self.gpio.bridge_addr
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            server: ServerConfig {
                port: 3000,
                jwt_secret: "0123456789abcdef0123".to_string(),
                dev_mode: false,
            },
            database: DatabaseConfig {
                url: "sqlite::memory:".to_string(),
            },
            network: NetworkIfaceConfig {
                lan_interface: "wlan0".to_string(),
                wan_interface: "eth0".to_string(),
                ttl_interface: "wlan0".to_string(),
                enable_dns_interceptor: false,
            },
            gpio: GpioConfig {
                coin_pin: 3,
                led_pin: 5,
                bridge_addr: "127.0.0.1:5770".to_string(),
            },
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_short_secret_rejected_outside_dev_mode() {
        let mut config = test_config();
        config.server.jwt_secret = "short".to_string();
        assert!(config.validate().is_err());
        config.server.dev_mode = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_hostile_interface_rejected() {
        let mut config = test_config();
        config.network.lan_interface = "wlan0; rm -rf /".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_same_lan_wan_rejected() {
        let mut config = test_config();
        config.network.wan_interface = "wlan0".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_bridge_addr_rejected() {
        let mut config = test_config();
        config.gpio.bridge_addr = "not-an-addr".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_defaults() {
        assert_eq!(default_port(), 3000);
        assert_eq!(default_lan_interface(), "wlan0");
        assert_eq!(default_bridge_addr(), "127.0.0.1:5770");
    }

    #[test]
    fn test_jwt_secret_redacted_in_debug() {
        let config = test_config();
        let debug = format!("{:?}", config.server);
        assert!(!debug.contains("0123456789abcdef0123"));
        assert!(debug.contains("<redacted>"));
    }
}
