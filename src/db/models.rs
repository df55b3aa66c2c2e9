use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// Money columns are canonical decimal strings. Arithmetic goes through
// BigDecimal at the call site; the store never interprets amounts.

/// Persistent identity of a device. `mac_address = 'Unknown'` rows are
/// keyed by session token instead.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Client {
    pub id: i64,
    pub mac_address: String,
    pub ip_address: Option<String>,
    pub session_token: Option<String>,
    pub device_os: Option<String>,
    pub device_browser: Option<String>,
    pub user_agent: Option<String>,
    pub status: String,
    pub time_remaining: i64,
    pub total_amount_paid: String,
    pub upload_limit: i64,
    pub download_limit: i64,
    pub whitelisted: bool,
    pub paused_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// For inserting new clients
#[derive(Debug, Clone)]
pub struct NewClient {
    pub mac_address: String,
    pub ip_address: Option<String>,
    pub session_token: Option<String>,
    pub device_os: Option<String>,
    pub device_browser: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub client_id: i64,
    pub mac_address: String,
    pub ip_address: Option<String>,
    pub session_token: Option<String>,
    pub granted_duration: i64,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub client_id: i64,
    pub session_id: Option<i64>,
    pub rate_id: Option<i64>,
    pub amount_paid: String,
    pub coins_used: i64,
    pub payment_method: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// For appending transactions
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub client_id: i64,
    pub session_id: Option<i64>,
    pub rate_id: Option<i64>,
    pub amount_paid: String,
    pub coins_used: i64,
    pub payment_method: String,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Rate {
    pub id: i64,
    pub name: String,
    pub price: String,
    pub duration: i64,
    pub coins_required: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewRate {
    pub name: String,
    pub price: String,
    pub duration: i64,
    pub coins_required: i64,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CoinSlot {
    pub id: i64,
    pub slot_number: i64,
    pub status: String,
    pub claimed_by_ip: Option<String>,
    pub claimed_by_mac: Option<String>,
    pub claimed_by_session_token: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CoinQueueEntry {
    pub id: i64,
    pub slot_id: Option<i64>,
    pub client_ip: Option<String>,
    pub client_mac: Option<String>,
    pub session_token: Option<String>,
    pub coin_value: String,
    pub coin_count: i64,
    pub total_value: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PortalSettings {
    pub id: i64,
    pub coin_timeout: i64,
    pub auto_pause_on_disconnect: bool,
    pub auto_resume_on_pause: bool,
    pub pause_resume_minutes: i64,
    pub coin_abuse_protection: bool,
    pub coin_attempt_limit: i64,
    pub coin_attempt_window: i64,
    pub coin_block_duration: i64,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub id: i64,
    pub lan_interface: String,
    pub gateway_ip: String,
    pub lan_prefix: i64,
    pub dhcp_range_start: String,
    pub dhcp_range_end: String,
    pub wan_mode: String,
    pub pppoe_username: Option<String>,
    pub pppoe_password: Option<String>,
    pub bandwidth_enabled: bool,
    pub bandwidth_download_limit: i64,
    pub bandwidth_upload_limit: i64,
    pub per_client_bandwidth_enabled: bool,
    pub per_client_download_limit: i64,
    pub per_client_upload_limit: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct CoinAttempt {
    pub id: i64,
    pub client_ip: String,
    pub client_mac: String,
    pub attempts: i64,
    pub window_start: DateTime<Utc>,
    pub blocked_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TtlSettings {
    pub id: i64,
    pub enabled: bool,
    pub sensitivity: String,
    pub auto_block: bool,
    pub alert_threshold: i64,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TtlBaseline {
    pub id: i64,
    pub client_mac: String,
    pub baseline_ttl: i64,
    pub confidence: f64,
    pub established_at: DateTime<Utc>,
    pub last_verified: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TtlAnomaly {
    pub id: i64,
    pub client_mac: String,
    pub anomaly_type: String,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TtlViolation {
    pub id: i64,
    pub client_mac: String,
    pub status: String,
    pub violation_count: i64,
    pub severity: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
