use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Lifecycle state of a client device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ClientStatus {
    Disconnected,
    Connected,
    Paused,
    Blocked,
}

impl ClientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientStatus::Disconnected => "DISCONNECTED",
            ClientStatus::Connected => "CONNECTED",
            ClientStatus::Paused => "PAUSED",
            ClientStatus::Blocked => "BLOCKED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "DISCONNECTED" => Ok(ClientStatus::Disconnected),
            "CONNECTED" => Ok(ClientStatus::Connected),
            "PAUSED" => Ok(ClientStatus::Paused),
            "BLOCKED" => Ok(ClientStatus::Blocked),
            other => Err(CoreError::Io(format!("unknown client status: {other}"))),
        }
    }
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One interval of continuous CONNECTED state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Ended,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "ACTIVE",
            SessionStatus::Ended => "ENDED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Completed,
    Refunded,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Completed => "COMPLETED",
            TransactionStatus::Refunded => "REFUNDED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentMethod {
    Coin,
    Voucher,
    Admin,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Coin => "COIN",
            PaymentMethod::Voucher => "VOUCHER",
            PaymentMethod::Admin => "ADMIN",
        }
    }
}

/// Coin acceptor slot ownership state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Available,
    Claimed,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Available => "available",
            SlotStatus::Claimed => "claimed",
        }
    }
}

/// Coin queue entry state. Once an entry leaves `queued` it is immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Queued,
    Redeemed,
    Expired,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Queued => "queued",
            QueueStatus::Redeemed => "redeemed",
            QueueStatus::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    TtlVariance,
    TtlDecrement,
    MultipleDevices,
}

impl AnomalyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyType::TtlVariance => "ttl_variance",
            AnomalyType::TtlDecrement => "ttl_decrement",
            AnomalyType::MultipleDevices => "multiple_devices",
        }
    }
}

impl fmt::Display for AnomalyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationStatus {
    Pending,
    Resolved,
}

impl ViolationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationStatus::Pending => "pending",
            ViolationStatus::Resolved => "resolved",
        }
    }
}

/// TTL anomaly sensitivity. The threshold is the tolerated |delta| from the
/// baseline before a `ttl_variance` anomaly is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtlSensitivity {
    High,
    Medium,
    Low,
}

impl TtlSensitivity {
    pub fn threshold(&self) -> i16 {
        match self {
            TtlSensitivity::High => 0,
            TtlSensitivity::Medium => 1,
            TtlSensitivity::Low => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TtlSensitivity::High => "high",
            TtlSensitivity::Medium => "medium",
            TtlSensitivity::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "high" => Ok(TtlSensitivity::High),
            "medium" => Ok(TtlSensitivity::Medium),
            "low" => Ok(TtlSensitivity::Low),
            other => Err(CoreError::InvalidInput(format!(
                "unknown sensitivity: {other}"
            ))),
        }
    }
}

/// Reason a session ended; carried on the disconnect event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    TimeExpired,
    AdminAction,
    Logout,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::TimeExpired => "time_expired",
            DisconnectReason::AdminAction => "admin_action",
            DisconnectReason::Logout => "logout",
        }
    }
}
