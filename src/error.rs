use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Domain error kinds. Each maps to exactly one HTTP status; `Conflict` and
/// `InsufficientFunds` are normal outcomes of the coin protocol, not faults.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Request rejected before any side effect.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Uniqueness or claim collision (slot already claimed by someone else).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Identity does not own the resource.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Redeem attempted with queued total below the rate price.
    #[error("insufficient funds: have {have}, need {need}")]
    InsufficientFunds { have: String, need: String },

    /// Kernel feature missing (e.g. TTL match unavailable).
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// External command or kernel call failed after retry. The caller's
    /// committed state stands; reconciliation re-applies the rule later.
    #[error("kernel error: {0}")]
    KernelError(String),

    /// Coin abuse guard tripped; advisory block, credits are untouched.
    #[error("too many attempts, retry after {retry_after_secs}s")]
    TooManyAttempts { retry_after_secs: i64 },

    /// Database or socket failure. Aborts the request, never the process.
    #[error("io: {0}")]
    Io(String),
}

impl CoreError {
    pub fn status(&self) -> StatusCode {
        match self {
            CoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::Forbidden(_) => StatusCode::FORBIDDEN,
            CoreError::InsufficientFunds { .. } => StatusCode::PAYMENT_REQUIRED,
            CoreError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
            CoreError::KernelError(_) => StatusCode::BAD_GATEWAY,
            CoreError::TooManyAttempts { .. } => StatusCode::TOO_MANY_REQUESTS,
            CoreError::Io(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Stable machine-readable kind for API consumers and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::InvalidInput(_) => "invalid_input",
            CoreError::NotFound(_) => "not_found",
            CoreError::Conflict(_) => "conflict",
            CoreError::Forbidden(_) => "forbidden",
            CoreError::InsufficientFunds { .. } => "insufficient_funds",
            CoreError::Unsupported(_) => "unsupported",
            CoreError::KernelError(_) => "kernel_error",
            CoreError::TooManyAttempts { .. } => "too_many_attempts",
            CoreError::Io(_) => "io",
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => CoreError::NotFound("row not found".into()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                CoreError::Conflict(db.message().to_string())
            }
            _ => CoreError::Io(e.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(kind = self.kind(), error = %self, "request failed");
        }
        let body = ErrorBody {
            error: self.kind(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
