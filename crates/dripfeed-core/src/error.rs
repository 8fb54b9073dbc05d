// Error taxonomy for the dripfeed core.
//
// Storage backends surface `StoreError`; everything above the store works
// with `DripError`. Per-user delivery failures are `Transport` and are
// isolated by the scheduler scan — they must never abort the remaining
// population.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Error produced by a `Store` implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("conflicting write: {0}")]
    Conflict(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Stable error codes surfaced at the HTTP boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    UserNotFound,
    UnknownPlan,
    GiftNotFound,
    GiftNotPaid,
    GiftAlreadyRedeemed,
    InvalidTimezone,
    SlotNotConfigured,
    TransportFailed,
    InternalError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::UserNotFound => "User not found",
            Self::UnknownPlan => "Unknown subscription plan",
            Self::GiftNotFound => "Gift token not found",
            Self::GiftNotPaid => "Gift has not been paid",
            Self::GiftAlreadyRedeemed => "Gift already redeemed",
            Self::InvalidTimezone => "Invalid timezone",
            Self::SlotNotConfigured => "Delivery slot not configured",
            Self::TransportFailed => "Message transport failed",
            Self::InternalError => "Internal error",
        };
        write!(f, "{msg}")
    }
}

/// Top-level error for engine operations.
#[derive(Debug, thiserror::Error)]
pub enum DripError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("unknown plan: {0}")]
    UnknownPlan(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl DripError {
    /// The stable code for this error, for HTTP responses and logs.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Store(StoreError::NotFound(_)) => ErrorCode::UserNotFound,
            Self::InvalidTimezone(_) => ErrorCode::InvalidTimezone,
            Self::UnknownPlan(_) => ErrorCode::UnknownPlan,
            Self::Transport(_) => ErrorCode::TransportFailed,
            _ => ErrorCode::InternalError,
        }
    }
}

/// Unified result type for dripfeed operations.
pub type Result<T> = std::result::Result<T, DripError>;
