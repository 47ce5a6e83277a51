//! Error types for Floodgate.

use serde::Serialize;
use thiserror::Error;

use crate::floodcontrol::CancelReason;
use crate::store::StoreError;

/// Main error type for Floodgate operations.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// The shared store failed; never retried by the checker
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The per-user lock stayed busy for every attempt
    #[error("Lock {lock} could not be acquired after {attempts} attempts")]
    LockTimeout { lock: String, attempts: u32 },

    /// The user has used up the quota for the current window
    #[error("Limit of {limit} requests is exceeded for user: {user_id}")]
    QuotaExceeded { user_id: String, limit: u64 },

    /// The caller's context ended before the check completed
    #[error("Check cancelled: {reason}")]
    Cancelled { reason: CancelReason },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of [`FloodgateError`] for callers that need to
/// branch on the failure without looking at its text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Store,
    LockTimeout,
    QuotaExceeded,
    Cancelled,
    Config,
    Io,
}

impl FloodgateError {
    /// The kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FloodgateError::Store(_) => ErrorKind::Store,
            FloodgateError::LockTimeout { .. } => ErrorKind::LockTimeout,
            FloodgateError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            FloodgateError::Cancelled { .. } => ErrorKind::Cancelled,
            FloodgateError::Config(_) => ErrorKind::Config,
            FloodgateError::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether the whole check may succeed if simply retried later.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Store | ErrorKind::LockTimeout)
    }

    /// Whether this is the expected "not allowed now" outcome.
    pub fn is_quota_exceeded(&self) -> bool {
        self.kind() == ErrorKind::QuotaExceeded
    }
}

impl From<config::ConfigError> for FloodgateError {
    fn from(err: config::ConfigError) -> Self {
        FloodgateError::Config(err.to_string())
    }
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
