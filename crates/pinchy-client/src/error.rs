//! Per-call errors.

use std::time::Duration;

use pinchy_core::ConnectionStatus;

/// Why a call failed. Delivered only to the caller that issued it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("Cannot call \"{method}\": not connected (status: {status})")]
    NotConnected {
        method: String,
        status: ConnectionStatus,
    },
    #[error("Request \"{method}\" timed out after {}ms", after.as_millis())]
    Timeout { method: String, after: Duration },
    #[error("{message}")]
    Rejected {
        code: Option<String>,
        message: String,
    },
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    #[error("Invalid params for \"{method}\": {message}")]
    InvalidParams { method: String, message: String },
    #[error("Unexpected payload for \"{method}\": {message}")]
    InvalidPayload { method: String, message: String },
}

impl CallError {
    /// Whether this error came from the call deadline.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
