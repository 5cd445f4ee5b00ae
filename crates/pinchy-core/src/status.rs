//! Connection status of a gateway client.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Connection status.
///
/// `Disconnected -> Connecting -> Handshaking -> Connected`, with `Error`
/// as the resting state after a failed handshake or exhausted retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No socket and no reconnect scheduled.
    #[default]
    Disconnected,
    /// Socket is being opened, or a reconnect is scheduled.
    Connecting,
    /// Socket is open; waiting for the challenge / `hello-ok`.
    Handshaking,
    /// Handshake complete; calls are allowed.
    Connected,
    /// Terminal until an explicit `connect()`.
    Error,
}

impl ConnectionStatus {
    /// Returns the wire/display name of this status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }

    /// Whether calls other than the handshake may be issued.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
