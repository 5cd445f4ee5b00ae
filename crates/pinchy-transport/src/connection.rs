//! Socket abstraction.

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

/// Message from the socket to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A UTF-8 text message.
    Text(String),
    /// The socket closed. Always the last item on a connection.
    Closed(CloseInfo),
}

/// Message from the client to the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    /// Close the socket.
    Close,
}

/// Why a socket closed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseInfo {
    /// WebSocket close code, if the peer sent one.
    pub code: Option<u16>,
    pub reason: String,
}

impl CloseInfo {
    #[must_use]
    pub fn new(code: Option<u16>, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for CloseInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.reason.is_empty()) {
            (Some(code), true) => write!(f, "closed (code: {code})"),
            (Some(code), false) => write!(f, "closed (code: {code}): {}", self.reason),
            (None, true) => f.write_str("closed"),
            (None, false) => write!(f, "closed: {}", self.reason),
        }
    }
}

/// An open socket, split into its two directions.
///
/// `inbound` yields text messages followed by exactly one `Closed`; a
/// channel that ends without `Closed` means the transport went away.
/// Dropping `outbound` closes the socket.
#[derive(Debug)]
pub struct Connection {
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub inbound: mpsc::UnboundedReceiver<Inbound>,
}

/// Transport error.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid gateway URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Connection refused")]
    Refused,
}

/// Opens sockets.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a socket to `url`.
    async fn connect(&self, url: &str) -> Result<Connection, TransportError>;
}

/// Build `<url>?token=<token>`, keeping any existing query parameters.
///
/// # Errors
/// Returns error if `base` is not a valid URL.
pub fn gateway_url(base: &str, token: &str) -> Result<Url, TransportError> {
    let mut url = Url::parse(base)?;
    url.query_pairs_mut().append_pair("token", token);
    Ok(url)
}
