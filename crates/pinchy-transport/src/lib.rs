//! Transport layer for the gateway client.
//!
//! Provides:
//! - `Connector` / `Connection` - the message-oriented socket abstraction
//! - WebSocket transport (feature: websocket)
//! - In-memory loopback transport for tests and demos

pub mod connection;
pub mod memory;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use connection::{CloseInfo, Connection, Connector, Inbound, Outbound, TransportError, gateway_url};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnector;
