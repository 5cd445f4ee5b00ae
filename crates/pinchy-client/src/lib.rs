//! Gateway protocol client.
//!
//! Provides:
//! - `GatewayClient` - connection lifecycle, challenge/response handshake,
//!   request/response correlation, event fan-out and reconnection
//! - `PendingCalls` - the in-flight request table
//! - `ReconnectPolicy` - capped exponential backoff

pub mod backoff;
pub mod client;
pub mod error;
pub mod pending;

pub use backoff::ReconnectPolicy;
pub use client::GatewayClient;
pub use error::CallError;
pub use pending::PendingCalls;
