//! Conversation state on top of the gateway client.
//!
//! Provides:
//! - `ChatState` - the chat stream reducer: turns `chat` events and call
//!   results into an ordered, per-session list of display messages
//! - `ChatController` - binds the reducer to a `GatewayClient`
//!   (send, abort, history, session switching)
//! - `SessionRegistry` - known sessions and the active session key
//! - `text` - display text extraction and oversized payload elision

pub mod chat;
pub mod config;
pub mod reducer;
pub mod registry;
pub mod text;

pub use chat::{ChatController, ChatError, ChatSnapshot};
pub use config::{ChatConfig, RegistryConfig};
pub use reducer::{ChatState, DisplayMessage};
pub use registry::SessionRegistry;
