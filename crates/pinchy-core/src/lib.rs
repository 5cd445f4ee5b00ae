//! Core building blocks for talking to an OpenClaw-style Gateway.
//!
//! This crate provides:
//! - `Frame` and the typed payloads carried over the gateway socket
//! - `codec` - text encoding/decoding of frames
//! - `EventBus` - multi-subscriber dispatch keyed by event name
//! - `ClientConfig` - connection and handshake settings
//! - Collaborator traits (settings store, file picker, file reader)

pub mod codec;
pub mod config;
pub mod event_bus;
pub mod files;
pub mod protocol;
pub mod settings;
pub mod status;
pub mod traits;

pub use codec::{DecodeError, decode, encode};
pub use config::ClientConfig;
pub use event_bus::{EventBus, Subscription};
pub use protocol::{EventFrame, Frame, Payload, RequestFrame, ResponseFrame};
pub use status::ConnectionStatus;
pub use traits::{FileAttachment, FilePicker, FileReader, SettingsStore};
