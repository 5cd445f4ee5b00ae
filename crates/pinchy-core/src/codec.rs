//! Frame codec: frames to and from text transport messages.
//!
//! Only the envelope is validated here. Payload shapes are checked where a
//! specific method or event is handled.

use crate::protocol::Frame;

/// Reasons a transport message could not be decoded into a frame.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Invalid JSON: {0}")]
    Json(#[source] serde_json::Error),
    #[error("Missing frame type discriminant")]
    MissingType,
    #[error("Unknown frame type: {0}")]
    UnknownType(String),
    #[error("Malformed {kind} frame: {source}")]
    Malformed {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Encode a frame as a text message.
///
/// # Errors
/// Returns error if a payload value cannot be serialized.
pub fn encode(frame: &Frame) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}

/// Decode a text message into a frame.
///
/// # Errors
/// Returns `DecodeError` if the text is not JSON, has no `type`, names an
/// unknown frame type, or lacks the fields that frame type requires.
pub fn decode(text: &str) -> Result<Frame, DecodeError> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(DecodeError::Json)?;

    let kind = match value.get("type").and_then(serde_json::Value::as_str) {
        Some("req") => "req",
        Some("res") => "res",
        Some("event") => "event",
        Some(other) => return Err(DecodeError::UnknownType(other.to_string())),
        None => return Err(DecodeError::MissingType),
    };

    serde_json::from_value(value).map_err(|source| DecodeError::Malformed { kind, source })
}
