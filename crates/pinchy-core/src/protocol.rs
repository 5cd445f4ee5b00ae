//! Gateway wire protocol (v3).
//!
//! Three frame kinds travel over the socket, discriminated by `type`:
//! requests (`req`), responses (`res`) and server-pushed events (`event`).
//! Frame bodies are opaque maps; the typed payloads below are applied at the
//! point where a specific method or event is handled.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

/// Opaque JSON object carried by frames.
pub type Payload = serde_json::Map<String, Value>;

/// Event name used by the server to start the handshake.
pub const EVENT_CONNECT_CHALLENGE: &str = "connect.challenge";

/// Event name carrying chat run updates.
pub const EVENT_CHAT: &str = "chat";

/// Payload `type` the server answers a successful handshake with.
pub const HELLO_OK: &str = "hello-ok";

/// Protocol version spoken by this client.
pub const PROTOCOL_VERSION: u32 = 3;

/// One discrete message on the gateway socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Client-issued call.
    #[serde(rename = "req")]
    Request(RequestFrame),
    /// Reply to a request, correlated by id.
    #[serde(rename = "res")]
    Response(ResponseFrame),
    /// Unsolicited server event.
    #[serde(rename = "event")]
    Event(EventFrame),
}

/// Request frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Correlation id, unique among this client's pending requests.
    pub id: String,
    /// Method name, e.g. `chat.send`.
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Payload,
}

/// Response frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    /// Id of the request this answers.
    pub id: String,
    /// Whether the call succeeded.
    pub ok: bool,
    /// Result payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    /// Error details on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

/// Error carried by a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorShape {
    /// Machine-readable error code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
}

/// Event frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    /// Event name, e.g. `chat`.
    pub event: String,
    /// Event payload.
    #[serde(default)]
    pub payload: Payload,
}

impl Frame {
    /// Build a request frame.
    #[must_use]
    pub fn request(id: impl Into<String>, method: impl Into<String>, params: Payload) -> Self {
        Self::Request(RequestFrame {
            id: id.into(),
            method: method.into(),
            params,
        })
    }

    /// Build a successful response frame.
    #[must_use]
    pub fn ok(id: impl Into<String>, payload: Payload) -> Self {
        Self::Response(ResponseFrame {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        })
    }

    /// Build a failed response frame.
    #[must_use]
    pub fn err(id: impl Into<String>, code: Option<String>, message: impl Into<String>) -> Self {
        Self::Response(ResponseFrame {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(ErrorShape {
                code,
                message: message.into(),
            }),
        })
    }

    /// Build an event frame.
    #[must_use]
    pub fn event(event: impl Into<String>, payload: Payload) -> Self {
        Self::Event(EventFrame {
            event: event.into(),
            payload,
        })
    }
}

/// Convert a serializable value into a frame payload.
///
/// # Errors
/// Returns error if the value does not serialize to a JSON object.
pub fn to_payload<T: Serialize>(value: &T) -> Result<Payload, serde_json::Error> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Payload::new()),
        other => Err(serde::ser::Error::custom(format!(
            "expected a JSON object, got {other}"
        ))),
    }
}

/// Interpret a frame payload as a typed value.
///
/// # Errors
/// Returns error if the payload does not match the target shape.
pub fn from_payload<T: DeserializeOwned>(payload: Payload) -> Result<T, serde_json::Error> {
    serde_json::from_value(Value::Object(payload))
}

// ── Methods ─────────────────────────────────────────────────────

/// A gateway RPC method with typed parameters and result.
pub trait GatewayMethod {
    /// Wire name of the method.
    const NAME: &'static str;
    /// Request parameters.
    type Params: Serialize + Send;
    /// Response payload.
    type Response: DeserializeOwned + Send;
}

/// `connect` - the handshake call.
#[derive(Debug)]
pub struct Connect;

impl GatewayMethod for Connect {
    const NAME: &'static str = "connect";
    type Params = ConnectParams;
    type Response = HelloOk;
}

/// `chat.send`
#[derive(Debug)]
pub struct ChatSend;

impl GatewayMethod for ChatSend {
    const NAME: &'static str = "chat.send";
    type Params = ChatSendParams;
    type Response = ChatSendAck;
}

/// `chat.history`
#[derive(Debug)]
pub struct ChatHistory;

impl GatewayMethod for ChatHistory {
    const NAME: &'static str = "chat.history";
    type Params = ChatHistoryParams;
    type Response = ChatHistoryResponse;
}

/// `chat.abort`
#[derive(Debug)]
pub struct ChatAbort;

impl GatewayMethod for ChatAbort {
    const NAME: &'static str = "chat.abort";
    type Params = ChatAbortParams;
    type Response = ChatAbortResponse;
}

/// `sessions.list`
#[derive(Debug)]
pub struct SessionsList;

impl GatewayMethod for SessionsList {
    const NAME: &'static str = "sessions.list";
    type Params = SessionsListParams;
    type Response = SessionsListResponse;
}

// ── Handshake ───────────────────────────────────────────────────

/// Payload of the `connect.challenge` event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectChallenge {
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub ts: Option<i64>,
}

/// Parameters of the `connect` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub role: String,
    pub scopes: Vec<String>,
    pub auth: ConnectAuth,
    pub client: ClientIdentity,
    pub min_protocol: u32,
    pub max_protocol: u32,
}

/// Credentials presented during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectAuth {
    pub token: String,
}

/// Client identity metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub platform: String,
    pub mode: String,
}

/// Successful handshake reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloOk {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub protocol: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<HelloPolicy>,
}

/// Server limits advertised in `hello-ok`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_payload: Option<u64>,
}

impl HelloOk {
    /// Whether this is a genuine `hello-ok`.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.kind == HELLO_OK
    }

    /// Maximum frame size the server accepts, if advertised.
    #[must_use]
    pub fn max_payload(&self) -> Option<u64> {
        self.policy.as_ref().and_then(|p| p.max_payload)
    }
}

// ── Chat messages ───────────────────────────────────────────────

/// Author of a chat message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    #[default]
    Assistant,
    /// Tool, system and anything newer.
    #[serde(other)]
    Other,
}

/// Message content: a plain string or a sequence of typed blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Blocks(Vec::new())
    }
}

/// One content block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    /// Images, tool calls, thinking, ...
    #[serde(other)]
    Other,
}

/// Message timestamp: ISO-8601 string or epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    Millis(serde_json::Number),
    Text(String),
}

/// Attachment carried alongside a chat message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatAttachment {
    /// `image` or `file`.
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Base64 body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// A chat message as the gateway stores it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<ChatAttachment>>,
}

// ── Chat methods ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSendParams {
    pub session_key: String,
    pub message: String,
    pub idempotency_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<ChatAttachment>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSendAck {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatHistoryParams {
    pub session_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatHistoryResponse {
    #[serde(default)]
    pub session_key: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_level: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatAbortParams {
    pub session_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatAbortResponse {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub aborted: bool,
    #[serde(default)]
    pub run_ids: Option<Vec<String>>,
}

// ── Chat events ─────────────────────────────────────────────────

/// Payload of a `chat` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
    #[serde(default)]
    pub run_id: String,
    pub session_key: String,
    #[serde(default)]
    pub seq: u64,
    #[serde(flatten)]
    pub body: ChatEventBody,
}

/// Run state carried by a chat event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ChatEventBody {
    /// Snapshot of the text accumulated so far.
    Delta {
        #[serde(default)]
        message: ChatMessage,
    },
    /// Run finished.
    Final {
        #[serde(default)]
        message: ChatMessage,
    },
    /// Run failed.
    Error {
        #[serde(rename = "errorMessage", default)]
        error_message: String,
    },
}

// ── Sessions ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionsListParams {}

/// A conversation session known to the gateway.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Colon-delimited hierarchical key, e.g. `agent:main:main`.
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    /// Fields this client does not interpret.
    #[serde(flatten)]
    pub extra: Payload,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionsListResponse {
    #[serde(default)]
    pub sessions: Vec<SessionInfo>,
}

// ── Typed events ────────────────────────────────────────────────

/// An event frame interpreted by name.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Challenge(ConnectChallenge),
    Chat(ChatEvent),
    /// Anything not (or not validly) recognised; kept for forward compatibility.
    Other { event: String, payload: Payload },
}

impl GatewayEvent {
    /// Interpret an event by name, falling back to `Other` on unknown names
    /// or payloads that do not match the expected shape.
    #[must_use]
    pub fn parse(event: &str, payload: &Payload) -> Self {
        let parsed = match event {
            EVENT_CONNECT_CHALLENGE => {
                from_payload(payload.clone()).map(Self::Challenge).ok()
            }
            EVENT_CHAT => match from_payload(payload.clone()) {
                Ok(chat) => Some(Self::Chat(chat)),
                Err(e) => {
                    tracing::warn!("Malformed chat event payload: {e}");
                    None
                }
            },
            _ => None,
        };
        parsed.unwrap_or_else(|| Self::Other {
            event: event.to_string(),
            payload: payload.clone(),
        })
    }
}
