//! Chat controller: the reducer wired to a live client.
//!
//! `chat` events are applied on the client's delivery path as they arrive;
//! `send`, `abort`, `load_history` and `set_active_session` are the
//! explicit entry points. Every state change is published as a
//! [`ChatSnapshot`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use pinchy_client::{CallError, GatewayClient};
use pinchy_core::{
    ConnectionStatus, Subscription,
    protocol::{
        ChatAbort, ChatAbortParams, ChatAbortResponse, ChatAttachment, ChatHistory,
        ChatHistoryParams, ChatSend, ChatSendParams, EVENT_CHAT, GatewayEvent,
    },
};
use serde::Serialize;
use tokio::{sync::watch, task::JoinHandle};
use tokio_stream::wrappers::WatchStream;
use uuid::Uuid;

use crate::{
    config::ChatConfig,
    reducer::{ChatState, DisplayMessage},
    registry::SessionRegistry,
};

/// Chat operation error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    #[error("Not connected")]
    NotConnected,
    #[error(transparent)]
    Call(#[from] CallError),
}

/// What a chat view renders.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSnapshot {
    pub session_key: String,
    pub messages: Vec<DisplayMessage>,
    pub is_streaming: bool,
    pub history_loading: bool,
}

impl From<&ChatState> for ChatSnapshot {
    fn from(state: &ChatState) -> Self {
        Self {
            session_key: state.active_session().to_string(),
            messages: state.messages().to_vec(),
            is_streaming: state.is_streaming(),
            history_loading: state.history_loading(),
        }
    }
}

/// Message shown when the gateway refuses a frame as too large.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn too_large_message(max_payload: u64) -> String {
    let mb = max_payload as f64 / (1024.0 * 1024.0);
    format!(
        "**📎 File too large to send**\n\n\
         This attachment exceeds the {mb:.1}MB gateway limit.\n\n\
         **Quick fix:** Try compressing or resizing the image first.\n\n\
         **Advanced:** You can increase the gateway limit by editing \
         `~/.openclaw/openclaw.json` - see docs.openclaw.ai for details."
    )
}

fn is_too_large(message: &str) -> bool {
    message.contains("1009") || message.to_lowercase().contains("too large")
}

fn is_new_session_command(text: &str) -> bool {
    text.to_lowercase().starts_with("/new")
}

struct ChatInner {
    client: GatewayClient,
    registry: SessionRegistry,
    config: ChatConfig,
    state: Mutex<ChatState>,
    snapshot: watch::Sender<ChatSnapshot>,
    chat_sub: Mutex<Option<Subscription>>,
    status_task: Mutex<Option<JoinHandle<()>>>,
}

/// Conversation state for the registry's active session.
#[derive(Clone)]
pub struct ChatController {
    inner: Arc<ChatInner>,
}

impl ChatController {
    /// Create a controller following `client`, starting on the registry's
    /// active session. Must be called inside a Tokio runtime.
    #[must_use]
    pub fn new(client: GatewayClient, registry: SessionRegistry, config: ChatConfig) -> Self {
        let state = ChatState::new(registry.active_key(), config.elide_threshold);
        let (snapshot, _) = watch::channel(ChatSnapshot::from(&state));
        let inner = Arc::new(ChatInner {
            client,
            registry,
            config,
            state: Mutex::new(state),
            snapshot,
            chat_sub: Mutex::new(None),
            status_task: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let sub = inner.client.subscribe(EVENT_CHAT, move |payload| {
            let Some(inner) = weak.upgrade() else {
                return Ok(());
            };
            if let GatewayEvent::Chat(event) = GatewayEvent::parse(EVENT_CHAT, payload) {
                let mut state = inner.state();
                if state.apply_event(&event) {
                    inner.publish(&state);
                }
            }
            Ok(())
        });
        *lock(&inner.chat_sub) = Some(sub);

        let task = tokio::spawn(follow_status(
            Arc::downgrade(&inner),
            inner.client.status_receiver(),
        ));
        *lock(&inner.status_task) = Some(task);

        Self { inner }
    }

    /// Current state.
    #[must_use]
    pub fn snapshot(&self) -> ChatSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    /// Observe state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ChatSnapshot> {
        self.inner.snapshot.subscribe()
    }

    /// State changes as a stream, starting with the current state.
    #[must_use]
    pub fn snapshots(&self) -> WatchStream<ChatSnapshot> {
        WatchStream::new(self.inner.snapshot.subscribe())
    }

    #[must_use]
    pub fn active_session(&self) -> String {
        self.inner.state().active_session().to_string()
    }

    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.inner.state().is_streaming()
    }

    #[must_use]
    pub fn active_run_id(&self) -> Option<String> {
        self.inner.state().active_run_id().map(str::to_string)
    }

    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    /// Send a message to the active session.
    ///
    /// The user message is shown immediately. If `chat.send` fails an
    /// error-flagged assistant message is appended and the error returned.
    /// Blank text is ignored.
    ///
    /// # Errors
    /// Returns `NotConnected` (with no state change) unless connected, or
    /// the `chat.send` call error.
    pub async fn send(
        &self,
        text: &str,
        attachments: Vec<ChatAttachment>,
    ) -> Result<(), ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        if !self.inner.client.status().is_connected() {
            return Err(ChatError::NotConnected);
        }

        let attachments = (!attachments.is_empty()).then_some(attachments);
        let session_key = {
            let mut state = self.inner.state();
            state.push_user(text, attachments.clone());
            self.inner.publish(&state);
            state.active_session().to_string()
        };

        let params = ChatSendParams {
            session_key: session_key.clone(),
            message: text.to_string(),
            idempotency_key: Uuid::new_v4().to_string(),
            attachments,
        };
        match self.inner.client.request::<ChatSend>(&params).await {
            Ok(ack) => {
                tracing::debug!("chat.send accepted: run {:?}", ack.run_id);
                {
                    let mut state = self.inner.state();
                    state.set_run_id(&session_key, ack.run_id);
                }
                if is_new_session_command(text) {
                    self.refresh_sessions_later();
                }
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to send: {e}");
                let message = self.inner.send_failure_message(&e);
                let mut state = self.inner.state();
                state.push_error(&session_key, message);
                self.inner.publish(&state);
                Err(e.into())
            }
        }
    }

    /// Ask the gateway to stop the active session's run.
    ///
    /// Local state is untouched; the run ends through its `final` or
    /// `error` event.
    ///
    /// # Errors
    /// Returns `NotConnected` unless connected, or the `chat.abort` call error.
    pub async fn abort(&self) -> Result<ChatAbortResponse, ChatError> {
        if !self.inner.client.status().is_connected() {
            return Err(ChatError::NotConnected);
        }
        let session_key = self.active_session();
        self.inner
            .client
            .request::<ChatAbort>(&ChatAbortParams { session_key })
            .await
            .map_err(|e| {
                tracing::error!("Failed to abort: {e}");
                e.into()
            })
    }

    /// Replace a session's messages with the gateway's history.
    ///
    /// # Errors
    /// Returns `NotConnected` unless connected, or the `chat.history` call
    /// error (the cached list, if any, stays visible).
    pub async fn load_history(&self, session_key: &str) -> Result<(), ChatError> {
        self.inner.load_history(session_key).await
    }

    /// Switch to another session, showing its cached messages at once and
    /// fetching its history when connected.
    ///
    /// # Errors
    /// Returns the `chat.history` call error.
    pub async fn set_active_session(&self, session_key: impl Into<String>) -> Result<(), ChatError> {
        let session_key = session_key.into();
        self.inner.registry.set_active_key(session_key.clone());
        let needs_history = {
            let mut state = self.inner.state();
            state.switch_session(session_key.clone());
            self.inner.publish(&state);
            state.needs_history()
        };
        if needs_history && self.inner.client.status().is_connected() {
            self.inner.load_history(&session_key).await
        } else {
            Ok(())
        }
    }

    fn refresh_sessions_later(&self) {
        let registry = self.inner.registry.clone();
        let delay = self.inner.config.new_session_refresh_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = registry.refresh().await;
        });
    }
}

impl std::fmt::Debug for ChatController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatController")
            .field("session", &self.active_session())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ChatInner {
    fn state(&self) -> MutexGuard<'_, ChatState> {
        lock(&self.state)
    }

    fn publish(&self, state: &ChatState) {
        self.snapshot.send_replace(ChatSnapshot::from(state));
    }

    fn send_failure_message(&self, error: &CallError) -> String {
        let message = error.to_string();
        if !is_too_large(&message) {
            return message;
        }
        let limit = self
            .client
            .hello()
            .and_then(|hello| hello.max_payload())
            .unwrap_or(self.config.default_max_payload);
        too_large_message(limit)
    }

    async fn load_history(&self, session_key: &str) -> Result<(), ChatError> {
        if !self.client.status().is_connected() {
            return Err(ChatError::NotConnected);
        }
        let had_cache = {
            let mut state = self.state();
            let had_cache = state.begin_history(session_key);
            self.publish(&state);
            had_cache
        };

        let result = self
            .client
            .request::<ChatHistory>(&ChatHistoryParams {
                session_key: session_key.to_string(),
                limit: Some(self.config.history_limit),
            })
            .await;

        let mut state = self.state();
        match result {
            Ok(res) => {
                tracing::debug!(
                    "Loaded {} history messages for {session_key}",
                    res.messages.len()
                );
                state.apply_history(session_key, &res.messages);
                self.publish(&state);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to load history: {e}");
                state.history_failed(session_key, had_cache);
                self.publish(&state);
                Err(e.into())
            }
        }
    }
}

impl Drop for ChatInner {
    fn drop(&mut self) {
        let status_task = self
            .status_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = status_task.take() {
            task.abort();
        }
    }
}

/// Reset the streaming flag on every status change and load history when
/// a connection comes up for a session that needs it.
async fn follow_status(inner: Weak<ChatInner>, mut rx: watch::Receiver<ConnectionStatus>) {
    loop {
        let status = *rx.borrow_and_update();
        let Some(chat) = inner.upgrade() else {
            return;
        };
        let reload = {
            let mut state = chat.state();
            state.reset_streaming();
            chat.publish(&state);
            (status.is_connected() && state.needs_history())
                .then(|| state.active_session().to_string())
        };
        if let Some(session_key) = reload {
            let _ = chat.load_history(&session_key).await;
        }
        drop(chat);
        if rx.changed().await.is_err() {
            return;
        }
    }
}
