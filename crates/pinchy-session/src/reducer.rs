//! Chat stream reducer.
//!
//! `ChatState` is plain data: every input (a `chat` event, an optimistic
//! send, a history response, a session switch) is one method call, and the
//! caller decides how those calls are serialised. It holds the message list
//! of the active session plus a cache of the lists of every session seen.
//!
//! Each session list holds at most one streaming assistant message. Deltas,
//! finals and errors all target that slot, creating it when absent.

use std::collections::HashMap;

use chrono::{SecondsFormat, Utc};
use pinchy_core::protocol::{ChatAttachment, ChatEvent, ChatEventBody, ChatMessage, Role, Timestamp};
use serde::Serialize;

use crate::text::{extract_text, filter_large_attachments};

/// One message as displayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayMessage {
    pub id: String,
    /// `User` or `Assistant`.
    pub role: Role,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    /// The in-progress turn being filled by deltas.
    pub streaming: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<ChatAttachment>>,
    /// Run that last wrote this message.
    #[serde(skip)]
    pub run_id: Option<String>,
    /// Sequence number of the last delta applied.
    #[serde(skip)]
    pub seq: Option<u64>,
}

impl DisplayMessage {
    fn assistant(id: String) -> Self {
        Self {
            id,
            role: Role::Assistant,
            text: String::new(),
            timestamp: None,
            streaming: false,
            error: None,
            attachments: None,
            run_id: None,
            seq: None,
        }
    }

    fn is_streaming_assistant(&self) -> bool {
        self.streaming && self.role == Role::Assistant
    }
}

/// Reducer state for one client.
#[derive(Debug, Clone)]
pub struct ChatState {
    active_session: String,
    messages: Vec<DisplayMessage>,
    cache: HashMap<String, Vec<DisplayMessage>>,
    streaming: bool,
    active_run_id: Option<String>,
    history_loading: bool,
    last_loaded: Option<String>,
    next_id: u64,
    elide_threshold: usize,
}

impl ChatState {
    #[must_use]
    pub fn new(session_key: impl Into<String>, elide_threshold: usize) -> Self {
        Self {
            active_session: session_key.into(),
            messages: Vec::new(),
            cache: HashMap::new(),
            streaming: false,
            active_run_id: None,
            history_loading: false,
            last_loaded: None,
            next_id: 0,
            elide_threshold,
        }
    }

    #[must_use]
    pub fn active_session(&self) -> &str {
        &self.active_session
    }

    /// Messages of the active session, oldest first.
    #[must_use]
    pub fn messages(&self) -> &[DisplayMessage] {
        &self.messages
    }

    /// Whether a reply is expected for the active session.
    #[must_use]
    pub const fn is_streaming(&self) -> bool {
        self.streaming
    }

    #[must_use]
    pub fn active_run_id(&self) -> Option<&str> {
        self.active_run_id.as_deref()
    }

    #[must_use]
    pub const fn history_loading(&self) -> bool {
        self.history_loading
    }

    /// Cached list for a session.
    #[must_use]
    pub fn cached(&self, session_key: &str) -> Option<&[DisplayMessage]> {
        self.cache.get(session_key).map(Vec::as_slice)
    }

    /// Whether history should be (re)fetched for the active session: it was
    /// never loaded for this session, or nothing is cached for it.
    #[must_use]
    pub fn needs_history(&self) -> bool {
        self.last_loaded.as_deref() != Some(self.active_session.as_str())
            || !self.cache.contains_key(&self.active_session)
    }

    fn next_id(&mut self) -> String {
        self.next_id += 1;
        format!("msg-{}", self.next_id)
    }

    fn remember(&mut self) {
        if !self.messages.is_empty() {
            self.cache
                .insert(self.active_session.clone(), self.messages.clone());
        }
    }

    /// Index of the streaming assistant slot, created if absent.
    fn streaming_slot(&mut self) -> usize {
        if let Some(idx) = self
            .messages
            .iter()
            .position(DisplayMessage::is_streaming_assistant)
        {
            return idx;
        }
        let id = self.next_id();
        self.messages.push(DisplayMessage::assistant(id));
        self.messages.len() - 1
    }

    /// Apply a `chat` event. Returns false if it was ignored.
    ///
    /// Events for any session other than the active one are ignored, as is
    /// a delta older than one already applied to the same run or arriving
    /// after that run has finished.
    pub fn apply_event(&mut self, event: &ChatEvent) -> bool {
        if event.session_key != self.active_session {
            tracing::debug!(
                "Ignoring chat event for inactive session {}",
                event.session_key
            );
            return false;
        }

        match &event.body {
            ChatEventBody::Delta { message } => {
                let stale = self.messages.iter().any(|m| {
                    m.role == Role::Assistant
                        && m.run_id.as_deref() == Some(event.run_id.as_str())
                        && (!m.streaming || m.seq.is_some_and(|seq| event.seq < seq))
                });
                if stale {
                    tracing::debug!("Ignoring stale delta seq {} for {}", event.seq, event.run_id);
                    return false;
                }
                let (text, attachments) = self.render(message);
                let idx = self.streaming_slot();
                let slot = &mut self.messages[idx];
                slot.text = text;
                slot.attachments = attachments;
                slot.streaming = true;
                slot.run_id = Some(event.run_id.clone());
                slot.seq = Some(event.seq);
                self.streaming = true;
                self.active_run_id = Some(event.run_id.clone());
            }
            ChatEventBody::Final { message } => {
                let (text, attachments) = self.render(message);
                let idx = self.streaming_slot();
                let slot = &mut self.messages[idx];
                slot.text = text;
                slot.attachments = attachments;
                slot.streaming = false;
                slot.timestamp.clone_from(&message.timestamp);
                slot.run_id = Some(event.run_id.clone());
                slot.seq = Some(event.seq);
                self.end_run();
            }
            ChatEventBody::Error { error_message } => {
                let idx = self.streaming_slot();
                let slot = &mut self.messages[idx];
                slot.streaming = false;
                slot.error = Some(error_message.clone());
                slot.run_id = Some(event.run_id.clone());
                self.end_run();
            }
        }
        self.remember();
        true
    }

    fn render(&self, message: &ChatMessage) -> (String, Option<Vec<ChatAttachment>>) {
        (
            extract_text(message, self.elide_threshold),
            filter_large_attachments(message.attachments.as_deref(), self.elide_threshold),
        )
    }

    fn end_run(&mut self) {
        self.streaming = false;
        self.active_run_id = None;
    }

    /// Append the user's message ahead of the `chat.send` round trip and
    /// start waiting for a reply.
    pub fn push_user(
        &mut self,
        text: impl Into<String>,
        attachments: Option<Vec<ChatAttachment>>,
    ) -> &DisplayMessage {
        let id = self.next_id();
        self.messages.push(DisplayMessage {
            role: Role::User,
            text: text.into(),
            timestamp: Some(Timestamp::Text(
                Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            )),
            attachments: attachments.filter(|a| !a.is_empty()),
            ..DisplayMessage::assistant(id)
        });
        self.streaming = true;
        self.remember();
        let last = self.messages.len() - 1;
        &self.messages[last]
    }

    /// Record the run started by a `chat.send` for `session_key`, unless
    /// that run already ended.
    pub fn set_run_id(&mut self, session_key: &str, run_id: Option<String>) {
        if session_key == self.active_session && self.streaming {
            self.active_run_id = run_id;
        }
    }

    /// Append an error-flagged assistant message to `session_key` (the
    /// active list or its cached copy) and stop waiting for a reply.
    pub fn push_error(&mut self, session_key: &str, error: impl Into<String>) {
        let id = self.next_id();
        let message = DisplayMessage {
            error: Some(error.into()),
            ..DisplayMessage::assistant(id)
        };
        if session_key == self.active_session {
            self.messages.push(message);
            self.end_run();
            self.remember();
        } else {
            self.cache
                .entry(session_key.to_string())
                .or_default()
                .push(message);
        }
    }

    /// Make `session_key` active. The current list is cached, the new
    /// session's cached list (if any) is shown, and streaming state resets.
    pub fn switch_session(&mut self, session_key: impl Into<String>) {
        let session_key = session_key.into();
        if session_key == self.active_session {
            return;
        }
        self.remember();
        self.messages = self.cache.get(&session_key).cloned().unwrap_or_default();
        self.active_session = session_key;
        self.history_loading = false;
        self.end_run();
    }

    /// Forget any in-flight run without touching the message list.
    pub fn reset_streaming(&mut self) {
        self.end_run();
    }

    /// Start a history fetch for `session_key`, showing its cached list
    /// right away. Returns whether a cached list existed.
    pub fn begin_history(&mut self, session_key: &str) -> bool {
        let cached = self.cache.get(session_key).cloned();
        let had_cache = cached.is_some();
        if session_key == self.active_session {
            if let Some(cached) = cached {
                self.messages = cached;
            }
            self.history_loading = true;
            self.last_loaded = Some(session_key.to_string());
        }
        had_cache
    }

    /// Replace `session_key`'s list with the gateway's history, keeping
    /// user and assistant messages that have display text.
    pub fn apply_history(&mut self, session_key: &str, history: &[ChatMessage]) {
        let mut list = Vec::with_capacity(history.len());
        for message in history {
            if !matches!(message.role, Role::User | Role::Assistant) {
                continue;
            }
            let text = extract_text(message, self.elide_threshold);
            if text.trim().is_empty() {
                continue;
            }
            let id = self.next_id();
            list.push(DisplayMessage {
                id,
                role: message.role,
                text,
                timestamp: message.timestamp.clone(),
                streaming: false,
                error: None,
                attachments: filter_large_attachments(
                    message.attachments.as_deref(),
                    self.elide_threshold,
                ),
                run_id: None,
                seq: None,
            });
        }

        self.cache.insert(session_key.to_string(), list.clone());
        if session_key == self.active_session {
            self.messages = list;
            self.history_loading = false;
        }
    }

    /// A history fetch failed: keep the cached list if there was one,
    /// otherwise show nothing.
    pub fn history_failed(&mut self, session_key: &str, had_cache: bool) {
        if session_key == self.active_session {
            if !had_cache {
                self.messages.clear();
            }
            self.history_loading = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const KEY: &str = "agent:main:main";
    const LIMIT: usize = 500 * 1024;

    fn event(session: &str, run: &str, seq: u64, body: serde_json::Value) -> ChatEvent {
        let mut value = json!({"runId": run, "sessionKey": session, "seq": seq});
        value
            .as_object_mut()
            .unwrap()
            .extend(body.as_object().unwrap().clone());
        serde_json::from_value(value).unwrap()
    }

    fn delta(run: &str, seq: u64, text: &str) -> ChatEvent {
        event(
            KEY,
            run,
            seq,
            json!({"state": "delta", "message": {"role": "assistant", "content": [{"type": "text", "text": text}]}}),
        )
    }

    fn final_(run: &str, seq: u64, text: &str, ts: u64) -> ChatEvent {
        event(
            KEY,
            run,
            seq,
            json!({"state": "final", "message": {"role": "assistant", "content": [{"type": "text", "text": text}], "timestamp": ts}}),
        )
    }

    fn streaming_count(state: &ChatState) -> usize {
        state.messages().iter().filter(|m| m.streaming).count()
    }

    #[test]
    fn test_send_then_stream() {
        let mut state = ChatState::new(KEY, LIMIT);
        state.push_user("hi", None);
        assert!(state.is_streaming());
        assert_eq!(state.messages().len(), 1);
        assert_eq!(state.messages()[0].role, Role::User);
        assert!(matches!(state.messages()[0].timestamp, Some(Timestamp::Text(_))));

        assert!(state.apply_event(&delta("run-1", 1, "He")));
        assert!(state.apply_event(&delta("run-1", 2, "Hello")));
        assert_eq!(state.messages().len(), 2);
        assert_eq!(streaming_count(&state), 1);
        assert_eq!(state.messages()[1].text, "Hello");
        assert!(state.messages()[1].streaming);

        assert!(state.apply_event(&final_("run-1", 3, "Hello!", 1_700_000_000_000)));
        assert_eq!(state.messages().len(), 2);
        let reply = &state.messages()[1];
        assert_eq!(reply.text, "Hello!");
        assert!(!reply.streaming);
        assert_eq!(
            reply.timestamp,
            Some(Timestamp::Millis(1_700_000_000_000_u64.into()))
        );
        assert!(!state.is_streaming());
        assert_eq!(state.active_run_id(), None);
    }

    #[test]
    fn test_single_streaming_slot_across_many_deltas() {
        let mut state = ChatState::new(KEY, LIMIT);
        let mut text = String::new();
        for seq in 1..=50 {
            text.push('x');
            state.apply_event(&delta("run-1", seq, &text));
            assert_eq!(streaming_count(&state), 1);
        }
        assert_eq!(state.messages().len(), 1);
        assert_eq!(state.messages()[0].text.len(), 50);
        assert_eq!(state.active_run_id(), Some("run-1"));
    }

    #[test]
    fn test_final_without_deltas_creates_message() {
        let mut state = ChatState::new(KEY, LIMIT);
        state.apply_event(&final_("run-1", 0, "done", 5));
        assert_eq!(state.messages().len(), 1);
        assert!(!state.messages()[0].streaming);
        assert_eq!(state.messages()[0].text, "done");
    }

    #[test]
    fn test_error_event_keeps_text_and_sets_error() {
        let mut state = ChatState::new(KEY, LIMIT);
        state.push_user("hi", None);
        state.apply_event(&delta("run-1", 1, "partial"));
        state.apply_event(&event(
            KEY,
            "run-1",
            2,
            json!({"state": "error", "errorMessage": "model overloaded"}),
        ));
        let reply = &state.messages()[1];
        assert_eq!(reply.text, "partial");
        assert_eq!(reply.error.as_deref(), Some("model overloaded"));
        assert!(!reply.streaming);
        assert!(!state.is_streaming());

        // Without a slot an empty error message is appended.
        state.apply_event(&event(KEY, "run-2", 0, json!({"state": "error", "errorMessage": "boom"})));
        assert_eq!(state.messages().len(), 3);
        assert_eq!(state.messages()[2].text, "");
    }

    #[test]
    fn test_other_session_events_never_mutate() {
        let mut state = ChatState::new(KEY, LIMIT);
        state.push_user("hi", None);
        let before = state.clone();

        let foreign = event(
            "agent:main:other",
            "run-9",
            1,
            json!({"state": "delta", "message": {"content": "leak"}}),
        );
        assert!(!state.apply_event(&foreign));
        assert_eq!(state.messages(), before.messages());
        assert_eq!(state.cached("agent:main:other"), None);
    }

    #[test]
    fn test_stale_delta_ignored() {
        let mut state = ChatState::new(KEY, LIMIT);
        state.apply_event(&delta("run-1", 5, "Hello wor"));
        assert!(!state.apply_event(&delta("run-1", 4, "Hello")));
        assert_eq!(state.messages()[0].text, "Hello wor");

        // A new run may restart numbering.
        state.apply_event(&final_("run-1", 6, "Hello world", 1));
        state.apply_event(&delta("run-2", 1, "Next"));
        assert_eq!(state.messages().len(), 2);
        assert_eq!(state.messages()[1].text, "Next");
    }

    #[test]
    fn test_late_delta_after_final_ignored() {
        let mut state = ChatState::new(KEY, LIMIT);
        state.push_user("hi", None);
        state.apply_event(&delta("run-1", 1, "He"));
        state.apply_event(&final_("run-1", 3, "Hello!", 1));

        assert!(!state.apply_event(&delta("run-1", 2, "Hell")));
        assert!(!state.is_streaming());
        assert_eq!(state.active_run_id(), None);
        assert_eq!(streaming_count(&state), 0);
        let texts: Vec<_> = state.messages().iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, ["hi", "Hello!"]);
    }

    #[test]
    fn test_late_delta_after_error_ignored() {
        let mut state = ChatState::new(KEY, LIMIT);
        state.apply_event(&delta("run-1", 1, "Partial"));
        state.apply_event(&event(KEY, "run-1", 2, json!({"state": "error", "errorMessage": "boom"})));

        assert!(!state.apply_event(&delta("run-1", 3, "Partial answer")));
        assert!(!state.is_streaming());
        assert_eq!(state.messages().len(), 1);
        assert_eq!(state.messages()[0].error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_large_inline_image_elided_from_delta() {
        let mut state = ChatState::new(KEY, 1024);
        let body = "A".repeat(4096);
        state.apply_event(&delta("run-1", 1, &format!("![](data:image/png;base64,{body})")));
        assert_eq!(state.messages()[0].text, "[Image too large: image.png (~3KB)]");
    }

    #[test]
    fn test_history_filters_and_caches() {
        let mut state = ChatState::new(KEY, LIMIT);
        let history: Vec<ChatMessage> = serde_json::from_value(json!([
            {"role": "user", "content": "hi", "timestamp": "2026-01-01T00:00:00Z"},
            {"role": "assistant", "content": [{"type": "text", "text": "hello"}]},
            {"role": "toolResult", "content": "ignored"},
            {"role": "assistant", "content": [{"type": "tool_use"}]},
            {"role": "assistant", "content": "   "}
        ]))
        .unwrap();

        assert!(!state.begin_history(KEY));
        assert!(state.history_loading());
        state.apply_history(KEY, &history);
        assert!(!state.history_loading());
        let texts: Vec<_> = state.messages().iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, ["hi", "hello"]);
        assert_eq!(state.cached(KEY).unwrap().len(), 2);
        assert!(!state.needs_history());
    }

    #[test]
    fn test_history_failure_keeps_cache() {
        let mut state = ChatState::new(KEY, LIMIT);
        state.push_user("kept", None);

        assert!(state.begin_history(KEY));
        state.history_failed(KEY, true);
        assert_eq!(state.messages().len(), 1);

        state.switch_session("agent:main:fresh");
        assert!(!state.begin_history("agent:main:fresh"));
        state.history_failed("agent:main:fresh", false);
        assert!(state.messages().is_empty());
    }

    #[test]
    fn test_switch_session_restores_cache_and_resets_streaming() {
        let mut state = ChatState::new(KEY, LIMIT);
        state.push_user("hi", None);
        state.apply_event(&delta("run-1", 1, "He"));
        assert!(state.is_streaming());

        state.switch_session("agent:main:b");
        assert!(state.messages().is_empty());
        assert!(!state.is_streaming());
        assert_eq!(state.active_run_id(), None);
        assert!(state.needs_history());

        state.switch_session(KEY);
        assert_eq!(state.messages().len(), 2);
        assert_eq!(state.messages()[1].text, "He");
    }

    #[test]
    fn test_send_error_lands_in_sending_session() {
        let mut state = ChatState::new(KEY, LIMIT);
        state.push_user("hi", None);
        state.switch_session("agent:main:b");
        state.push_error(KEY, "File too large to send");
        assert!(state.messages().is_empty());
        let cached = state.cached(KEY).unwrap();
        assert_eq!(cached.len(), 2);
        assert_eq!(cached[1].error.as_deref(), Some("File too large to send"));
    }

    #[test]
    fn test_ids_unique() {
        let mut state = ChatState::new(KEY, LIMIT);
        state.push_user("a", None);
        state.push_user("b", Some(Vec::new()));
        assert_ne!(state.messages()[0].id, state.messages()[1].id);
        assert_eq!(state.messages()[1].attachments, None);
    }
}
