//! In-flight request table.

use std::collections::HashMap;

use pinchy_core::{Payload, ResponseFrame};
use tokio::sync::oneshot;

use crate::error::CallError;

/// Outcome delivered to a waiting caller.
pub type CallResult = Result<Payload, CallError>;

struct PendingCall {
    method: String,
    tx: oneshot::Sender<CallResult>,
}

/// Requests awaiting a response, keyed by correlation id.
///
/// An entry leaves the table exactly once: on its response, when its
/// caller gives up waiting, or when the connection is torn down.
#[derive(Default)]
pub struct PendingCalls {
    entries: HashMap<String, PendingCall>,
}

impl PendingCalls {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request; the receiver resolves with its outcome.
    pub fn insert(
        &mut self,
        id: impl Into<String>,
        method: impl Into<String>,
    ) -> oneshot::Receiver<CallResult> {
        let (tx, rx) = oneshot::channel();
        self.entries.insert(
            id.into(),
            PendingCall {
                method: method.into(),
                tx,
            },
        );
        rx
    }

    /// Deliver a response to its caller.
    ///
    /// Returns false if no request with that id is pending.
    pub fn resolve(&mut self, frame: ResponseFrame) -> bool {
        let Some(call) = self.entries.remove(&frame.id) else {
            return false;
        };

        let result = if frame.ok {
            Ok(frame.payload.unwrap_or_default())
        } else {
            let (code, message) = frame
                .error
                .map(|e| (e.code, e.message))
                .unwrap_or_default();
            let message = if message.is_empty() {
                "Unknown error".to_string()
            } else {
                message
            };
            Err(CallError::Rejected { code, message })
        };

        if call.tx.send(result).is_err() {
            tracing::debug!("Caller for {} ({}) went away", frame.id, call.method);
        }
        true
    }

    /// Drop a request without notifying its caller.
    pub fn remove(&mut self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Reject every pending request with `ConnectionLost(reason)`.
    ///
    /// Returns the number of requests rejected.
    pub fn reject_all(&mut self, reason: &str) -> usize {
        let count = self.entries.len();
        for (id, call) in self.entries.drain() {
            tracing::debug!("Rejecting {id} ({}): {reason}", call.method);
            let _ = call.tx.send(Err(CallError::ConnectionLost(reason.to_string())));
        }
        count
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
