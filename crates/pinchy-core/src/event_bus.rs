//! In-process event dispatch keyed by event name.

use std::{
    collections::HashMap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex, MutexGuard, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::protocol::Payload;

/// Error a subscriber may report; logged and otherwise ignored.
pub type SubscriberError = Box<dyn std::error::Error + Send + Sync>;

/// Callback invoked with an event's payload.
pub type EventCallback = Arc<dyn Fn(&Payload) -> Result<(), SubscriberError> + Send + Sync>;

/// Callback invoked for every event with its name.
pub type AnyEventCallback =
    Arc<dyn Fn(&str, &Payload) -> Result<(), SubscriberError> + Send + Sync>;

#[derive(Default)]
struct Inner {
    by_name: HashMap<String, Vec<(u64, EventCallback)>>,
    any: Vec<(u64, AnyEventCallback)>,
}

/// Multi-subscriber event bus.
///
/// Each subscriber is invoked once per dispatched event. A subscriber that
/// returns an error or panics is logged and does not stop delivery to the
/// rest. Callbacks run on the dispatching task and must not block.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Inner>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Subscribe to one event name.
    ///
    /// The subscription stays active until [`Subscription::unsubscribe`] is
    /// called or the handle is dropped.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe<F>(&self, event: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&Payload) -> Result<(), SubscriberError> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let event = event.into();
        self.lock()
            .by_name
            .entry(event.clone())
            .or_default()
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(&self.inner),
            key: Key::Named(event, id),
        }
    }

    /// Subscribe to every event.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe_all<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&str, &Payload) -> Result<(), SubscriberError> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().any.push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(&self.inner),
            key: Key::Any(id),
        }
    }

    /// Number of subscribers for an event name.
    #[must_use]
    pub fn subscriber_count(&self, event: &str) -> usize {
        self.lock().by_name.get(event).map_or(0, Vec::len)
    }

    /// Deliver an event to its named subscribers, then to catch-all subscribers.
    ///
    /// Returns the number of callbacks invoked.
    pub fn dispatch(&self, event: &str, payload: &Payload) -> usize {
        // Snapshot so callbacks may (un)subscribe without deadlocking.
        let (named, any): (Vec<EventCallback>, Vec<AnyEventCallback>) = {
            let inner = self.lock();
            (
                inner
                    .by_name
                    .get(event)
                    .map(|subs| subs.iter().map(|(_, cb)| Arc::clone(cb)).collect())
                    .unwrap_or_default(),
                inner.any.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            )
        };

        for cb in &named {
            report(event, catch_unwind(AssertUnwindSafe(|| cb(payload))));
        }
        for cb in &any {
            report(event, catch_unwind(AssertUnwindSafe(|| cb(event, payload))));
        }
        named.len() + any.len()
    }
}

fn report(event: &str, outcome: std::thread::Result<Result<(), SubscriberError>>) {
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("Event listener error for '{event}': {e}"),
        Err(_) => tracing::error!("Event listener for '{event}' panicked"),
    }
}

enum Key {
    Named(String, u64),
    Any(u64),
}

/// Handle returned by [`EventBus::subscribe`]; unsubscribes on drop.
pub struct Subscription {
    bus: Weak<Mutex<Inner>>,
    key: Key,
}

impl Subscription {
    /// Remove the subscriber. Calling this more than once is harmless.
    pub fn unsubscribe(&self) {
        let Some(inner) = self.bus.upgrade() else {
            return;
        };
        let mut inner = inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match &self.key {
            Key::Named(event, id) => {
                if let Some(subs) = inner.by_name.get_mut(event) {
                    subs.retain(|(sid, _)| sid != id);
                    if subs.is_empty() {
                        inner.by_name.remove(event);
                    }
                }
            }
            Key::Any(id) => inner.any.retain(|(sid, _)| sid != id),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match &self.key {
            Key::Named(event, _) => event.as_str(),
            Key::Any(_) => "*",
        };
        f.debug_struct("Subscription").field("event", &name).finish()
    }
}
