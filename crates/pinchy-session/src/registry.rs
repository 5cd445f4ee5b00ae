//! Known sessions and the active session key.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use pinchy_client::{CallError, GatewayClient};
use pinchy_core::{
    ConnectionStatus, Subscription,
    protocol::{EVENT_CHAT, SessionInfo, SessionsList, SessionsListParams},
};
use tokio::{sync::watch, task::JoinHandle};

use crate::config::RegistryConfig;

/// Sessions worth listing: the default session plus any that have seen
/// traffic.
#[must_use]
pub fn visible_sessions(sessions: Vec<SessionInfo>, default_key: &str) -> Vec<SessionInfo> {
    sessions
        .into_iter()
        .filter(|s| s.key == default_key || s.total_tokens.unwrap_or(0) > 0)
        .collect()
}

struct RegistryState {
    sessions: Vec<SessionInfo>,
    active_key: String,
    loading: bool,
}

struct RegistryInner {
    client: GatewayClient,
    config: RegistryConfig,
    state: Mutex<RegistryState>,
    sessions_tx: watch::Sender<Vec<SessionInfo>>,
    debounce: Mutex<Option<JoinHandle<()>>>,
    status_task: Mutex<Option<JoinHandle<()>>>,
    chat_sub: Mutex<Option<Subscription>>,
}

/// Session list kept in step with the gateway.
///
/// Refreshes when the client reaches `Connected`, and again after a quiet
/// period following `chat` events so a session created mid-conversation
/// shows up. The list is cleared on `Disconnected`. Cheap to clone.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    /// Create a registry following `client`. Must be called inside a Tokio runtime.
    #[must_use]
    pub fn new(client: GatewayClient, config: RegistryConfig) -> Self {
        let (sessions_tx, _) = watch::channel(Vec::new());
        let inner = Arc::new(RegistryInner {
            state: Mutex::new(RegistryState {
                sessions: Vec::new(),
                active_key: config.default_session_key.clone(),
                loading: false,
            }),
            client,
            config,
            sessions_tx,
            debounce: Mutex::new(None),
            status_task: Mutex::new(None),
            chat_sub: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let sub = inner.client.subscribe(EVENT_CHAT, move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.schedule_refresh();
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

    /// Sessions from the last successful refresh.
    #[must_use]
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.inner.state().sessions.clone()
    }

    /// Observe the session list.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Vec<SessionInfo>> {
        self.inner.sessions_tx.subscribe()
    }

    #[must_use]
    pub fn active_key(&self) -> String {
        self.inner.state().active_key.clone()
    }

    pub fn set_active_key(&self, key: impl Into<String>) {
        let key = key.into();
        tracing::debug!("Active session: {key}");
        self.inner.state().active_key = key;
    }

    /// Whether a `sessions.list` call is in flight.
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.inner.state().loading
    }

    /// Re-fetch the session list now. A no-op unless connected.
    ///
    /// # Errors
    /// Returns the call error if `sessions.list` fails; the previous list is kept.
    pub async fn refresh(&self) -> Result<(), CallError> {
        self.inner.refresh().await
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state();
        f.debug_struct("SessionRegistry")
            .field("active_key", &state.active_key)
            .field("sessions", &state.sessions.len())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RegistryInner {
    fn state(&self) -> MutexGuard<'_, RegistryState> {
        lock(&self.state)
    }

    async fn refresh(&self) -> Result<(), CallError> {
        if !self.client.status().is_connected() {
            return Ok(());
        }
        self.state().loading = true;
        let result = self
            .client
            .request::<SessionsList>(&SessionsListParams {})
            .await;

        let mut state = self.state();
        state.loading = false;
        match result {
            Ok(res) => {
                let sessions = visible_sessions(res.sessions, &self.config.default_session_key);
                tracing::debug!("Loaded {} sessions", sessions.len());
                state.sessions.clone_from(&sessions);
                drop(state);
                self.sessions_tx.send_replace(sessions);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to list sessions: {e}");
                Err(e)
            }
        }
    }

    /// Refresh once no chat event has arrived for the debounce period.
    fn schedule_refresh(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let delay = self.config.refresh_debounce;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                let _ = inner.refresh().await;
            }
        });
        if let Some(previous) = lock(&self.debounce).replace(task) {
            previous.abort();
        }
    }

    fn clear(&self) {
        self.state().sessions.clear();
        self.sessions_tx.send_replace(Vec::new());
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        let debounce = self.debounce.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = debounce.take() {
            task.abort();
        }
        let status_task = self
            .status_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = status_task.take() {
            task.abort();
        }
    }
}

async fn follow_status(inner: Weak<RegistryInner>, mut rx: watch::Receiver<ConnectionStatus>) {
    loop {
        let status = *rx.borrow_and_update();
        let Some(registry) = inner.upgrade() else {
            return;
        };
        match status {
            ConnectionStatus::Connected => {
                let _ = registry.refresh().await;
            }
            ConnectionStatus::Disconnected => registry.clear(),
            _ => {}
        }
        drop(registry);
        if rx.changed().await.is_err() {
            return;
        }
    }
}
