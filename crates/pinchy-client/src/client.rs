//! Gateway protocol client.
//!
//! One `GatewayClient` owns one logical connection. Frames from the socket
//! are processed strictly in arrival order on a single task; responses are
//! routed to the pending-call table, events to the event bus.

use std::{
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use pinchy_core::{
    ClientConfig, ConnectionStatus, EventBus, Frame, Payload, Subscription, codec,
    event_bus::SubscriberError,
    protocol::{self, Connect, EVENT_CONNECT_CHALLENGE, GatewayMethod, HelloOk},
};
use pinchy_transport::{CloseInfo, Connector, Inbound, Outbound, gateway_url};
use tokio::{
    sync::{Notify, mpsc, watch},
    task::JoinHandle,
};

use crate::{backoff::ReconnectPolicy, error::CallError, pending::PendingCalls};

/// Pending-table entry owned by a waiting caller.
struct PendingEntry<'a> {
    inner: &'a Inner,
    id: &'a str,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        if self.inner.lock().pending.remove(self.id) {
            tracing::debug!("Dropped pending call {}", self.id);
        }
    }
}

/// Frame size assumed when the server does not advertise one (1 MiB).
pub const DEFAULT_MAX_PAYLOAD: u64 = 1024 * 1024;

/// Whether a call may run while the handshake is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallMode {
    Normal,
    /// Only the internal `connect` handshake call.
    Handshake,
}

/// Live socket of the current connection attempt.
struct Link {
    outbound: mpsc::UnboundedSender<Outbound>,
    shutdown: Arc<Notify>,
}

impl Link {
    fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
        self.shutdown.notify_one();
    }
}

struct State {
    pending: PendingCalls,
    retry_count: u32,
    intentional_close: bool,
    /// Bumped whenever an attempt is superseded; stale tasks compare and bail.
    generation: u64,
    link: Option<Link>,
    reconnect_task: Option<JoinHandle<()>>,
    hello: Option<HelloOk>,
}

struct Inner {
    config: ClientConfig,
    policy: ReconnectPolicy,
    connector: Arc<dyn Connector>,
    bus: EventBus,
    status: watch::Sender<ConnectionStatus>,
    state: Mutex<State>,
    next_id: AtomicU64,
}

/// Protocol-aware client for the gateway.
///
/// Cheap to clone; clones share the connection. Call [`disconnect`] to shut
/// the connection down, background tasks keep it alive otherwise.
///
/// [`disconnect`]: GatewayClient::disconnect
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<Inner>,
}

impl GatewayClient {
    /// Create a client that opens sockets through `connector`.
    #[must_use]
    pub fn new(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            inner: Arc::new(Inner {
                policy: ReconnectPolicy::from_config(&config),
                config,
                connector,
                bus: EventBus::new(),
                status,
                state: Mutex::new(State {
                    pending: PendingCalls::new(),
                    retry_count: 0,
                    intentional_close: false,
                    generation: 0,
                    link: None,
                    reconnect_task: None,
                    hello: None,
                }),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Create a client that connects over WebSocket.
    #[cfg(feature = "websocket")]
    #[must_use]
    pub fn websocket(config: ClientConfig) -> Self {
        Self::new(config, Arc::new(pinchy_transport::WebSocketConnector::new()))
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Current connection status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    /// Observe status transitions.
    #[must_use]
    pub fn status_receiver(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Consecutive failed attempts since the last `hello-ok`.
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.inner.lock().retry_count
    }

    /// Number of calls awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Whether a call with this correlation id is still awaiting a response.
    #[must_use]
    pub fn is_pending(&self, id: &str) -> bool {
        self.inner.lock().pending.contains(id)
    }

    /// The last `hello-ok` received, if the handshake has ever completed.
    #[must_use]
    pub fn hello(&self) -> Option<HelloOk> {
        self.inner.lock().hello.clone()
    }

    /// Largest frame the server accepts.
    #[must_use]
    pub fn max_payload(&self) -> u64 {
        self.inner
            .lock()
            .hello
            .as_ref()
            .and_then(HelloOk::max_payload)
            .unwrap_or(DEFAULT_MAX_PAYLOAD)
    }

    /// Start connecting. Resets the retry counter and cancels any scheduled
    /// reconnect; an existing socket is replaced.
    pub fn connect(&self) {
        let inner = &self.inner;
        let generation = {
            let mut state = inner.lock();
            state.intentional_close = false;
            state.retry_count = 0;
            inner.supersede(&mut state, "Client cleanup");
            inner.set_status(ConnectionStatus::Connecting);
            state.generation
        };
        tracing::info!("Connecting to gateway at {}", inner.config.url);
        tokio::spawn(Arc::clone(inner).run_socket(generation));
    }

    /// Close the connection and stop reconnecting. Pending calls are rejected.
    pub fn disconnect(&self) {
        let inner = &self.inner;
        {
            let mut state = inner.lock();
            state.intentional_close = true;
            inner.supersede(&mut state, "Client disconnected");
            inner.set_status(ConnectionStatus::Disconnected);
        }
        tracing::info!("Disconnected from gateway");
    }

    /// Send a request and await its response payload.
    ///
    /// # Errors
    /// Returns `NotConnected` immediately unless connected, `Timeout` if no
    /// response arrives in time, `Rejected` for an `ok: false` response and
    /// `ConnectionLost` if the socket goes away first.
    pub async fn call(&self, method: &str, params: Payload) -> Result<Payload, CallError> {
        let timeout = self.inner.config.request_timeout();
        self.inner
            .call(method, params, timeout, CallMode::Normal)
            .await
    }

    /// Like [`call`](Self::call) with an explicit deadline.
    ///
    /// # Errors
    /// See [`call`](Self::call).
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Payload,
        timeout: Duration,
    ) -> Result<Payload, CallError> {
        self.inner
            .call(method, params, timeout, CallMode::Normal)
            .await
    }

    /// Typed call.
    ///
    /// # Errors
    /// See [`call`](Self::call); also fails if the params do not serialize
    /// to an object or the response does not match `M::Response`.
    pub async fn request<M: GatewayMethod>(
        &self,
        params: &M::Params,
    ) -> Result<M::Response, CallError> {
        let params = protocol::to_payload(params).map_err(|e| CallError::InvalidParams {
            method: M::NAME.to_string(),
            message: e.to_string(),
        })?;
        let payload = self.call(M::NAME, params).await?;
        protocol::from_payload(payload).map_err(|e| CallError::InvalidPayload {
            method: M::NAME.to_string(),
            message: e.to_string(),
        })
    }

    /// Subscribe to a gateway event by name (e.g. `chat`, `agent`, `tick`).
    ///
    /// `connect.challenge` is consumed by the handshake and never delivered.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe<F>(&self, event: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&Payload) -> Result<(), SubscriberError> + Send + Sync + 'static,
    {
        self.inner.bus.subscribe(event, callback)
    }

    /// Subscribe to every gateway event.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe_all<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&str, &Payload) -> Result<(), SubscriberError> + Send + Sync + 'static,
    {
        self.inner.bus.subscribe_all(callback)
    }
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("url", &self.inner.config.url)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Publish a status. Called with the state lock held so a transition is
    /// ordered with the generation check that allowed it.
    fn set_status(&self, status: ConnectionStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            tracing::debug!("Gateway status: {status}");
        }
    }

    fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Invalidate the current attempt: cancel the reconnect timer, close
    /// the socket and reject pending calls.
    fn supersede(&self, state: &mut State, reason: &str) {
        state.generation += 1;
        if let Some(task) = state.reconnect_task.take() {
            task.abort();
        }
        if let Some(link) = state.link.take() {
            link.close();
        }
        state.pending.reject_all(reason);
    }

    fn next_id(&self) -> String {
        format!("pd-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    async fn call(
        &self,
        method: &str,
        params: Payload,
        timeout: Duration,
        mode: CallMode,
    ) -> Result<Payload, CallError> {
        let (id, rx) = {
            let mut state = self.lock();
            let status = self.status();
            let allowed = match mode {
                CallMode::Normal => status.is_connected(),
                CallMode::Handshake => {
                    status == ConnectionStatus::Handshaking && method == Connect::NAME
                }
            };
            let outbound = match (&state.link, allowed) {
                (Some(link), true) => link.outbound.clone(),
                _ => {
                    return Err(CallError::NotConnected {
                        method: method.to_string(),
                        status,
                    });
                }
            };

            let id = self.next_id();
            let text = codec::encode(&Frame::request(id.clone(), method, params)).map_err(|e| {
                CallError::InvalidParams {
                    method: method.to_string(),
                    message: e.to_string(),
                }
            })?;
            let rx = state.pending.insert(id.clone(), method);
            if outbound.send(Outbound::Text(text)).is_err() {
                state.pending.remove(&id);
                return Err(CallError::ConnectionLost("WebSocket closed".to_string()));
            }
            tracing::debug!("→ {method} ({id})");
            (id, rx)
        };

        // Removes the entry on timeout, or when the caller stops waiting.
        let _entry = PendingEntry { inner: self, id: &id };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CallError::ConnectionLost("Client dropped".to_string())),
            Err(_) => Err(CallError::Timeout {
                method: method.to_string(),
                after: timeout,
            }),
        }
    }

    /// Open one socket and pump it until it closes.
    async fn run_socket(self: Arc<Self>, generation: u64) {
        let url = match gateway_url(&self.config.url, &self.config.token) {
            Ok(url) => url,
            Err(e) => {
                tracing::error!("Cannot connect: {e}");
                self.handle_close(generation, &e.to_string());
                return;
            }
        };

        let conn = match self.connector.connect(url.as_str()).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("Gateway connection failed: {e}");
                self.handle_close(generation, &e.to_string());
                return;
            }
        };

        let shutdown = Arc::new(Notify::new());
        {
            let mut state = self.lock();
            if state.generation != generation {
                let _ = conn.outbound.send(Outbound::Close);
                return;
            }
            state.link = Some(Link {
                outbound: conn.outbound.clone(),
                shutdown: Arc::clone(&shutdown),
            });
            self.set_status(ConnectionStatus::Handshaking);
        }
        tracing::info!("WebSocket open, awaiting connect.challenge");

        let mut inbound = conn.inbound;
        let reason = loop {
            tokio::select! {
                msg = inbound.recv() => match msg {
                    Some(Inbound::Text(text)) => self.on_message(&text, generation),
                    Some(Inbound::Closed(info)) => break info,
                    None => break CloseInfo::new(None, "transport dropped"),
                },
                () = shutdown.notified() => break CloseInfo::new(Some(1000), "closed by client"),
            }
        };
        tracing::info!("WebSocket {reason}");
        self.handle_close(generation, &format!("WebSocket {reason}"));
    }

    fn on_message(self: &Arc<Self>, text: &str, generation: u64) {
        let frame = match codec::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Discarding undecodable message: {e}");
                return;
            }
        };

        match frame {
            Frame::Event(ev) if ev.event == EVENT_CONNECT_CHALLENGE => {
                if self.status() == ConnectionStatus::Handshaking {
                    tokio::spawn(Arc::clone(self).handshake(generation));
                } else {
                    tracing::debug!("Ignoring connect.challenge while {}", self.status());
                }
            }
            Frame::Event(ev) => {
                tracing::trace!("← event {}", ev.event);
                self.bus.dispatch(&ev.event, &ev.payload);
            }
            Frame::Response(res) => {
                let id = res.id.clone();
                if self.lock().pending.resolve(res) {
                    tracing::debug!("← response ({id})");
                } else {
                    tracing::warn!("Unmatched response id: {id}");
                }
            }
            Frame::Request(req) => {
                tracing::debug!("Ignoring server request {} ({})", req.method, req.id);
            }
        }
    }

    async fn handshake(self: Arc<Self>, generation: u64) {
        tracing::debug!("Performing connect handshake");
        let params = match protocol::to_payload(&self.config.connect_params()) {
            Ok(params) => params,
            Err(e) => {
                tracing::error!("Cannot encode handshake params: {e}");
                self.fail_handshake(generation);
                return;
            }
        };

        let result = self
            .call(
                Connect::NAME,
                params,
                self.config.request_timeout(),
                CallMode::Handshake,
            )
            .await
            .and_then(|payload| {
                protocol::from_payload::<HelloOk>(payload).map_err(|e| CallError::InvalidPayload {
                    method: Connect::NAME.to_string(),
                    message: e.to_string(),
                })
            });

        match result {
            Ok(hello) if hello.is_ok() => {
                {
                    let mut state = self.lock();
                    if state.generation != generation {
                        return;
                    }
                    state.retry_count = 0;
                    state.hello = Some(hello.clone());
                    self.set_status(ConnectionStatus::Connected);
                }
                tracing::info!("Handshake complete (protocol {})", hello.protocol);
            }
            Ok(hello) => {
                tracing::error!("Unexpected handshake payload type: {:?}", hello.kind);
                self.fail_handshake(generation);
            }
            Err(e) => {
                tracing::error!("Handshake failed: {e}");
                self.fail_handshake(generation);
            }
        }
    }

    /// Enter `Error` and force the socket closed; the close path then
    /// applies the reconnect policy.
    fn fail_handshake(&self, generation: u64) {
        let state = self.lock();
        if state.generation != generation {
            return;
        }
        self.set_status(ConnectionStatus::Error);
        if let Some(link) = &state.link {
            link.close();
        }
    }

    /// The single place deciding between reconnect and a resting status.
    fn handle_close(self: &Arc<Self>, generation: u64, reason: &str) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        state.link = None;
        state.pending.reject_all(reason);

        if state.intentional_close {
            self.set_status(ConnectionStatus::Disconnected);
            return;
        }

        if !self.policy.allows(state.retry_count) {
            tracing::error!("Max retries ({}) reached", self.policy.max_retries);
            self.set_status(ConnectionStatus::Error);
            return;
        }

        let delay = self.policy.delay_for(state.retry_count);
        state.retry_count += 1;
        state.generation += 1;
        let next = state.generation;
        tracing::info!(
            "Reconnecting in {}ms (attempt {})",
            delay.as_millis(),
            state.retry_count
        );
        self.set_status(ConnectionStatus::Connecting);

        let inner = Arc::clone(self);
        state.reconnect_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.run_socket(next).await;
        }));
    }
}
