//! In-memory loopback transport.
//!
//! `MemoryConnector` hands the server side of every connection to a
//! `MemoryListener`, so a test can play the gateway frame by frame.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use pinchy_core::{Frame, codec};
use tokio::sync::mpsc;

use crate::connection::{CloseInfo, Connection, Connector, Inbound, Outbound, TransportError};

/// Create a connected connector/listener pair.
#[must_use]
pub fn memory_pair() -> (MemoryConnector, MemoryListener) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    let connector = MemoryConnector {
        accept_tx,
        refuse: Arc::new(AtomicBool::new(false)),
        urls: Arc::new(Mutex::new(Vec::new())),
    };
    (connector, MemoryListener { accept_rx })
}

/// Client side: opens loopback connections.
#[derive(Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
    refuse: Arc<AtomicBool>,
    urls: Arc<Mutex<Vec<String>>>,
}

impl MemoryConnector {
    /// Make subsequent connection attempts fail (or succeed again).
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// URLs of every connection attempt so far.
    #[must_use]
    pub fn attempts(&self) -> Vec<String> {
        self.urls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<Connection, TransportError> {
        self.urls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(url.to_string());

        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Refused);
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let peer = MemoryPeer {
            url: url.to_string(),
            to_client: in_tx,
            from_client: out_rx,
        };
        self.accept_tx
            .send(peer)
            .map_err(|_| TransportError::Refused)?;

        Ok(Connection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Server side: receives accepted connections.
pub struct MemoryListener {
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryListener {
    /// Wait for the next connection.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.recv().await
    }
}

/// Server end of one loopback connection.
///
/// Dropping the peer looks to the client like the socket going away.
pub struct MemoryPeer {
    url: String,
    to_client: mpsc::UnboundedSender<Inbound>,
    from_client: mpsc::UnboundedReceiver<Outbound>,
}

impl MemoryPeer {
    /// URL the client connected to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send a raw text message. Returns false if the client is gone.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(Inbound::Text(text.into())).is_ok()
    }

    /// Send a frame. Returns false if the client is gone.
    pub fn send_frame(&self, frame: &Frame) -> bool {
        match codec::encode(frame) {
            Ok(text) => self.send_text(text),
            Err(e) => {
                tracing::error!("Failed to encode frame: {e}");
                false
            }
        }
    }

    /// Next text message from the client; `None` once the client closes.
    pub async fn recv_text(&mut self) -> Option<String> {
        match self.from_client.recv().await? {
            Outbound::Text(text) => Some(text),
            Outbound::Close => None,
        }
    }

    /// Next frame from the client; undecodable messages are skipped.
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        loop {
            let text = self.recv_text().await?;
            match codec::decode(&text) {
                Ok(frame) => return Some(frame),
                Err(e) => tracing::warn!("Client sent undecodable message: {e}"),
            }
        }
    }

    /// Close the connection from the server side.
    pub fn close(self, code: u16, reason: &str) {
        let _ = self
            .to_client
            .send(Inbound::Closed(CloseInfo::new(Some(code), reason)));
    }
}
