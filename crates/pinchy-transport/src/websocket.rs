//! WebSocket transport over `tokio-tungstenite`.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::connection::{CloseInfo, Connection, Connector, Inbound, Outbound, TransportError};

/// Opens gateway sockets with `tokio-tungstenite` (ws:// and wss://).
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Connection, TransportError> {
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        tracing::debug!("WebSocket open");

        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Inbound>();
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        // Writer: forward outbound messages; a Close (or a dropped sender)
        // closes the socket and stops the reader.
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                match msg {
                    Outbound::Text(text) => {
                        if let Err(e) = sink.send(Message::Text(text.into())).await {
                            tracing::debug!("WebSocket send failed: {e}");
                            break;
                        }
                    }
                    Outbound::Close => break,
                }
            }
            if let Err(e) = sink.close().await {
                tracing::debug!("WebSocket close failed: {e}");
            }
            let _ = stop_tx.send(());
        });

        // Reader: surface text messages, then exactly one Closed.
        tokio::spawn(async move {
            let info = loop {
                tokio::select! {
                    next = stream.next() => match next {
                        Some(Ok(Message::Text(text))) => {
                            if in_tx.send(Inbound::Text(text.as_str().to_owned())).is_err() {
                                break CloseInfo::new(None, "receiver dropped");
                            }
                        }
                        Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                            Ok(text) => {
                                if in_tx.send(Inbound::Text(text)).is_err() {
                                    break CloseInfo::new(None, "receiver dropped");
                                }
                            }
                            Err(_) => tracing::warn!("Dropping non-UTF-8 binary message"),
                        },
                        Some(Ok(Message::Close(frame))) => {
                            break frame.map_or_else(CloseInfo::default, |f| {
                                CloseInfo::new(Some(u16::from(f.code)), f.reason.as_str())
                            });
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::debug!("WebSocket error: {e}");
                            break CloseInfo::new(None, e.to_string());
                        }
                        None => break CloseInfo::new(None, "stream ended"),
                    },
                    _ = &mut stop_rx => break CloseInfo::new(Some(1000), "closed by client"),
                }
            };
            let _ = in_tx.send(Inbound::Closed(info));
        });

        Ok(Connection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
