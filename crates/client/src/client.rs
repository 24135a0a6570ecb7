//! Establishing the realtime connection.
//!
//! A [`Connector`] performs one handshake and returns a [`Connection`]:
//! a pair of channels carrying outbound text frames and inbound
//! [`RawFrame`]s. [`WsConnector`] does this over WebSocket; the
//! [`RealtimeChannel`](crate::channel::RealtimeChannel) only ever sees
//! the channel pair, so tests can supply their own connector.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::messages::RawFrame;

/// A live connection as seen by the channel.
///
/// Dropping `outbound` closes the write side; dropping `inbound` tells
/// the read side to stop. The read side closing `inbound` means the
/// connection was lost.
#[derive(Debug)]
pub struct Connection {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<RawFrame>,
}

/// Performs a single handshake with the realtime endpoint.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Connection, ConnectError>;
}

/// Errors that can occur while establishing the connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// Failed to establish the connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The handshake did not finish in time.
    #[error("Handshake timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// WebSocket connector for the backend's realtime endpoint.
pub struct WsConnector {
    realtime_url: String,
}

impl WsConnector {
    /// * `realtime_url` - WebSocket endpoint, e.g. `ws://host:5000/ws`.
    pub fn new(realtime_url: impl Into<String>) -> Self {
        Self {
            realtime_url: realtime_url.into(),
        }
    }

    pub fn realtime_url(&self) -> &str {
        &self.realtime_url
    }
}

#[async_trait]
impl Connector for WsConnector {
    /// Connect to the realtime endpoint.
    ///
    /// Generates a unique `clientId` (UUID v4) and appends it as a query
    /// parameter so the server can address messages to this client.
    async fn connect(&self) -> Result<Connection, ConnectError> {
        let client_id = uuid::Uuid::new_v4().to_string();
        let url = format!("{}?clientId={}", self.realtime_url, client_id);

        let (ws_stream, _response) = connect_async(&url).await.map_err(|e| {
            ConnectError::Connection(format!(
                "Failed to connect to {}: {e}",
                self.realtime_url
            ))
        })?;

        tracing::info!(client_id = %client_id, "Connected to {}", self.realtime_url);

        let (mut sink, mut stream) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    tracing::error!(error = %e, "WebSocket send error");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = in_tx.closed() => break,
                    msg = stream.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            if in_tx.send(RawFrame::Text(text)).is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            if in_tx.send(RawFrame::Binary(bytes)).is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                            // Handled automatically by tungstenite.
                        }
                        Some(Ok(Message::Close(frame))) => {
                            tracing::info!(?frame, "Realtime WebSocket closed");
                            break;
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => {
                            tracing::error!(error = %e, "WebSocket receive error");
                            break;
                        }
                        None => break,
                    }
                }
            }
        });

        Ok(Connection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
