//! Real-network WebSocket transports

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, WebSocketStream};
use tracing::{debug, warn};

use crate::exchange::AbortReason;
use crate::{InterposeError, Result};

use super::frame::{self, CloseFrame, SocketMessage, CLOSE_ABNORMAL};
use super::session::{Transport, CHANNEL_CAPACITY};

/// Opens server-side connections for sessions
#[async_trait]
pub trait WebSocketConnector: Send + Sync {
    /// Connect to `url`
    ///
    /// # Errors
    ///
    /// Returns an `Aborted` network error if the server cannot be reached
    async fn connect(&self, url: &str) -> Result<Transport>;
}

/// Connector backed by `tokio-tungstenite`
#[derive(Debug, Clone)]
pub struct TungsteniteConnector {
    capacity: usize,
}

impl TungsteniteConnector {
    /// Create a connector with the given per-direction buffer
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { capacity }
    }
}

impl Default for TungsteniteConnector {
    fn default() -> Self {
        Self::new(CHANNEL_CAPACITY)
    }
}

#[async_trait]
impl WebSocketConnector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<Transport> {
        let (stream, response) = connect_async(url).await.map_err(|e| InterposeError::Aborted {
            reason: AbortReason::ConnectionFailed,
            detail: Some(format!("WebSocket connect to {url} failed: {e}")),
        })?;
        debug!("Connected to {} (status {})", url, response.status());
        let (transport, _pump) = spawn_pump(stream, self.capacity);
        Ok(transport)
    }
}

/// Bridge a tungstenite stream to a channel [`Transport`]
///
/// The pump task ends when the socket closes or the transport is dropped;
/// dropping the transport sends a close frame first. The returned handle
/// completes with the task.
pub fn spawn_pump<S>(stream: WebSocketStream<S>, capacity: usize) -> (Transport, JoinHandle<()>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (to_socket_tx, mut to_socket_rx) = mpsc::channel::<SocketMessage>(capacity);
    let (from_socket_tx, from_socket_rx) = mpsc::channel::<SocketMessage>(capacity);

    let pump = tokio::spawn(async move {
        let (mut sink, mut source) = stream.split();
        let mut close_sent = false;

        loop {
            tokio::select! {
                outgoing = to_socket_rx.recv(), if !close_sent => match outgoing {
                    Some(message) => {
                        close_sent = message.is_close();
                        if let Err(e) = sink.send(frame::to_message(message)).await {
                            debug!("WebSocket send failed: {}", e);
                            break;
                        }
                    }
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        close_sent = true;
                    }
                },
                incoming = source.next() => match incoming {
                    Some(Ok(message)) => {
                        let Some(message) = frame::from_message(message) else {
                            continue;
                        };
                        if from_socket_tx.send(message).await.is_err() && close_sent {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket stream error: {}", e);
                        let _ = from_socket_tx
                            .send(SocketMessage::Close(Some(CloseFrame::new(
                                CLOSE_ABNORMAL,
                                e.to_string(),
                            ))))
                            .await;
                        break;
                    }
                    None => {
                        let _ = from_socket_tx.send(SocketMessage::Close(None)).await;
                        break;
                    }
                },
            }
        }

        // Fails harmlessly once the handshake already completed
        if let Err(e) = sink.close().await {
            debug!("WebSocket sink close: {}", e);
        }
    });

    let transport = Transport {
        outbound: to_socket_tx,
        inbound: from_socket_rx,
    };
    (transport, pump)
}
