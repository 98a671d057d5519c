//! Handler-facing session API

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::events::EventSink;
use crate::shaper::NetworkConditions;
use crate::{InterposeError, Result};

use super::connector::WebSocketConnector;
use super::frame::{is_sendable, CloseFrame, Frame, SocketMessage, SocketState, CLOSE_NORMAL};
use super::session::{relay, Role, Session, Side, Transport};

/// User-supplied logic owning one intercepted WebSocket session
///
/// The session ends when the handler returns: the client side is closed
/// with 1000, or with 1011 if the handler failed.
#[async_trait]
pub trait WebSocketHandler: Send + Sync {
    /// Handle one session
    async fn handle(&self, route: WebSocketRoute) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> WebSocketHandler for F
where
    F: Fn(WebSocketRoute) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, route: WebSocketRoute) -> anyhow::Result<()> {
        (self)(route).await
    }
}

/// Client side of an intercepted session, as seen by its handler
///
/// Without [`connect_to_server`](Self::connect_to_server) the session is a
/// pure mock. After it, frames flow only where the handler forwards them.
pub struct WebSocketRoute {
    session: Arc<Session>,
    inbound: mpsc::Receiver<SocketMessage>,
    connector: Arc<dyn WebSocketConnector>,
    sink: EventSink,
    capacity: usize,
}

impl WebSocketRoute {
    pub(crate) fn new(
        session: Arc<Session>,
        inbound: mpsc::Receiver<SocketMessage>,
        connector: Arc<dyn WebSocketConnector>,
        sink: EventSink,
        capacity: usize,
    ) -> Self {
        Self {
            session,
            inbound,
            connector,
            sink,
            capacity,
        }
    }

    /// Session identifier
    #[must_use]
    pub fn session_id(&self) -> u64 {
        self.session.id()
    }

    /// URL the client opened
    #[must_use]
    pub fn url(&self) -> &str {
        self.session.url()
    }

    /// Client side state
    #[must_use]
    pub fn state(&self) -> SocketState {
        self.session.client().state()
    }

    /// Next message from the client; `None` once the client side is gone
    pub async fn on_message(&mut self) -> Option<SocketMessage> {
        self.inbound.recv().await
    }

    /// Send a frame to the client
    ///
    /// # Errors
    ///
    /// Returns `SocketClosed` once the client side is closing or closed
    pub async fn send(&self, frame: impl Into<Frame>) -> Result<()> {
        self.session.client().send(frame.into()).await
    }

    /// Close the client side
    pub async fn close(&self, code: u16, reason: &str) {
        self.close_with(Some(CloseFrame::new(code, reason))).await;
    }

    /// Close the client side with an optional frame
    pub async fn close_with(&self, frame: Option<CloseFrame>) {
        self.session.client().close(frame);
    }

    /// Open the real server connection for this session
    ///
    /// # Errors
    ///
    /// Returns `SocketClosed` if the client already left, a `WebSocket`
    /// error if the server side was already connected, or the connector's
    /// network error
    pub async fn connect_to_server(&self) -> Result<ServerSide> {
        if self.state() != SocketState::Open {
            return Err(InterposeError::SocketClosed {
                session: self.session_id(),
            });
        }
        if self.session.server().is_some() {
            return Err(InterposeError::WebSocket(format!(
                "session {} is already connected to its server",
                self.session_id()
            )));
        }

        let transport = self.connector.connect(self.url()).await?;
        self.attach_server(transport)
    }

    pub(crate) fn attach_server(&self, transport: Transport) -> Result<ServerSide> {
        let side = Arc::new(Side::new(
            self.session_id(),
            Role::Server,
            transport.outbound,
            self.sink.clone(),
            Arc::new(NetworkConditions::no_throttling()),
        ));
        side.open();

        if !self.session.set_server(Arc::clone(&side)) {
            return Err(InterposeError::WebSocket(format!(
                "session {} is already connected to its server",
                self.session_id()
            )));
        }

        let (handler_tx, handler_rx) = mpsc::channel(self.capacity);
        tokio::spawn(relay(Arc::clone(&side), transport.inbound, handler_tx));
        debug!("Session {}: server side open", self.session_id());

        Ok(ServerSide {
            side,
            inbound: handler_rx,
        })
    }
}

impl std::fmt::Debug for WebSocketRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketRoute")
            .field("session", &self.session_id())
            .field("url", &self.url())
            .finish_non_exhaustive()
    }
}

/// Real server connection of a session in forwarding mode
pub struct ServerSide {
    side: Arc<Side>,
    inbound: mpsc::Receiver<SocketMessage>,
}

impl ServerSide {
    /// Next message from the server; `None` once the server side is gone
    pub async fn on_message(&mut self) -> Option<SocketMessage> {
        self.inbound.recv().await
    }

    /// Send a frame to the server
    ///
    /// # Errors
    ///
    /// Returns `SocketClosed` once the server side is closing or closed
    pub async fn send(&self, frame: impl Into<Frame>) -> Result<()> {
        self.side.send(frame.into()).await
    }

    /// Close the server side
    pub async fn close(&self, code: u16, reason: &str) {
        self.side.close(Some(CloseFrame::new(code, reason)));
    }

    /// Close the server side with an optional frame
    pub async fn close_with(&self, frame: Option<CloseFrame>) {
        self.side.close(frame);
    }

    /// Server side state
    #[must_use]
    pub fn state(&self) -> SocketState {
        self.side.state()
    }
}

impl std::fmt::Debug for ServerSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSide")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Forward both directions unchanged until either side closes
pub(crate) async fn passthrough(mut route: WebSocketRoute, mut server: ServerSide) {
    loop {
        tokio::select! {
            message = route.on_message() => match message {
                Some(SocketMessage::Frame(frame)) => {
                    if server.send(frame).await.is_err() {
                        break;
                    }
                }
                other => {
                    server.close_with(forwarded_close(other)).await;
                    break;
                }
            },
            message = server.on_message() => match message {
                Some(SocketMessage::Frame(frame)) => {
                    if route.send(frame).await.is_err() {
                        break;
                    }
                }
                other => {
                    route.close_with(forwarded_close(other)).await;
                    break;
                }
            },
        }
    }
    debug!("Session {}: passthrough finished", route.session_id());
}

/// Close frame to pass on after one side ended
fn forwarded_close(message: Option<SocketMessage>) -> Option<CloseFrame> {
    match message {
        Some(SocketMessage::Close(Some(frame))) if is_sendable(frame.code) => Some(frame),
        Some(SocketMessage::Close(Some(frame))) => Some(CloseFrame::new(CLOSE_NORMAL, frame.reason)),
        _ => None,
    }
}
