//! In-process client end of a session

use tokio::sync::watch;

use crate::{InterposeError, Result};

use super::frame::{CloseFrame, Frame, SocketMessage, SocketState};
use super::session::Transport;

/// What the client holds after opening a socket through the engine
pub struct WebSocketConnection {
    session: u64,
    url: String,
    transport: Transport,
    state: watch::Receiver<SocketState>,
}

impl WebSocketConnection {
    pub(crate) fn new(
        session: u64,
        url: String,
        transport: Transport,
        state: watch::Receiver<SocketState>,
    ) -> Self {
        Self {
            session,
            url,
            transport,
            state,
        }
    }

    /// Session identifier
    #[must_use]
    pub fn session_id(&self) -> u64 {
        self.session
    }

    /// URL the socket was opened with
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SocketState {
        *self.state.borrow()
    }

    /// Send a frame
    ///
    /// # Errors
    ///
    /// Returns `SocketClosed` once the socket is closing or closed
    pub async fn send(&self, frame: impl Into<Frame>) -> Result<()> {
        if self.state() != SocketState::Open {
            return Err(InterposeError::SocketClosed {
                session: self.session,
            });
        }
        self.transport
            .outbound
            .send(SocketMessage::Frame(frame.into()))
            .await
            .map_err(|_| InterposeError::SocketClosed {
                session: self.session,
            })
    }

    /// Next message; a `Close` is delivered once, then `None`
    pub async fn recv(&mut self) -> Option<SocketMessage> {
        self.transport.inbound.recv().await
    }

    /// Start the close handshake
    pub async fn close(&self, code: u16, reason: &str) {
        if self.state() == SocketState::Closed {
            return;
        }
        // The engine may already have dropped its end
        let _ = self
            .transport
            .outbound
            .send(SocketMessage::Close(Some(CloseFrame::new(code, reason))))
            .await;
    }

    /// Wait until the socket reaches `Closed`
    pub async fn closed(&mut self) {
        let _ = self
            .state
            .wait_for(|state| *state == SocketState::Closed)
            .await;
    }
}

impl std::fmt::Debug for WebSocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnection")
            .field("session", &self.session)
            .field("url", &self.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
