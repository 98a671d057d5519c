//! Session sides, relays and the companion-close supervisor

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::events::{EngineEvent, EventSink};
use crate::shaper::NetworkConditions;
use crate::{InterposeError, Result};

use super::frame::{CloseFrame, Frame, SocketMessage, SocketState, COMPANION_CLOSED};

/// Default companion-close grace period in milliseconds
pub const COMPANION_CLOSE_GRACE_MS: u64 = 100;

/// Default per-direction frame buffer
pub const CHANNEL_CAPACITY: usize = 256;

/// One end of a message pipe: what we send and what we receive
#[derive(Debug)]
pub struct Transport {
    /// Messages to the peer
    pub outbound: mpsc::Sender<SocketMessage>,
    /// Messages from the peer
    pub inbound: mpsc::Receiver<SocketMessage>,
}

impl Transport {
    /// Two connected in-memory ends
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0
    #[must_use]
    pub fn pair(capacity: usize) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (
            Self {
                outbound: a_tx,
                inbound: b_rx,
            },
            Self {
                outbound: b_tx,
                inbound: a_rx,
            },
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Server,
}

/// Engine-owned view of one socket of a session
///
/// Only the session's relay, the handler's route and the supervisor hold a
/// side; nothing else writes to its transport.
pub(crate) struct Side {
    session: u64,
    role: Role,
    state: watch::Sender<SocketState>,
    // Taken on local close so the peer sees the stream end
    outbound: Mutex<Option<mpsc::Sender<SocketMessage>>>,
    close_frame: Mutex<Option<CloseFrame>>,
    sink: EventSink,
    conditions: Arc<NetworkConditions>,
}

impl Side {
    pub(crate) fn new(
        session: u64,
        role: Role,
        outbound: mpsc::Sender<SocketMessage>,
        sink: EventSink,
        conditions: Arc<NetworkConditions>,
    ) -> Self {
        let (state, _) = watch::channel(SocketState::Connecting);
        Self {
            session,
            role,
            state,
            outbound: Mutex::new(Some(outbound)),
            close_frame: Mutex::new(None),
            sink,
            conditions,
        }
    }

    pub(crate) fn state(&self) -> SocketState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SocketState> {
        self.state.subscribe()
    }

    pub(crate) fn close_frame(&self) -> Option<CloseFrame> {
        self.close_frame.lock().clone()
    }

    pub(crate) fn open(&self) {
        self.state.send_if_modified(|state| {
            if *state == SocketState::Connecting {
                *state = SocketState::Open;
                true
            } else {
                false
            }
        });
    }

    pub(crate) async fn wait_closed(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`
        let _ = rx.wait_for(|state| *state == SocketState::Closed).await;
    }

    /// Deliver a frame to this side's peer; frames keep `send` order
    pub(crate) async fn send(&self, frame: Frame) -> Result<()> {
        if self.state() != SocketState::Open {
            return Err(InterposeError::SocketClosed {
                session: self.session,
            });
        }

        if self.role == Role::Client {
            let delay = self.conditions.download_delay(frame.len());
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        let outbound = self
            .outbound
            .lock()
            .clone()
            .ok_or(InterposeError::SocketClosed {
                session: self.session,
            })?;
        let event = (self.role == Role::Client).then(|| frame.clone());
        outbound
            .send(SocketMessage::Frame(frame))
            .await
            .map_err(|_| InterposeError::SocketClosed {
                session: self.session,
            })?;

        if let Some(frame) = event {
            self.sink.emit(EngineEvent::FrameReceived {
                session: self.session,
                frame,
            });
        }
        Ok(())
    }

    /// Close from our end; a no-op once closing has begun
    ///
    /// Never waits on the peer. A peer whose buffer is full gets no close
    /// frame, only the end of its stream once it drains.
    pub(crate) fn close(&self, frame: Option<CloseFrame>) {
        let began = self.state.send_if_modified(|state| {
            if matches!(state, SocketState::Connecting | SocketState::Open) {
                *state = SocketState::Closing;
                true
            } else {
                false
            }
        });
        if !began {
            return;
        }

        debug!(
            "Session {}: closing {:?} side ({:?})",
            self.session, self.role, frame
        );
        self.mark_closed(frame.clone());

        let Some(outbound) = self.outbound.lock().take() else {
            return;
        };
        match outbound.try_send(SocketMessage::Close(frame)) {
            // Peer may already be gone
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => debug!(
                "Session {}: {:?} peer is backed up, ending its stream without a close frame",
                self.session, self.role
            ),
        }
    }

    /// Record that this side reached `Closed`
    pub(crate) fn mark_closed(&self, frame: Option<CloseFrame>) {
        let changed = self.state.send_if_modified(|state| {
            if *state == SocketState::Closed {
                false
            } else {
                *state = SocketState::Closed;
                true
            }
        });
        if !changed {
            return;
        }

        debug!(
            "Session {}: {:?} side closed ({:?})",
            self.session, self.role, frame
        );
        *self.close_frame.lock() = frame.clone();

        if self.role == Role::Client {
            self.sink.emit(EngineEvent::SocketClosed {
                session: self.session,
                code: frame.as_ref().map(|f| f.code),
                reason: frame.map(|f| f.reason).unwrap_or_default(),
            });
        }
    }
}

/// Forward everything arriving on a side's transport to the handler
///
/// Ends when the peer closes, the transport ends or the side is closed
/// locally.
pub(crate) async fn relay(
    side: Arc<Side>,
    mut transport: mpsc::Receiver<SocketMessage>,
    handler: mpsc::Sender<SocketMessage>,
) {
    loop {
        tokio::select! {
            message = transport.recv() => match message {
                Some(SocketMessage::Frame(frame)) => {
                    if side.role == Role::Client {
                        side.sink.emit(EngineEvent::FrameSent {
                            session: side.session,
                            frame: frame.clone(),
                        });
                    }
                    tokio::select! {
                        // A handler that stopped listening drops frames
                        _ = handler.send(SocketMessage::Frame(frame)) => {}
                        () = side.wait_closed() => break,
                    }
                }
                Some(SocketMessage::Close(frame)) => {
                    side.mark_closed(frame.clone());
                    // A full handler buffer ends with `None` instead
                    let _ = handler.try_send(SocketMessage::Close(frame));
                    break;
                }
                None => {
                    side.mark_closed(None);
                    let _ = handler.try_send(SocketMessage::Close(None));
                    break;
                }
            },
            () = side.wait_closed() => break,
        }
    }
    debug!("Session {}: {:?} relay finished", side.session, side.role);
}

/// A live WebSocket session: client side plus optional server side
pub(crate) struct Session {
    id: u64,
    url: String,
    client: Arc<Side>,
    server: watch::Sender<Option<Arc<Side>>>,
    grace: Duration,
}

impl Session {
    pub(crate) fn new(id: u64, url: String, client: Arc<Side>, grace: Duration) -> Self {
        let (server, _) = watch::channel(None);
        Self {
            id,
            url,
            client,
            server,
            grace,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn url(&self) -> &str {
        &self.url
    }

    pub(crate) fn client(&self) -> &Arc<Side> {
        &self.client
    }

    pub(crate) fn server(&self) -> Option<Arc<Side>> {
        self.server.borrow().clone()
    }

    /// Install the server side; fails if one is already present
    pub(crate) fn set_server(&self, side: Arc<Side>) -> bool {
        self.server.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(side);
                true
            } else {
                false
            }
        })
    }

    /// Close both sides immediately
    pub(crate) fn close_all(&self, frame: CloseFrame) {
        self.client.close(Some(frame.clone()));
        if let Some(server) = self.server() {
            server.close(Some(frame));
        }
    }
}

async fn wait_server(server: Option<&Side>) {
    match server {
        Some(side) => side.wait_closed().await,
        None => std::future::pending().await,
    }
}

/// Close the remaining side once either side closes
///
/// The handler gets `grace` to close the other side itself; after that the
/// engine closes it with the first side's code and "companion closed".
pub(crate) async fn supervise(session: Arc<Session>, sessions: Arc<DashMap<u64, Arc<Session>>>) {
    let mut slot = session.server.subscribe();

    let client_closed_first = loop {
        let server = slot.borrow_and_update().clone();
        tokio::select! {
            () = session.client.wait_closed() => break true,
            () = wait_server(server.as_deref()) => break false,
            changed = slot.changed() => {
                if changed.is_err() {
                    session.client.wait_closed().await;
                    break true;
                }
            }
        }
    };

    tokio::time::sleep(session.grace).await;

    let (closed, remaining) = if client_closed_first {
        (Arc::clone(&session.client), session.server())
    } else {
        match session.server() {
            Some(server) => (server, Some(Arc::clone(&session.client))),
            None => (Arc::clone(&session.client), None),
        }
    };

    if let Some(remaining) = remaining {
        if remaining.state() != SocketState::Closed {
            debug!(
                "Session {}: closing {:?} side after companion closed",
                session.id, remaining.role
            );
            remaining
                .close(Some(CloseFrame::mirror(
                    closed.close_frame().as_ref(),
                    COMPANION_CLOSED,
                )));
        }
    }

    sessions.remove(&session.id);
    debug!("Session {} finished ({})", session.id, session.url);
}
