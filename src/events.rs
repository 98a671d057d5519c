//! Observability events emitted to external collaborators

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::exchange::{AbortReason, Outcome, ResourceType};
use crate::websocket::Frame;

/// Default number of buffered events per subscriber
pub const EVENT_CAPACITY: usize = 1024;

/// Condensed exchange outcome carried by `exchange-resolved`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OutcomeSummary {
    /// Synthetic response
    Fulfilled {
        /// Status code
        status: u16,
    },
    /// Network response after a handler continued
    Continued {
        /// Status code
        status: u16,
    },
    /// Network response with no handler acting
    Forwarded {
        /// Status code
        status: u16,
    },
    /// Network-level failure
    Aborted {
        /// Abort reason
        reason: AbortReason,
    },
}

impl From<&Outcome> for OutcomeSummary {
    fn from(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Fulfilled(r) => Self::Fulfilled { status: r.status },
            Outcome::Continued(r) => Self::Continued { status: r.status },
            Outcome::Forwarded(r) => Self::Forwarded { status: r.status },
            Outcome::Aborted(abort) => Self::Aborted {
                reason: abort.reason,
            },
        }
    }
}

/// Lifecycle event
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum EngineEvent {
    /// An exchange entered the engine
    ExchangeStarted {
        /// Exchange identifier
        exchange: u64,
        /// Request method
        method: String,
        /// Request URL
        url: String,
        /// Resource type
        resource_type: ResourceType,
    },
    /// An exchange reached its terminal state
    ExchangeResolved {
        /// Exchange identifier
        exchange: u64,
        /// Outcome
        outcome: OutcomeSummary,
    },
    /// A route handler failed while dispatching an exchange or session
    HandlerFailed {
        /// Exchange or session identifier
        id: u64,
        /// Error message
        message: String,
    },
    /// A WebSocket session opened
    SocketOpened {
        /// Session identifier
        session: u64,
        /// Socket URL
        url: String,
    },
    /// The client sent a frame
    FrameSent {
        /// Session identifier
        session: u64,
        /// Frame payload
        frame: Frame,
    },
    /// The client received a frame
    FrameReceived {
        /// Session identifier
        session: u64,
        /// Frame payload
        frame: Frame,
    },
    /// The client side of a session closed
    SocketClosed {
        /// Session identifier
        session: u64,
        /// Close code, if one was exchanged
        code: Option<u16>,
        /// Close reason
        reason: String,
    },
}

/// Broadcast sink for engine events
///
/// Emission never blocks; subscribers that fall behind lose the oldest
/// events (`RecvError::Lagged`).
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventSink {
    /// Create a sink with the given per-subscriber buffer
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "event capacity must be > 0");
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to future events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Emit an event
    pub fn emit(&self, event: EngineEvent) {
        debug!("event: {:?}", event);
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Response;

    #[tokio::test]
    async fn test_subscribers_see_events_in_order() {
        let sink = EventSink::default();
        let mut rx = sink.subscribe();

        sink.emit(EngineEvent::SocketOpened {
            session: 1,
            url: "ws://example.com/feed".to_string(),
        });
        sink.emit(EngineEvent::SocketClosed {
            session: 1,
            code: Some(1000),
            reason: String::new(),
        });

        assert!(matches!(
            rx.recv().await.unwrap(),
            EngineEvent::SocketOpened { session: 1, .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            EngineEvent::SocketClosed { code: Some(1000), .. }
        ));
    }

    #[test]
    fn test_emit_without_subscribers() {
        let sink = EventSink::new(4);
        sink.emit(EngineEvent::HandlerFailed {
            id: 3,
            message: "boom".to_string(),
        });
    }

    #[test]
    fn test_event_serialization() {
        let event = EngineEvent::ExchangeResolved {
            exchange: 9,
            outcome: OutcomeSummary::from(&Outcome::Fulfilled(Response::new(204))),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "exchange-resolved");
        assert_eq!(json["outcome"]["kind"], "fulfilled");
        assert_eq!(json["outcome"]["status"], 204);
    }
}
