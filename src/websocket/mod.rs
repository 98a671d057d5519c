//! WebSocket virtualization sessions
//!
//! A session pairs the client's socket with an optional real server socket.
//! Each socket is driven by a relay task that turns its transport into an
//! ordered channel for the handler; a supervisor closes the remaining side
//! when the other one goes away.

mod connection;
mod connector;
mod frame;
mod route;
mod session;

pub use connection::WebSocketConnection;
pub use connector::{spawn_pump, TungsteniteConnector, WebSocketConnector};
pub use frame::{
    from_message, is_sendable, to_message, CloseFrame, Frame, SocketMessage, SocketState,
    CLOSE_ABNORMAL, CLOSE_GOING_AWAY, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL, COMPANION_CLOSED,
};
pub use route::{ServerSide, WebSocketHandler, WebSocketRoute};
pub use session::{Transport, CHANNEL_CAPACITY, COMPANION_CLOSE_GRACE_MS};

pub(crate) use route::passthrough;
pub(crate) use session::{relay, supervise, Role, Session, Side};
