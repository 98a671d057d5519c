//! WebSocket frames and their tungstenite wire form

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as WireCloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// Normal closure
pub const CLOSE_NORMAL: u16 = 1000;
/// Endpoint going away (context destroyed)
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Abnormal closure; never sent on the wire
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Unexpected condition (handler failed)
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Reason used when the engine closes the remaining side of a session
pub const COMPANION_CLOSED: &str = "companion closed";

/// Data frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Frame {
    /// UTF-8 text
    Text(String),
    /// Binary payload
    Binary(Vec<u8>),
}

impl Frame {
    /// Payload length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(data) => data.len(),
        }
    }

    /// Whether the payload is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Text payload, if this is a text frame
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }
}

impl From<&str> for Frame {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for Frame {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Vec<u8>> for Frame {
    fn from(data: Vec<u8>) -> Self {
        Self::Binary(data)
    }
}

/// Close code and reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseFrame {
    /// Close code
    pub code: u16,
    /// Close reason
    pub reason: String,
}

impl CloseFrame {
    /// Create a close frame
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Frame to send to the other side after `observed` closed one side
    ///
    /// Codes that may not appear on the wire (1005, 1006, 1015, ...) become
    /// 1000.
    #[must_use]
    pub fn mirror(observed: Option<&CloseFrame>, reason: &str) -> Self {
        let code = observed
            .map(|f| f.code)
            .filter(|code| is_sendable(*code))
            .unwrap_or(CLOSE_NORMAL);
        Self::new(code, reason)
    }
}

/// Whether a close code may be sent in a close frame
#[must_use]
pub fn is_sendable(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
}

/// Anything that travels over one side of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketMessage {
    /// Data frame
    Frame(Frame),
    /// Close, with the peer's code and reason if it sent one
    Close(Option<CloseFrame>),
}

impl SocketMessage {
    /// Whether this is a close
    #[must_use]
    pub fn is_close(&self) -> bool {
        matches!(self, Self::Close(_))
    }
}

/// Socket lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketState {
    /// Handshake in progress
    Connecting,
    /// Frames may flow
    Open,
    /// Close sent, not yet complete
    Closing,
    /// No further sends accepted
    Closed,
}

/// Convert a wire message; control frames other than close yield `None`
#[must_use]
pub fn from_message(message: Message) -> Option<SocketMessage> {
    match message {
        Message::Text(text) => Some(SocketMessage::Frame(Frame::Text(text))),
        Message::Binary(data) => Some(SocketMessage::Frame(Frame::Binary(data))),
        Message::Close(frame) => Some(SocketMessage::Close(frame.map(|f| CloseFrame {
            code: u16::from(f.code),
            reason: f.reason.into_owned(),
        }))),
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => None,
    }
}

/// Convert to a wire message
#[must_use]
pub fn to_message(message: SocketMessage) -> Message {
    match message {
        SocketMessage::Frame(Frame::Text(text)) => Message::Text(text),
        SocketMessage::Frame(Frame::Binary(data)) => Message::Binary(data),
        SocketMessage::Close(frame) => Message::Close(frame.map(|f| WireCloseFrame {
            code: CloseCode::from(f.code),
            reason: Cow::Owned(f.reason),
        })),
    }
}
