//! Interpose - network interception and virtualization engine
//!
//! Every HTTP exchange and WebSocket session a browsing context issues is
//! offered to user-registered handlers first. Handlers can answer with a
//! synthetic response, abort with a typed network error, or let the exchange
//! continue to the real network with overrides. On top of that sit HAR
//! record/replay, WebSocket man-in-the-middle sessions and network condition
//! shaping.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::field_reassign_with_default,
    clippy::multiple_crate_versions
)]

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod exchange;
pub mod har;
pub mod network;
pub mod pattern;
pub mod route;
pub mod shaper;
pub mod websocket;

pub use engine::{Engine, EngineOptions};
pub use error::{InterposeError, Result};
pub use events::EngineEvent;
pub use exchange::{AbortReason, Outcome, Request, Resolution, ResourceType, Response};
pub use har::{HarHandle, HarMode, HarOptions, NotFound};
pub use pattern::RoutePattern;
pub use route::{Overrides, Route, RouteHandler, StaticResponder};
pub use shaper::NetworkConditions;
pub use websocket::{
    CloseFrame, Frame, ServerSide, WebSocketConnection, WebSocketHandler, WebSocketRoute,
};
