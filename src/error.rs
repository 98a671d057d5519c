//! Error types for Interpose

use std::io;
use thiserror::Error;

use crate::exchange::AbortReason;

/// Result type for Interpose operations
pub type Result<T> = std::result::Result<T, InterposeError>;

/// Errors that can occur in Interpose
#[derive(Debug, Error)]
pub enum InterposeError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON (HAR) encoding or decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Route pattern could not be compiled
    #[error("Invalid pattern '{pattern}': {message}")]
    InvalidPattern {
        /// Pattern source as supplied by the caller
        pattern: String,
        /// Why compilation failed
        message: String,
    },

    /// A second resolution was attempted on an exchange or route
    #[error("Exchange {exchange} is already resolved")]
    AlreadyResolved {
        /// Exchange identifier
        exchange: u64,
    },

    /// A route handler failed
    #[error("Route handler failed: {0}")]
    Handler(String),

    /// Strict HAR replay found no entry for the request
    #[error("No matching HAR entry for {method} {url}")]
    NoMatchingHarEntry {
        /// Request method
        method: String,
        /// Request URL
        url: String,
    },

    /// The exchange was aborted; a network-level failure, never an HTTP status
    #[error("net::{reason}{}", .detail.as_deref().map(|d| format!(" ({d})")).unwrap_or_default())]
    Aborted {
        /// Typed abort reason
        reason: AbortReason,
        /// Optional diagnostic detail
        detail: Option<String>,
    },

    /// Send or connect attempted on a closed WebSocket side
    #[error("WebSocket session {session} is closed")]
    SocketClosed {
        /// Session identifier
        session: u64,
    },

    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl InterposeError {
    /// Network-level abort with no detail
    #[must_use]
    pub fn aborted(reason: AbortReason) -> Self {
        Self::Aborted {
            reason,
            detail: None,
        }
    }

    /// Whether the caller should treat this as a network failure
    /// rather than a configuration or programming error
    #[must_use]
    pub fn is_network_error(&self) -> bool {
        matches!(
            self,
            Self::Aborted { .. } | Self::NoMatchingHarEntry { .. } | Self::Handler(_)
        )
    }

    /// Abort reason carried by this error, if it is a network failure
    #[must_use]
    pub fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            Self::Aborted { reason, .. } => Some(*reason),
            Self::NoMatchingHarEntry { .. } => Some(AbortReason::NoMatchingHarEntry),
            Self::Handler(_) => Some(AbortReason::HandlerError),
            _ => None,
        }
    }
}
