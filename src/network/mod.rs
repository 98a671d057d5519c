//! Network layer for Interpose
//!
//! The upstream client behind the engine and the front door that accepts
//! client traffic.

mod client;
mod connection_pool;
mod server;

pub use client::{HttpUpstream, Upstream, UPSTREAM_TIMEOUT_MS};
pub use connection_pool::{ConnectionGuard, ConnectionKind, ConnectionPool};
pub use server::{FrontDoor, ServerOptions};

/// Maximum number of concurrent connections
pub const MAX_CONNECTIONS: usize = 4096;

/// Default maximum request body size
pub const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Graceful shutdown timeout
pub const SHUTDOWN_TIMEOUT_MS: u64 = 5000;
