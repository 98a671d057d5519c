//! Bounded concurrency for front-door connections

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::MAX_CONNECTIONS;

/// Which listener a connection came in on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// HTTP/1.1 exchange traffic
    Http,
    /// Upgraded WebSocket session
    WebSocket,
}

impl ConnectionKind {
    fn slot(self) -> usize {
        match self {
            Self::Http => 0,
            Self::WebSocket => 1,
        }
    }
}

/// One limit shared by both listeners, with per-kind counts for reporting
#[derive(Clone)]
pub struct ConnectionPool {
    permits: Arc<Semaphore>,
    active: Arc<[AtomicUsize; 2]>,
    limit: usize,
}

impl ConnectionPool {
    /// Create a pool admitting at most `limit` connections
    ///
    /// # Panics
    ///
    /// Panics if `limit` is 0
    #[must_use]
    pub fn new(limit: usize) -> Self {
        assert!(limit > 0, "max_connections must be > 0");

        Self {
            permits: Arc::new(Semaphore::new(limit)),
            active: Arc::new([AtomicUsize::new(0), AtomicUsize::new(0)]),
            limit,
        }
    }

    /// Admit a connection without waiting; `None` when full or shut down
    pub fn try_acquire(&self, kind: ConnectionKind) -> Option<ConnectionGuard> {
        let permit = Arc::clone(&self.permits).try_acquire_owned().ok()?;
        self.active[kind.slot()].fetch_add(1, Ordering::Relaxed);
        Some(ConnectionGuard {
            _permit: permit,
            active: Arc::clone(&self.active),
            kind,
        })
    }

    /// Refuse every later connection
    pub fn shutdown(&self) {
        self.permits.close();
    }

    /// Open connections of one kind
    #[must_use]
    pub fn active(&self, kind: ConnectionKind) -> usize {
        self.active[kind.slot()].load(Ordering::Relaxed)
    }

    /// Open connections of both kinds
    #[must_use]
    pub fn total_active(&self) -> usize {
        self.active(ConnectionKind::Http) + self.active(ConnectionKind::WebSocket)
    }

    /// Configured limit
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(MAX_CONNECTIONS)
    }
}

/// Slot held for the lifetime of one connection
pub struct ConnectionGuard {
    _permit: OwnedSemaphorePermit,
    active: Arc<[AtomicUsize; 2]>,
    kind: ConnectionKind,
}

impl ConnectionGuard {
    /// Listener the connection came in on
    #[must_use]
    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active[self.kind.slot()].fetch_sub(1, Ordering::Relaxed);
    }
}
