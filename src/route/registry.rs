//! Ordered route registrations for one browsing context

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::pattern::RoutePattern;

/// Opaque handle identifying one registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationHandle(u64);

impl RegistrationHandle {
    /// Registration sequence number (higher = more recent)
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.0
    }
}

/// A pattern/handler pair
///
/// Registrations are never mutated in place; removal only flips `active`.
pub struct RouteRegistration<H: ?Sized> {
    pattern: RoutePattern,
    handler: Arc<H>,
    sequence: u64,
    active: AtomicBool,
    remaining: Option<AtomicUsize>,
}

impl<H: ?Sized> RouteRegistration<H> {
    /// Compiled pattern
    #[must_use]
    pub fn pattern(&self) -> &RoutePattern {
        &self.pattern
    }

    /// Handler
    #[must_use]
    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Registration sequence number
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Whether the registration may still be offered exchanges
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Consume one use; `false` if the registration is inactive or exhausted
    pub(crate) fn claim(&self) -> bool {
        if !self.is_active() {
            return false;
        }

        let Some(remaining) = &self.remaining else {
            return true;
        };

        match remaining.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1)) {
            Ok(previous) => {
                if previous == 1 {
                    self.deactivate();
                }
                true
            }
            Err(_) => false,
        }
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }
}

/// Registry of routes, most recent first at dispatch time
///
/// Dispatch takes a read lock and snapshots matching registrations, so
/// registration changes never disturb an in-flight handler chain.
pub struct RouteRegistry<H: ?Sized> {
    entries: RwLock<Vec<Arc<RouteRegistration<H>>>>,
    next_sequence: AtomicU64,
}

impl<H: ?Sized + Send + Sync> RouteRegistry<H> {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            next_sequence: AtomicU64::new(1),
        }
    }

    /// Append a registration
    ///
    /// `times` limits how many exchanges the handler is offered before the
    /// registration expires on its own.
    pub async fn register(
        &self,
        pattern: RoutePattern,
        handler: Arc<H>,
        times: Option<usize>,
    ) -> RegistrationHandle {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let registration = Arc::new(RouteRegistration {
            pattern,
            handler,
            sequence,
            active: AtomicBool::new(times != Some(0)),
            remaining: times.map(AtomicUsize::new),
        });

        debug!("Registered route #{} ({})", sequence, registration.pattern);

        let mut entries = self.entries.write().await;
        entries.retain(|r| r.is_active());
        entries.push(registration);

        RegistrationHandle(sequence)
    }

    /// Deactivate a registration; returns whether it was active
    pub async fn unregister(&self, handle: RegistrationHandle) -> bool {
        let mut entries = self.entries.write().await;
        let mut found = false;

        for registration in entries.iter().filter(|r| r.sequence == handle.0) {
            found = registration.is_active();
            registration.deactivate();
        }
        entries.retain(|r| r.is_active());

        if found {
            debug!("Unregistered route #{}", handle.0);
        }
        found
    }

    /// Deactivate every registration
    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        for registration in entries.iter() {
            registration.deactivate();
        }
        entries.clear();
    }

    /// Active registrations matching the URL and method, most recent first
    pub async fn candidates(&self, url: &str, method: &str) -> Vec<Arc<RouteRegistration<H>>> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .rev()
            .filter(|r| r.is_active() && r.pattern.matches(url, method))
            .cloned()
            .collect()
    }

    /// Number of active registrations
    pub async fn len(&self) -> usize {
        self.entries
            .read()
            .await
            .iter()
            .filter(|r| r.is_active())
            .count()
    }

    /// Whether there are no active registrations
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl<H: ?Sized + Send + Sync> Default for RouteRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::compile;

    fn registry() -> RouteRegistry<str> {
        RouteRegistry::new()
    }

    #[tokio::test]
    async fn test_candidates_most_recent_first() {
        let registry = registry();
        registry
            .register(compile("**/api/**").unwrap(), Arc::from("broad"), None)
            .await;
        registry
            .register(compile("**/api/data").unwrap(), Arc::from("narrow"), None)
            .await;
        registry
            .register(compile("**/other").unwrap(), Arc::from("unrelated"), None)
            .await;

        let names: Vec<String> = registry
            .candidates("http://localhost/api/data", "GET")
            .await
            .iter()
            .map(|r| r.handler().to_string())
            .collect();
        assert_eq!(names, vec!["narrow", "broad"]);
    }

    #[tokio::test]
    async fn test_unregister() {
        let registry = registry();
        let handle = registry
            .register(compile("**").unwrap(), Arc::from("all"), None)
            .await;
        assert_eq!(registry.len().await, 1);

        assert!(registry.unregister(handle).await);
        assert!(!registry.unregister(handle).await);
        assert!(registry.is_empty().await);
        assert!(registry.candidates("http://x/", "GET").await.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_survives_unregister() {
        let registry = registry();
        let handle = registry
            .register(compile("**").unwrap(), Arc::from("all"), None)
            .await;

        let snapshot = registry.candidates("http://x/", "GET").await;
        registry.unregister(handle).await;

        assert_eq!(snapshot.len(), 1);
        assert!(!snapshot[0].is_active());
        assert!(!snapshot[0].claim());
    }

    #[tokio::test]
    async fn test_times_limit() {
        let registry = registry();
        registry
            .register(compile("**").unwrap(), Arc::from("twice"), Some(2))
            .await;

        let registration = registry.candidates("http://x/", "GET").await.remove(0);
        assert!(registration.claim());
        assert!(registration.claim());
        assert!(!registration.claim());
        assert!(registry.candidates("http://x/", "GET").await.is_empty());
    }

    #[tokio::test]
    async fn test_clear() {
        let registry = registry();
        registry
            .register(compile("**/a").unwrap(), Arc::from("a"), None)
            .await;
        registry
            .register(compile("**/b").unwrap(), Arc::from("b"), None)
            .await;

        registry.clear().await;
        assert!(registry.is_empty().await);
    }
}
