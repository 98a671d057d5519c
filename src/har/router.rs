//! Route handler wiring an archive into the dispatcher

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;

use crate::exchange::AbortReason;
use crate::route::{Overrides, RegistrationHandle, Route, RouteHandler, RouteRegistry};
use crate::{InterposeError, Result};

use super::store::{HarArchive, HarMode, HarStats, NotFound};

/// Serves (replay) or captures (record) exchanges within the archive's scope
pub struct HarRouter {
    archive: Arc<HarArchive>,
}

impl HarRouter {
    /// Wrap an archive
    #[must_use]
    pub fn new(archive: Arc<HarArchive>) -> Self {
        Self { archive }
    }

    fn replay(&self, route: &Route) -> Result<()> {
        if let Some(response) = self.archive.lookup(route.request())? {
            return route.fulfill(response);
        }

        let request = route.request();
        match self.archive.options().not_found {
            NotFound::Abort => route.abort_with(
                AbortReason::NoMatchingHarEntry,
                format!("{} {}", request.method, request.url),
            ),
            NotFound::Fallback => route.continue_to(Overrides::none()),
        }
    }

    async fn record(&self, route: &Route) -> Result<()> {
        let started = Utc::now();
        let clock = Instant::now();

        match route.fetch(Overrides::none()).await {
            Ok(response) => {
                let elapsed_ms = clock.elapsed().as_secs_f64() * 1000.0;
                self.archive
                    .record(route.request(), &response, started, elapsed_ms);
                route.fulfill(response)
            }
            // Network failures are passed through unchanged, never recorded
            Err(InterposeError::Aborted { reason, detail }) => match detail {
                Some(detail) => route.abort_with(reason, detail),
                None => route.abort(reason),
            },
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl RouteHandler for HarRouter {
    async fn handle(&self, route: Route) -> anyhow::Result<()> {
        match self.archive.mode() {
            HarMode::Replay => self.replay(&route)?,
            HarMode::Record => self.record(&route).await?,
        }
        Ok(())
    }
}

/// Handle to an archive registered on an engine
pub struct HarHandle {
    archive: Arc<HarArchive>,
    path: PathBuf,
    registration: RegistrationHandle,
    registry: Arc<RouteRegistry<dyn RouteHandler>>,
}

impl HarHandle {
    pub(crate) fn new(
        archive: Arc<HarArchive>,
        path: PathBuf,
        registration: RegistrationHandle,
        registry: Arc<RouteRegistry<dyn RouteHandler>>,
    ) -> Self {
        Self {
            archive,
            path,
            registration,
            registry,
        }
    }

    /// The archive
    #[must_use]
    pub fn archive(&self) -> &Arc<HarArchive> {
        &self.archive
    }

    /// Path the archive was opened from
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Counters
    #[must_use]
    pub fn stats(&self) -> HarStats {
        self.archive.stats()
    }

    /// Write the archive back to its path
    ///
    /// # Errors
    ///
    /// Returns error if serialization or the write fails
    pub fn save(&self) -> Result<()> {
        if self.archive.mode() != HarMode::Record {
            warn!(
                "Saving replay archive {}; contents are unchanged",
                self.path.display()
            );
        }
        self.archive.save(&self.path)
    }

    /// Remove the archive's route registration
    pub async fn unroute(&self) -> bool {
        self.registry.unregister(self.registration).await
    }
}

impl std::fmt::Debug for HarHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarHandle")
            .field("path", &self.path)
            .field("mode", &self.archive.mode())
            .field("registration", &self.registration)
            .finish_non_exhaustive()
    }
}
