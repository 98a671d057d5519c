//! Interception context: the single point of control a handler uses to
//! resolve an exchange

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::exchange::{Abort, AbortReason, Exchange, ExchangeState, Request, ResourceType, Response};
use crate::network::Upstream;
use crate::shaper::{self, NetworkConditions};
use crate::{InterposeError, Result};

/// Request changes applied before the exchange moves on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    /// Replacement method
    pub method: Option<String>,
    /// Replacement URL (matching still uses the original URL)
    pub url: Option<String>,
    /// Replacement header list
    pub headers: Option<Vec<(String, String)>>,
    /// Replacement body
    pub body: Option<Vec<u8>>,
}

impl Overrides {
    /// No changes
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Replace the method
    #[must_use]
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    /// Replace the URL
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Replace all headers
    #[must_use]
    pub fn headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Replace the body
    #[must_use]
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Apply to a request
    #[must_use]
    pub fn apply(self, mut request: Request) -> Request {
        if let Some(method) = self.method {
            request.method = method;
        }
        if let Some(url) = self.url {
            request.url = url;
        }
        if let Some(headers) = self.headers {
            request.headers = headers;
        }
        if let Some(body) = self.body {
            request.body = body;
        }
        request
    }
}

/// What a handler decided
#[derive(Debug)]
pub(crate) enum Decision {
    Fulfill(Response),
    Abort(Abort),
    Continue(Overrides),
}

/// Per-handler decision cell shared between a `Route` and the dispatcher
#[derive(Debug, Default)]
pub(crate) struct RouteSlot {
    decision: Mutex<Option<Decision>>,
    acted: AtomicBool,
    released: AtomicBool,
}

impl RouteSlot {
    /// Close the slot once the handler has returned
    pub(crate) fn release(&self) {
        self.released.store(true, Ordering::Release);
    }

    pub(crate) fn take(&self) -> Option<Decision> {
        self.decision.lock().take()
    }
}

/// Handle given to one route handler for one exchange
///
/// Exactly one of [`fulfill`](Self::fulfill), [`abort`](Self::abort),
/// [`continue_to`](Self::continue_to) or
/// [`fetch_and_fulfill`](Self::fetch_and_fulfill) may succeed. The route is
/// released when the handler returns; any later call fails with
/// `AlreadyResolved`.
pub struct Route {
    exchange: Arc<Exchange>,
    request: Request,
    slot: Arc<RouteSlot>,
    upstream: Arc<dyn Upstream>,
    conditions: Arc<NetworkConditions>,
    has_fallback: bool,
}

impl Route {
    pub(crate) fn new(
        exchange: Arc<Exchange>,
        request: Request,
        slot: Arc<RouteSlot>,
        upstream: Arc<dyn Upstream>,
        conditions: Arc<NetworkConditions>,
        has_fallback: bool,
    ) -> Self {
        Self {
            exchange,
            request,
            slot,
            upstream,
            conditions,
            has_fallback,
        }
    }

    /// Request as it currently stands, including overrides from earlier handlers
    #[must_use]
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Exchange identifier
    #[must_use]
    pub fn exchange_id(&self) -> u64 {
        self.exchange.id()
    }

    /// Resource type of the exchange
    #[must_use]
    pub fn resource_type(&self) -> ResourceType {
        self.exchange.resource_type()
    }

    /// Whether an older matching handler would receive `continue_to`
    #[must_use]
    pub fn has_fallback(&self) -> bool {
        self.has_fallback
    }

    /// Answer with a synthetic response; the network is never contacted
    ///
    /// # Errors
    ///
    /// Returns `AlreadyResolved` if this route or its exchange was already resolved
    pub fn fulfill(&self, response: Response) -> Result<()> {
        self.claim()?;
        self.exchange.resolve(ExchangeState::Fulfilled)?;
        debug!(
            "Exchange {} fulfilled with {}",
            self.exchange.id(),
            response.status
        );
        *self.slot.decision.lock() = Some(Decision::Fulfill(response));
        Ok(())
    }

    /// Fail the exchange with a network error
    ///
    /// # Errors
    ///
    /// Returns `AlreadyResolved` if this route or its exchange was already resolved
    pub fn abort(&self, reason: AbortReason) -> Result<()> {
        self.abort_inner(reason, None)
    }

    /// Fail the exchange with a network error and a diagnostic detail
    ///
    /// # Errors
    ///
    /// Returns `AlreadyResolved` if this route or its exchange was already resolved
    pub fn abort_with(&self, reason: AbortReason, detail: impl Into<String>) -> Result<()> {
        self.abort_inner(reason, Some(detail.into()))
    }

    fn abort_inner(&self, reason: AbortReason, detail: Option<String>) -> Result<()> {
        self.claim()?;
        self.exchange.resolve(ExchangeState::Aborted)?;
        debug!("Exchange {} aborted: {}", self.exchange.id(), reason);
        *self.slot.decision.lock() = Some(Decision::Abort(Abort { reason, detail }));
        Ok(())
    }

    /// Pass the exchange on: to the next older matching handler if one
    /// remains, otherwise to the real network
    ///
    /// # Errors
    ///
    /// Returns `AlreadyResolved` if this route or its exchange was already resolved
    pub fn continue_to(&self, overrides: Overrides) -> Result<()> {
        self.claim()?;
        if self.exchange.state().is_terminal() {
            return Err(InterposeError::AlreadyResolved {
                exchange: self.exchange.id(),
            });
        }
        debug!(
            "Exchange {} continued ({})",
            self.exchange.id(),
            if self.has_fallback {
                "next handler"
            } else {
                "network"
            }
        );
        *self.slot.decision.lock() = Some(Decision::Continue(overrides));
        Ok(())
    }

    /// Perform the real network round trip without resolving the exchange
    ///
    /// The response is only handed back. A handler that fetches and then
    /// returns without acting leaves the exchange to be forwarded, which
    /// reaches the upstream a second time; use
    /// [`fetch_and_fulfill`](Self::fetch_and_fulfill) or
    /// [`fulfill`](Self::fulfill) to deliver what was fetched.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyResolved` after the route was released, or the
    /// network error from the upstream
    pub async fn fetch(&self, overrides: Overrides) -> Result<Response> {
        if self.slot.released.load(Ordering::Acquire) {
            return Err(InterposeError::AlreadyResolved {
                exchange: self.exchange.id(),
            });
        }

        let request = overrides.apply(self.request.clone());
        shaper::shape_upload(&self.conditions, request.body.len()).await;
        self.upstream.fetch(&request).await
    }

    /// Fetch the real response, pass it through `transform`, then fulfill
    ///
    /// `transform` receives the complete response; headers it leaves alone
    /// are delivered unchanged.
    ///
    /// # Errors
    ///
    /// Returns the network error from the fetch or `AlreadyResolved`
    pub async fn fetch_and_fulfill<F>(&self, transform: F) -> Result<()>
    where
        F: FnOnce(Response) -> Response + Send,
    {
        let response = self.fetch(Overrides::none()).await?;
        self.fulfill(transform(response))
    }

    fn claim(&self) -> Result<()> {
        if self.slot.released.load(Ordering::Acquire) || self.slot.acted.swap(true, Ordering::AcqRel)
        {
            return Err(InterposeError::AlreadyResolved {
                exchange: self.exchange.id(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("exchange", &self.exchange.id())
            .field("method", &self.request.method)
            .field("url", &self.request.url)
            .field("has_fallback", &self.has_fallback)
            .finish_non_exhaustive()
    }
}
