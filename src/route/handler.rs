//! Route handler trait and built-in handlers

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures_util::FutureExt;

use crate::exchange::{AbortReason, Response};

use super::Route;

/// User-supplied logic resolving an exchange through its [`Route`]
///
/// Returning without acting on the route forwards the exchange to the real
/// network. Returning an error (or panicking) aborts the exchange with
/// `handler-error`.
#[async_trait]
pub trait RouteHandler: Send + Sync {
    /// Handle one exchange
    async fn handle(&self, route: Route) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> RouteHandler for F
where
    F: Fn(Route) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, route: Route) -> anyhow::Result<()> {
        (self)(route).await
    }
}

/// Handler answering every exchange the same way
#[derive(Debug, Clone)]
pub enum StaticResponder {
    /// Fulfill with a fixed response
    Fulfill(Response),
    /// Abort with a fixed reason
    Abort(AbortReason),
}

#[async_trait]
impl RouteHandler for StaticResponder {
    async fn handle(&self, route: Route) -> anyhow::Result<()> {
        match self {
            Self::Fulfill(response) => route.fulfill(response.clone())?,
            Self::Abort(reason) => route.abort(*reason)?,
        }
        Ok(())
    }
}

/// Run a handler future, turning an error or a panic into a message
pub(crate) async fn guarded<F>(future: F) -> std::result::Result<(), String>
where
    F: Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{e:#}")),
        Err(panic) => Err(format!("handler panicked: {}", panic_message(&*panic))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}
