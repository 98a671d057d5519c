//! Route registration, dispatch and the per-exchange interception context

mod context;
mod dispatcher;
mod handler;
mod registry;

pub use context::{Overrides, Route};
pub use dispatcher::Dispatcher;
pub use handler::{RouteHandler, StaticResponder};

pub(crate) use handler::guarded;
pub use registry::{RegistrationHandle, RouteRegistration, RouteRegistry};

use crate::pattern::{self, RoutePattern};
use crate::Result;

/// Anything that can be compiled into a [`RoutePattern`]
pub trait IntoRoutePattern {
    /// Compile
    ///
    /// # Errors
    ///
    /// Returns `InvalidPattern` if the pattern is malformed
    fn into_route_pattern(self) -> Result<RoutePattern>;
}

impl IntoRoutePattern for RoutePattern {
    fn into_route_pattern(self) -> Result<RoutePattern> {
        Ok(self)
    }
}

impl IntoRoutePattern for &str {
    fn into_route_pattern(self) -> Result<RoutePattern> {
        pattern::compile(self)
    }
}

impl IntoRoutePattern for String {
    fn into_route_pattern(self) -> Result<RoutePattern> {
        pattern::compile(&self)
    }
}

impl IntoRoutePattern for &String {
    fn into_route_pattern(self) -> Result<RoutePattern> {
        pattern::compile(self)
    }
}
