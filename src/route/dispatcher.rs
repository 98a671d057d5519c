//! Handler chain evaluation for HTTP exchanges

use std::sync::Arc;

use tracing::{debug, warn};

use crate::events::{EngineEvent, EventSink};
use crate::exchange::{Abort, AbortReason, Exchange, ExchangeState, Outcome, Request};
use crate::network::Upstream;
use crate::shaper::{self, NetworkConditions};
use crate::InterposeError;

use super::context::{Decision, RouteSlot};
use super::handler::guarded;
use super::{Route, RouteHandler, RouteRegistry};

/// Walks matching registrations (newest first) and forwards to the network
/// when the chain runs out
pub struct Dispatcher {
    registry: Arc<RouteRegistry<dyn RouteHandler>>,
    upstream: Arc<dyn Upstream>,
    sink: EventSink,
}

impl Dispatcher {
    /// Create a dispatcher over a registry
    pub fn new(
        registry: Arc<RouteRegistry<dyn RouteHandler>>,
        upstream: Arc<dyn Upstream>,
        sink: EventSink,
    ) -> Self {
        Self {
            registry,
            upstream,
            sink,
        }
    }

    /// Registry consulted on every dispatch
    #[must_use]
    pub fn registry(&self) -> &Arc<RouteRegistry<dyn RouteHandler>> {
        &self.registry
    }

    /// Resolve one exchange
    ///
    /// A handler that fulfills or aborts ends the chain. A handler that
    /// continues passes the (possibly overridden) request to the next older
    /// match. A handler that does nothing, or running out of handlers,
    /// forwards to the network.
    pub async fn dispatch(
        &self,
        exchange: &Arc<Exchange>,
        conditions: &Arc<NetworkConditions>,
    ) -> Outcome {
        let original = exchange.request();
        let candidates = self
            .registry
            .candidates(&original.url, &original.method)
            .await;
        let total = candidates.len();

        let mut current = original.clone();
        let mut continued = false;

        for (index, registration) in candidates.into_iter().enumerate() {
            if !registration.claim() {
                continue;
            }

            debug!(
                "Exchange {} offered to route #{} ({})",
                exchange.id(),
                registration.sequence(),
                registration.pattern()
            );

            let slot = Arc::new(RouteSlot::default());
            let route = Route::new(
                Arc::clone(exchange),
                current.clone(),
                Arc::clone(&slot),
                Arc::clone(&self.upstream),
                Arc::clone(conditions),
                index + 1 < total,
            );

            let result = guarded(registration.handler().handle(route)).await;
            slot.release();

            if let Err(message) = result {
                warn!("Exchange {}: {}", exchange.id(), message);
                self.sink.emit(EngineEvent::HandlerFailed {
                    id: exchange.id(),
                    message: message.clone(),
                });

                if exchange.resolve(ExchangeState::Aborted).is_ok() {
                    return Outcome::Aborted(Abort {
                        reason: AbortReason::HandlerError,
                        detail: Some(message),
                    });
                }
                // Handler resolved the exchange before failing; keep that result
            }

            match slot.take() {
                Some(Decision::Fulfill(response)) => return Outcome::Fulfilled(response),
                Some(Decision::Abort(abort)) => return Outcome::Aborted(abort),
                Some(Decision::Continue(overrides)) => {
                    current = overrides.apply(current);
                    continued = true;
                }
                None => {
                    debug!(
                        "Exchange {}: route #{} did not act",
                        exchange.id(),
                        registration.sequence()
                    );
                    break;
                }
            }
        }

        self.forward(exchange, current, continued, conditions).await
    }

    async fn forward(
        &self,
        exchange: &Arc<Exchange>,
        request: Request,
        continued: bool,
        conditions: &NetworkConditions,
    ) -> Outcome {
        shaper::shape_upload(conditions, request.body.len()).await;

        let outcome = match self.upstream.fetch(&request).await {
            Ok(response) if continued => Outcome::Continued(response),
            Ok(response) => Outcome::Forwarded(response),
            Err(InterposeError::Aborted { reason, detail }) => {
                Outcome::Aborted(Abort { reason, detail })
            }
            Err(e) => Outcome::Aborted(Abort {
                reason: AbortReason::Failed,
                detail: Some(e.to_string()),
            }),
        };

        if exchange.resolve(outcome.state()).is_err() {
            warn!(
                "Exchange {} resolved elsewhere while forwarding",
                exchange.id()
            );
        }
        outcome
    }
}
