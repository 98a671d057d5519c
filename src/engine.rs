//! The per-context engine: registration API, exchange dispatch and sessions

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::events::{EngineEvent, EventSink, OutcomeSummary, EVENT_CAPACITY};
use crate::exchange::{
    Abort, AbortReason, Exchange, ExchangeState, Outcome, Request, Resolution, ResourceType,
    Response,
};
use crate::har::{HarArchive, HarHandle, HarOptions, HarRouter};
use crate::network::{HttpUpstream, Upstream};
use crate::pattern::{self, RoutePattern};
use crate::route::{
    guarded, Dispatcher, IntoRoutePattern, RegistrationHandle, RouteHandler, RouteRegistry,
};
use crate::shaper::{self, ConditionShaper, NetworkConditions};
use crate::websocket::{
    passthrough, relay, supervise, CloseFrame, Role, Session, Side, Transport,
    TungsteniteConnector, WebSocketConnection, WebSocketConnector, WebSocketHandler,
    WebSocketRoute, CHANNEL_CAPACITY, CLOSE_GOING_AWAY, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL,
    COMPANION_CLOSE_GRACE_MS,
};
use crate::{InterposeError, Result};

/// Runtime settings for an [`Engine`]
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Initial network conditions
    pub conditions: NetworkConditions,
    /// Timeout for real HTTP round trips
    pub upstream_timeout: Duration,
    /// Time a handler gets to close the remaining side of a session itself
    pub companion_close_grace: Duration,
    /// Per-direction WebSocket frame buffer
    pub channel_capacity: usize,
    /// Per-subscriber event buffer
    pub event_capacity: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            conditions: NetworkConditions::default(),
            upstream_timeout: Duration::from_millis(crate::network::UPSTREAM_TIMEOUT_MS),
            companion_close_grace: Duration::from_millis(COMPANION_CLOSE_GRACE_MS),
            channel_capacity: CHANNEL_CAPACITY,
            event_capacity: EVENT_CAPACITY,
        }
    }
}

/// Network interception engine for one browsing context
///
/// Owns the route registries, condition shaper, event sink and live
/// WebSocket sessions. Nothing here is process-global; two engines never
/// see each other's routes.
pub struct Engine {
    options: EngineOptions,
    routes: Arc<RouteRegistry<dyn RouteHandler>>,
    socket_routes: RouteRegistry<dyn WebSocketHandler>,
    dispatcher: Dispatcher,
    shaper: ConditionShaper,
    sink: EventSink,
    connector: Arc<dyn WebSocketConnector>,
    sessions: Arc<DashMap<u64, Arc<Session>>>,
    next_exchange: AtomicU64,
    next_session: AtomicU64,
    destroyed: watch::Sender<bool>,
}

impl Engine {
    /// Create an engine that reaches the real network
    #[must_use]
    pub fn new(options: EngineOptions) -> Self {
        let upstream = Arc::new(HttpUpstream::new(options.upstream_timeout));
        let connector = Arc::new(TungsteniteConnector::new(options.channel_capacity));
        Self::with_transports(options, upstream, connector)
    }

    /// Create an engine with custom network transports
    #[must_use]
    pub fn with_transports(
        options: EngineOptions,
        upstream: Arc<dyn Upstream>,
        connector: Arc<dyn WebSocketConnector>,
    ) -> Self {
        let sink = EventSink::new(options.event_capacity);
        let routes: Arc<RouteRegistry<dyn RouteHandler>> = Arc::new(RouteRegistry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&routes), upstream, sink.clone());
        let (destroyed, _) = watch::channel(false);

        Self {
            shaper: ConditionShaper::new(options.conditions.clone()),
            options,
            routes,
            socket_routes: RouteRegistry::new(),
            dispatcher,
            sink,
            connector,
            sessions: Arc::new(DashMap::new()),
            next_exchange: AtomicU64::new(1),
            next_session: AtomicU64::new(1),
            destroyed,
        }
    }

    /// Options the engine was created with
    #[must_use]
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Register an HTTP route
    ///
    /// # Errors
    ///
    /// Returns `InvalidPattern` if the pattern does not compile
    pub async fn route<P, H>(&self, pattern: P, handler: H) -> Result<RegistrationHandle>
    where
        P: IntoRoutePattern,
        H: RouteHandler + 'static,
    {
        Ok(self
            .route_handler(pattern.into_route_pattern()?, Arc::new(handler), None)
            .await)
    }

    /// Register an HTTP route that expires after `times` exchanges
    ///
    /// # Errors
    ///
    /// Returns `InvalidPattern` if the pattern does not compile
    pub async fn route_times<P, H>(
        &self,
        pattern: P,
        handler: H,
        times: usize,
    ) -> Result<RegistrationHandle>
    where
        P: IntoRoutePattern,
        H: RouteHandler + 'static,
    {
        Ok(self
            .route_handler(pattern.into_route_pattern()?, Arc::new(handler), Some(times))
            .await)
    }

    /// Register a shared handler under a compiled pattern
    ///
    /// `times` limits how many exchanges the handler is offered.
    pub async fn route_handler(
        &self,
        pattern: RoutePattern,
        handler: Arc<dyn RouteHandler>,
        times: Option<usize>,
    ) -> RegistrationHandle {
        self.routes.register(pattern, handler, times).await
    }

    /// Remove an HTTP route; returns whether it was still active
    pub async fn unroute(&self, handle: RegistrationHandle) -> bool {
        self.routes.unregister(handle).await
    }

    /// Remove every HTTP route
    pub async fn unroute_all(&self) {
        self.routes.clear().await;
        info!("All routes removed");
    }

    /// Register a WebSocket route
    ///
    /// # Errors
    ///
    /// Returns `InvalidPattern` if the pattern does not compile
    pub async fn route_websocket<P, H>(&self, pattern: P, handler: H) -> Result<RegistrationHandle>
    where
        P: IntoRoutePattern,
        H: WebSocketHandler + 'static,
    {
        let pattern = pattern.into_route_pattern()?;
        let handler: Arc<dyn WebSocketHandler> = Arc::new(handler);
        Ok(self.socket_routes.register(pattern, handler, None).await)
    }

    /// Remove a WebSocket route; returns whether it was still active
    pub async fn unroute_websocket(&self, handle: RegistrationHandle) -> bool {
        self.socket_routes.unregister(handle).await
    }

    /// Apply network conditions to exchanges and sessions opened from now on
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the conditions are invalid
    pub fn set_conditions(&self, conditions: NetworkConditions) -> Result<()> {
        self.shaper.set_conditions(conditions)
    }

    /// Remove all shaping
    pub fn reset_conditions(&self) {
        self.shaper.reset();
    }

    /// Conditions new exchanges would see
    #[must_use]
    pub fn conditions(&self) -> Arc<NetworkConditions> {
        self.shaper.snapshot()
    }

    /// Open a HAR archive and route matching exchanges through it
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read (replay) or the URL filter
    /// does not compile
    pub async fn load_har_archive(&self, path: &Path, options: HarOptions) -> Result<HarHandle> {
        let pattern = match &options.url_filter {
            Some(filter) => pattern::compile(filter)?,
            None => RoutePattern::any(),
        };
        let archive = Arc::new(HarArchive::open(path, options)?);
        let router: Arc<dyn RouteHandler> = Arc::new(HarRouter::new(Arc::clone(&archive)));
        let registration = self.routes.register(pattern, router, None).await;

        info!(
            "HAR archive {} routed ({:?} mode)",
            path.display(),
            archive.mode()
        );
        Ok(HarHandle::new(
            archive,
            path.to_path_buf(),
            registration,
            Arc::clone(&self.routes),
        ))
    }

    /// Subscribe to lifecycle events
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.sink.subscribe()
    }

    /// Whether the context was destroyed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.destroyed.borrow()
    }

    /// Issue a request; aborts surface as network errors
    ///
    /// # Errors
    ///
    /// Returns `Aborted`, `Handler` or `NoMatchingHarEntry` when the exchange
    /// did not produce a response
    pub async fn fetch(&self, request: Request) -> Result<Response> {
        self.dispatch(request, ResourceType::Fetch)
            .await
            .into_result()
    }

    /// Run one exchange through shaping and the handler chain
    pub async fn dispatch(&self, request: Request, resource_type: ResourceType) -> Resolution {
        let id = self.next_exchange.fetch_add(1, Ordering::Relaxed);
        let method = request.method.clone();
        let url = request.url.clone();
        let exchange = Arc::new(Exchange::new(id, request, resource_type));

        self.sink.emit(EngineEvent::ExchangeStarted {
            exchange: id,
            method: method.clone(),
            url: url.clone(),
            resource_type,
        });

        let conditions = self.shaper.snapshot();
        let outcome = if self.is_closed() {
            abort_exchange(&exchange, AbortReason::ContextDestroyed, None)
        } else if conditions.offline {
            abort_exchange(
                &exchange,
                AbortReason::ConnectionFailed,
                Some("offline".to_string()),
            )
        } else {
            self.run(&exchange, &conditions).await
        };

        debug!("Exchange {} {} {} -> {:?}", id, method, url, outcome.state());
        self.sink.emit(EngineEvent::ExchangeResolved {
            exchange: id,
            outcome: OutcomeSummary::from(&outcome),
        });

        Resolution {
            exchange: id,
            method,
            url,
            outcome,
        }
    }

    async fn run(&self, exchange: &Arc<Exchange>, conditions: &Arc<NetworkConditions>) -> Outcome {
        let mut destroyed = self.destroyed.subscribe();
        let cancelled = async move {
            let _ = destroyed.wait_for(|destroyed| *destroyed).await;
        };

        let work = async {
            let outcome = self.dispatcher.dispatch(exchange, conditions).await;
            if let Some(response) = outcome.response() {
                shaper::shape_download(conditions, response.body.len()).await;
            }
            outcome
        };

        tokio::select! {
            outcome = work => outcome,
            () = cancelled => {
                warn!("Exchange {} cancelled: context destroyed", exchange.id());
                abort_exchange(exchange, AbortReason::ContextDestroyed, None)
            }
        }
    }

    /// Open a WebSocket from an in-process client
    ///
    /// # Errors
    ///
    /// Returns an `Aborted` network error when offline, after the context
    /// was destroyed, or when an unrouted socket cannot reach its server
    pub async fn connect_websocket(&self, url: &str) -> Result<WebSocketConnection> {
        let (client_end, engine_end) = Transport::pair(self.options.channel_capacity);
        let session = self.open_session(url, engine_end).await?;
        Ok(WebSocketConnection::new(
            session.id(),
            url.to_string(),
            client_end,
            session.client().subscribe(),
        ))
    }

    /// Open a WebSocket for a client already connected through `transport`
    ///
    /// Returns the session identifier.
    ///
    /// # Errors
    ///
    /// Same as [`connect_websocket`](Self::connect_websocket)
    pub async fn attach_websocket(&self, url: &str, transport: Transport) -> Result<u64> {
        self.open_session(url, transport).await.map(|s| s.id())
    }

    async fn open_session(&self, url: &str, transport: Transport) -> Result<Arc<Session>> {
        if self.is_closed() {
            return Err(InterposeError::aborted(AbortReason::ContextDestroyed));
        }

        let conditions = self.shaper.snapshot();
        if conditions.offline {
            return Err(InterposeError::Aborted {
                reason: AbortReason::ConnectionFailed,
                detail: Some("offline".to_string()),
            });
        }
        let latency = conditions.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let Transport { outbound, inbound } = transport;
        let client = Arc::new(Side::new(
            id,
            Role::Client,
            outbound,
            self.sink.clone(),
            Arc::clone(&conditions),
        ));
        let session = Arc::new(Session::new(
            id,
            url.to_string(),
            Arc::clone(&client),
            self.options.companion_close_grace,
        ));

        let (handler_tx, handler_rx) = mpsc::channel(self.options.channel_capacity);
        let route = WebSocketRoute::new(
            Arc::clone(&session),
            handler_rx,
            Arc::clone(&self.connector),
            self.sink.clone(),
            self.options.channel_capacity,
        );

        // Only the most recent matching route handles a session
        let handler = self
            .socket_routes
            .candidates(url, "GET")
            .await
            .into_iter()
            .find(|registration| registration.claim())
            .map(|registration| Arc::clone(registration.handler()));

        let plan = match handler {
            Some(handler) => SessionPlan::Handler(handler),
            None => SessionPlan::Passthrough(self.connector.connect(url).await?),
        };

        client.open();
        self.sink.emit(EngineEvent::SocketOpened {
            session: id,
            url: url.to_string(),
        });
        info!("WebSocket session {} opened: {}", id, url);

        self.sessions.insert(id, Arc::clone(&session));
        tokio::spawn(relay(Arc::clone(&client), inbound, handler_tx));
        tokio::spawn(supervise(Arc::clone(&session), Arc::clone(&self.sessions)));

        match plan {
            SessionPlan::Handler(handler) => {
                tokio::spawn(run_socket_handler(
                    handler,
                    route,
                    Arc::clone(&session),
                    self.sink.clone(),
                ));
            }
            SessionPlan::Passthrough(transport) => {
                let server = route.attach_server(transport)?;
                tokio::spawn(passthrough(route, server));
            }
        }

        Ok(session)
    }

    /// Number of live WebSocket sessions
    #[must_use]
    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Destroy the context
    ///
    /// Pending exchanges abort with `context-destroyed`, every session is
    /// closed with 1001 and later dispatches are refused the same way.
    pub async fn close(&self) {
        self.destroyed.send_replace(true);

        let sessions: Vec<Arc<Session>> =
            self.sessions.iter().map(|e| Arc::clone(e.value())).collect();
        for session in sessions {
            session.close_all(CloseFrame::new(CLOSE_GOING_AWAY, "context destroyed"));
        }
        self.sessions.clear();
        info!("Engine closed");
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineOptions::default())
    }
}

/// Who drives a newly opened session
enum SessionPlan {
    /// The most recent matching WebSocket route
    Handler(Arc<dyn WebSocketHandler>),
    /// No route matched: forward to the real server unchanged
    Passthrough(Transport),
}

/// Resolve a still-pending exchange to `Aborted`
///
/// An exchange resolved by its handler just before the abort stays in that
/// state; its response is withheld from the caller all the same.
fn abort_exchange(exchange: &Exchange, reason: AbortReason, detail: Option<String>) -> Outcome {
    if exchange.resolve(ExchangeState::Aborted).is_err() {
        debug!(
            "Exchange {} already {:?}; withholding response",
            exchange.id(),
            exchange.state()
        );
    }
    Outcome::Aborted(Abort { reason, detail })
}

async fn run_socket_handler(
    handler: Arc<dyn WebSocketHandler>,
    route: WebSocketRoute,
    session: Arc<Session>,
    sink: EventSink,
) {
    let id = session.id();
    match guarded(handler.handle(route)).await {
        Ok(()) => {
            session
                .client()
                .close(Some(CloseFrame::new(CLOSE_NORMAL, "handler finished")));
        }
        Err(message) => {
            warn!("WebSocket session {}: {}", id, message);
            sink.emit(EngineEvent::HandlerFailed { id, message });
            session
                .client()
                .close(Some(CloseFrame::new(CLOSE_INTERNAL_ERROR, "handler error")));
        }
    }
}
