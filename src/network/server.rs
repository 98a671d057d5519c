//! Front door: accepts client HTTP and WebSocket traffic and hands it to the engine

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as WsRequest, Response as WsResponse,
};
use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use crate::exchange::{Outcome, Request, ResourceType, Response};
use crate::websocket::{spawn_pump, CHANNEL_CAPACITY};
use crate::{InterposeError, Result};

use super::connection_pool::{ConnectionKind, ConnectionPool};
use super::{MAX_BODY_SIZE, MAX_CONNECTIONS, SHUTDOWN_TIMEOUT_MS};

/// Front door settings
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// HTTP listen address
    pub listen: SocketAddr,
    /// WebSocket listen address
    pub ws_listen: Option<SocketAddr>,
    /// Base URL accepted sockets are opened against (`ws://host:port`)
    pub ws_target: Option<String>,
    /// Concurrent connection limit across both listeners
    pub max_connections: usize,
    /// Largest request body accepted
    pub max_body_size: usize,
    /// Per-direction frame buffer for accepted sockets
    pub channel_capacity: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            ws_listen: None,
            ws_target: None,
            max_connections: MAX_CONNECTIONS,
            max_body_size: MAX_BODY_SIZE,
            channel_capacity: CHANNEL_CAPACITY,
        }
    }
}

/// HTTP/1.1 listener plus optional WebSocket listener in front of an engine
pub struct FrontDoor {
    engine: Arc<Engine>,
    options: ServerOptions,
    connection_pool: ConnectionPool,
    shutdown_tx: broadcast::Sender<()>,
}

impl FrontDoor {
    /// Create a front door
    #[must_use]
    pub fn new(engine: Arc<Engine>, options: ServerOptions) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            connection_pool: ConnectionPool::new(options.max_connections),
            engine,
            options,
            shutdown_tx,
        }
    }

    /// Sender that stops [`run`](Self::run) when signalled
    #[must_use]
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Bind the configured addresses and serve until Ctrl-C or shutdown
    ///
    /// # Errors
    ///
    /// Returns error if a listener cannot be bound or a listener task fails
    pub async fn run(self) -> Result<()> {
        let http = TcpListener::bind(self.options.listen).await?;
        let ws = match self.options.ws_listen {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };
        self.serve(http, ws).await
    }

    /// Serve on already bound listeners until Ctrl-C or shutdown
    ///
    /// # Errors
    ///
    /// Returns error if a listener task fails
    pub async fn serve(self, http: TcpListener, ws: Option<TcpListener>) -> Result<()> {
        let this = Arc::new(self);
        let mut shutdown_rx = this.shutdown_tx.subscribe();
        let mut tasks = JoinSet::new();

        info!("HTTP front door listening on {}", http.local_addr()?);
        tasks.spawn(Arc::clone(&this).accept_http(http));

        if let Some(ws) = ws {
            let Some(target) = this.options.ws_target.clone() else {
                return Err(InterposeError::ConfigError(
                    "ws_listen requires ws_target".to_string(),
                ));
            };
            info!(
                "WebSocket front door listening on {} (target {})",
                ws.local_addr()?,
                target
            );
            tasks.spawn(Arc::clone(&this).accept_websocket(ws, target));
        }

        let shutdown_signal = async {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT, shutting down");
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                }
            }
        };

        let outcome = tokio::select! {
            () = shutdown_signal => Ok(()),
            Some(result) = tasks.join_next() => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(e) => {
                    error!("Listener task failed: {}", e);
                    Err(InterposeError::Other(format!("Listener task failed: {e}")))
                }
            },
        };

        // Graceful shutdown
        this.shutdown_tx.send(()).ok();
        this.connection_pool.shutdown();

        let shutdown_timeout = Duration::from_millis(SHUTDOWN_TIMEOUT_MS);
        tokio::time::timeout(shutdown_timeout, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    warn!("Task cleanup error: {}", e);
                }
            }
        })
        .await
        .ok();

        info!(
            "Front door stopped ({} HTTP, {} WebSocket connections still open)",
            this.connection_pool.active(ConnectionKind::Http),
            this.connection_pool.active(ConnectionKind::WebSocket)
        );
        outcome
    }

    async fn accept_http(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        let Some(guard) = self.connection_pool.try_acquire(ConnectionKind::Http) else {
                            warn!("Connection limit reached, rejecting {}", peer);
                            continue;
                        };
                        let engine = Arc::clone(&self.engine);
                        let max_body = self.options.max_body_size;
                        tokio::spawn(async move {
                            let _guard = guard;
                            serve_connection(engine, stream, peer, max_body).await;
                        });
                    }
                    Err(e) => error!("Accept error: {}", e),
                },
                _ = shutdown_rx.recv() => break,
            }
        }

        Ok(())
    }

    async fn accept_websocket(self: Arc<Self>, listener: TcpListener, target: String) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        let Some(guard) = self.connection_pool.try_acquire(ConnectionKind::WebSocket) else {
                            warn!("Connection limit reached, rejecting socket from {}", peer);
                            continue;
                        };
                        let engine = Arc::clone(&self.engine);
                        let target = target.clone();
                        let capacity = self.options.channel_capacity;
                        tokio::spawn(async move {
                            let _guard = guard;
                            if let Err(e) = accept_socket(engine, stream, &target, capacity).await {
                                debug!("Socket from {} rejected: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => error!("Accept error: {}", e),
                },
                _ = shutdown_rx.recv() => break,
            }
        }

        Ok(())
    }
}

async fn serve_connection(engine: Arc<Engine>, stream: TcpStream, peer: SocketAddr, max_body: usize) {
    let io = TokioIo::new(stream);
    let service = service_fn(move |request| {
        let engine = Arc::clone(&engine);
        async move { handle_request(&engine, request, max_body).await }
    });

    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
        // Aborted exchanges surface here as a dropped connection
        debug!("Connection from {} closed: {}", peer, e);
    }
}

/// Dispatch one client request; an abort becomes a dropped connection
async fn handle_request(
    engine: &Engine,
    request: hyper::Request<Incoming>,
    max_body: usize,
) -> Result<hyper::Response<Full<Bytes>>> {
    let url = request_url(&request)?;
    let resource_type = request
        .headers()
        .get("sec-fetch-dest")
        .and_then(|v| v.to_str().ok())
        .map_or(ResourceType::Other, ResourceType::from_fetch_dest);
    let method = request.method().as_str().to_string();
    let headers: Vec<(String, String)> = request
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();

    let body = Limited::new(request.into_body(), max_body)
        .collect()
        .await
        .map_err(|e| InterposeError::Other(format!("Failed to read request body: {e}")))?
        .to_bytes();

    let resolution = engine
        .dispatch(
            Request {
                method,
                url,
                headers,
                body: body.to_vec(),
            },
            resource_type,
        )
        .await;

    match resolution.outcome {
        Outcome::Fulfilled(response) | Outcome::Continued(response) | Outcome::Forwarded(response) => {
            to_hyper_response(response)
        }
        Outcome::Aborted(abort) => Err(InterposeError::Aborted {
            reason: abort.reason,
            detail: abort.detail,
        }),
    }
}

/// Absolute URL for a proxy-style or origin-form request
fn request_url<B>(request: &hyper::Request<B>) -> Result<String> {
    let uri = request.uri();
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Ok(uri.to_string());
    }

    let host = request
        .headers()
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| InterposeError::Other("Request has no Host header".to_string()))?;
    let path = uri.path_and_query().map_or("/", |pq| pq.as_str());
    Ok(format!("http://{host}{path}"))
}

fn to_hyper_response(response: Response) -> Result<hyper::Response<Full<Bytes>>> {
    let mut builder = hyper::Response::builder().status(response.status);
    for (name, value) in &response.headers {
        if name.eq_ignore_ascii_case("transfer-encoding")
            || name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("connection")
        {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
        .body(Full::new(Bytes::from(response.body)))
        .map_err(|e| InterposeError::Other(format!("Failed to build response: {e}")))
}

async fn accept_socket(
    engine: Arc<Engine>,
    stream: TcpStream,
    target: &str,
    capacity: usize,
) -> Result<()> {
    let mut path = String::from("/");
    let callback = |request: &WsRequest,
                    response: WsResponse|
     -> std::result::Result<WsResponse, ErrorResponse> {
        if let Some(pq) = request.uri().path_and_query() {
            path = pq.as_str().to_string();
        }
        Ok(response)
    };

    let socket = accept_hdr_async(stream, callback)
        .await
        .map_err(|e| InterposeError::WebSocket(format!("Handshake failed: {e}")))?;

    let url = format!("{}{}", target.trim_end_matches('/'), path);
    let (transport, pump) = spawn_pump(socket, capacity);
    let session = engine.attach_websocket(&url, transport).await?;
    debug!("Accepted socket for {} as session {}", url, session);

    // The connection slot stays taken until the client socket is gone
    if let Err(e) = pump.await {
        warn!("Socket pump for session {} failed: {}", session, e);
    }
    Ok(())
}
