//! Upstream HTTP client: the "real network" behind the engine

use std::error::Error as StdError;
use std::time::Duration;

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, warn};

use crate::exchange::{AbortReason, Request, Response};
use crate::{InterposeError, Result};

/// Default upstream timeout
pub const UPSTREAM_TIMEOUT_MS: u64 = 30_000;

/// Performs real network round trips
///
/// Failures must be reported as `InterposeError::Aborted` with the typed
/// reason the caller should see.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Send a request and read the complete response
    async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// Upstream backed by a pooled hyper client (plain HTTP)
pub struct HttpUpstream {
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
}

impl HttpUpstream {
    /// Create a new upstream client
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .build_http();

        Self { client, timeout }
    }

    async fn send(&self, request: &Request) -> Result<Response> {
        let uri = request.url.parse::<Uri>().map_err(|e| InterposeError::Aborted {
            reason: AbortReason::Failed,
            detail: Some(format!("Invalid URI '{}': {e}", request.url)),
        })?;

        if uri.scheme_str() != Some("http") {
            return Err(InterposeError::Aborted {
                reason: AbortReason::ConnectionFailed,
                detail: Some(format!("unsupported scheme in '{uri}'")),
            });
        }

        let method = request.method.parse::<Method>().map_err(|e| InterposeError::Aborted {
            reason: AbortReason::Failed,
            detail: Some(format!("Invalid HTTP method '{}': {e}", request.method)),
        })?;

        let mut builder = hyper::Request::builder().method(method).uri(uri);
        for (name, value) in &request.headers {
            // hop-by-hop and length are recomputed by hyper
            if is_hop_header(name) {
                continue;
            }
            builder = builder.header(name, value);
        }

        let http_request = builder
            .body(Full::new(Bytes::copy_from_slice(&request.body)))
            .map_err(|e| InterposeError::Aborted {
                reason: AbortReason::Failed,
                detail: Some(format!("Failed to build request: {e}")),
            })?;

        let response = self.client.request(http_request).await.map_err(|e| {
            warn!("Upstream request failed: {e}");
            InterposeError::Aborted {
                reason: classify_client_error(&e),
                detail: Some(error_chain(&e)),
            }
        })?;

        let status = response.status().as_u16();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| InterposeError::Aborted {
                reason: AbortReason::ConnectionReset,
                detail: Some(format!("Failed to read response body: {e}")),
            })?
            .to_bytes();

        Ok(Response {
            status,
            headers,
            body: body.to_vec(),
        })
    }
}

impl Default for HttpUpstream {
    fn default() -> Self {
        Self::new(Duration::from_millis(UPSTREAM_TIMEOUT_MS))
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        debug!("Forwarding {} {}", request.method, request.url);

        match tokio::time::timeout(self.timeout, self.send(request)).await {
            Ok(result) => result,
            Err(_) => Err(InterposeError::Aborted {
                reason: AbortReason::TimedOut,
                detail: Some(format!("no response within {:?}", self.timeout)),
            }),
        }
    }
}

fn is_hop_header(name: &str) -> bool {
    const HOP: [&str; 6] = [
        "connection",
        "keep-alive",
        "proxy-connection",
        "transfer-encoding",
        "upgrade",
        "content-length",
    ];
    HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

fn error_chain(error: &(dyn StdError + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Map a client error onto the network error vocabulary
fn classify_client_error(error: &hyper_util::client::legacy::Error) -> AbortReason {
    let chain = error_chain(error).to_ascii_lowercase();

    if chain.contains("dns error") || chain.contains("failed to lookup address") {
        AbortReason::NameNotResolved
    } else if chain.contains("connection refused") {
        AbortReason::ConnectionRefused
    } else if chain.contains("connection reset") {
        AbortReason::ConnectionReset
    } else if chain.contains("timed out") {
        AbortReason::TimedOut
    } else if error.is_connect() {
        AbortReason::ConnectionFailed
    } else {
        AbortReason::Failed
    }
}
