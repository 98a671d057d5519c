//! Exchanges: one HTTP request paired with its eventual resolution

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use crate::{InterposeError, Result};

/// HTTP request as seen by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// HTTP method (e.g., "GET", "POST")
    pub method: String,
    /// Absolute request URL
    pub url: String,
    /// Request headers, in arrival order
    pub headers: Vec<(String, String)>,
    /// Request body
    pub body: Vec<u8>,
}

impl Request {
    /// Create a request with no headers and no body
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// `GET` request
    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    /// Add a header
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Replace the body
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// First header value with the given name (case-insensitive)
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// HTTP response, synthesized or received from the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// HTTP status code
    pub status: u16,
    /// Response headers
    pub headers: Vec<(String, String)>,
    /// Response body
    pub body: Vec<u8>,
}

impl Response {
    /// Create an empty response with the given status
    #[must_use]
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// `200 OK` with a body
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self::new(200).with_body(body)
    }

    /// JSON body with a matching content type
    pub fn json(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self::new(status)
            .with_header("content-type", "application/json")
            .with_body(body)
    }

    /// Add a header
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Replace the body
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// First header value with the given name (case-insensitive)
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Set a header, replacing every existing value with that name
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.remove_header(name);
        self.headers.push((name.to_string(), value.into()));
    }

    /// Remove every header with the given name
    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Kind of resource an exchange loads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    /// Top-level or frame document
    Document,
    /// CSS
    Stylesheet,
    /// Image
    Image,
    /// Audio/video
    Media,
    /// Web font
    Font,
    /// JavaScript
    Script,
    /// `fetch()` call
    Fetch,
    /// `XMLHttpRequest`
    Xhr,
    /// Anything else
    Other,
}

impl ResourceType {
    /// Infer a resource type from a `Sec-Fetch-Dest` header value
    #[must_use]
    pub fn from_fetch_dest(dest: &str) -> Self {
        match dest {
            "document" | "iframe" | "frame" => Self::Document,
            "style" => Self::Stylesheet,
            "image" => Self::Image,
            "audio" | "video" | "track" => Self::Media,
            "font" => Self::Font,
            "script" | "worker" | "sharedworker" | "serviceworker" => Self::Script,
            "empty" => Self::Fetch,
            _ => Self::Other,
        }
    }
}

/// Why an exchange was aborted
///
/// Surfaced to the caller as a typed network error, never as an HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AbortReason {
    /// Generic abort
    Aborted,
    /// Access denied
    AccessDenied,
    /// Address unreachable
    AddressUnreachable,
    /// Blocked by the client
    BlockedByClient,
    /// Blocked by the response (e.g. CORP)
    BlockedByResponse,
    /// Connection aborted
    ConnectionAborted,
    /// Connection closed
    ConnectionClosed,
    /// Connection failed
    ConnectionFailed,
    /// Connection refused
    ConnectionRefused,
    /// Connection reset
    ConnectionReset,
    /// Internet disconnected
    InternetDisconnected,
    /// DNS lookup failed
    NameNotResolved,
    /// Timed out
    TimedOut,
    /// Generic failure
    Failed,
    /// Owning browsing context went away while the exchange was pending
    ContextDestroyed,
    /// A route handler raised an error
    HandlerError,
    /// Strict HAR replay had no entry for the request
    NoMatchingHarEntry,
}

impl AbortReason {
    /// Wire name of the reason
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aborted => "aborted",
            Self::AccessDenied => "access-denied",
            Self::AddressUnreachable => "address-unreachable",
            Self::BlockedByClient => "blocked-by-client",
            Self::BlockedByResponse => "blocked-by-response",
            Self::ConnectionAborted => "connection-aborted",
            Self::ConnectionClosed => "connection-closed",
            Self::ConnectionFailed => "connection-failed",
            Self::ConnectionRefused => "connection-refused",
            Self::ConnectionReset => "connection-reset",
            Self::InternetDisconnected => "internet-disconnected",
            Self::NameNotResolved => "name-not-resolved",
            Self::TimedOut => "timed-out",
            Self::Failed => "failed",
            Self::ContextDestroyed => "context-destroyed",
            Self::HandlerError => "handler-error",
            Self::NoMatchingHarEntry => "no-matching-har-entry",
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AbortReason {
    type Err = InterposeError;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| InterposeError::ConfigError(format!("Unknown abort reason: {s}")))
    }
}

/// Exchange lifecycle
///
/// `Pending` is the only non-terminal state; exactly one terminal
/// transition is permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ExchangeState {
    /// Not yet resolved
    Pending = 0,
    /// Reached the network after a handler continued it
    Continued = 1,
    /// Answered with a synthetic response
    Fulfilled = 2,
    /// Failed with a network error
    Aborted = 3,
    /// Reached the network with no handler acting on it
    Forwarded = 4,
}

impl ExchangeState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Continued,
            2 => Self::Fulfilled,
            3 => Self::Aborted,
            4 => Self::Forwarded,
            _ => Self::Pending,
        }
    }

    /// Whether the state is terminal
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }
}

/// One in-flight HTTP exchange
#[derive(Debug)]
pub struct Exchange {
    id: u64,
    request: Request,
    resource_type: ResourceType,
    state: AtomicU8,
}

impl Exchange {
    /// Create a pending exchange
    #[must_use]
    pub fn new(id: u64, request: Request, resource_type: ResourceType) -> Self {
        Self {
            id,
            request,
            resource_type,
            state: AtomicU8::new(ExchangeState::Pending as u8),
        }
    }

    /// Exchange identifier, unique within an engine
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Request as originally issued by the client
    #[must_use]
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Resource type
    #[must_use]
    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ExchangeState {
        ExchangeState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Perform the single terminal transition
    ///
    /// # Errors
    ///
    /// Returns `AlreadyResolved` if the exchange is no longer pending
    ///
    /// # Panics
    ///
    /// Panics if `to` is `Pending` (programming error)
    pub fn resolve(&self, to: ExchangeState) -> Result<()> {
        assert!(to.is_terminal(), "cannot transition back to Pending");

        self.state
            .compare_exchange(
                ExchangeState::Pending as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|_| InterposeError::AlreadyResolved { exchange: self.id })
    }
}

/// Abort outcome details
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Abort {
    /// Typed reason
    pub reason: AbortReason,
    /// Optional diagnostic detail
    pub detail: Option<String>,
}

/// How an exchange was resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Synthetic response from a handler or the HAR archive
    Fulfilled(Response),
    /// Network response after a handler continued the exchange
    Continued(Response),
    /// Network response with no handler acting
    Forwarded(Response),
    /// Network-level failure
    Aborted(Abort),
}

impl Outcome {
    /// Abort with no detail
    #[must_use]
    pub fn aborted(reason: AbortReason) -> Self {
        Self::Aborted(Abort {
            reason,
            detail: None,
        })
    }

    /// Terminal state this outcome corresponds to
    #[must_use]
    pub fn state(&self) -> ExchangeState {
        match self {
            Self::Fulfilled(_) => ExchangeState::Fulfilled,
            Self::Continued(_) => ExchangeState::Continued,
            Self::Forwarded(_) => ExchangeState::Forwarded,
            Self::Aborted(_) => ExchangeState::Aborted,
        }
    }

    /// Response delivered to the caller, if any
    #[must_use]
    pub fn response(&self) -> Option<&Response> {
        match self {
            Self::Fulfilled(r) | Self::Continued(r) | Self::Forwarded(r) => Some(r),
            Self::Aborted(_) => None,
        }
    }
}

/// Final result of dispatching one exchange
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Exchange identifier
    pub exchange: u64,
    /// Request method
    pub method: String,
    /// Request URL
    pub url: String,
    /// Outcome
    pub outcome: Outcome,
}

impl Resolution {
    /// Convert into what the calling code observes: a response or a network error
    ///
    /// # Errors
    ///
    /// Returns the typed network error for an aborted exchange
    pub fn into_result(self) -> Result<Response> {
        match self.outcome {
            Outcome::Fulfilled(r) | Outcome::Continued(r) | Outcome::Forwarded(r) => Ok(r),
            Outcome::Aborted(abort) => Err(match abort.reason {
                AbortReason::HandlerError => InterposeError::Handler(
                    abort.detail.unwrap_or_else(|| "handler failed".to_string()),
                ),
                AbortReason::NoMatchingHarEntry => InterposeError::NoMatchingHarEntry {
                    method: self.method,
                    url: self.url,
                },
                reason => InterposeError::Aborted {
                    reason,
                    detail: abort.detail,
                },
            }),
        }
    }
}
