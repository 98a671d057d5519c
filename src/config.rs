//! Configuration types for the `interpose` server

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::engine::{Engine, EngineOptions};
use crate::exchange::{AbortReason, Response};
use crate::har::HarOptions;
use crate::network::{ServerOptions, MAX_BODY_SIZE, MAX_CONNECTIONS, UPSTREAM_TIMEOUT_MS};
use crate::pattern::{self, RoutePattern};
use crate::route::{RouteHandler, StaticResponder};
use crate::shaper::NetworkConditions;
use crate::websocket::{CHANNEL_CAPACITY, COMPANION_CLOSE_GRACE_MS};
use crate::{InterposeError, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Listen addresses
    #[serde(default)]
    pub server: ServerConfig,
    /// HAR archive routed at start-up
    #[serde(default)]
    pub har: Option<HarConfig>,
    /// Initial network conditions
    #[serde(default)]
    pub conditions: NetworkConditions,
    /// Static mock routes, registered in file order
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    /// Resource limits
    #[serde(default)]
    pub limits: LimitsConfig,
    /// WebSocket session settings
    #[serde(default)]
    pub websocket: WebSocketConfig,
}

/// Front door listeners
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// WebSocket listen address
    #[serde(default)]
    pub ws_listen: Option<SocketAddr>,
    /// Base URL accepted sockets are opened against
    #[serde(default)]
    pub ws_target: Option<String>,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            ws_listen: None,
            ws_target: None,
        }
    }
}

/// HAR archive section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarConfig {
    /// Archive file
    pub path: PathBuf,
    /// Mode, miss behavior, URL filter and looping
    #[serde(flatten)]
    pub options: HarOptions,
}

/// One static route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Glob (or `re:` regex) URL pattern
    pub pattern: String,
    /// Only match this method
    #[serde(default)]
    pub method: Option<String>,
    /// Treat `pattern` as a regular expression
    #[serde(default)]
    pub regex: bool,
    /// Response status
    #[serde(default = "default_status")]
    pub status: u16,
    /// Response headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Response body
    #[serde(default)]
    pub body: Option<String>,
    /// Abort with this reason instead of responding
    #[serde(default)]
    pub abort: Option<AbortReason>,
    /// Expire after this many exchanges
    #[serde(default)]
    pub times: Option<usize>,
}

fn default_status() -> u16 {
    200
}

impl RouteConfig {
    /// Compile the URL pattern and method filter
    ///
    /// # Errors
    ///
    /// Returns `InvalidPattern` if either does not compile
    pub fn pattern(&self) -> Result<RoutePattern> {
        let compiled = if self.regex {
            RoutePattern::regex(&self.pattern)?
        } else {
            pattern::compile(&self.pattern)?
        };
        match &self.method {
            Some(method) => compiled.with_method(method),
            None => Ok(compiled),
        }
    }

    /// Handler answering matched exchanges
    #[must_use]
    pub fn responder(&self) -> StaticResponder {
        if let Some(reason) = self.abort {
            return StaticResponder::Abort(reason);
        }

        let mut response = Response::new(self.status);
        for (name, value) in &self.headers {
            response = response.with_header(name.clone(), value.clone());
        }
        if let Some(body) = &self.body {
            response = response.with_body(body.clone());
        }
        StaticResponder::Fulfill(response)
    }
}

/// Resource limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum concurrent client connections
    pub max_connections: usize,
    /// Maximum request body size in bytes
    pub max_body_size: usize,
    /// Timeout for real HTTP round trips
    pub upstream_timeout_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: MAX_CONNECTIONS,
            max_body_size: MAX_BODY_SIZE,
            upstream_timeout_ms: UPSTREAM_TIMEOUT_MS,
        }
    }
}

/// WebSocket session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Time a handler gets to close the remaining side itself
    pub companion_close_grace_ms: u64,
    /// Per-direction frame buffer
    pub channel_capacity: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            companion_close_grace_ms: COMPANION_CLOSE_GRACE_MS,
            channel_capacity: CHANNEL_CAPACITY,
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read, parsed or validated
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| InterposeError::ConfigError(format!("Failed to read config file: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| InterposeError::ConfigError(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<()> {
        if self.server.ws_listen.is_some() && self.server.ws_target.is_none() {
            return Err(InterposeError::ConfigError(
                "server.ws_listen requires server.ws_target".to_string(),
            ));
        }

        if let Some(har) = &self.har {
            if let Some(filter) = &har.options.url_filter {
                pattern::compile(filter)?;
            }
        }

        self.conditions.validate()?;

        for (i, route) in self.routes.iter().enumerate() {
            route.pattern()?;

            if !(100..=599).contains(&route.status) {
                return Err(InterposeError::ConfigError(format!(
                    "Route {i}: status {} is out of range",
                    route.status
                )));
            }

            if route.abort.is_some() && (route.body.is_some() || !route.headers.is_empty()) {
                return Err(InterposeError::ConfigError(format!(
                    "Route {i}: abort cannot be combined with a response"
                )));
            }

            if route.times == Some(0) {
                return Err(InterposeError::ConfigError(format!(
                    "Route {i}: times must be > 0"
                )));
            }
        }

        if self.limits.max_connections == 0 {
            return Err(InterposeError::ConfigError(
                "limits.max_connections must be > 0".to_string(),
            ));
        }
        if self.limits.max_body_size == 0 {
            return Err(InterposeError::ConfigError(
                "limits.max_body_size must be > 0".to_string(),
            ));
        }
        if self.websocket.channel_capacity == 0 {
            return Err(InterposeError::ConfigError(
                "websocket.channel_capacity must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Runtime options for the engine
    #[must_use]
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            conditions: self.conditions.clone(),
            upstream_timeout: Duration::from_millis(self.limits.upstream_timeout_ms),
            companion_close_grace: Duration::from_millis(self.websocket.companion_close_grace_ms),
            channel_capacity: self.websocket.channel_capacity,
            ..EngineOptions::default()
        }
    }

    /// Settings for the front door
    #[must_use]
    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            listen: self.server.listen,
            ws_listen: self.server.ws_listen,
            ws_target: self.server.ws_target.clone(),
            max_connections: self.limits.max_connections,
            max_body_size: self.limits.max_body_size,
            channel_capacity: self.websocket.channel_capacity,
        }
    }

    /// Register the static routes on an engine
    ///
    /// Later entries take precedence over earlier ones, as with any
    /// registration order. Returns the number of routes registered.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPattern` if a route pattern does not compile
    pub async fn register_routes(&self, engine: &Engine) -> Result<usize> {
        for route in &self.routes {
            let handler: Arc<dyn RouteHandler> = Arc::new(route.responder());
            engine
                .route_handler(route.pattern()?, handler, route.times)
                .await;
        }
        Ok(self.routes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::har::{HarMode, NotFound};
    use std::io::Write;
    use tempfile::NamedTempFile;

    const FULL_CONFIG: &str = r#"
        [server]
        listen = "127.0.0.1:9000"
        ws_listen = "127.0.0.1:9001"
        ws_target = "ws://localhost:4000"

        [har]
        path = "/tmp/session.har"
        mode = "record"
        not_found = "fallback"
        url_filter = "**/api/**"

        [conditions]
        latency_ms = 40
        download_throughput = 1000

        [[routes]]
        pattern = "**/api/data"
        method = "get"
        headers = { "content-type" = "application/json" }
        body = "[]"

        [[routes]]
        pattern = "**/ads/**"
        abort = "blocked-by-client"
        times = 3

        [limits]
        max_connections = 16
        upstream_timeout_ms = 2500

        [websocket]
        companion_close_grace_ms = 250
    "#;

    #[test]
    fn test_config_parse() {
        let config: Config = toml::from_str(FULL_CONFIG).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.listen.port(), 9000);
        let har = config.har.as_ref().unwrap();
        assert_eq!(har.options.mode, HarMode::Record);
        assert_eq!(har.options.not_found, NotFound::Fallback);
        assert!(!har.options.loop_entries);
        assert_eq!(config.conditions.latency_ms, 40);
        assert_eq!(config.routes.len(), 2);
        assert_eq!(config.routes[0].status, 200);
        assert_eq!(config.routes[1].abort, Some(AbortReason::BlockedByClient));
        assert_eq!(config.limits.max_body_size, MAX_BODY_SIZE);
        assert_eq!(config.websocket.channel_capacity, CHANNEL_CAPACITY);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();

        assert!(config.har.is_none());
        assert!(config.routes.is_empty());
        assert_eq!(config.server.listen, default_listen());
        assert_eq!(config.limits.max_connections, MAX_CONNECTIONS);
    }

    #[test]
    fn test_config_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(FULL_CONFIG.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        let options = config.engine_options();
        assert_eq!(options.upstream_timeout, Duration::from_millis(2500));
        assert_eq!(options.companion_close_grace, Duration::from_millis(250));
        assert_eq!(options.conditions.download_throughput, Some(1000));

        let server = config.server_options();
        assert_eq!(server.max_connections, 16);
        assert_eq!(server.ws_target.as_deref(), Some("ws://localhost:4000"));
    }

    #[test]
    fn test_route_config_builds_responder() {
        let config: Config = toml::from_str(FULL_CONFIG).unwrap();

        let pattern = config.routes[0].pattern().unwrap();
        assert!(pattern.matches("http://localhost/api/data", "GET"));
        assert!(!pattern.matches("http://localhost/api/data", "POST"));

        match config.routes[0].responder() {
            StaticResponder::Fulfill(response) => {
                assert_eq!(response.status, 200);
                assert_eq!(response.body, b"[]");
                assert_eq!(response.header("content-type"), Some("application/json"));
            }
            StaticResponder::Abort(_) => panic!("expected a fulfilling responder"),
        }
        assert!(matches!(
            config.routes[1].responder(),
            StaticResponder::Abort(AbortReason::BlockedByClient)
        ));
    }

    #[test]
    fn test_invalid_configs() {
        let ws_without_target = r#"
            [server]
            ws_listen = "127.0.0.1:9001"
        "#;
        let config: Config = toml::from_str(ws_without_target).unwrap();
        assert!(config.validate().is_err());

        let bad_pattern = r#"
            [[routes]]
            pattern = "**/{a,b"
        "#;
        let config: Config = toml::from_str(bad_pattern).unwrap();
        assert!(matches!(
            config.validate(),
            Err(InterposeError::InvalidPattern { .. })
        ));

        let abort_with_body = r#"
            [[routes]]
            pattern = "**"
            abort = "failed"
            body = "nope"
        "#;
        let config: Config = toml::from_str(abort_with_body).unwrap();
        assert!(config.validate().is_err());

        let zero_times = r#"
            [[routes]]
            pattern = "**"
            times = 0
        "#;
        let config: Config = toml::from_str(zero_times).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_abort_reason_rejected() {
        let config = r#"
            [[routes]]
            pattern = "**"
            abort = "teapot"
        "#;
        assert!(toml::from_str::<Config>(config).is_err());
    }

    #[tokio::test]
    async fn test_register_routes() {
        let config: Config = toml::from_str(FULL_CONFIG).unwrap();
        let engine = Engine::default();

        assert_eq!(config.register_routes(&engine).await.unwrap(), 2);

        let response = engine
            .fetch(crate::exchange::Request::get("http://localhost/api/data"))
            .await
            .unwrap();
        assert_eq!(response.body, b"[]");

        let err = engine
            .fetch(crate::exchange::Request::get("http://localhost/ads/banner.js"))
            .await
            .unwrap_err();
        assert_eq!(err.abort_reason(), Some(AbortReason::BlockedByClient));
    }
}
