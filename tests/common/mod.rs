//! In-memory network stand-ins shared by the integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use interpose::network::Upstream;
use interpose::websocket::{CloseFrame, SocketMessage, Transport, WebSocketConnector};
use interpose::{AbortReason, Engine, EngineOptions, InterposeError, Request, Response, Result};

type Responder = Box<dyn Fn(&Request) -> Result<Response> + Send + Sync>;

/// Upstream answering from a closure and remembering what it was sent
pub struct StubUpstream {
    respond: Responder,
    requests: Mutex<Vec<Request>>,
    calls: AtomicUsize,
}

impl StubUpstream {
    pub fn new<F>(respond: F) -> Arc<Self>
    where
        F: Fn(&Request) -> Result<Response> + Send + Sync + 'static,
    {
        Arc::new(Self {
            respond: Box::new(respond),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    /// 200 with a fixed body and the requested URL echoed in `x-upstream-url`
    pub fn ok(body: &str) -> Arc<Self> {
        let body = body.to_string();
        Self::new(move |request| {
            Ok(Response::ok(body.clone()).with_header("x-upstream-url", request.url.clone()))
        })
    }

    pub fn failing(reason: AbortReason) -> Arc<Self> {
        Self::new(move |_| Err(InterposeError::aborted(reason)))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Upstream for StubUpstream {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        (self.respond)(request)
    }
}

/// WebSocket "servers" living in the test process
pub struct EchoConnector {
    refuse: bool,
    hang_up: Option<CloseFrame>,
    urls: Mutex<Vec<String>>,
    closes: Arc<Mutex<Vec<Option<CloseFrame>>>>,
}

impl EchoConnector {
    /// Every connection gets a server that echoes frames back
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            refuse: false,
            hang_up: None,
            urls: Mutex::new(Vec::new()),
            closes: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Every connection attempt fails
    pub fn refusing() -> Arc<Self> {
        Arc::new(Self {
            refuse: true,
            hang_up: None,
            urls: Mutex::new(Vec::new()),
            closes: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Every server closes with `frame` as soon as it is connected
    pub fn hanging_up(frame: CloseFrame) -> Arc<Self> {
        Arc::new(Self {
            refuse: false,
            hang_up: Some(frame),
            urls: Mutex::new(Vec::new()),
            closes: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().clone()
    }

    /// Close frames the servers received, in arrival order
    pub fn closes(&self) -> Vec<Option<CloseFrame>> {
        self.closes.lock().clone()
    }

    /// Wait until some server saw a close
    pub async fn wait_for_close(&self) -> Option<CloseFrame> {
        for _ in 0..200 {
            if let Some(frame) = self.closes.lock().first() {
                return frame.clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no server observed a close");
    }
}

#[async_trait]
impl WebSocketConnector for EchoConnector {
    async fn connect(&self, url: &str) -> Result<Transport> {
        self.urls.lock().push(url.to_string());
        if self.refuse {
            return Err(InterposeError::Aborted {
                reason: AbortReason::ConnectionRefused,
                detail: Some(url.to_string()),
            });
        }

        let (engine_end, mut server_end) = Transport::pair(64);
        let closes = Arc::clone(&self.closes);
        let hang_up = self.hang_up.clone();
        tokio::spawn(async move {
            if let Some(frame) = hang_up {
                let _ = server_end.outbound.send(SocketMessage::Close(Some(frame))).await;
                return;
            }
            while let Some(message) = server_end.inbound.recv().await {
                match message {
                    SocketMessage::Frame(frame) => {
                        if server_end.outbound.send(SocketMessage::Frame(frame)).await.is_err() {
                            break;
                        }
                    }
                    SocketMessage::Close(frame) => {
                        closes.lock().push(frame.clone());
                        let _ = server_end.outbound.send(SocketMessage::Close(frame)).await;
                        break;
                    }
                }
            }
        });
        Ok(engine_end)
    }
}

pub fn engine_with(upstream: Arc<StubUpstream>, connector: Arc<EchoConnector>) -> Engine {
    Engine::with_transports(EngineOptions::default(), upstream, connector)
}

pub fn engine(upstream: Arc<StubUpstream>) -> Engine {
    engine_with(upstream, EchoConnector::new())
}
