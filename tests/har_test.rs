//! Integration tests for HAR record and replay

mod common;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tempfile::TempDir;

use common::{engine, StubUpstream};
use interpose::har::format::{HarDocument, HarLog};
use interpose::har::{self, HarMode, HarOptions, NotFound};
use interpose::{AbortReason, InterposeError, Outcome, Request, ResourceType, Response};

fn write_empty_archive(path: &Path) {
    let document = HarDocument {
        log: HarLog::default(),
    };
    std::fs::write(path, serde_json::to_vec(&document).unwrap()).unwrap();
}

fn record_options() -> HarOptions {
    HarOptions {
        mode: HarMode::Record,
        ..HarOptions::default()
    }
}

/// Upstream whose body counts the calls it has served
fn counting_upstream() -> Arc<StubUpstream> {
    let counter = AtomicUsize::new(0);
    StubUpstream::new(move |request| {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Response::ok(format!("{} #{n}", request.url)).with_header("x-call", n.to_string()))
    })
}

#[tokio::test]
async fn test_record_then_replay_is_byte_identical() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("session.har");
    let binary: Vec<u8> = vec![0x89, b'P', b'N', b'G', 0x00, 0xff, 0xfe];

    let requests = vec![
        Request::get("http://example.com/api/users?b=2&a=1"),
        Request::new("POST", "http://example.com/api/users")
            .with_header("content-type", "application/json")
            .with_body(r#"{"name":"ada"}"#),
        Request::get("http://example.com/logo.png"),
    ];

    // Record
    let recorded = {
        let binary = binary.clone();
        let upstream = StubUpstream::new(move |request| {
            if request.url.ends_with(".png") {
                Ok(Response::ok(binary.clone()).with_header("content-type", "image/png"))
            } else {
                Ok(Response::json(201, format!(r#"{{"echo":"{}"}}"#, request.url)))
            }
        });
        let engine = engine(Arc::clone(&upstream));
        let handle = engine.load_har_archive(&path, record_options()).await.unwrap();

        let mut responses = Vec::new();
        for request in &requests {
            let resolution = engine.dispatch(request.clone(), ResourceType::Fetch).await;
            assert!(matches!(resolution.outcome, Outcome::Fulfilled(_)));
            responses.push(resolution.into_result().unwrap());
        }
        assert_eq!(upstream.calls(), 3);
        assert_eq!(handle.stats().entries, 3);
        handle.save().unwrap();
        responses
    };

    // Replay against a network that would fail
    let upstream = StubUpstream::failing(AbortReason::InternetDisconnected);
    let engine = engine(Arc::clone(&upstream));
    let handle = engine
        .load_har_archive(&path, HarOptions::default())
        .await
        .unwrap();

    let reordered = Request::get("http://example.com/api/users?a=1&b=2");
    let first = engine.fetch(reordered).await.unwrap();
    assert_eq!(first.status, recorded[0].status);
    assert_eq!(first.body, recorded[0].body);

    let second = engine.fetch(requests[1].clone()).await.unwrap();
    assert_eq!(second.status, 201);
    assert_eq!(second.body, recorded[1].body);

    let image = engine.fetch(requests[2].clone()).await.unwrap();
    assert_eq!(image.body, binary);
    assert_eq!(image.header("content-type"), Some("image/png"));

    assert_eq!(upstream.calls(), 0);
    let stats = handle.stats();
    assert_eq!(stats.hits, 3);
    assert_eq!(stats.misses, 0);
}

#[tokio::test]
async fn test_strict_miss_on_empty_archive() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("empty.har");
    write_empty_archive(&path);

    let upstream = StubUpstream::ok("real");
    let engine = engine(Arc::clone(&upstream));
    let handle = engine
        .load_har_archive(&path, HarOptions::default())
        .await
        .unwrap();

    let err = engine
        .fetch(Request::get("http://example.com/missing"))
        .await
        .unwrap_err();
    match err {
        InterposeError::NoMatchingHarEntry { method, url } => {
            assert_eq!(method, "GET");
            assert_eq!(url, "http://example.com/missing");
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(upstream.calls(), 0);
    assert_eq!(handle.stats().misses, 1);
}

#[tokio::test]
async fn test_fallback_miss_reaches_network() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("empty.har");
    write_empty_archive(&path);

    let upstream = StubUpstream::ok("real");
    let engine = engine(Arc::clone(&upstream));
    engine
        .load_har_archive(
            &path,
            HarOptions {
                not_found: NotFound::Fallback,
                ..HarOptions::default()
            },
        )
        .await
        .unwrap();

    let response = engine
        .fetch(Request::get("http://example.com/missing"))
        .await
        .unwrap();
    assert_eq!(response.body, b"real");
    assert_eq!(upstream.calls(), 1);
}

#[tokio::test]
async fn test_repeated_requests_replay_in_order() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("poll.har");
    let url = "http://example.com/api/poll";

    {
        let engine = engine(counting_upstream());
        let handle = engine.load_har_archive(&path, record_options()).await.unwrap();
        engine.fetch(Request::get(url)).await.unwrap();
        engine.fetch(Request::get(url)).await.unwrap();
        handle.save().unwrap();
    }

    // Strict: the queue runs dry after two hits
    let engine_strict = engine(StubUpstream::ok("real"));
    engine_strict
        .load_har_archive(&path, HarOptions::default())
        .await
        .unwrap();
    assert_eq!(
        engine_strict.fetch(Request::get(url)).await.unwrap().header("x-call"),
        Some("1")
    );
    assert_eq!(
        engine_strict.fetch(Request::get(url)).await.unwrap().header("x-call"),
        Some("2")
    );
    assert!(matches!(
        engine_strict.fetch(Request::get(url)).await,
        Err(InterposeError::NoMatchingHarEntry { .. })
    ));

    // Looping starts over
    let engine_loop = engine(StubUpstream::ok("real"));
    engine_loop
        .load_har_archive(
            &path,
            HarOptions {
                loop_entries: true,
                ..HarOptions::default()
            },
        )
        .await
        .unwrap();
    let calls: Vec<String> = {
        let mut calls = Vec::new();
        for _ in 0..3 {
            let response = engine_loop.fetch(Request::get(url)).await.unwrap();
            calls.push(response.header("x-call").unwrap_or_default().to_string());
        }
        calls
    };
    assert_eq!(calls, vec!["1", "2", "1"]);
}

#[tokio::test]
async fn test_url_filter_limits_archive_scope() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("empty.har");
    write_empty_archive(&path);

    let upstream = StubUpstream::ok("real");
    let engine = engine(Arc::clone(&upstream));
    engine
        .load_har_archive(
            &path,
            HarOptions {
                url_filter: Some("**/api/**".to_string()),
                ..HarOptions::default()
            },
        )
        .await
        .unwrap();

    let response = engine
        .fetch(Request::get("http://example.com/static/app.js"))
        .await
        .unwrap();
    assert_eq!(response.body, b"real");

    assert!(matches!(
        engine.fetch(Request::get("http://example.com/api/items")).await,
        Err(InterposeError::NoMatchingHarEntry { .. })
    ));
    assert_eq!(upstream.calls(), 1);
}

#[tokio::test]
async fn test_newer_route_overrides_archive_and_unroute() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("empty.har");
    write_empty_archive(&path);

    let upstream = StubUpstream::ok("real");
    let engine = engine(Arc::clone(&upstream));
    let handle = engine
        .load_har_archive(&path, HarOptions::default())
        .await
        .unwrap();

    engine
        .route("**/health", |route: interpose::Route| async move {
            route.fulfill(Response::ok("up"))?;
            anyhow::Ok(())
        })
        .await
        .unwrap();

    assert_eq!(
        engine.fetch(Request::get("http://example.com/health")).await.unwrap().body,
        b"up"
    );

    assert!(handle.unroute().await);
    assert_eq!(
        engine.fetch(Request::get("http://example.com/other")).await.unwrap().body,
        b"real"
    );
}

#[tokio::test]
async fn test_record_passes_network_errors_through() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("errors.har");

    let engine = engine(StubUpstream::failing(AbortReason::NameNotResolved));
    let handle = engine.load_har_archive(&path, record_options()).await.unwrap();

    let err = engine
        .fetch(Request::get("http://nowhere.invalid/"))
        .await
        .unwrap_err();
    assert_eq!(err.abort_reason(), Some(AbortReason::NameNotResolved));
    assert_eq!(handle.stats().entries, 0);

    handle.save().unwrap();
    let document = har::read_document(&path).unwrap();
    assert!(document.log.entries.is_empty());
}

#[tokio::test]
async fn test_summarize_recorded_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("summary.har");

    let engine = engine(counting_upstream());
    let handle = engine.load_har_archive(&path, record_options()).await.unwrap();
    engine.fetch(Request::get("http://example.com/a")).await.unwrap();
    engine.fetch(Request::get("http://example.com/a")).await.unwrap();
    engine
        .fetch(Request::new("post", "http://example.com/b").with_body("x"))
        .await
        .unwrap();
    handle.save().unwrap();

    let document = har::read_document(&path).unwrap();
    let (methods, keys) = har::summarize(&document);
    assert_eq!(methods.get("GET"), Some(&2));
    assert_eq!(methods.get("POST"), Some(&1));
    assert_eq!(keys.len(), 2);
}
