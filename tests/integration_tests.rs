//! Integration tests for mirage-mocker

use axum::body::Body;
use axum::extract::{ConnectInfo, Request as AxumRequest};
use axum::http::{HeaderValue, Request, Response, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use mirage_mocker::config::AppConfig;
use mirage_mocker::dispatcher::Dispatcher;
use mirage_mocker::hooks::{HookError, HookRegistry, HookRequest, ResponseSink};
use mirage_mocker::server::create_server_router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower::ServiceExt;

const CONFIG: &str = r#"
services:
  - parser:
      pattern: "^/ping$"
      methods: [GET]
      type: mock
      responses:
        - status: { GET: 200 }
          headers: { Content-Type: text/plain }
          body-type: fixed
          body: pong
  - parser:
      pattern: "/mock/fixed/value"
      methods: [GET]
      type: mock
      responses:
        - status: { GET: 200 }
          body: pong
  - parser:
      pattern: "/teste"
      methods: [POST]
      headers: { Content-Type: application/json }
      type: mock
      responses:
        - status: { POST: 201 }
          headers: { Content-Type: application/json }
          body-type: request
  - parser:
      pattern: "/version"
      methods: [GET]
      type: mock
      responses:
        - status: { GET: 200 }
          headers: { X-Configured: "yes" }
          body-type: runnable
          response-lib: runnable
          response-symbol: Version
  - parser:
      pattern: "/slow"
      methods: [GET]
      type: mock
      responses:
        - body: late
          delay: { min: 200ms, max: 300ms }
"#;

fn hooks() -> HookRegistry {
    let mut hooks = HookRegistry::new();
    hooks
        .register_runnable(
            "runnable",
            "Version",
            |sink: &mut ResponseSink, _: &HookRequest, status: StatusCode| -> Result<(), HookError> {
                sink.headers_mut()
                    .insert("content-type", HeaderValue::from_static("text/plain"));
                sink.write_status(status);
                sink.write(b"v1.0.0");
                Ok(())
            },
        )
        .register_runnable(
            "runnable",
            "Broken",
            |_: &mut ResponseSink, _: &HookRequest, _: StatusCode| -> Result<(), HookError> {
                Err(HookError::failed("plugin exploded"))
            },
        )
        .register_transform(
            "transform",
            "AddHeader",
            |req: &mut HookRequest| -> Result<(), HookError> {
                req.headers
                    .insert("version", HeaderValue::from_static("v1.0.1"));
                Ok(())
            },
        )
        .register_transform(
            "transform",
            "Broken",
            |req: &mut HookRequest| -> Result<(), HookError> {
                req.headers
                    .insert("version", HeaderValue::from_static("partial"));
                Err(HookError::failed("transform exploded"))
            },
        );
    hooks
}

fn app(yaml: &str) -> Router {
    let config = AppConfig::from_yaml(yaml).unwrap();
    let dispatcher = Dispatcher::from_config(&config, &hooks()).unwrap();
    create_server_router(Arc::new(dispatcher))
}

async fn body_string(response: Response<Body>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> Response<Body> {
    app.clone().oneshot(request).await.unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_mock_not_match() {
    let app = app(CONFIG);

    let response = send(&app, get("/nothing-here")).await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers()["content-type"], "text/plain");
    assert_eq!(
        body_string(response).await,
        "error processing request: no match found for request"
    );
}

#[tokio::test]
async fn test_mock_fixed_response() {
    let app = app(CONFIG);

    let response = send(&app, get("/ping")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/plain");
    assert_eq!(body_string(response).await, "pong");

    let response = send(&app, get("/mock/fixed/value/x")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "pong");
}

#[tokio::test]
async fn test_mock_echo_response() {
    let app = app(CONFIG);
    let body = r#"{"some":"response"}"#;

    let request = Request::builder()
        .method("POST")
        .uri("/teste")
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .unwrap();
    let response = send(&app, request).await;

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.headers()["content-type"], "application/json");
    assert_eq!(body_string(response).await, body);

    // header constraint is an exact match
    let request = Request::builder()
        .method("POST")
        .uri("/teste")
        .header("Content-Type", "text/plain")
        .body(Body::from(body))
        .unwrap();
    assert_eq!(send(&app, request).await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_mock_runnable_response() {
    let app = app(CONFIG);

    let response = send(&app, get("/version")).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/plain");
    assert_eq!(response.headers()["x-configured"], "yes");
    assert_eq!(body_string(response).await, "v1.0.0");
}

#[tokio::test]
async fn test_mock_runnable_failure() {
    let app = app(
        r#"
services:
  - parser:
      pattern: "/version"
      methods: [GET]
      type: mock
      responses:
        - body-type: runnable
          response-lib: runnable
          response-symbol: Broken
"#,
    );

    let response = send(&app, get("/version")).await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.headers()["content-type"], "text/plain");
    assert_eq!(
        body_string(response).await,
        "error running request: plugin exploded"
    );
}

#[tokio::test]
async fn test_mock_delay() {
    let app = app(CONFIG);

    let start = Instant::now();
    let response = send(&app, get("/slow")).await;

    assert!(start.elapsed() >= Duration::from_millis(200));
    assert_eq!(body_string(response).await, "late");
}

#[tokio::test]
async fn test_mock_override_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("response1.json"), r#"{"some":"response1"}"#).unwrap();

    let app = app(&format!(
        r#"
services:
  - parser:
      pattern: "/mock/magic"
      methods: [GET]
      type: mock
      responses:
        - status: {{ GET: 200 }}
          body: default
          magic-header-name: X-MOCK-FILE
          magic-header-folder: "{}"
"#,
        dir.path().display()
    ));

    let with_file = |name: &str| {
        Request::builder()
            .uri("/mock/magic")
            .header("X-MOCK-FILE", name)
            .body(Body::empty())
            .unwrap()
    };

    let response = send(&app, with_file("response1.json")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, r#"{"some":"response1"}"#);

    let response = send(&app, with_file("unknown.json")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers()["content-type"], "text/plain");
    assert_eq!(body_string(response).await, "file not found unknown.json");

    // cached: the file is not read again
    std::fs::remove_file(dir.path().join("response1.json")).unwrap();
    let response = send(&app, with_file("response1.json")).await;
    assert_eq!(body_string(response).await, r#"{"some":"response1"}"#);

    let response = send(&app, get("/mock/magic")).await;
    assert_eq!(body_string(response).await, "default");
}

#[tokio::test]
async fn test_identical_requests_identical_responses() {
    let app = app(CONFIG);

    let mut seen = Vec::new();
    for _ in 0..5 {
        let request = Request::builder()
            .method("POST")
            .uri("/teste")
            .header("Content-Type", "application/json")
            .body(Body::from(r#"{"a":1}"#))
            .unwrap();
        let response = send(&app, request).await;
        let status = response.status();
        seen.push((status, body_string(response).await));
    }
    assert!(seen.windows(2).all(|pair| pair[0] == pair[1]));
}

#[tokio::test]
async fn test_weighted_route_only_serves_configured_bodies() {
    let app = app(
        r#"
services:
  - parser:
      pattern: "/weighted"
      methods: [GET]
      type: mock
      responses:
        - { body: common, distribution: 90 }
        - { body: rare, distribution: 10 }
"#,
    );

    for _ in 0..50 {
        let body = body_string(send(&app, get("/weighted")).await).await;
        assert!(body == "common" || body == "rare", "unexpected body {body}");
    }
}

/// Upstream that echoes what it received in headers and body
async fn spawn_upstream() -> String {
    let upstream = Router::new().fallback(|req: AxumRequest| async move {
        let version = req
            .headers()
            .get("version")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("none")
            .to_string();
        let (forwarded_for, forwarded_host) = {
            let forwarded = |name: &str| {
                req.headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("none")
                    .to_string()
            };
            (forwarded("x-forwarded-for"), forwarded("x-forwarded-host"))
        };
        let path = req.uri().path().to_string();
        let query = req.uri().query().unwrap_or("").to_string();
        let body = axum::body::to_bytes(req.into_body(), usize::MAX)
            .await
            .unwrap();

        Response::builder()
            .status(StatusCode::ACCEPTED)
            .header("content-type", "application/json")
            .header("x-upstream-path", path)
            .header("x-upstream-query", query)
            .header("x-upstream-version", version)
            .header("x-upstream-forwarded-for", forwarded_for)
            .header("x-upstream-forwarded-host", forwarded_host)
            .body(Body::from(body))
            .unwrap()
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, upstream).await.unwrap();
    });
    format!("http://{addr}")
}

fn pass_config(upstream: &str, transform_symbol: &str) -> String {
    format!(
        r#"
services:
  - parser:
      pattern: "/test"
      methods: [GET, POST]
      type: pass
      log: true
      pass-base-uri: {upstream}
      rewrite:
        - source: "/test(/.*)"
          target: "$1"
        - source: "("
          target: "ignored"
      transform-lib: transform
      transform-symbol: {transform_symbol}
"#
    )
}

#[tokio::test]
async fn test_pass_response() {
    let upstream = spawn_upstream().await;
    let app = app(&pass_config(&upstream, "AddHeader"));

    let request = Request::builder()
        .method("POST")
        .uri("/test/pass?x=1")
        .body(Body::from(r#"{"teste":"teste1"}"#))
        .unwrap();
    let response = send(&app, request).await;

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(response.headers()["content-type"], "application/json");
    assert_eq!(response.headers()["x-upstream-path"], "/pass");
    assert_eq!(response.headers()["x-upstream-query"], "x=1");
    assert_eq!(response.headers()["x-upstream-version"], "v1.0.1");
    assert_eq!(body_string(response).await, r#"{"teste":"teste1"}"#);
}

#[tokio::test]
async fn test_pass_uses_only_upstream_origin() {
    let upstream = spawn_upstream().await;
    let app = app(&pass_config(&format!("{upstream}/api?key=1"), "AddHeader"));

    let mut request = get("/test/pass?x=1");
    request
        .headers_mut()
        .insert("host", HeaderValue::from_static("mocker.local"));
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 7], 5555))));
    let response = send(&app, request).await;

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(response.headers()["x-upstream-path"], "/pass");
    assert_eq!(response.headers()["x-upstream-query"], "x=1");
    assert_eq!(response.headers()["x-upstream-forwarded-for"], "10.0.0.7");
    assert_eq!(response.headers()["x-upstream-forwarded-host"], "mocker.local");
}

#[tokio::test]
async fn test_pass_failed_transform_forwards_unmodified() {
    let upstream = spawn_upstream().await;
    let app = app(&pass_config(&upstream, "Broken"));

    let response = send(&app, get("/test/pass")).await;

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(response.headers()["x-upstream-path"], "/pass");
    assert_eq!(response.headers()["x-upstream-version"], "none");
}

#[tokio::test]
async fn test_pass_upstream_unreachable() {
    // bind then drop to get a port nothing listens on
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let app = app(&pass_config(&format!("http://{addr}"), "AddHeader"));
    let response = send(&app, get("/test/pass")).await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(response.headers()["content-type"], "text/plain");
    assert!(body_string(response).await.starts_with("proxy error:"));
}

#[test]
fn test_config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mocker.yml");
    std::fs::write(&path, CONFIG).unwrap();

    let config = AppConfig::load_from_file(&path).unwrap();
    assert_eq!(config.services.len(), 5);
    assert_eq!(config.server.port, 8080);

    let dispatcher = Dispatcher::from_config(&config, &hooks()).unwrap();
    assert_eq!(dispatcher.routes().len(), 5);
}

#[test]
fn test_unresolvable_hook_is_fatal() {
    let config = AppConfig::from_yaml(
        r#"
services:
  - parser:
      pattern: "/version"
      methods: [GET]
      type: mock
      responses:
        - body-type: runnable
          response-lib: ./no/such/plugin
          response-symbol: Version
"#,
    )
    .unwrap();

    assert!(Dispatcher::from_config(&config, &HookRegistry::new()).is_err());
}
