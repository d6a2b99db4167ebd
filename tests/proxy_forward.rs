use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agentgate::config::{AppConfig, BackendConfig, ClientAuthConfig};
use agentgate::proxy::dispatch;
use agentgate::state::AppState;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode, Uri};
use axum::response::{Json, Response};
use axum::routing::{any, get, post};
use axum::Router;
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{json, Value};

async fn spawn_backend(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock backend");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve mock backend");
    });
    format!("http://{addr}")
}

/// A 127.0.0.1 URL that nothing listens on.
async fn unreachable_backend() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind probe listener");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    format!("http://{addr}")
}

fn build_state(base_url: String, api_key: Option<&str>) -> Arc<AppState> {
    let config = AppConfig {
        backend: BackendConfig { base_url },
        client_authentication: ClientAuthConfig {
            api_key: api_key.map(ToString::to_string),
        },
        ..AppConfig::default()
    };
    Arc::new(AppState::new(config).expect("build state"))
}

async fn body_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("json body")
}

#[tokio::test]
async fn test_non_streaming_forward_roundtrip() {
    let backend = Router::new().route(
        "/v1/echo",
        post(|headers: HeaderMap, body: String| async move {
            Json(json!({
                "received": body,
                "api_key_header": headers
                    .get("x-api-key")
                    .and_then(|v| v.to_str().ok()),
            }))
        }),
    );
    let state = build_state(spawn_backend(backend).await, Some("client-key"));

    let request = Request::builder()
        .method("POST")
        .uri("/v1/echo")
        .header("x-api-key", "client-key")
        .header("content-type", "text/plain")
        .body(Body::from("ping"))
        .unwrap();

    let response = dispatch(state, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("application/json")
    );

    let body = body_json(response).await;
    assert_eq!(body["received"], "ping");
    // Client headers (including the key) are forwarded through.
    assert_eq!(body["api_key_header"], "client-key");
}

#[tokio::test]
async fn test_query_preserved_and_host_rewritten() {
    let backend = Router::new().route(
        "/threads/search",
        any(
            |uri: Uri, headers: HeaderMap| async move {
                Json(json!({
                    "uri": uri.to_string(),
                    "host": headers.get("host").and_then(|v| v.to_str().ok()),
                }))
            },
        ),
    );
    let base_url = spawn_backend(backend).await;
    let backend_authority = base_url.trim_start_matches("http://").to_string();
    let state = build_state(base_url, None);

    let request = Request::builder()
        .method("GET")
        .uri("/threads/search?limit=5&offset=10")
        .header("host", "proxy.example.com")
        .body(Body::empty())
        .unwrap();

    let response = dispatch(state, request).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["uri"], "/threads/search?limit=5&offset=10");
    // The original Host must not leak to the backend.
    assert_eq!(body["host"], backend_authority.as_str());
}

#[tokio::test]
async fn test_missing_key_rejected_with_401() {
    let state = build_state(unreachable_backend().await, Some("client-key"));

    let request = Request::builder()
        .method("POST")
        .uri("/threads/abc/runs/stream")
        .body(Body::empty())
        .unwrap();

    let response = dispatch(state, request).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["detail"], "Invalid or missing API key");
}

#[tokio::test]
async fn test_wrong_key_rejected_valid_key_admitted() {
    let backend = Router::new().route("/threads", post(|| async { Json(json!({"ok": true})) }));
    let state = build_state(spawn_backend(backend).await, Some("K"));

    let rejected = dispatch(
        Arc::clone(&state),
        Request::builder()
            .method("POST")
            .uri("/threads")
            .header("x-api-key", "wrong")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(rejected.status(), StatusCode::UNAUTHORIZED);

    let admitted = dispatch(
        state,
        Request::builder()
            .method("POST")
            .uri("/threads")
            .header("x-api-key", "K")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(admitted.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_query_param_key_admitted() {
    let backend = Router::new().route("/threads", post(|| async { Json(json!({"ok": true})) }));
    let state = build_state(spawn_backend(backend).await, Some("K"));

    let response = dispatch(
        state,
        Request::builder()
            .method("POST")
            .uri("/threads?api-key=K")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_options_admitted_without_key() {
    let backend = Router::new().fallback(|| async { StatusCode::OK });
    let state = build_state(spawn_backend(backend).await, Some("K"));

    let response = dispatch(
        state,
        Request::builder()
            .method("OPTIONS")
            .uri("/threads")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_backend_error_status_forwarded_verbatim() {
    let backend = Router::new().route(
        "/threads/missing",
        get(|| async { (StatusCode::NOT_FOUND, Json(json!({"detail": "no such thread"}))) }),
    );
    let state = build_state(spawn_backend(backend).await, None);

    let response = dispatch(
        state,
        Request::builder()
            .method("GET")
            .uri("/threads/missing")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["detail"], "no such thread");
}

#[tokio::test]
async fn test_unreachable_backend_yields_503() {
    let base_url = unreachable_backend().await;
    let state = build_state(base_url.clone(), None);

    let started = std::time::Instant::now();
    let response = dispatch(
        state,
        Request::builder()
            .method("POST")
            .uri("/threads")
            .body(Body::from("{}"))
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    // Bounded by the connect timeout, not hanging.
    assert!(started.elapsed() < Duration::from_secs(10));

    let body = body_json(response).await;
    assert_eq!(body["error"], "Backend service unavailable");
    assert!(body["detail"].as_str().unwrap().contains(&base_url));
}

#[tokio::test]
async fn test_ok_health_mirrors_backend() {
    let backend = Router::new().route("/ok", get(|| async { Json(json!({"ok": true})) }));
    let state = build_state(spawn_backend(backend).await, Some("K"));

    // No key needed for health paths.
    let response = dispatch(
        state,
        Request::builder()
            .method("GET")
            .uri("/ok")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["ok"], true);
}

#[tokio::test]
async fn test_health_unhealthy_when_backend_down() {
    let state = build_state(unreachable_backend().await, None);

    let response = dispatch(
        state,
        Request::builder()
            .method("GET")
            .uri("/health")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["status"], "unhealthy");
}

#[tokio::test]
async fn test_detailed_health_reports_degraded_backend() {
    let state = build_state(unreachable_backend().await, Some("K"));

    let response = dispatch(
        state,
        Request::builder()
            .method("GET")
            .uri("/health-detailed")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["service"], "agentgate");
    assert_eq!(body["auth_enabled"], true);
    assert!(body["backend_server"]
        .as_str()
        .unwrap()
        .starts_with("not responding"));
}

#[tokio::test]
async fn test_detailed_health_healthy_backend() {
    let backend = Router::new().route("/ok", get(|| async { "OK" }));
    let state = build_state(spawn_backend(backend).await, None);

    let response = dispatch(
        state,
        Request::builder()
            .method("GET")
            .uri("/health-detailed")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["backend_server"], "responding");
}

#[tokio::test]
async fn test_streaming_relay_is_incremental() {
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));

    let backend = Router::new().route(
        "/threads/t1/runs/stream",
        post(move || {
            let release_rx = Arc::clone(&release_rx);
            async move {
                let release_rx = release_rx.lock().await.take().expect("single call");
                let stream = futures_util::stream::unfold(
                    (0u8, Some(release_rx)),
                    |(step, mut release_rx)| async move {
                        match step {
                            0 => Some((
                                Ok::<_, Infallible>(Bytes::from_static(b"data: first\n\n")),
                                (1, release_rx),
                            )),
                            1 => {
                                // Hold the second chunk until the test saw
                                // the first one arrive.
                                let _ = release_rx.take().expect("receiver").await;
                                Some((
                                    Ok(Bytes::from_static(b"data: second\n\n")),
                                    (2, None),
                                ))
                            }
                            _ => None,
                        }
                    },
                );
                Response::builder()
                    .header("content-type", "text/event-stream")
                    .body(Body::from_stream(stream))
                    .unwrap()
            }
        }),
    );
    let state = build_state(spawn_backend(backend).await, None);

    let response = dispatch(
        state,
        Request::builder()
            .method("POST")
            .uri("/threads/t1/runs/stream")
            .body(Body::from("{}"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );
    assert!(response.headers().get("content-length").is_none());

    let mut body = response.into_body().into_data_stream();

    // The first chunk must arrive while the backend is still holding the
    // second: the relay does not wait for stream completion.
    let first = tokio::time::timeout(Duration::from_secs(5), body.next())
        .await
        .expect("first chunk within deadline")
        .expect("stream not ended")
        .expect("chunk ok");
    assert_eq!(first.as_ref(), b"data: first\n\n");

    release_tx.send(()).expect("release backend");

    let mut rest = Vec::new();
    while let Some(chunk) = tokio::time::timeout(Duration::from_secs(5), body.next())
        .await
        .expect("next chunk within deadline")
    {
        rest.extend_from_slice(&chunk.expect("chunk ok"));
    }
    assert_eq!(rest.as_slice(), b"data: second\n\n");
}

#[tokio::test]
async fn test_streaming_default_content_type() {
    let backend = Router::new().route(
        "/runs/stream",
        post(|| async {
            // Content-type deliberately omitted by the backend.
            Response::new(Body::from("data: x\n\n"))
        }),
    );
    let state = build_state(spawn_backend(backend).await, None);

    let response = dispatch(
        state,
        Request::builder()
            .method("POST")
            .uri("/runs/stream")
            .body(Body::from("{}"))
            .unwrap(),
    )
    .await;

    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(
        content_type.starts_with("text/event-stream"),
        "unexpected content-type: {content_type}"
    );
}

struct StreamGuard(Arc<AtomicUsize>);

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_upstream_closed_when_downstream_disconnects() {
    let active_streams = Arc::new(AtomicUsize::new(0));
    let handler_streams = Arc::clone(&active_streams);

    let backend = Router::new().route(
        "/threads/t1/runs/stream",
        post(move || {
            let active = Arc::clone(&handler_streams);
            async move {
                active.fetch_add(1, Ordering::SeqCst);
                let guard = StreamGuard(active);
                // Endless stream; only a downstream disconnect ends it.
                let stream = futures_util::stream::unfold(
                    (guard, 0u64),
                    |(guard, n)| async move {
                        tokio::time::sleep(Duration::from_millis(25)).await;
                        let chunk = Bytes::from(format!("data: {n}\n\n"));
                        Some((Ok::<_, Infallible>(chunk), (guard, n + 1)))
                    },
                );
                Response::builder()
                    .header("content-type", "text/event-stream")
                    .body(Body::from_stream(stream))
                    .unwrap()
            }
        }),
    );
    let state = build_state(spawn_backend(backend).await, None);

    let response = dispatch(
        state,
        Request::builder()
            .method("POST")
            .uri("/threads/t1/runs/stream")
            .body(Body::from("{}"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body().into_data_stream();
    let first = tokio::time::timeout(Duration::from_secs(5), body.next())
        .await
        .expect("first chunk within deadline");
    assert!(first.is_some());
    assert_eq!(active_streams.load(Ordering::SeqCst), 1);

    // Downstream walks away mid-stream.
    drop(body);

    // The upstream connection must be torn down within a bounded grace
    // period, releasing the backend's stream.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while active_streams.load(Ordering::SeqCst) != 0 {
        assert!(
            std::time::Instant::now() < deadline,
            "backend stream still active after downstream disconnect"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_favicon_answered_locally() {
    let state = build_state(unreachable_backend().await, Some("K"));

    let response = dispatch(
        state,
        Request::builder()
            .method("GET")
            .uri("/favicon.ico")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}
