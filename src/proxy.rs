//! Request dispatch and the streaming forwarder.
//!
//! Every inbound request flows through [`dispatch`]: the favicon
//! short-circuit, then the authentication gate, then local health-check
//! interception, then the forward to the backend service. Responses classified as streaming are relayed
//! chunk-by-chunk without buffering; everything else is forwarded whole.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use http::{HeaderMap, Method, Request, StatusCode};

use crate::api::health::handle_health_check;
use crate::error::GatewayError;
use crate::state::AppState;

/// Paths answered locally by the health collaborator, never forwarded.
const HEALTH_PATHS: &[&str] = &["/ok", "/health", "/health-detailed"];

const EVENT_STREAM: &str = "text/event-stream";

/// Entry point for every inbound request.
pub async fn dispatch(state: Arc<AppState>, request: Request<Body>) -> Response {
    // Browser favicon noise is answered before the key check so it never
    // produces a 401 and never reaches the backend.
    if request.method() == Method::GET && request.uri().path() == "/favicon.ico" {
        return StatusCode::NO_CONTENT.into_response();
    }

    if let Err(err) = state.authenticate(request.method(), request.uri(), request.headers()) {
        return err.into_response();
    }

    let path = request.uri().path();

    if HEALTH_PATHS.contains(&path) {
        return handle_health_check(&state, path).await;
    }

    match forward(&state, request).await {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(error = %err, "request forwarding failed");
            err.into_response()
        }
    }
}

/// Classify a request as streaming before dispatch: by path suffix, by a
/// known streaming path segment, or by the `Accept` header requesting an
/// event stream. The classification decides the response-handling
/// strategy, so it must not depend on the upstream response.
fn is_streaming_request(path: &str, headers: &HeaderMap) -> bool {
    if path.ends_with("/stream") || path.contains("/runs/stream") {
        return true;
    }
    headers
        .get(http::header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains(EVENT_STREAM))
}

/// Copy request headers for forwarding, dropping `Host` so the backend's
/// virtual-host resolution sees its own address.
fn prepare_forward_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = headers.clone();
    forwarded.remove(http::header::HOST);
    forwarded
}

/// Hop-by-hop headers that must not be copied onto a rebuilt response.
fn is_hop_by_hop(name: &http::HeaderName) -> bool {
    name == http::header::CONNECTION
        || name == http::header::TRANSFER_ENCODING
        || name == http::header::UPGRADE
}

async fn forward(state: &Arc<AppState>, request: Request<Body>) -> Result<Response, GatewayError> {
    let (parts, body) = request.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path().to_string(), ToString::to_string);
    let url = state.backend.url_for(&path_and_query)?;
    let headers = prepare_forward_headers(&parts.headers);
    let streaming = is_streaming_request(parts.uri.path(), &parts.headers);

    // Forward a body only for methods that carry one.
    let body = if matches!(
        parts.method,
        Method::POST | Method::PUT | Method::PATCH
    ) {
        let bytes = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(|e| GatewayError::Internal(format!("Failed to read request body: {e}")))?;
        Some(bytes)
    } else {
        None
    };

    if streaming {
        tracing::info!(method = %parts.method, path = %parts.uri.path(), "relaying streaming request");
        forward_streaming(state, parts.method, url, headers, body).await
    } else {
        forward_buffered(state, parts.method, url, headers, body).await
    }
}

/// Non-streaming path: issue the request, wait for full completion, and
/// return status/headers/body verbatim.
async fn forward_buffered(
    state: &Arc<AppState>,
    method: Method,
    url: url::Url,
    headers: HeaderMap,
    body: Option<bytes::Bytes>,
) -> Result<Response, GatewayError> {
    let upstream = state.transport.send(method, url, headers, body).await?;

    let status = upstream.status();
    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        if !is_hop_by_hop(name) {
            response_headers.insert(name.clone(), value.clone());
        }
    }

    let bytes = upstream
        .bytes()
        .await
        .map_err(|e| GatewayError::Transport(format!("Failed to read backend response: {e}")))?;
    response_headers.remove(http::header::CONTENT_LENGTH);

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}

/// Streaming path: open the upstream connection, then relay each chunk
/// to the caller as it arrives.
///
/// The upstream connection is owned by the response body stream: when the
/// downstream consumer disconnects the body is dropped, which drops the
/// reqwest response and closes the backend connection. Total lifetime is
/// capped by `server.max_stream_lifetime_secs` so abandoned streams
/// cannot pin a connection forever.
async fn forward_streaming(
    state: &Arc<AppState>,
    method: Method,
    url: url::Url,
    headers: HeaderMap,
    body: Option<bytes::Bytes>,
) -> Result<Response, GatewayError> {
    let upstream = state.transport.open_stream(method, url, headers, body).await?;

    let status = upstream.status();
    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        if !is_hop_by_hop(name) {
            response_headers.insert(name.clone(), value.clone());
        }
    }
    // Length of the relay is unknown ahead of time.
    response_headers.remove(http::header::CONTENT_LENGTH);
    if !response_headers.contains_key(http::header::CONTENT_TYPE) {
        response_headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static(EVENT_STREAM),
        );
    }

    let lifetime_cap = Duration::from_secs(state.config.server.max_stream_lifetime_secs);
    // Mid-flight upstream failures end the relay instead of hanging the
    // downstream response; the status line is already committed by then.
    let relay = upstream
        .bytes_stream()
        .scan((), |_state, chunk| {
            futures_util::future::ready(match chunk {
                Ok(bytes) => Some(Ok::<bytes::Bytes, Infallible>(bytes)),
                Err(e) => {
                    tracing::warn!(error = %e, "upstream stream failed mid-relay, ending response");
                    None
                }
            })
        })
        .take_until(tokio::time::sleep(lifetime_cap));

    let mut response = Response::new(Body::from_stream(relay));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}
