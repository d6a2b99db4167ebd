use std::sync::Arc;

use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

use crate::state::AppState;

/// Handle the reserved health paths, answered locally and never forwarded
/// through the generic proxy path.
pub async fn handle_health_check(state: &Arc<AppState>, path: &str) -> Response {
    if path == "/health-detailed" {
        detailed_health_check(state).await
    } else {
        simple_health_check(state).await
    }
}

/// Simple check: mirror the backend's own `/ok` endpoint.
async fn simple_health_check(state: &Arc<AppState>) -> Response {
    let Ok(url) = state.backend.url_for("/ok") else {
        return unhealthy_response();
    };

    match state.transport.probe(url).await {
        Ok(response) => {
            let status = response.status();
            let content_type = response
                .headers()
                .get(http::header::CONTENT_TYPE)
                .cloned()
                .unwrap_or_else(|| http::HeaderValue::from_static("application/json"));
            let body = response.bytes().await.unwrap_or_default();

            let mut mirrored = Response::new(axum::body::Body::from(body));
            *mirrored.status_mut() = status;
            mirrored
                .headers_mut()
                .insert(http::header::CONTENT_TYPE, content_type);
            mirrored
        }
        Err(_) => unhealthy_response(),
    }
}

fn unhealthy_response() -> Response {
    (
        http::StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({"status": "unhealthy"})),
    )
        .into_response()
}

/// Detailed check: configuration summary plus backend reachability.
async fn detailed_health_check(state: &Arc<AppState>) -> Response {
    let backend_status = check_backend_server(state).await;
    let healthy = backend_status == "responding";

    let body = json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "service": "agentgate",
        "listen_port": state.config.server.port,
        "backend_url": state.backend.base_url(),
        "auth_enabled": state.auth_enabled(),
        "cors_enabled": !state.config.cors.allowed_origins.is_empty(),
        "backend_server": backend_status,
    });

    Json(body).into_response()
}

async fn check_backend_server(state: &Arc<AppState>) -> String {
    let Ok(url) = state.backend.url_for("/ok") else {
        return "not responding: invalid backend URL".to_string();
    };

    match state.transport.probe(url).await {
        Ok(response) if response.status().is_success() => "responding".to_string(),
        Ok(response) => format!("error {}", response.status().as_u16()),
        Err(e) => format!("not responding: {e}"),
    }
}
