use axum::response::IntoResponse;
use serde_json::json;

/// Canonical error type used across all modules.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Auth error: {0}")]
    Auth(String),
    #[error("Backend unavailable at {target}: {detail}")]
    UpstreamUnavailable { target: String, detail: String },
    #[error("Upstream error: {0}")]
    Upstream(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Broad error category for status code selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Authentication,
    ServiceUnavailable,
    ServerError,
}

impl GatewayError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            GatewayError::Auth(_) => ErrorCategory::Authentication,
            GatewayError::UpstreamUnavailable { .. } => ErrorCategory::ServiceUnavailable,
            GatewayError::Config(_)
            | GatewayError::Upstream(_)
            | GatewayError::Transport(_)
            | GatewayError::Internal(_) => ErrorCategory::ServerError,
        }
    }
}

fn http_status_for_category(cat: ErrorCategory) -> http::StatusCode {
    match cat {
        ErrorCategory::Authentication => http::StatusCode::UNAUTHORIZED,
        ErrorCategory::ServiceUnavailable => http::StatusCode::SERVICE_UNAVAILABLE,
        ErrorCategory::ServerError => http::StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Format an error as `(status_code, JSON body)`.
///
/// Auth failures use a fixed, non-revealing body: the submitted key is
/// never echoed back, and the message does not distinguish a missing key
/// from a wrong one.
#[must_use]
pub fn format_error(err: &GatewayError) -> (http::StatusCode, serde_json::Value) {
    let status = http_status_for_category(err.category());

    let body = match err {
        GatewayError::Auth(_) => json!({
            "detail": "Invalid or missing API key"
        }),
        GatewayError::UpstreamUnavailable { target, .. } => json!({
            "error": "Backend service unavailable",
            "detail": format!("Could not connect to backend service at {target}")
        }),
        other => json!({
            "error": "Proxy error",
            "detail": other.to_string()
        }),
    };

    (status, body)
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        let (status, body) = format_error(&self);
        (status, axum::Json(body)).into_response()
    }
}
