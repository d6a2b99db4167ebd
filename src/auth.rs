use std::borrow::Cow;

use http::header::HeaderName;
use http::{HeaderMap, Method, Uri};
use subtle::ConstantTimeEq;

use crate::config::AppConfig;
use crate::error::GatewayError;

const X_API_KEY: HeaderName = HeaderName::from_static("x-api-key");
const API_KEY_QUERY_PARAM: &str = "api-key";

/// Paths that are always admitted regardless of key configuration:
/// health checks, docs, and well-known orchestration probe paths.
const INTERNAL_PATHS: &[&str] = &[
    "/",
    "/ok",
    "/health",
    "/metrics",
    "/docs",
    "/openapi.json",
    "/health-detailed",
    "/__health__",
    "/ready",
    "/startup",
    "/shutdown",
];

const INTERNAL_PREFIXES: &[&str] = &["/_internal/", "/api/v1/health"];

/// Pre-indexed client key used in hot-path authentication.
///
/// Authentication is opt-in: a gateway with no configured key admits
/// every request.
pub enum ClientKey {
    Disabled,
    Required(Box<str>),
}

/// Build the client key index from config.
#[must_use]
pub fn build_client_key(config: &AppConfig) -> ClientKey {
    match config.client_authentication.api_key.as_deref() {
        Some(key) if !key.trim().is_empty() => ClientKey::Required(key.trim().into()),
        _ => ClientKey::Disabled,
    }
}

/// Check if the path should skip authentication.
#[must_use]
pub fn is_internal_path(path: &str) -> bool {
    INTERNAL_PATHS.contains(&path)
        || INTERNAL_PREFIXES
            .iter()
            .any(|prefix| path.starts_with(prefix))
}

/// Extract the candidate API key from the `x-api-key` header, falling back
/// to the `api-key` query parameter. The query value is form-decoded, so
/// keys containing reserved characters survive the URL round trip.
fn extract_api_key<'a>(headers: &'a HeaderMap, uri: &'a Uri) -> Option<Cow<'a, str>> {
    if let Some(value) = headers.get(X_API_KEY) {
        return value.to_str().ok().map(Cow::Borrowed);
    }

    let query = uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(name, _)| name == API_KEY_QUERY_PARAM)
        .map(|(_, value)| value)
}

/// Authenticate an inbound request against the configured key.
///
/// Decision rules, in order:
/// - no key configured: admit;
/// - `OPTIONS` (CORS preflight): admit;
/// - internal allow-listed path: admit;
/// - otherwise the candidate key must be present and equal the configured
///   key (constant-time comparison).
///
/// This is a pure decision function: the request is never mutated and the
/// decision is never cached across requests.
///
/// # Errors
///
/// Returns `GatewayError::Auth` when the API key is missing or invalid.
/// The error message is internal only; the client-visible body is fixed.
pub fn authenticate(
    client_key: &ClientKey,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
) -> Result<(), GatewayError> {
    let configured = match client_key {
        ClientKey::Disabled => return Ok(()),
        ClientKey::Required(key) => key,
    };

    if method == Method::OPTIONS {
        return Ok(());
    }

    if is_internal_path(uri.path()) {
        tracing::debug!(path = uri.path(), "internal path, skipping authentication");
        return Ok(());
    }

    let Some(candidate) = extract_api_key(headers, uri) else {
        tracing::warn!(method = %method, path = uri.path(), "authentication failed: no API key");
        return Err(GatewayError::Auth("Missing API key".to_string()));
    };

    if candidate.as_bytes().ct_eq(configured.as_bytes()).into() {
        Ok(())
    } else {
        tracing::warn!(method = %method, path = uri.path(), "authentication failed: key mismatch");
        Err(GatewayError::Auth("Invalid API key".to_string()))
    }
}
