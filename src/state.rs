use crate::auth::{build_client_key, ClientKey};
use crate::config::AppConfig;
use crate::error::GatewayError;
use crate::transport::HttpTransport;

/// Pre-parsed backend target. Per-request upstream URLs are built by
/// substituting this base for the inbound scheme/host and preserving
/// path + query exactly.
pub struct BackendTarget {
    /// Validated base URL with any trailing slash removed, for plain
    /// string joins.
    base_str: String,
}

impl BackendTarget {
    /// # Errors
    ///
    /// Returns `GatewayError::Config` if the base URL does not parse.
    pub fn new(base_url: &str) -> Result<Self, GatewayError> {
        let trimmed = base_url.trim_end_matches('/');
        url::Url::parse(trimmed)
            .map_err(|e| GatewayError::Config(format!("Invalid backend base URL: {e}")))?;
        Ok(Self {
            base_str: trimmed.to_string(),
        })
    }

    /// Build the upstream URL for a forwarded request, preserving the
    /// original path and query.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Internal` if the joined URL is not parseable,
    /// which would indicate a malformed inbound path.
    pub fn url_for(&self, path_and_query: &str) -> Result<url::Url, GatewayError> {
        url::Url::parse(&format!("{}{path_and_query}", self.base_str))
            .map_err(|e| GatewayError::Internal(format!("Invalid upstream URL: {e}")))
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_str
    }
}

/// Shared application state accessible to all handlers.
///
/// Everything here is immutable after startup; per-request and per-stream
/// mutable state lives on the stack of the handling task, never in shared
/// structures.
pub struct AppState {
    pub config: AppConfig,
    pub transport: HttpTransport,
    pub backend: BackendTarget,
    client_key: ClientKey,
}

impl AppState {
    /// # Errors
    ///
    /// Returns `GatewayError` if the backend URL is invalid or the HTTP
    /// clients cannot be built.
    pub fn new(config: AppConfig) -> Result<Self, GatewayError> {
        let transport = HttpTransport::new(&config.server)?;
        let backend = BackendTarget::new(&config.backend.base_url)?;
        let client_key = build_client_key(&config);
        Ok(Self {
            config,
            transport,
            backend,
            client_key,
        })
    }

    /// Authenticate an inbound request using the prebuilt key index.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Auth` when the API key is missing or invalid.
    pub fn authenticate(
        &self,
        method: &http::Method,
        uri: &http::Uri,
        headers: &http::HeaderMap,
    ) -> Result<(), GatewayError> {
        crate::auth::authenticate(&self.client_key, method, uri, headers)
    }

    /// Whether client authentication is enabled.
    #[must_use]
    pub fn auth_enabled(&self) -> bool {
        matches!(self.client_key, ClientKey::Required(_))
    }
}
