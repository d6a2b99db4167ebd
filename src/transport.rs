use std::time::Duration;

use http::HeaderMap;

use crate::config::ServerConfig;
use crate::error::GatewayError;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

fn build_client(
    config: &ServerConfig,
    total_timeout: Option<Duration>,
) -> Result<reqwest::Client, GatewayError> {
    let pool_idle_timeout = if config.http_pool_idle_timeout_secs == 0 {
        None
    } else {
        Some(Duration::from_secs(config.http_pool_idle_timeout_secs))
    };

    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(config.http_pool_max_idle_per_host.max(1))
        .pool_idle_timeout(pool_idle_timeout)
        .tcp_nodelay(true)
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs));

    if let Some(timeout) = total_timeout {
        builder = builder.timeout(timeout);
    }

    builder
        .build()
        .map_err(|e| GatewayError::Transport(format!("Failed to build HTTP client: {e}")))
}

/// HTTP transport for the backend service.
///
/// Holds two pooled clients built once at startup and shared across all
/// requests: a bounded-timeout client for non-streaming forwards and
/// health probes, and a client without an overall timeout for long-lived
/// streaming relays (streams are bounded separately by the relay's
/// lifetime cap). Pool lifetime exceeds any single request; each request
/// checks out its own connection.
pub struct HttpTransport {
    request_client: reqwest::Client,
    stream_client: reqwest::Client,
}

impl HttpTransport {
    /// Create a new transport with connection pooling and timeouts from
    /// the given server config.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Transport` if a client cannot be built.
    pub fn new(config: &ServerConfig) -> Result<Self, GatewayError> {
        Ok(Self {
            request_client: build_client(config, Some(Duration::from_secs(config.timeout)))?,
            stream_client: build_client(config, None)?,
        })
    }

    /// Send a fully-buffered request and wait for the complete response.
    ///
    /// # Errors
    ///
    /// Connect failures map to `UpstreamUnavailable`; anything else to
    /// `Transport`.
    pub async fn send(
        &self,
        method: http::Method,
        url: url::Url,
        headers: HeaderMap,
        body: Option<bytes::Bytes>,
    ) -> Result<reqwest::Response, GatewayError> {
        let target = origin_of(&url);
        let mut request = self.request_client.request(method, url).headers(headers);
        if let Some(body) = body {
            request = request.body(body);
        }
        request.send().await.map_err(|e| classify_error(e, target))
    }

    /// Open a streaming request; the returned response's body is read
    /// incrementally by the caller.
    ///
    /// # Errors
    ///
    /// Connect failures map to `UpstreamUnavailable`; anything else to
    /// `Transport`.
    pub async fn open_stream(
        &self,
        method: http::Method,
        url: url::Url,
        headers: HeaderMap,
        body: Option<bytes::Bytes>,
    ) -> Result<reqwest::Response, GatewayError> {
        let target = origin_of(&url);
        let mut request = self.stream_client.request(method, url).headers(headers);
        if let Some(body) = body {
            request = request.body(body);
        }
        request.send().await.map_err(|e| classify_error(e, target))
    }

    /// Short-timeout GET used by health checks.
    ///
    /// # Errors
    ///
    /// Returns the classified transport error on failure.
    pub async fn probe(&self, url: url::Url) -> Result<reqwest::Response, GatewayError> {
        let target = origin_of(&url);
        self.request_client
            .get(url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|e| classify_error(e, target))
    }
}

/// Scheme + authority of a URL, used to identify the backend in errors
/// without echoing the full request path.
fn origin_of(url: &url::Url) -> String {
    let mut origin = format!("{}://{}", url.scheme(), url.host_str().unwrap_or("unknown"));
    if let Some(port) = url.port() {
        origin.push(':');
        origin.push_str(&port.to_string());
    }
    origin
}

fn classify_error(err: reqwest::Error, target: String) -> GatewayError {
    if err.is_connect() {
        GatewayError::UpstreamUnavailable {
            target,
            detail: err.to_string(),
        }
    } else if err.is_timeout() {
        GatewayError::Transport(format!("Request to {target} timed out: {err}"))
    } else {
        GatewayError::Transport(format!("Request to {target} failed: {err}"))
    }
}
