pub mod validation;

use serde::{Deserialize, Serialize};

use self::validation::validate_config;

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Overall timeout for non-streaming forwarded requests, in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Timeout for establishing an upstream connection, in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Upper bound on the total lifetime of one relayed stream, in
    /// seconds. Abandoned streams are cut off at this point even if the
    /// backend keeps sending.
    #[serde(default = "default_max_stream_lifetime")]
    pub max_stream_lifetime_secs: u64,
    #[serde(default = "default_http_pool_max_idle_per_host")]
    pub http_pool_max_idle_per_host: usize,
    #[serde(default = "default_http_pool_idle_timeout_secs")]
    pub http_pool_idle_timeout_secs: u64,
}

fn default_port() -> u16 {
    8000
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_timeout() -> u64 {
    300
}
fn default_connect_timeout() -> u64 {
    5
}
fn default_max_stream_lifetime() -> u64 {
    3600
}
fn default_http_pool_max_idle_per_host() -> usize {
    16
}
fn default_http_pool_idle_timeout_secs() -> u64 {
    15
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            timeout: default_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            max_stream_lifetime_secs: default_max_stream_lifetime(),
            http_pool_max_idle_per_host: default_http_pool_max_idle_per_host(),
            http_pool_idle_timeout_secs: default_http_pool_idle_timeout_secs(),
        }
    }
}

/// Backend service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the internal agent-orchestration server.
    #[serde(default = "default_backend_base_url")]
    pub base_url: String,
}

fn default_backend_base_url() -> String {
    "http://127.0.0.1:8123".to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_backend_base_url(),
        }
    }
}

/// Client-facing authentication configuration.
///
/// Authentication is opt-in: when `api_key` is absent or empty, every
/// request is admitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientAuthConfig {
    #[serde(default)]
    pub api_key: Option<String>,
}

impl ClientAuthConfig {
    /// Whether a non-empty key is configured, i.e. authentication is on.
    #[must_use]
    pub fn required(&self) -> bool {
        self.api_key
            .as_deref()
            .is_some_and(|key| !key.trim().is_empty())
    }
}

/// CORS configuration. An empty origin list disables CORS handling.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

/// Feature toggles and diagnostics settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub client_authentication: ClientAuthConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
}

/// Load and validate configuration from a YAML file.
///
/// # Errors
///
/// Returns `ConfigError` when the file cannot be read, is not valid YAML,
/// or fails validation.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let config: AppConfig = serde_yaml::from_str(&contents)?;
    validate_config(&config)?;
    Ok(config)
}
