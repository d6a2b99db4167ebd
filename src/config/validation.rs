use super::{AppConfig, ConfigError};

/// Validate the full application config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_server_config(config)?;
    validate_backend_config(config)?;
    validate_cors_origins(config)?;
    validate_log_level(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_server_config(config: &AppConfig) -> Result<(), ConfigError> {
    let server = &config.server;
    if server.timeout == 0 {
        return Err(validation_err("server.timeout must be greater than 0"));
    }
    if server.connect_timeout_secs == 0 {
        return Err(validation_err(
            "server.connect_timeout_secs must be greater than 0",
        ));
    }
    if server.max_stream_lifetime_secs == 0 {
        return Err(validation_err(
            "server.max_stream_lifetime_secs must be greater than 0",
        ));
    }
    if server.http_pool_max_idle_per_host == 0 {
        return Err(validation_err(
            "server.http_pool_max_idle_per_host must be greater than 0",
        ));
    }
    Ok(())
}

fn validate_backend_config(config: &AppConfig) -> Result<(), ConfigError> {
    let base_url = &config.backend.base_url;
    let parsed = url::Url::parse(base_url)
        .map_err(|e| validation_err(format!("backend.base_url '{base_url}' is invalid: {e}")))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(validation_err(format!(
            "backend.base_url '{base_url}' must use http or https"
        )));
    }
    if parsed.host_str().is_none() {
        return Err(validation_err(format!(
            "backend.base_url '{base_url}' is missing a host"
        )));
    }

    // The gateway proxies to the backend; the two cannot share a listen
    // address or every forwarded request would loop back into the gateway.
    if let (Some(host), Some(port)) = (parsed.host_str(), parsed.port_or_known_default()) {
        let same_host = host == config.server.host
            || (is_loopback(host) && is_loopback(&config.server.host));
        if same_host && port == config.server.port {
            return Err(validation_err(format!(
                "backend.base_url '{base_url}' points at the gateway's own listen address"
            )));
        }
    }
    Ok(())
}

fn is_loopback(host: &str) -> bool {
    host == "localhost" || host == "127.0.0.1" || host == "::1" || host == "0.0.0.0"
}

fn validate_cors_origins(config: &AppConfig) -> Result<(), ConfigError> {
    for origin in &config.cors.allowed_origins {
        let origin = origin.trim();
        if origin.is_empty() {
            return Err(validation_err("cors.allowed_origins contains a blank entry"));
        }
        if !origin.starts_with("http://") && !origin.starts_with("https://") {
            return Err(validation_err(format!(
                "cors.allowed_origins entry '{origin}' must start with http:// or https://"
            )));
        }
    }
    Ok(())
}

const VALID_LOG_LEVELS: &[&str] = &[
    "TRACE", "DEBUG", "INFO", "WARN", "WARNING", "ERROR", "CRITICAL", "DISABLED",
];

fn validate_log_level(config: &AppConfig) -> Result<(), ConfigError> {
    let level = config.features.log_level.to_uppercase();
    if !VALID_LOG_LEVELS.contains(&level.as_str()) {
        return Err(validation_err(format!(
            "features.log_level '{}' is not one of {VALID_LOG_LEVELS:?}",
            config.features.log_level
        )));
    }
    Ok(())
}
