use std::sync::Arc;

use agentgate::config::load_config;
use agentgate::observability::init_tracing;
use agentgate::proxy::dispatch;
use agentgate::state::AppState;
use axum::body::Body;
use axum::extract::State;
use axum::response::Response;
use axum::Router;
use http::{HeaderValue, Request};
use tower_http::cors::{AllowHeaders, AllowMethods, CorsLayer};

#[tokio::main]
async fn main() {
    let config = load_config("config.yaml").unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        eprintln!("Please copy 'config.example.yaml' to 'config.yaml' and modify as needed.");
        std::process::exit(1);
    });

    init_tracing(&config.features.log_level);

    let host = config.server.host.clone();
    let port = config.server.port;
    let cors = build_cors_layer(&config.cors.allowed_origins);

    let state = Arc::new(AppState::new(config).unwrap_or_else(|e| {
        eprintln!("Failed to initialize: {e}");
        std::process::exit(1);
    }));

    tracing::info!(
        backend = state.backend.base_url(),
        auth_enabled = state.auth_enabled(),
        cors_enabled = cors.is_some(),
        "agentgate starting on {}:{}",
        host,
        port
    );

    // Every method and path funnels through the dispatch chain.
    let mut app = Router::new()
        .fallback(dispatch_handler)
        .with_state(Arc::clone(&state));
    if let Some(cors) = cors {
        app = app.layer(cors);
    }

    let listener = tokio::net::TcpListener::bind(format!("{host}:{port}"))
        .await
        .unwrap_or_else(|e| {
            eprintln!("Failed to bind to {host}:{port}: {e}");
            std::process::exit(1);
        });

    tracing::info!("agentgate is ready to accept connections");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        eprintln!("Server error: {e}");
        std::process::exit(1);
    }
}

async fn dispatch_handler(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
) -> Response {
    dispatch(state, request).await
}

/// Preflight handling with credentials allowed and all methods/headers
/// allowed. Credentialed CORS cannot use wildcards, so the layer mirrors
/// whatever the request asks for.
fn build_cors_layer(allowed_origins: &[String]) -> Option<CorsLayer> {
    if allowed_origins.is_empty() {
        tracing::info!("CORS allowed origins: [] (CORS disabled)");
        return None;
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| {
            let origin = origin.trim().trim_end_matches('/');
            origin.parse().ok()
        })
        .collect();

    tracing::info!(origins = ?allowed_origins, "CORS enabled");
    Some(
        CorsLayer::new()
            .allow_origin(origins)
            .allow_credentials(true)
            .allow_methods(AllowMethods::mirror_request())
            .allow_headers(AllowHeaders::mirror_request()),
    )
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install shutdown signal handler");
        return;
    }
    tracing::info!("shutdown signal received, draining connections");
}
