//! Proxy server setup and initialization

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    routing::{any, get},
    Json, Router,
};
use tokio::net::TcpListener;

use crate::config::Config;
use crate::scale::ScaleController;
use crate::version::{self, VersionInfo};

use super::{proxy_handler, ProxyState};

/// Start the proxy server
pub async fn start_proxy(
    config: Config,
    controller: Arc<ScaleController>,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<()> {
    // Build the HTTP client once with connection pooling. No overall request
    // timeout: streaming responses legitimately run for minutes. Connects
    // fail fast instead.
    let client = reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(10))
        .pool_max_idle_per_host(10)
        // Force HTTP/1.1: SSE over h2 triggers reset bugs in some backends
        .http1_only()
        .build()
        .context("Failed to create HTTP client")?;

    let state = ProxyState {
        client,
        controller,
        backend_url: config.backend_url.clone(),
        served_model: config.model.served_name.clone(),
        upstream_read_idle: config.upstream_read_idle,
    };

    // Build the router: liveness and version endpoints plus the catch-all
    // dispatcher.
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/*path", any(proxy_handler))
        .with_state(state);

    let bind_addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting proxy on {}", bind_addr);

    let listener = TcpListener::bind(&bind_addr)
        .await
        .context("Failed to bind to address")?;

    tracing::info!("Proxy listening on {}", bind_addr);

    // Serve until the shutdown signal; in-flight requests get to finish.
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.await.ok();
        })
        .await
        .context("Server error")?;

    tracing::info!("Proxy server shut down gracefully");
    Ok(())
}

/// Proxy liveness, deliberately unrelated to backend health: the proxy is up
/// even while the backend is scaled to zero.
async fn health_handler() -> &'static str {
    "OK"
}

async fn version_handler() -> Json<VersionInfo> {
    Json(version::current())
}
