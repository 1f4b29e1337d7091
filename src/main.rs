// coldfront - scale-to-zero proxy for OpenAI-compatible inference backends
//
// Sits in front of a GPU inference deployment and lets it scale to zero while
// idle. Anthropic- and OpenAI-shaped clients both land here; requests block
// until the backend is warm, bodies are translated between protocols where
// needed, and streamed responses pass through a rewriter that salvages
// malformed tool-call output.
//
// Architecture:
// - Proxy server (axum): request dispatch, translation, upstream streaming
// - Scale controller: cold-start gate, health probing, idle scale-down
// - Translation: Anthropic Messages <-> OpenAI Chat Completions
// - Parser: structured tool calls out of malformed model text

mod cli;
mod config;
mod parser;
mod proxy;
mod scale;
mod startup;
mod translation;
mod version;

use anyhow::Result;
use config::Config;
use scale::orchestrator::{KubernetesOrchestrator, Orchestrator};
use scale::{ScaleController, ScaleSettings};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Exit codes: 0 clean shutdown, 1 invalid configuration, 2 orchestrator
/// unreachable at startup.
#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    // Handle CLI subcommands first (config --show, --path).
    if cli::handle_cli() {
        return 0;
    }

    let config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {}", err);
            return 1;
        }
    };

    // Precedence: RUST_LOG env var > config file > default "info"
    let default_filter = format!("coldfront={},tower_http=info", config.log_level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    startup::print_startup(&config);
    startup::log_startup(&config);

    let orchestrator: Arc<dyn Orchestrator> = match build_orchestrator(&config) {
        Ok(orchestrator) => orchestrator,
        Err(err) => {
            tracing::error!(error = %err, "cannot reach orchestrator");
            return 2;
        }
    };

    let mut settings = ScaleSettings::new(
        config.deployment.clone(),
        format!("{}/health", config.backend_url.trim_end_matches('/')),
    );
    settings.idle_timeout = config.idle_timeout;
    settings.schedule_timeout = config.schedule_timeout;
    settings.warm_timeout = config.warm_timeout;

    let controller = ScaleController::new(orchestrator, settings);

    match controller.startup_check().await {
        Ok(replicas) => tracing::info!(replicas, "orchestrator reachable"),
        Err(err) => {
            tracing::error!(error = %err, "orchestrator unreachable at startup");
            return 2;
        }
    }

    // Background idle watcher with its own shutdown signal.
    let (watcher_shutdown_tx, watcher_shutdown_rx) = tokio::sync::oneshot::channel();
    let watcher_handle = tokio::spawn(scale::idle::run_idle_watcher(
        controller.clone(),
        watcher_shutdown_rx,
    ));

    // Proxy server with graceful shutdown on ctrl-c / SIGTERM.
    let (server_shutdown_tx, server_shutdown_rx) = tokio::sync::oneshot::channel();
    let server_config = config.clone();
    let server_controller = controller.clone();
    let server_handle = tokio::spawn(async move {
        proxy::server::start_proxy(server_config, server_controller, server_shutdown_rx).await
    });

    if let Err(err) = shutdown_signal().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
    tracing::info!("Shutting down...");

    let _ = server_shutdown_tx.send(());
    let _ = watcher_shutdown_tx.send(());
    let _ = watcher_handle.await;
    match server_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::error!(error = %err, "proxy server failed"),
        Err(err) => tracing::error!(error = %err, "proxy server task panicked"),
    }

    // Release the GPU on the way out.
    controller.stop().await;

    tracing::info!("Shutdown complete");
    0
}

/// Build the Kubernetes orchestrator: in-cluster when a service account is
/// mounted, otherwise an explicit API server (kubectl proxy and tests).
fn build_orchestrator(config: &Config) -> Result<Arc<dyn Orchestrator>> {
    if let Ok(api_server) = std::env::var("COLDFRONT_API_SERVER") {
        let token = std::env::var("COLDFRONT_API_TOKEN").ok();
        let orchestrator =
            KubernetesOrchestrator::with_api_server(api_server, config.namespace.clone(), token)?;
        return Ok(Arc::new(orchestrator));
    }
    Ok(Arc::new(KubernetesOrchestrator::in_cluster(
        config.namespace.clone(),
    )?))
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = sigterm.recv() => {}
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok(())
    }
}
