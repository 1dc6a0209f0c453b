//! CodeRunner WebSocket service binary
//!
//! Assembles the execution pipeline (engine client, network manager,
//! container pool, queue, metrics, orchestrator, cleaner) and serves the
//! wire protocol over axum. Exits non-zero only on startup failure.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use coderunner_core::cleaner::AdaptiveCleaner;
use coderunner_core::config::RunnerConfig;
use coderunner_core::engine::{ContainerEngine, DockerEngine};
use coderunner_core::language::Language;
use coderunner_core::metrics::PipelineMetrics;
use coderunner_core::network::NetworkManager;
use coderunner_core::orchestrator::SessionOrchestrator;
use coderunner_core::pool::SessionPool;
use coderunner_core::queue::ExecutionQueue;

mod api;
mod config;
mod ws;

use api::AppState;
use config::ServerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting CodeRunner server...");

    let server_config = ServerConfig::from_env();
    let config = Arc::new(RunnerConfig::from_env());
    tracing::info!(
        max_concurrent = config.queue.max_concurrent,
        max_queue_size = config.queue.max_queue_size,
        session_ttl_ms = config.pool.session_ttl_ms,
        network_prefix = %config.network.prefix,
        "configuration loaded"
    );

    // Startup preflight: the daemon must be reachable; missing language
    // images are reported but not fatal (they may be pulled out of band)
    let engine: Arc<dyn ContainerEngine> = Arc::new(
        DockerEngine::connect()
            .await
            .context("container engine preflight failed")?,
    );
    engine
        .ping()
        .await
        .context("container engine did not answer ping")?;
    for descriptor in Language::all_descriptors() {
        match engine.image_exists(descriptor.image).await {
            Ok(true) => tracing::debug!(image = descriptor.image, "image present"),
            Ok(false) => tracing::warn!(image = descriptor.image, "image missing"),
            Err(e) => tracing::warn!(image = descriptor.image, "image probe failed: {}", e),
        }
    }

    // Assemble the pipeline
    let networks = Arc::new(NetworkManager::new(engine.clone(), config.network.clone()));
    let pool = Arc::new(SessionPool::new(
        engine.clone(),
        config.pool.clone(),
        config.resources.clone(),
    ));
    let queue = ExecutionQueue::new(config.queue.clone());
    let metrics = Arc::new(PipelineMetrics::new());
    let orchestrator = SessionOrchestrator::new(
        engine.clone(),
        networks.clone(),
        pool.clone(),
        queue.clone(),
        metrics.clone(),
        config.clone(),
    );

    let cleaner = AdaptiveCleaner::start(
        pool.clone(),
        networks.clone(),
        Duration::from_millis(config.pool.cleanup_interval_ms),
        Duration::from_millis(config.network.sweep_interval_ms),
    );

    let state = AppState {
        orchestrator,
        metrics,
        pool: pool.clone(),
        networks: networks.clone(),
        queue,
    };
    let router = api::build_router(state, &server_config.cors_origins);

    let bind_addr = format!("{}:{}", server_config.host, server_config.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", bind_addr))?;
    tracing::info!("listening on {}", bind_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            shutdown_signal().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    // Teardown: stop the sweepers, drop every pooled container, and sweep
    // the remaining session networks, all best-effort
    cleaner.shutdown().await;
    pool.cleanup_all().await;
    if let Err(e) = networks.cleanup_orphaned_networks(Duration::ZERO).await {
        tracing::warn!("network teardown sweep failed: {}", e);
    }

    tracing::info!("CodeRunner server shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
