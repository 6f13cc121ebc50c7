//! Analysis Runtime daemon
//!
//! Hosts the cache and the worker pool behind the HTTP admin API.

use std::net::SocketAddr;

use anyhow::Context;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use analysis_runtime::api::create_router;
use analysis_runtime::{spawn_cleanup_task, AppState, Config};

/// Main entry point for the analysis runtime daemon.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load configuration from environment variables
/// 3. Create the cache and the worker pool with built-in handlers
/// 4. Start background TTL cleanup task
/// 5. Serve the admin API until SIGINT/SIGTERM
/// 6. Drain and destroy the worker pool
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "analysis_runtime=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting analysis runtime");

    let config = Config::from_env();
    info!(
        "Configuration loaded: memory_max_entries={}, persistent_dir={:?}, workers={}..{}, queue_size={}, port={}",
        config.cache.memory_max_entries,
        config.cache.persistent_dir,
        config.pool.min_workers,
        config.pool.max_workers,
        config.pool.queue_size,
        config.server_port
    );

    let state = AppState::from_config(&config);
    info!(
        "Cache initialized (persistent: {}), handlers: {:?}",
        state.cache.is_persistent(),
        state.pool.registry().task_types()
    );

    let cleanup_handle = spawn_cleanup_task(state.cache.clone(), config.cache.cleanup_interval);
    info!("Background cleanup task started");

    let pool = state.pool.clone();
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cleanup_handle))
        .await
        .context("server error")?;

    pool.destroy().await;
    info!("Server shutdown complete");
    Ok(())
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
///
/// On shutdown signal, aborts the cleanup task and allows graceful shutdown.
async fn shutdown_signal(cleanup_handle: tokio::task::JoinHandle<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    cleanup_handle.abort();
    warn!("Cleanup task aborted");
}
