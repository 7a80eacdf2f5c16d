//! mf-server: HTTP API server and background job processor.
//!
//! This crate ties together the other mf-* crates into a running service:
//!
//! - Axum-based HTTP API for upload, status, download and SSE events
//! - Upload admission that creates and enqueues jobs
//! - Background workers that dequeue jobs and run the stage pipeline
//! - Graceful shutdown via signal handling

pub mod admission;
pub mod context;
pub mod error;
pub mod middleware;
pub mod processor;
pub mod router;
pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use mf_core::config::Config;
use mf_pipeline::StageRegistry;
use mf_tools::ToolRegistry;
use tokio_util::sync::CancellationToken;

use crate::context::AppContext;

/// Discover external tools and log what was found.
pub fn discover_tools(config: &Config) -> Arc<ToolRegistry> {
    let tools = Arc::new(ToolRegistry::discover(&config.tools));
    for info in tools.check_all() {
        if info.available {
            tracing::info!(
                "Tool found: {} ({})",
                info.name,
                info.version.as_deref().unwrap_or("unknown version")
            );
        } else {
            tracing::warn!("Tool not found: {}", info.name);
        }
    }
    tools
}

/// Start the meshforge server.
///
/// Opens the database, wires the [`AppContext`], requeues unfinished jobs and
/// runs the HTTP server alongside the job processor. Returns once a shutdown
/// signal is received and every worker has stopped.
pub async fn start(config: Config) -> mf_core::Result<()> {
    for warning in config.validate() {
        tracing::warn!("Config warning: {warning}");
    }

    let db_path = &config.server.db_path;
    let existed = db_path.exists();
    let db = mf_db::init_pool(db_path)?;
    if existed {
        tracing::info!("Database opened (existing) at {}", db_path.display());
    } else {
        tracing::info!("Database created (new) at {}", db_path.display());
    }

    let tools = discover_tools(&config);
    let stages = StageRegistry::with_builtin(tools.clone(), &config.tools);
    let ctx = AppContext::new(config.clone(), db, tools, stages)?;

    match processor::requeue_unfinished(&ctx).await {
        Ok(0) => {}
        Ok(n) => tracing::info!("Requeued {n} unfinished jobs"),
        Err(e) => tracing::warn!("Failed to requeue unfinished jobs: {e}"),
    }

    let cancel = CancellationToken::new();

    let processor_handle = tokio::spawn(processor::run_processor(
        ctx.clone(),
        config.server.workers,
        cancel.clone(),
    ));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| mf_core::Error::Config(format!("Invalid server address: {e}")))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| mf_core::Error::Internal(format!("Failed to bind to {addr}: {e}")))?;
    tracing::info!("Starting server on {addr}");

    let app = router::build_router(ctx);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await;

    // Stop the workers whether the server exited cleanly or not.
    cancel.cancel();
    if let Err(e) = processor_handle.await {
        tracing::error!("Job processor task failed: {e}");
    }

    served.map_err(|e| mf_core::Error::Internal(format!("Server error: {e}")))?;
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM) or for `cancel`.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = cancel.cancelled() => {}
    }

    tracing::info!("Shutdown signal received");
}
