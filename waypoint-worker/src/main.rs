//! Waypoint worker
//!
//! Long-running process that consumes dispatch units for every stage queue
//! and serves the admin API.
//!
//! # Architecture
//!
//! - Stage consumers pull units from the control plane, call the section
//!   fetcher service and record checkpoints in PostgreSQL
//! - Orchestration consumers seed and finalize runs
//! - The HTTP server exposes the admin routes plus /health, /ready and /metrics
//!
//! On SIGTERM the server stops accepting requests and every consumer finishes
//! the unit it holds before the process exits.
//!
//! # Configuration
//!
//! See [`waypoint_worker::config`] for the environment variables.

use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::{limit::RequestBodyLimitLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use waypoint_runtime::{Dispatcher, PipelineOrchestrator, RedisControlPlane, WorkerPool};
use waypoint_storage::{migrations::run_migrations, PostgresStorage};
use waypoint_worker::{
    config::WorkerConfig,
    handler::{router, AppState},
    http_executor::HttpStageExecutor,
};

#[tokio::main]
async fn main() {
    // JSON logs; every dispatch span carries run_id, so one run's log is a filter away
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "waypoint_worker=info,waypoint_runtime=info,tower_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting waypoint worker");

    let config = match WorkerConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    info!(
        database_url = %mask_password(&config.database_url),
        redis_url = %mask_password(&config.redis_url),
        control_prefix = %config.control_prefix,
        fetcher_url = %config.fetcher_url,
        port = config.port,
        "Configuration loaded"
    );

    let storage = match PostgresStorage::with_pool_config(&config.database_url, config.pool_config())
        .await
    {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to initialize storage");
            std::process::exit(1);
        }
    };

    if config.run_migrations {
        if let Err(e) = run_migrations(storage.pool()).await {
            error!(error = %e, "Failed to apply migrations");
            std::process::exit(1);
        }
    }

    if let Err(e) = storage.health_check().await {
        error!(error = %e, "Storage health check failed");
        std::process::exit(1);
    }
    info!("Storage initialized successfully");

    let control = match RedisControlPlane::connect(&config.redis_url, config.control_prefix.clone())
        .await
    {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!(error = %e, "Failed to connect to the control plane");
            std::process::exit(1);
        }
    };

    if let Err(e) = control.ping().await {
        error!(error = %e, "Control plane health check failed");
        std::process::exit(1);
    }
    info!("Control plane initialized successfully");

    let executor = match HttpStageExecutor::new(config.fetcher_url.clone(), config.fetcher_timeout)
    {
        Ok(e) => Arc::new(e),
        Err(e) => {
            error!(error = %e, "Failed to create the stage executor");
            std::process::exit(1);
        }
    };

    let storage = Arc::new(storage);
    let orchestrator = PipelineOrchestrator::new(storage.clone(), control.clone());
    let dispatcher = Dispatcher::new(storage, control, executor, config.dispatcher_config());
    let pool = WorkerPool::spawn(dispatcher, orchestrator.clone(), config.pool_settings());

    let app: Router = router(AppState::new(orchestrator, config.admin_key.as_str()))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(RequestBodyLimitLayer::new(2 * 1024 * 1024));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, address = %addr, "Failed to bind server");
            std::process::exit(1);
        }
    };

    info!(address = %addr, "Server listening");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "Server error");
    }

    pool.shutdown().await;
    info!("Worker shut down gracefully");
}

/// Graceful shutdown signal handler
///
/// Waits for SIGTERM or Ctrl-C
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl-C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}

/// Mask the password of a connection URL for logging
fn mask_password(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            let mut masked = url.to_string();
            masked.replace_range(colon_pos + 1..at_pos, "****");
            return masked;
        }
    }
    url.to_string()
}
