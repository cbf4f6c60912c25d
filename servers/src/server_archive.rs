//! # Archive Engine Server
//!
//! Hosts one archive engine: loads its configuration from PostgreSQL, samples
//! its channels from Redis, persists them back to PostgreSQL, and serves the
//! management HTTP API on the port named in the engine's URL.
//!
//! The process exits when a shutdown is requested (SIGINT, SIGTERM or
//! `POST /stop`) and the engine has flushed its buffers, or when a restart
//! fails to bring the engine back up.

use anyhow::{Context, Result};
use clap::Parser;
use lib_archive::connections::cache_redis::RedisValueSource;
use lib_archive::connections::db_postgres::PgArchiveStore;
use lib_archive::core::{EngineModel, EngineServices, EngineState};
use lib_archive::loggers::setup_logging;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod archive_logic;
use archive_logic::{config, control, supervisor};

const APP_NAME: &str = "server_archive";

#[tokio::main]
async fn main() -> Result<()> {
    // --- Phase 1: Configuration ---
    let _ = dotenvy::dotenv();
    let config = config::load_config(config::Config::parse())?;

    // --- Phase 2: Logging ---
    let _log_guard = setup_logging(&config.log_dir, APP_NAME, &config.log_level, config.log_json)?;
    info!(
        engine = %config.engine_name,
        port = config.http_port,
        "Starting {}",
        APP_NAME
    );

    // --- Phase 3: Collaborators ---
    let store = Arc::new(
        PgArchiveStore::new(&config.database_url, config.db_max_connections)
            .context("failed to create database pool")?,
    );
    if let Err(e) = store.ping().await {
        warn!(error = %e, "Database not reachable yet");
    }
    let source = Arc::new(RedisValueSource::new(&config.redis_url).context("invalid redis url")?);

    let services = EngineServices {
        config_store: store.clone(),
        sink: store.clone(),
        audit: store,
        source,
    };

    // --- Phase 4: Engine ---
    let engine = Arc::new(EngineModel::new(config.engine.clone(), services));
    engine
        .read_config(&config.engine_name, config.http_port)
        .await
        .context("failed to read engine configuration")?;
    engine.start().await.context("failed to start engine")?;

    // --- Phase 5: Management HTTP ---
    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "Management API listening");

    let http_shutdown = CancellationToken::new();
    let http_token = http_shutdown.clone();
    let app = control::router(engine.clone());
    let http = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(http_token.cancelled_owned())
            .await
    });

    // --- Phase 6: Signals ---
    let signal_engine = engine.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Shutdown signal received");
        request_shutdown(&signal_engine).await;
    });

    // --- Phase 7: Supervision ---
    let outcome = supervisor::supervise(engine, config.engine_name.clone(), config.http_port).await;

    http_shutdown.cancel();
    match http.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Management API failed"),
        Err(e) => error!(error = %e, "Management API task panicked"),
    }

    match &outcome {
        Ok(()) => info!("Shutdown complete"),
        Err(e) => error!(error = %format!("{e:#}"), "Engine terminated"),
    }
    outcome
}

/// Requests a shutdown, retrying while the engine is in a state that cannot
/// accept one yet (for example in the middle of a restart).
async fn request_shutdown(engine: &EngineModel) {
    let mut state_rx = engine.subscribe_state();
    loop {
        match engine.request_stop() {
            Ok(()) => return,
            Err(e) => {
                let state = engine.state();
                if matches!(state, EngineState::ShutdownRequested) {
                    return;
                }
                warn!(error = %e, %state, "Shutdown deferred");
                if state_rx.changed().await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
