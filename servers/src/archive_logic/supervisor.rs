//! # Engine Supervisor
//!
//! Acts on the engine's requested state changes. `request_stop()` and
//! `request_restart()` only flag the engine; this loop performs the actual
//! stop, or the stop / clear / read / start sequence of a restart.

use anyhow::{Context, Result};
use lib_archive::core::{EngineError, EngineModel, EngineState};
use std::sync::Arc;
use tracing::{error, info};

/// Runs until a requested shutdown has completed. Returns an error when a
/// restart could not bring the engine back up.
pub async fn supervise(engine: Arc<EngineModel>, engine_name: String, port: u16) -> Result<()> {
    let mut state_rx = engine.subscribe_state();
    loop {
        let requested = *state_rx
            .wait_for(|s| matches!(s, EngineState::ShutdownRequested | EngineState::RestartRequested))
            .await
            .context("engine state channel closed")?;

        match requested {
            EngineState::ShutdownRequested => {
                engine.stop().await.context("engine stop failed")?;
                info!("Archive engine shut down");
                return Ok(());
            }
            EngineState::RestartRequested => {
                info!("Restarting archive engine");
                if let Err(e) = restart(&engine, &engine_name, port).await {
                    error!(error = %e, "Restart failed");
                    return Err(e).context("engine restart failed");
                }
                info!(channels = engine.channel_count(), "Archive engine restarted");
            }
            _ => {}
        }
    }
}

async fn restart(engine: &EngineModel, engine_name: &str, port: u16) -> Result<(), EngineError> {
    engine.stop().await?;
    engine.clear_config().await?;
    engine.read_config(engine_name, port).await?;
    engine.start().await
}
