//! # Management HTTP API
//!
//! A small `axum` router exposing the engine's operator surface.
//!
//! | Route | Method | Effect |
//! |---|---|---|
//! | `/health` | GET | Liveness check, always `OK` |
//! | `/status` | GET | Engine status and write statistics |
//! | `/channels` | GET | Per-channel diagnostics |
//! | `/stop` | POST | Requests a shutdown |
//! | `/restart` | POST | Requests a restart |
//! | `/reset` | POST | Zeroes channel and write statistics |
//!
//! Stop and restart only flag the engine; the supervisor loop carries them out.

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use lib_archive::core::{ChannelDiagnostics, EngineError, EngineModel, EngineStatus};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{error, info, warn};

type SharedEngine = Arc<EngineModel>;

pub fn router(engine: SharedEngine) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/channels", get(channels_handler))
        .route("/stop", post(stop_handler))
        .route("/restart", post(restart_handler))
        .route("/reset", post(reset_handler))
        .with_state(engine)
}

/// Engine errors surfaced to HTTP clients.
#[derive(Debug)]
pub struct ControlError(EngineError);

impl From<EngineError> for ControlError {
    fn from(e: EngineError) -> Self {
        ControlError(e)
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self.0 {
            EngineError::InvalidState { .. } => (StatusCode::CONFLICT, "InvalidState"),
            EngineError::Busy { .. } => (StatusCode::CONFLICT, "Busy"),
            EngineError::NotConfigured => (StatusCode::CONFLICT, "NotConfigured"),
            EngineError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ConfigurationError"),
        };
        if status.is_server_error() {
            error!(error = %self.0, "Control request failed");
        } else {
            warn!(error = %self.0, "Control request rejected");
        }
        (
            status,
            Json(json!({
                "error_type": error_type,
                "message": self.0.to_string(),
            })),
        )
            .into_response()
    }
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn status_handler(State(engine): State<SharedEngine>) -> Json<EngineStatus> {
    Json(engine.status())
}

async fn channels_handler(State(engine): State<SharedEngine>) -> Json<Vec<ChannelDiagnostics>> {
    Json(engine.dump_debug_info())
}

async fn stop_handler(State(engine): State<SharedEngine>) -> Result<(StatusCode, Json<Value>), ControlError> {
    engine.request_stop()?;
    info!("Shutdown requested over HTTP");
    Ok((StatusCode::ACCEPTED, Json(json!({ "state": engine.state() }))))
}

async fn restart_handler(State(engine): State<SharedEngine>) -> Result<(StatusCode, Json<Value>), ControlError> {
    engine.request_restart()?;
    info!("Restart requested over HTTP");
    Ok((StatusCode::ACCEPTED, Json(json!({ "state": engine.state() }))))
}

async fn reset_handler(State(engine): State<SharedEngine>) -> Json<EngineStatus> {
    engine.reset();
    Json(engine.status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_archive::connections::memory::{
        MemoryAuditSink, MemoryConfigStore, MemorySampleSink, MemoryValueSource,
    };
    use lib_archive::core::{EngineDescriptor, EngineServices, EngineSettings, EngineState};

    fn engine() -> SharedEngine {
        let store = MemoryConfigStore::new();
        store.add_engine(EngineDescriptor {
            id: 1,
            name: "main".into(),
            url: "http://localhost:4812/main".into(),
        });
        Arc::new(EngineModel::new(
            EngineSettings::default(),
            EngineServices {
                config_store: Arc::new(store),
                sink: Arc::new(MemorySampleSink::new()),
                audit: Arc::new(MemoryAuditSink::new()),
                source: Arc::new(MemoryValueSource::new()),
            },
        ))
    }

    #[tokio::test]
    async fn test_stop_while_idle_is_a_conflict() {
        let engine = engine();
        let response = stop_handler(State(engine.clone())).await.unwrap_err().into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn test_stop_and_restart_requests() {
        let engine = engine();
        engine.read_config("main", 4812).await.unwrap();
        engine.start().await.unwrap();

        let (status, _) = restart_handler(State(engine.clone())).await.unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(engine.state(), EngineState::RestartRequested);

        // A pending restart can still be turned into a shutdown.
        let (status, Json(body)) = stop_handler(State(engine.clone())).await.unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["state"], "SHUTDOWN_REQUESTED");

        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_status_reports_configuration() {
        let engine = engine();
        engine.read_config("main", 4812).await.unwrap();
        let Json(status) = status_handler(State(engine)).await;
        assert_eq!(status.state, EngineState::Idle);
        assert_eq!(status.engine_id, Some(1));
        assert_eq!(status.batch_size, 500);
    }

    #[tokio::test]
    async fn test_health() {
        assert_eq!(health_handler().await, "OK");
    }
}
