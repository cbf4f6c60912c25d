//! # Engine Errors
//!
//! Error types raised by the engine and by its collaborators. Collaborator
//! errors are folded into [`ConfigError`] (configuration path) or contained and
//! logged (runtime path); only [`EngineError`] reaches the engine's callers.

use std::time::Duration;
use thiserror::Error;

use crate::core::state::EngineState;

/// Classification of a configuration failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigErrorKind {
    /// No engine descriptor exists for the requested name.
    UnknownEngine,
    /// The engine descriptor's URL port differs from the port the caller runs on.
    PortMismatch,
    /// The configuration store could not be reached.
    ServiceUnavailable,
    /// The configuration store answered with an internal failure.
    InternalService,
    /// A descriptor could not be interpreted (bad URL and similar).
    MalformedDescriptor,
    /// A channel descriptor names a sample mode the engine cannot run.
    UnsupportedChannelType,
}

impl ConfigErrorKind {
    pub fn category(&self) -> &'static str {
        match self {
            ConfigErrorKind::UnknownEngine => "Unknown engine",
            ConfigErrorKind::PortMismatch => "Port mismatch",
            ConfigErrorKind::ServiceUnavailable => "Service unavailable",
            ConfigErrorKind::InternalService => "Internal service exception",
            ConfigErrorKind::MalformedDescriptor => "Engine url malformed",
            ConfigErrorKind::UnsupportedChannelType => "Channel type not supported",
        }
    }
}

/// A failure while loading the engine configuration.
#[derive(Debug, Error)]
#[error("Archive engine configuration failed ({}): {message}", .kind.category())]
pub struct ConfigError {
    pub kind: ConfigErrorKind,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl ConfigError {
    pub fn new(kind: ConfigErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: ConfigErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Errors reported by a [`ChannelConfigStore`](crate::core::services::ChannelConfigStore).
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("configuration service unavailable: {0}")]
    Unavailable(String),
    #[error("configuration service internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ConfigError {
    fn from(err: StoreError) -> Self {
        let kind = match err {
            StoreError::Unavailable(_) => ConfigErrorKind::ServiceUnavailable,
            StoreError::Internal(_) => ConfigErrorKind::InternalService,
        };
        ConfigError::with_source(kind, "configuration store request failed", err)
    }
}

/// Errors reported by a [`SampleSink`](crate::core::services::SampleSink).
#[derive(Debug, Clone, Error)]
pub enum SinkError {
    #[error("sample sink unavailable: {0}")]
    Unavailable(String),
    #[error("batch write failed: {0}")]
    WriteFailed(String),
    #[error("batch write timed out after {0:?}")]
    Timeout(Duration),
}

/// Error reported by an [`AuditSink`](crate::core::services::AuditSink).
#[derive(Debug, Clone, Error)]
#[error("audit record failed: {0}")]
pub struct AuditError(pub String);

/// Errors reported by a [`ValueSource`](crate::core::services::ValueSource).
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("no value available for '{0}'")]
    NotFound(String),
    #[error("value source disconnected: {0}")]
    Disconnected(String),
    #[error("value source protocol error: {0}")]
    Protocol(String),
}

/// A single channel failed to start or stop.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel '{channel}' failed to connect: {source}")]
    Connect {
        channel: String,
        #[source]
        source: SourceError,
    },
    #[error("channel '{channel}' failed to disconnect: {source}")]
    Disconnect {
        channel: String,
        #[source]
        source: SourceError,
    },
}

/// Errors returned by [`EngineModel`](crate::core::engine_model::EngineModel) operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("operation '{operation}' is not allowed in state {state}")]
    InvalidState {
        operation: &'static str,
        state: EngineState,
    },
    #[error("operation '{operation}' rejected: another lifecycle operation is in progress")]
    Busy { operation: &'static str },
    #[error("no engine configuration loaded")]
    NotConfigured,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_are_classified() {
        let unavailable: ConfigError = StoreError::Unavailable("refused".into()).into();
        let internal: ConfigError = StoreError::Internal("bad row".into()).into();
        assert_eq!(unavailable.kind, ConfigErrorKind::ServiceUnavailable);
        assert_eq!(internal.kind, ConfigErrorKind::InternalService);
        assert!(std::error::Error::source(&unavailable).is_some());
    }

    #[test]
    fn test_config_error_message_carries_category() {
        let err = ConfigError::new(ConfigErrorKind::UnsupportedChannelType, "channel 'x'");
        let text = err.to_string();
        assert!(text.contains("Channel type not supported"));
        assert!(text.contains("channel 'x'"));
    }
}
