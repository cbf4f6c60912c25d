//! # Logging Setup
//!
//! Installs the process-wide `tracing` subscriber used by the archive engine
//! binaries:
//!
//! - **Console**: human-readable output on stdout.
//! - **File**: daily rolling file `<app_name>.log.<date>` in `log_dir`, written
//!   through a non-blocking writer. Plain text or JSON lines.
//! - **Filter**: `RUST_LOG` overrides the configured level.
//!
//! Older log files beyond [`LOG_RETENTION`] are removed before the subscriber
//! is installed.

use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Number of rolled log files kept in the log directory.
pub const LOG_RETENTION: usize = 7;

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("log directory unusable: {0}")]
    Io(#[from] io::Error),
    #[error("failed to install tracing subscriber: {0}")]
    Init(String),
}

/// Sets up console and file logging. Keep the returned guard alive for the
/// lifetime of the process, dropping it flushes the file writer.
pub fn setup_logging(
    log_dir: &Path,
    app_name: &str,
    log_level: &str,
    json: bool,
) -> Result<WorkerGuard, LoggerError> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
    }
    let removed = cleanup_old_logs(log_dir, app_name, LOG_RETENTION)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let appender = tracing_appender::rolling::daily(log_dir, format!("{app_name}.log"));
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let json_layer = json.then(|| fmt::layer().json().with_writer(file_writer.clone()));
    let text_layer = (!json).then(|| fmt::layer().with_ansi(false).with_writer(file_writer));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|e| LoggerError::Init(e.to_string()))?;

    tracing::info!(dir = %log_dir.display(), removed, "Logging initialised");
    Ok(guard)
}

/// Removes all but the `keep` most recently modified log files of `app_name`.
/// Returns the number of files removed.
pub fn cleanup_old_logs(log_dir: &Path, app_name: &str, keep: usize) -> io::Result<usize> {
    let prefix = format!("{app_name}.log");
    let mut entries: Vec<_> = fs::read_dir(log_dir)?
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().starts_with(&prefix))
        .filter_map(|e| {
            let modified = e.metadata().and_then(|m| m.modified()).ok()?;
            Some((modified, e.path()))
        })
        .collect();

    // Newest first
    entries.sort_by(|a, b| b.0.cmp(&a.0));

    let mut removed = 0;
    for (_, path) in entries.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Failed to delete old log file {:?}: {}", path, e),
        }
    }
    Ok(removed)
}
