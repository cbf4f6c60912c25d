//! # Engine Model
//!
//! The top-level orchestrator of an archive engine process. It owns the
//! channel and group registries, the [`WriteScheduler`] and the lifecycle
//! state, and is the only object the host process talks to.
//!
//! ## Lifecycle:
//!
//! ```text
//!  IDLE --start()--> RUNNING --request_stop()----> SHUTDOWN_REQUESTED
//!    ^                  |    --request_restart()-> RESTART_REQUESTED
//!    |                  v                               |
//!    +--- STOPPING <--stop()----------------------------+
//! ```
//!
//! `request_stop` and `request_restart` only flip the state; the host observes
//! the change through [`EngineModel::subscribe_state`] and drives `stop()`
//! (plus reconfiguration for a restart). `read_config`, `clear_config`,
//! `start` and `stop` are serialised by a lifecycle lock, and the registries
//! only change while the engine is idle.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::channel::{ArchiveChannel, ChannelDiagnostics};
use crate::core::error::{ConfigError, ConfigErrorKind, EngineError};
use crate::core::group::ArchiveGroup;
use crate::core::registry::Registry;
use crate::core::services::{
    AuditSink, ChannelConfigStore, EngineDescriptor, GroupDescriptor, MgmtEventKind, SampleSink,
    ValueSource,
};
use crate::core::settings::{EngineSettings, DEFAULT_ENGINE_NAME};
use crate::core::state::{EngineState, StateCell, Transition};
use crate::core::write_scheduler::{WriteScheduler, WriteStats};

/// The collaborators an engine is built with.
#[derive(Clone)]
pub struct EngineServices {
    pub config_store: Arc<dyn ChannelConfigStore>,
    pub sink: Arc<dyn SampleSink>,
    pub audit: Arc<dyn AuditSink>,
    pub source: Arc<dyn ValueSource>,
}

/// Serializable summary of the engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub name: String,
    pub state: EngineState,
    pub engine_id: Option<i64>,
    pub start_time: Option<DateTime<Utc>>,
    pub groups: usize,
    pub channels: usize,
    pub write_period_secs: u64,
    pub batch_size: usize,
    pub max_repeats: u32,
    pub write_stats: WriteStats,
}

pub struct EngineModel {
    settings: EngineSettings,
    name: RwLock<String>,
    state: StateCell,
    start_time: RwLock<Option<DateTime<Utc>>>,
    engine: RwLock<Option<EngineDescriptor>>,
    channels: Registry<ArchiveChannel>,
    groups: Registry<ArchiveGroup>,
    writer: Arc<WriteScheduler>,
    config_store: Arc<dyn ChannelConfigStore>,
    audit: Arc<dyn AuditSink>,
    source: Arc<dyn ValueSource>,
    lifecycle: tokio::sync::Mutex<()>,
    shutdown: Mutex<CancellationToken>,
}

impl EngineModel {
    pub fn new(settings: EngineSettings, services: EngineServices) -> Self {
        let writer = Arc::new(WriteScheduler::new(
            services.sink,
            settings.batch_size(),
            settings.write_timeout(),
        ));
        Self {
            settings,
            name: RwLock::new(DEFAULT_ENGINE_NAME.to_string()),
            state: StateCell::new(),
            start_time: RwLock::new(None),
            engine: RwLock::new(None),
            channels: Registry::new(),
            groups: Registry::new(),
            writer,
            config_store: services.config_store,
            audit: services.audit,
            source: services.source,
            lifecycle: tokio::sync::Mutex::new(()),
            shutdown: Mutex::new(CancellationToken::new()),
        }
    }

    // --- Accessors ---

    pub fn name(&self) -> String {
        self.name.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn state(&self) -> EngineState {
        self.state.get()
    }

    /// Receiver that wakes on every accepted state change.
    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        *self.start_time.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn engine_id(&self) -> Option<i64> {
        self.engine
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|e| e.id)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn write_period(&self) -> Duration {
        self.settings.write_period()
    }

    pub fn batch_size(&self) -> usize {
        self.settings.batch_size()
    }

    pub fn max_repeats(&self) -> u32 {
        self.settings.max_repeats
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn group(&self, name: &str) -> Option<Arc<ArchiveGroup>> {
        self.groups.get(name)
    }

    pub fn channel(&self, name: &str) -> Option<Arc<ArchiveChannel>> {
        self.channels.get(name)
    }

    pub fn groups(&self) -> Vec<Arc<ArchiveGroup>> {
        self.groups.snapshot()
    }

    pub fn channels(&self) -> Vec<Arc<ArchiveChannel>> {
        self.channels.snapshot()
    }

    pub fn last_write_time(&self) -> Option<DateTime<Utc>> {
        self.writer.last_write_time()
    }

    pub fn avg_write_count(&self) -> f64 {
        self.writer.avg_write_count()
    }

    pub fn avg_write_duration(&self) -> Duration {
        self.writer.avg_write_duration()
    }

    pub fn write_stats(&self) -> WriteStats {
        self.writer.stats()
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            name: self.name(),
            state: self.state(),
            engine_id: self.engine_id(),
            start_time: self.start_time(),
            groups: self.group_count(),
            channels: self.channel_count(),
            write_period_secs: self.write_period().as_secs(),
            batch_size: self.batch_size(),
            max_repeats: self.max_repeats(),
            write_stats: self.write_stats(),
        }
    }

    fn set_start_time(&self, value: Option<DateTime<Utc>>) {
        *self.start_time.write().unwrap_or_else(PoisonError::into_inner) = value;
    }

    fn current_shutdown(&self) -> CancellationToken {
        self.shutdown.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn renew_shutdown(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.shutdown.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();
        token
    }

    // --- Configuration ---

    /// # Read Configuration
    ///
    /// Loads the engine, its groups and their channels from the configuration
    /// store. Only allowed while idle.
    ///
    /// ## Workflow:
    /// 1. Resolve the engine descriptor by name and compare its URL port with
    ///    `port`. An unknown engine or a mismatch fails before any registry change.
    /// 2. For each group (in store order), create or fetch the group, then for
    ///    each channel resolve the registered one or build it from the
    ///    descriptor. New channels are registered with the write scheduler and
    ///    the channel registry, and appended to the group.
    /// 3. Any failure aborts with a [`ConfigError`]. Groups and channels
    ///    configured before the failure stay registered; call
    ///    [`clear_config`](Self::clear_config) before retrying.
    pub async fn read_config(&self, engine_name: &str, port: u16) -> Result<(), EngineError> {
        self.state.require("read_config", EngineState::Idle)?;
        let _lifecycle = self
            .lifecycle
            .try_lock()
            .map_err(|_| EngineError::Busy { operation: "read_config" })?;
        self.state.require("read_config", EngineState::Idle)?;

        match self.configure(engine_name, port).await {
            Ok(()) => {
                *self.name.write().unwrap_or_else(PoisonError::into_inner) = engine_name.to_string();
                info!(
                    engine = engine_name,
                    groups = self.group_count(),
                    channels = self.channel_count(),
                    "Engine configuration loaded"
                );
                Ok(())
            }
            Err(e) => {
                error!(engine = engine_name, kind = ?e.kind, error = %e, "Engine configuration failed");
                Err(e.into())
            }
        }
    }

    async fn configure(&self, engine_name: &str, port: u16) -> Result<(), ConfigError> {
        let engine = self.config_store.find_engine(engine_name).await?.ok_or_else(|| {
            ConfigError::new(
                ConfigErrorKind::UnknownEngine,
                format!("unknown engine '{engine_name}'"),
            )
        })?;

        let configured_port = engine.port()?;
        if configured_port != port {
            return Err(ConfigError::new(
                ConfigErrorKind::PortMismatch,
                format!(
                    "engine '{}' is configured for port {} but runs on port {}",
                    engine.name, configured_port, port
                ),
            ));
        }

        let engine_id = engine.id;
        *self.engine.write().unwrap_or_else(PoisonError::into_inner) = Some(engine);

        let groups = self.config_store.groups_for_engine(engine_id).await?;
        for group in &groups {
            self.configure_group(group).await?;
        }
        Ok(())
    }

    async fn configure_group(&self, desc: &GroupDescriptor) -> Result<(), ConfigError> {
        let group = self
            .groups
            .get_or_insert_with(&desc.name, || ArchiveGroup::from_descriptor(desc));

        let channels = self.config_store.channels_by_group_id(desc.id).await?;
        for channel_desc in &channels {
            let channel = match self.channels.get(&channel_desc.name) {
                Some(existing) => {
                    if existing.id() != channel_desc.id {
                        warn!(
                            channel = %channel_desc.name,
                            group = %desc.name,
                            "Channel already configured by another group, keeping first definition"
                        );
                    }
                    existing
                }
                None => {
                    let created = Arc::new(ArchiveChannel::from_descriptor(channel_desc, &self.settings)?);
                    self.writer.add_channel(Arc::clone(&created));
                    self.channels.insert_if_absent(created)
                }
            };
            group.add(channel);
        }
        debug!(group = %desc.name, channels = group.len(), "Group configured");
        Ok(())
    }

    /// Drops every group and channel. Only allowed while idle.
    pub async fn clear_config(&self) -> Result<(), EngineError> {
        self.state.require("clear_config", EngineState::Idle)?;
        let _lifecycle = self
            .lifecycle
            .try_lock()
            .map_err(|_| EngineError::Busy { operation: "clear_config" })?;
        self.state.require("clear_config", EngineState::Idle)?;

        self.groups.clear();
        self.channels.clear();
        self.writer.clear_channels();
        self.config_store.invalidate_cache();
        *self.engine.write().unwrap_or_else(PoisonError::into_inner) = None;
        info!("Engine configuration cleared");
        Ok(())
    }

    // --- Lifecycle ---

    /// # Start
    ///
    /// Moves the engine from `IDLE` to `RUNNING`, starts the write scheduler
    /// and then every group in registration order. A `request_stop()` (or a
    /// concurrent `stop()`) arriving while groups are starting ends the pass
    /// after the current group; the host then performs the stop.
    pub async fn start(&self) -> Result<(), EngineError> {
        let _lifecycle = self.lifecycle.lock().await;
        let engine_id = self.engine_id().ok_or(EngineError::NotConfigured)?;
        self.state.require("start", EngineState::Idle)?;
        // The token must exist before RUNNING becomes visible to request_stop().
        let shutdown = self.renew_shutdown();
        self.state.transition(Transition::Start)?;

        self.set_start_time(Some(Utc::now()));
        self.writer.start(self.settings.write_period());
        info!(engine = %self.name(), groups = self.group_count(), "Archive engine starting");

        for group in self.groups.snapshot() {
            let report = group
                .start(
                    engine_id,
                    MgmtEventKind::ArchiverStart,
                    &self.source,
                    self.audit.as_ref(),
                    &shutdown,
                )
                .await;
            if report.aborted || shutdown.is_cancelled() || self.state() != EngineState::Running {
                info!(group = %group.name(), "Shutdown requested, remaining groups not started");
                break;
            }
        }
        info!(engine = %self.name(), state = %self.state(), "Archive engine started");
        Ok(())
    }

    /// Flags a shutdown for the host to act on. Allowed while running or
    /// while a restart is pending.
    pub fn request_stop(&self) -> Result<(), EngineError> {
        self.state.transition(Transition::RequestStop)?;
        self.current_shutdown().cancel();
        info!(engine = %self.name(), "Shutdown requested");
        Ok(())
    }

    /// Flags a restart for the host to act on. Allowed while running.
    pub fn request_restart(&self) -> Result<(), EngineError> {
        self.state.transition(Transition::RequestRestart)?;
        info!(engine = %self.name(), "Restart requested");
        Ok(())
    }

    /// # Stop
    ///
    /// Stops every group, shuts the write scheduler down with a final flush and
    /// returns to `IDLE`. A no-op when already idle.
    ///
    /// Group and scheduler failures (including panics) are logged and skipped,
    /// so a stop that got past the state check always ends in `IDLE`.
    pub async fn stop(&self) -> Result<(), EngineError> {
        self.current_shutdown().cancel();
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() == EngineState::Idle {
            debug!("Stop requested while idle");
            return Ok(());
        }
        self.state.transition(Transition::BeginStop)?;
        let engine_id = self.engine_id().unwrap_or_default();
        info!(engine = %self.name(), "Archive engine stopping");

        for group in self.groups.snapshot() {
            let name = group.name().to_string();
            let source = Arc::clone(&self.source);
            let audit = Arc::clone(&self.audit);
            let stopping = tokio::spawn(async move {
                group
                    .stop(engine_id, MgmtEventKind::ArchiverStop, &source, audit.as_ref())
                    .await
            });
            match stopping.await {
                Ok(report) if report.failed > 0 => {
                    warn!(group = %name, failed = report.failed, "Group did not stop cleanly")
                }
                Ok(_) => {}
                Err(e) => error!(group = %name, error = %e, "Group stop aborted"),
            }
        }

        let writer = Arc::clone(&self.writer);
        match tokio::spawn(async move { writer.shutdown().await }).await {
            Ok(report) if report.failed() => {
                warn!(lost = report.drained, "Final flush failed")
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Write scheduler shutdown aborted"),
        }

        self.set_start_time(None);
        self.state.transition(Transition::FinishStop)?;
        info!(engine = %self.name(), "Archive engine stopped");
        Ok(())
    }

    /// Zeroes scheduler statistics and channel counters. No state change.
    pub fn reset(&self) {
        self.writer.reset();
        for channel in self.channels.snapshot() {
            channel.reset();
        }
        info!("Engine statistics reset");
    }

    /// Snapshot of every channel, also written to the log.
    pub fn dump_debug_info(&self) -> Vec<ChannelDiagnostics> {
        let dump: Vec<ChannelDiagnostics> = self
            .channels
            .snapshot()
            .iter()
            .map(|c| c.diagnostics())
            .collect();

        info!(engine = %self.name(), state = %self.state(), channels = dump.len(), "Debug dump");
        for d in &dump {
            info!(
                channel = %d.name,
                groups = ?d.groups,
                mode = %d.mode,
                enabled = d.enabled,
                connected = d.connected,
                value = ?d.current_value.as_ref().map(|s| s.to_string()),
                last_stored = ?d.last_archived.as_ref().map(|s| s.to_string()),
                buffered = d.buffered,
                "Channel"
            );
        }
        dump
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::memory::{
        MemoryAuditSink, MemoryConfigStore, MemorySampleSink, MemoryValueSource,
    };
    use crate::core::services::ChannelDescriptor;

    fn services(store: MemoryConfigStore) -> EngineServices {
        EngineServices {
            config_store: Arc::new(store),
            sink: Arc::new(MemorySampleSink::new()),
            audit: Arc::new(MemoryAuditSink::new()),
            source: Arc::new(MemoryValueSource::new()),
        }
    }

    fn store() -> MemoryConfigStore {
        let store = MemoryConfigStore::new();
        store.add_engine(EngineDescriptor {
            id: 1,
            name: "main".into(),
            url: "http://localhost:4812/main".into(),
        });
        store.add_group(1, GroupDescriptor { id: 10, name: "g".into() });
        store.add_channel(
            10,
            ChannelDescriptor {
                id: 100,
                name: "PV:1".into(),
                sample_mode: "monitor".into(),
                sample_value: 0.0,
                sample_period: 1.0,
                last_archived_time: None,
                enablement: Default::default(),
            },
        );
        store
    }

    #[tokio::test]
    async fn test_start_requires_configuration() {
        let engine = EngineModel::new(EngineSettings::default(), services(store()));
        assert!(matches!(engine.start().await, Err(EngineError::NotConfigured)));
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn test_start_stop_round_trip() {
        let engine = EngineModel::new(EngineSettings::default(), services(store()));
        engine.read_config("main", 4812).await.unwrap();
        engine.start().await.unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        assert!(engine.start_time().is_some());
        assert!(engine.channel("PV:1").unwrap().is_connected());

        engine.stop().await.unwrap();
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(engine.start_time().is_none());
        assert!(!engine.channel("PV:1").unwrap().is_connected());
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let engine = EngineModel::new(EngineSettings::default(), services(store()));
        engine.stop().await.unwrap();
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn test_status_reflects_configuration() {
        let engine = EngineModel::new(EngineSettings::default(), services(store()));
        engine.read_config("main", 4812).await.unwrap();
        let status = engine.status();
        assert_eq!(status.name, "main");
        assert_eq!(status.engine_id, Some(1));
        assert_eq!((status.groups, status.channels), (1, 1));
        assert_eq!(status.batch_size, 500);
    }
}
