//! # Collaborator Contracts
//!
//! The engine never talks to a database, a broker or a control system
//! directly. Everything outside the process is reached through the traits in
//! this module, injected once into
//! [`EngineModel::new`](crate::core::engine_model::EngineModel::new):
//!
//! - **[`ChannelConfigStore`]**: engine, group and channel descriptors.
//! - **[`SampleSink`]**: batched persistence of drained samples.
//! - **[`AuditSink`]**: archiver start/stop management events.
//! - **[`ValueSource`]**: live subscriptions and one-shot reads of channel values.
//!
//! Implementations live in [`crate::connections`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use url::Url;

use crate::core::error::{
    AuditError, ConfigError, ConfigErrorKind, SinkError, SourceError, StoreError,
};
use crate::core::sample::{ArchiveSample, Sample, SampleValue};

/// An archive engine as recorded in the configuration store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineDescriptor {
    pub id: i64,
    pub name: String,
    /// Management URL; its port identifies which process may run this engine.
    pub url: String,
}

impl EngineDescriptor {
    /// Port of the management URL, falling back to the scheme's default.
    pub fn port(&self) -> Result<u16, ConfigError> {
        let url = Url::parse(&self.url).map_err(|e| {
            ConfigError::with_source(
                ConfigErrorKind::MalformedDescriptor,
                format!("engine '{}' has url '{}'", self.name, self.url),
                e,
            )
        })?;
        url.port_or_known_default().ok_or_else(|| {
            ConfigError::new(
                ConfigErrorKind::MalformedDescriptor,
                format!("engine '{}' url '{}' carries no port", self.name, self.url),
            )
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupDescriptor {
    pub id: i64,
    pub name: String,
}

/// How a channel influences the groups it belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Enablement {
    /// Never touches its groups.
    #[default]
    Passive,
    /// A non-zero value enables its groups, zero disables them.
    Enabling,
    /// A non-zero value disables its groups, zero enables them.
    Disabling,
}

impl Enablement {
    /// Group state requested by `value`, `None` for passive channels.
    pub fn requested_group_state(&self, value: &SampleValue) -> Option<bool> {
        match self {
            Enablement::Passive => None,
            Enablement::Enabling => Some(value.is_nonzero()),
            Enablement::Disabling => Some(!value.is_nonzero()),
        }
    }
}

impl FromStr for Enablement {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "passive" => Ok(Enablement::Passive),
            "enabling" | "enable" => Ok(Enablement::Enabling),
            "disabling" | "disable" => Ok(Enablement::Disabling),
            other => Err(format!("unknown enablement '{other}'")),
        }
    }
}

impl fmt::Display for Enablement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Enablement::Passive => f.write_str("Passive"),
            Enablement::Enabling => f.write_str("Enabling"),
            Enablement::Disabling => f.write_str("Disabling"),
        }
    }
}

/// A channel as recorded in the configuration store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    pub id: i64,
    pub name: String,
    /// `"monitor"` or `"scan"`.
    pub sample_mode: String,
    /// Delta threshold for monitored channels, `0` for none.
    #[serde(default)]
    pub sample_value: f64,
    /// Expected update period (monitor) or scan period (scan), in seconds.
    #[serde(default)]
    pub sample_period: f64,
    /// Timestamp of the newest sample already in the archive.
    #[serde(default)]
    pub last_archived_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub enablement: Enablement,
}

/// Management events recorded by groups on start and stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MgmtEventKind {
    ArchiverStart,
    ArchiverStop,
}

impl MgmtEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MgmtEventKind::ArchiverStart => "ARCHIVER_START",
            MgmtEventKind::ArchiverStop => "ARCHIVER_STOP",
        }
    }
}

impl fmt::Display for MgmtEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait ChannelConfigStore: Send + Sync {
    async fn find_engine(&self, name: &str) -> Result<Option<EngineDescriptor>, StoreError>;

    /// Groups of an engine, in configuration order.
    async fn groups_for_engine(&self, engine_id: i64) -> Result<Vec<GroupDescriptor>, StoreError>;

    /// Channels of a group, in configuration order.
    async fn channels_by_group_id(&self, group_id: i64) -> Result<Vec<ChannelDescriptor>, StoreError>;

    /// Forgets anything cached from earlier reads, so the next read sees the
    /// stored configuration as it is now.
    fn invalidate_cache(&self) {}
}

#[async_trait]
pub trait SampleSink: Send + Sync {
    /// Persists one batch. Returns the number of samples written.
    async fn write_batch(&self, samples: &[ArchiveSample]) -> Result<usize, SinkError>;
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record_event(
        &self,
        engine_id: i64,
        kind: MgmtEventKind,
        timestamp: DateTime<Utc>,
    ) -> Result<(), AuditError>;
}

/// Receiver of live values for one channel.
///
/// Called from the value source's own tasks; implementations must not block.
pub trait SampleListener: Send + Sync {
    fn on_value(&self, value: SampleValue, timestamp: DateTime<Utc>);

    fn on_connection(&self, connected: bool);
}

#[async_trait]
pub trait ValueSource: Send + Sync {
    /// Starts delivering updates of `channel` to `listener` until unsubscribed.
    async fn subscribe(&self, channel: &str, listener: Arc<dyn SampleListener>) -> Result<(), SourceError>;

    async fn unsubscribe(&self, channel: &str) -> Result<(), SourceError>;

    /// Reads the current value of `channel` once.
    async fn read(&self, channel: &str) -> Result<Sample, SourceError>;
}
