//! # Archive Group
//!
//! A named, ordered cohort of channels that start and stop together. Channels
//! are shared: one channel may belong to several groups, and a group never
//! owns the channels it lists.

use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::channel::ArchiveChannel;
use crate::core::registry::Named;
use crate::core::services::{AuditSink, Enablement, GroupDescriptor, MgmtEventKind, ValueSource};

/// Outcome of a group start or stop pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GroupRunReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// The pass stopped early because shutdown was requested.
    pub aborted: bool,
}

pub struct ArchiveGroup {
    id: i64,
    name: String,
    channels: RwLock<Vec<Arc<ArchiveChannel>>>,
    enabled: AtomicBool,
}

impl Named for ArchiveGroup {
    fn name(&self) -> &str {
        &self.name
    }
}

impl ArchiveGroup {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            channels: RwLock::new(Vec::new()),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn from_descriptor(desc: &GroupDescriptor) -> Self {
        Self::new(desc.id, desc.name.clone())
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends `channel` unless a channel of that name is already a member.
    pub fn add(self: &Arc<Self>, channel: Arc<ArchiveChannel>) -> bool {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        if channels.iter().any(|c| c.name() == channel.name()) {
            return false;
        }
        channel.add_group(self);
        channels.push(channel);
        true
    }

    pub fn channels(&self) -> Vec<Arc<ArchiveChannel>> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.channels.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Enables or disables archiving for the group's passive members.
    ///
    /// Channels that control enablement themselves keep running so they can
    /// flip the group back. Returns `true` when the flag changed.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        if self.enabled.swap(enabled, Ordering::AcqRel) == enabled {
            return false;
        }
        info!(group = %self.name, enabled, "Group enablement changed");
        for channel in self.channels() {
            if channel.enablement() == Enablement::Passive {
                channel.set_enabled(enabled);
            }
        }
        true
    }

    /// # Start
    ///
    /// Connects every member in order, then records `kind` for `engine_id`.
    ///
    /// ## Workflow:
    /// 1. Before each channel, `shutdown` is checked; a cancelled token ends the
    ///    pass and marks the report as aborted.
    /// 2. A channel that fails to connect is logged and skipped.
    /// 3. The management event is recorded even for a partial pass; an audit
    ///    failure is logged only.
    pub async fn start(
        &self,
        engine_id: i64,
        kind: MgmtEventKind,
        source: &Arc<dyn ValueSource>,
        audit: &dyn AuditSink,
        shutdown: &CancellationToken,
    ) -> GroupRunReport {
        let mut report = GroupRunReport::default();
        for channel in self.channels() {
            if shutdown.is_cancelled() {
                info!(group = %self.name, "Shutdown requested, remaining channels not started");
                report.aborted = true;
                break;
            }
            report.attempted += 1;
            match channel.start(source).await {
                Ok(()) => report.succeeded += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(group = %self.name, error = %e, "Channel start failed");
                }
            }
        }
        self.record(engine_id, kind, audit).await;
        info!(
            group = %self.name,
            started = report.succeeded,
            failed = report.failed,
            "Group started"
        );
        report
    }

    /// Disconnects every member in order and records `kind`. Never stops early.
    pub async fn stop(
        &self,
        engine_id: i64,
        kind: MgmtEventKind,
        source: &Arc<dyn ValueSource>,
        audit: &dyn AuditSink,
    ) -> GroupRunReport {
        let mut report = GroupRunReport::default();
        for channel in self.channels() {
            report.attempted += 1;
            match channel.stop(source).await {
                Ok(()) => report.succeeded += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(group = %self.name, error = %e, "Channel stop failed");
                }
            }
        }
        self.record(engine_id, kind, audit).await;
        info!(group = %self.name, stopped = report.succeeded, failed = report.failed, "Group stopped");
        report
    }

    async fn record(&self, engine_id: i64, kind: MgmtEventKind, audit: &dyn AuditSink) {
        if let Err(e) = audit.record_event(engine_id, kind, Utc::now()).await {
            warn!(group = %self.name, event = %kind, error = %e, "Management event not recorded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::memory::{MemoryAuditSink, MemoryValueSource};
    use crate::core::sample::SampleValue;
    use crate::core::sample_mode::SampleMode;
    use std::time::Duration;

    fn channel(name: &str, enablement: Enablement) -> Arc<ArchiveChannel> {
        Arc::new(ArchiveChannel::new(
            0,
            name,
            SampleMode::Monitor,
            enablement,
            8,
            Duration::from_secs(3600),
        ))
    }

    #[test]
    fn test_add_is_idempotent_by_name() {
        let group = Arc::new(ArchiveGroup::new(1, "vacuum"));
        assert!(group.add(channel("PV:1", Enablement::Passive)));
        assert!(!group.add(channel("PV:1", Enablement::Passive)));
        assert!(group.add(channel("PV:2", Enablement::Passive)));
        assert_eq!(group.len(), 2);
    }

    #[test]
    fn test_enabling_channel_controls_its_group() {
        let group = Arc::new(ArchiveGroup::new(1, "beam"));
        let switch = channel("BEAM:ON", Enablement::Enabling);
        let member = channel("BEAM:CURRENT", Enablement::Passive);
        group.add(Arc::clone(&switch));
        group.add(Arc::clone(&member));

        switch.ingest(SampleValue::Long(0), Utc::now());
        assert!(!group.is_enabled());
        assert!(!member.is_enabled());
        assert!(switch.is_enabled());

        switch.ingest(SampleValue::Long(1), Utc::now());
        assert!(group.is_enabled());
        assert!(member.is_enabled());
    }

    #[tokio::test]
    async fn test_start_and_stop_record_events_and_isolate_failures() {
        let group = Arc::new(ArchiveGroup::new(7, "cryo"));
        group.add(channel("PV:OK", Enablement::Passive));
        group.add(channel("PV:BROKEN", Enablement::Passive));

        let memory = Arc::new(MemoryValueSource::new());
        memory.fail_channel("PV:BROKEN");
        let source: Arc<dyn ValueSource> = memory.clone();
        let audit = MemoryAuditSink::new();

        let report = group
            .start(3, MgmtEventKind::ArchiverStart, &source, &audit, &CancellationToken::new())
            .await;
        assert_eq!(report.attempted, 2);
        assert_eq!(report.failed, 1);
        assert!(memory.is_subscribed("PV:OK"));

        let report = group.stop(3, MgmtEventKind::ArchiverStop, &source, &audit).await;
        assert_eq!(report.attempted, 2);
        assert!(!memory.is_subscribed("PV:OK"));

        let kinds: Vec<_> = audit.events().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![MgmtEventKind::ArchiverStart, MgmtEventKind::ArchiverStop]);
    }

    #[tokio::test]
    async fn test_start_observes_shutdown_between_channels() {
        let group = Arc::new(ArchiveGroup::new(7, "cryo"));
        group.add(channel("PV:A", Enablement::Passive));
        group.add(channel("PV:B", Enablement::Passive));
        let source: Arc<dyn ValueSource> = Arc::new(MemoryValueSource::new());
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let report = group
            .start(1, MgmtEventKind::ArchiverStart, &source, &MemoryAuditSink::new(), &shutdown)
            .await;
        assert!(report.aborted);
        assert_eq!(report.attempted, 0);
    }
}
