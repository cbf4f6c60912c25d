//! # Archive Channel
//!
//! One monitored process variable: its subscription (or scan task), the filter
//! that decides what is archived, and the bounded buffer the write scheduler
//! drains.
//!
//! ## Ingestion path
//!
//! 1. The value source (or the scan task) delivers a value with its timestamp.
//! 2. The time guard rejects samples older than the newest one already
//!    buffered or archived, and samples too far in the future.
//! 3. The current value is updated. Disabled channels stop here.
//! 4. The [`SampleMode`] filter decides between buffering and suppression.
//! 5. Enabling/disabling channels forward the value's truthiness to their groups.
//!
//! The channel's own lock and the buffer's lock are never held together, so
//! ingestion and [`drain`](ArchiveChannel::drain) only contend for the short
//! buffer critical section.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::error::{ChannelError, ConfigError, SourceError};
use crate::core::group::ArchiveGroup;
use crate::core::registry::Named;
use crate::core::sample::{Sample, SampleValue};
use crate::core::sample_buffer::SampleBuffer;
use crate::core::sample_mode::{Admission, FilterState, SampleMode};
use crate::core::services::{ChannelDescriptor, Enablement, SampleListener, ValueSource};
use crate::core::settings::EngineSettings;

/// What happened to one ingested value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Buffered,
    /// Buffered, evicting the oldest sample.
    BufferedWithDrop,
    Suppressed,
    /// Failed the time guard.
    Rejected,
    /// Channel disabled by its group; only the current value was updated.
    Disabled,
}

/// Snapshot of a channel's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelCounters {
    pub received: u64,
    pub written: u64,
    pub dropped: u64,
    pub suppressed: u64,
    pub rejected: u64,
}

/// Read-only view of a channel for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelDiagnostics {
    pub name: String,
    pub groups: Vec<String>,
    pub mode: String,
    pub enablement: Enablement,
    pub enabled: bool,
    pub connected: bool,
    pub current_value: Option<Sample>,
    pub last_archived: Option<Sample>,
    pub buffered: usize,
    pub capacity: usize,
    pub counters: ChannelCounters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Rejected,
    Disabled,
    Admitted(Admission),
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    written: AtomicU64,
    suppressed: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Default)]
struct ChannelState {
    current: Option<Sample>,
    last_archived: Option<Sample>,
    last_archived_time: Option<DateTime<Utc>>,
    last_buffered_time: Option<DateTime<Utc>>,
    filter: FilterState,
}

struct ScanTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct ArchiveChannel {
    id: i64,
    name: String,
    mode: SampleMode,
    enablement: Enablement,
    ignored_future: chrono::Duration,
    buffer: SampleBuffer,
    connected: AtomicBool,
    enabled: AtomicBool,
    /// Set between `start` and `stop`; source callbacks outside it are dropped.
    active: AtomicBool,
    state: Mutex<ChannelState>,
    groups: RwLock<Vec<Weak<ArchiveGroup>>>,
    counters: Counters,
    scan_task: Mutex<Option<ScanTask>>,
}

impl Named for ArchiveChannel {
    fn name(&self) -> &str {
        &self.name
    }
}

impl ArchiveChannel {
    pub fn new(
        id: i64,
        name: impl Into<String>,
        mode: SampleMode,
        enablement: Enablement,
        capacity: usize,
        ignored_future: Duration,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            mode,
            enablement,
            ignored_future: chrono::Duration::from_std(ignored_future)
                .unwrap_or(chrono::Duration::MAX),
            buffer: SampleBuffer::new(capacity),
            connected: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
            active: AtomicBool::new(false),
            state: Mutex::new(ChannelState::default()),
            groups: RwLock::new(Vec::new()),
            counters: Counters::default(),
            scan_task: Mutex::new(None),
        }
    }

    /// Builds a channel from its stored descriptor.
    pub fn from_descriptor(desc: &ChannelDescriptor, settings: &EngineSettings) -> Result<Self, ConfigError> {
        let mode = SampleMode::from_descriptor(desc, settings.max_repeats)?;
        let capacity = SampleBuffer::capacity_for(
            settings.write_period(),
            SampleMode::update_period(desc),
            settings.buffer_reserve,
        );
        let channel = Self::new(
            desc.id,
            desc.name.clone(),
            mode,
            desc.enablement,
            capacity,
            settings.ignored_future(),
        );
        channel.lock_state().last_archived_time = desc.last_archived_time;
        Ok(channel)
    }

    fn lock_state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> &SampleMode {
        &self.mode
    }

    pub fn enablement(&self) -> Enablement {
        self.enablement
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        if self.enabled.swap(enabled, Ordering::AcqRel) != enabled {
            debug!(channel = %self.name, enabled, "Channel enablement changed");
        }
    }

    pub fn current_value(&self) -> Option<Sample> {
        self.lock_state().current.clone()
    }

    pub fn last_archived_value(&self) -> Option<Sample> {
        self.lock_state().last_archived.clone()
    }

    pub fn buffered_count(&self) -> usize {
        self.buffer.len()
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Records membership in `group`; repeated calls for the same group are ignored.
    pub fn add_group(&self, group: &Arc<ArchiveGroup>) {
        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        let known = groups
            .iter()
            .filter_map(Weak::upgrade)
            .any(|g| g.name() == group.name());
        if !known {
            groups.push(Arc::downgrade(group));
        }
    }

    fn member_groups(&self) -> Vec<Arc<ArchiveGroup>> {
        self.groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Names of the groups this channel belongs to.
    pub fn group_names(&self) -> Vec<String> {
        self.member_groups()
            .iter()
            .map(|g| g.name().to_string())
            .collect()
    }

    pub fn counters(&self) -> ChannelCounters {
        ChannelCounters {
            received: self.counters.received.load(Ordering::Relaxed),
            written: self.counters.written.load(Ordering::Relaxed),
            dropped: self.buffer.dropped_count(),
            suppressed: self.counters.suppressed.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    /// Zeroes the counters. Buffer contents and values are left alone.
    pub fn reset(&self) {
        self.counters.received.store(0, Ordering::Relaxed);
        self.counters.written.store(0, Ordering::Relaxed);
        self.counters.suppressed.store(0, Ordering::Relaxed);
        self.counters.rejected.store(0, Ordering::Relaxed);
        self.buffer.reset_counters();
    }

    /// Offers one value to the channel.
    pub fn ingest(&self, value: SampleValue, timestamp: DateTime<Utc>) -> IngestOutcome {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        let sample = Sample::new(value, timestamp);
        let verdict = {
            let mut state = self.lock_state();
            if self.violates_time_guard(&state, timestamp) {
                Verdict::Rejected
            } else {
                state.current = Some(sample.clone());
                if self.is_enabled() {
                    let admission = self.mode.admit(&sample.value, &mut state.filter);
                    if admission == Admission::Buffer {
                        state.last_buffered_time = Some(timestamp);
                    }
                    Verdict::Admitted(admission)
                } else {
                    Verdict::Disabled
                }
            }
        };

        if verdict == Verdict::Rejected {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(channel = %self.name, %timestamp, "Sample rejected by time guard");
            return IngestOutcome::Rejected;
        }
        self.forward_enablement(&sample.value);

        match verdict {
            Verdict::Admitted(Admission::Buffer) => {
                if self.buffer.push(sample) {
                    IngestOutcome::Buffered
                } else {
                    IngestOutcome::BufferedWithDrop
                }
            }
            Verdict::Admitted(Admission::Suppress) => {
                self.counters.suppressed.fetch_add(1, Ordering::Relaxed);
                IngestOutcome::Suppressed
            }
            Verdict::Disabled | Verdict::Rejected => IngestOutcome::Disabled,
        }
    }

    fn violates_time_guard(&self, state: &ChannelState, timestamp: DateTime<Utc>) -> bool {
        let newest = state.last_archived_time.max(state.last_buffered_time);
        if newest.is_some_and(|last| timestamp < last) {
            return true;
        }
        Utc::now()
            .checked_add_signed(self.ignored_future)
            .is_some_and(|limit| timestamp > limit)
    }

    fn forward_enablement(&self, value: &SampleValue) {
        if let Some(enable) = self.enablement.requested_group_state(value) {
            for group in self.member_groups() {
                group.set_enabled(enable);
            }
        }
    }

    /// Removes up to `max` samples in arrival order for persistence.
    pub fn drain(&self, max: usize) -> Vec<Sample> {
        let drained = self.buffer.drain(max);
        if let Some(last) = drained.last() {
            self.counters
                .written
                .fetch_add(drained.len() as u64, Ordering::Relaxed);
            let mut state = self.lock_state();
            state.last_archived_time = Some(last.timestamp);
            state.last_archived = Some(last.clone());
        }
        drained
    }

    /// Connects the channel to `source`.
    ///
    /// Monitored channels subscribe with themselves as listener. Scanned
    /// channels read once (a failed read is a failed connect) and then poll on
    /// a background task until [`stop`](Self::stop).
    pub async fn start(self: &Arc<Self>, source: &Arc<dyn ValueSource>) -> Result<(), ChannelError> {
        self.active.store(true, Ordering::Release);
        let result = match &self.mode {
            SampleMode::Scan { period, .. } => self.start_scan(source, *period).await,
            SampleMode::Monitor | SampleMode::Delta { .. } => {
                let listener: Arc<dyn SampleListener> = Arc::clone(self) as Arc<dyn SampleListener>;
                source.subscribe(&self.name, listener).await.map(|()| {
                    self.connected.store(true, Ordering::Release);
                })
            }
        };
        match result {
            Ok(()) => {
                debug!(channel = %self.name, mode = %self.mode, "Channel started");
                Ok(())
            }
            Err(source) => {
                self.active.store(false, Ordering::Release);
                Err(ChannelError::Connect {
                    channel: self.name.clone(),
                    source,
                })
            }
        }
    }

    async fn start_scan(self: &Arc<Self>, source: &Arc<dyn ValueSource>, period: Duration) -> Result<(), SourceError> {
        let first = source.read(&self.name).await?;
        self.connected.store(true, Ordering::Release);
        self.ingest(first.value, first.timestamp);

        let token = CancellationToken::new();
        let channel = Arc::clone(self);
        let source = Arc::clone(source);
        let loop_token = token.clone();
        let handle = tokio::spawn(async move { channel.run_scan(source, period, loop_token).await });

        let previous = self
            .scan_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(ScanTask { token, handle });
        if let Some(previous) = previous {
            previous.token.cancel();
        }
        Ok(())
    }

    async fn run_scan(&self, source: Arc<dyn ValueSource>, period: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; the initial read already covered it.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let read = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                read = source.read(&self.name) => read,
            };
            match read {
                Ok(sample) => {
                    self.on_connection(true);
                    self.on_value(sample.value, sample.timestamp);
                }
                Err(e) => {
                    if self.connected.swap(false, Ordering::AcqRel) {
                        warn!(channel = %self.name, error = %e, "Scan read failed");
                    }
                }
            }
        }
        debug!(channel = %self.name, "Scan task finished");
    }

    /// Disconnects the channel. Always leaves it disconnected; values
    /// delivered afterwards are ignored.
    pub async fn stop(&self, source: &Arc<dyn ValueSource>) -> Result<(), ChannelError> {
        self.active.store(false, Ordering::Release);
        let result = match &self.mode {
            SampleMode::Scan { .. } => {
                let task = self
                    .scan_task
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                if let Some(task) = task {
                    task.token.cancel();
                    if let Err(e) = task.handle.await {
                        warn!(channel = %self.name, error = %e, "Scan task ended abnormally");
                    }
                }
                Ok(())
            }
            SampleMode::Monitor | SampleMode::Delta { .. } => source
                .unsubscribe(&self.name)
                .await
                .map_err(|source| ChannelError::Disconnect {
                    channel: self.name.clone(),
                    source,
                }),
        };
        self.connected.store(false, Ordering::Release);
        result
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn diagnostics(&self) -> ChannelDiagnostics {
        let (current_value, last_archived) = {
            let state = self.lock_state();
            (state.current.clone(), state.last_archived.clone())
        };
        ChannelDiagnostics {
            name: self.name.clone(),
            groups: self.group_names(),
            mode: self.mode.to_string(),
            enablement: self.enablement,
            enabled: self.is_enabled(),
            connected: self.is_connected(),
            current_value,
            last_archived,
            buffered: self.buffer.len(),
            capacity: self.buffer.capacity(),
            counters: self.counters(),
        }
    }
}

impl SampleListener for ArchiveChannel {
    fn on_value(&self, value: SampleValue, timestamp: DateTime<Utc>) {
        if !self.is_active() {
            debug!(channel = %self.name, "Value after stop ignored");
            return;
        }
        self.ingest(value, timestamp);
    }

    fn on_connection(&self, connected: bool) {
        if !self.is_active() {
            return;
        }
        if self.connected.swap(connected, Ordering::AcqRel) != connected {
            if connected {
                info!(channel = %self.name, "Channel connected");
            } else {
                warn!(channel = %self.name, "Channel disconnected");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn monitor(capacity: usize) -> ArchiveChannel {
        ArchiveChannel::new(
            1,
            "PV:MON",
            SampleMode::Monitor,
            Enablement::Passive,
            capacity,
            Duration::from_secs(24 * 3600),
        )
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_overflow_keeps_newest_samples() {
        let channel = monitor(4);
        for i in 0..5 {
            channel.ingest(SampleValue::Long(i), at(i));
        }
        assert_eq!(channel.buffered_count(), 4);
        assert_eq!(channel.counters().dropped, 1);
        assert_eq!(channel.counters().received, 5);

        let drained = channel.drain(usize::MAX);
        assert_eq!(drained.first().map(|s| s.timestamp), Some(at(1)));
        assert_eq!(drained.last().map(|s| s.timestamp), Some(at(4)));
    }

    #[test]
    fn test_drain_updates_last_archived_and_written() {
        let channel = monitor(10);
        for i in 0..3 {
            channel.ingest(SampleValue::Double(i as f64), at(i));
        }
        assert_eq!(channel.drain(2).len(), 2);
        assert_eq!(channel.last_archived_value().map(|s| s.timestamp), Some(at(1)));
        assert_eq!(channel.counters().written, 2);
        assert_eq!(channel.current_value().map(|s| s.timestamp), Some(at(2)));
    }

    #[test]
    fn test_time_guard_rejects_past_and_far_future() {
        let channel = monitor(10);
        channel.ingest(SampleValue::Long(1), at(10));
        channel.drain(usize::MAX);

        assert_eq!(channel.ingest(SampleValue::Long(2), at(5)), IngestOutcome::Rejected);
        let far_future = Utc::now() + chrono::Duration::days(2);
        assert_eq!(channel.ingest(SampleValue::Long(3), far_future), IngestOutcome::Rejected);
        assert_eq!(channel.ingest(SampleValue::Long(4), at(10)), IngestOutcome::Buffered);

        assert_eq!(channel.counters().rejected, 2);
        assert_eq!(channel.buffered_count(), 1);
        assert_eq!(channel.current_value().map(|s| s.timestamp), Some(at(10)));
    }

    #[test]
    fn test_time_guard_rejects_out_of_order_before_drain() {
        let channel = monitor(10);
        assert_eq!(channel.ingest(SampleValue::Long(1), at(5)), IngestOutcome::Buffered);
        assert_eq!(channel.ingest(SampleValue::Long(2), at(3)), IngestOutcome::Rejected);
        assert_eq!(channel.ingest(SampleValue::Long(3), at(5)), IngestOutcome::Buffered);
        assert_eq!(channel.buffered_count(), 2);
    }

    #[test]
    fn test_disabled_channel_tracks_value_without_buffering() {
        let channel = monitor(10);
        channel.set_enabled(false);
        assert_eq!(channel.ingest(SampleValue::Long(7), at(1)), IngestOutcome::Disabled);
        assert_eq!(channel.buffered_count(), 0);
        assert_eq!(channel.current_value().map(|s| s.value), Some(SampleValue::Long(7)));
    }

    #[test]
    fn test_delta_suppression_is_counted() {
        let channel = ArchiveChannel::new(
            2,
            "PV:DELTA",
            SampleMode::Delta { threshold: 1.0 },
            Enablement::Passive,
            10,
            Duration::from_secs(3600),
        );
        channel.ingest(SampleValue::Double(1.0), at(0));
        channel.ingest(SampleValue::Double(1.5), at(1));
        channel.ingest(SampleValue::Double(2.5), at(2));
        assert_eq!(channel.buffered_count(), 2);
        assert_eq!(channel.counters().suppressed, 1);
    }

    #[test]
    fn test_reset_zeroes_counters_only() {
        let channel = monitor(2);
        for i in 0..3 {
            channel.ingest(SampleValue::Long(i), at(i));
        }
        channel.reset();
        assert_eq!(channel.counters(), ChannelCounters::default());
        assert_eq!(channel.buffered_count(), 2);
        assert!(channel.current_value().is_some());
    }

    #[test]
    fn test_from_descriptor_sizes_buffer_and_seeds_time_guard() {
        let desc = ChannelDescriptor {
            id: 9,
            name: "PV:SCAN".into(),
            sample_mode: "scan".into(),
            sample_value: 0.0,
            sample_period: 0.5,
            last_archived_time: Some(at(100)),
            enablement: Enablement::Passive,
        };
        let channel = ArchiveChannel::from_descriptor(&desc, &EngineSettings::default()).unwrap();
        assert_eq!(channel.capacity(), 120);
        assert!(channel.mode().is_scanned());
        assert_eq!(channel.ingest(SampleValue::Long(1), at(99)), IngestOutcome::Rejected);
    }

    /// Answers the first read at once and holds every later read until
    /// released.
    #[derive(Default)]
    struct GatedSource {
        reads: AtomicUsize,
        gate: Notify,
    }

    #[async_trait]
    impl ValueSource for GatedSource {
        async fn subscribe(&self, _channel: &str, _listener: Arc<dyn SampleListener>) -> Result<(), SourceError> {
            Ok(())
        }

        async fn unsubscribe(&self, _channel: &str) -> Result<(), SourceError> {
            Ok(())
        }

        async fn read(&self, _channel: &str) -> Result<Sample, SourceError> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst);
            if n > 0 {
                self.gate.notified().await;
            }
            Ok(Sample::new(SampleValue::Long(n as i64), Utc::now()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_abandons_in_flight_scan_read() {
        let gated = Arc::new(GatedSource::default());
        let source: Arc<dyn ValueSource> = gated.clone();
        let channel = Arc::new(ArchiveChannel::new(
            3,
            "PV:SLOW",
            SampleMode::Scan {
                period: Duration::from_secs(1),
                max_repeats: 60,
            },
            Enablement::Passive,
            10,
            Duration::from_secs(3600),
        ));

        channel.start(&source).await.unwrap();
        assert_eq!(channel.buffered_count(), 1);
        while gated.reads.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        channel.stop(&source).await.unwrap();
        gated.gate.notify_waiters();
        tokio::time::sleep(Duration::from_secs(5)).await;

        channel.on_value(SampleValue::Long(99), Utc::now());
        channel.on_connection(true);
        assert!(!channel.is_active());
        assert!(!channel.is_connected());
        assert_eq!(channel.buffered_count(), 1);
        assert_eq!(gated.reads.load(Ordering::SeqCst), 2);
    }
}
