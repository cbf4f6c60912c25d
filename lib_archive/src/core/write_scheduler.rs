//! # Write Scheduler
//!
//! The single recurring task that moves samples from channel buffers into the
//! [`SampleSink`].
//!
//! ## Write cycle:
//!
//! 1. Channels are visited round-robin, starting after the channel that hit
//!    the previous cycle's batch cap, so a busy channel cannot starve the ones
//!    registered after it.
//! 2. Up to `batch_size` samples are drained in total and handed to the sink as
//!    one batch, bounded by `write_timeout`.
//! 3. Statistics are updated whether or not the write succeeded. A failed batch
//!    is counted as lost; drained samples are never re-buffered.
//!
//! Only one cycle runs at a time. [`shutdown`](WriteScheduler::shutdown) stops
//! the periodic task, waits for an in-flight cycle and then performs one final
//! cycle without a cap.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::channel::ArchiveChannel;
use crate::core::error::SinkError;
use crate::core::sample::ArchiveSample;
use crate::core::services::SampleSink;

/// Smoothing factor of the rolling averages.
pub const EWMA_ALPHA: f64 = 0.1;

const MIN_PERIOD: Duration = Duration::from_millis(10);

/// Scheduler statistics since start or the last reset.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WriteStats {
    pub last_write_time: Option<DateTime<Utc>>,
    /// Rolling average of samples per cycle.
    pub avg_write_count: f64,
    /// Rolling average of cycle duration, in seconds.
    pub avg_write_duration_secs: f64,
    pub cycles: u64,
    pub failed_cycles: u64,
    pub samples_written: u64,
    pub samples_lost: u64,
}

impl WriteStats {
    fn record(&mut self, drained: usize, duration: Duration, outcome: &Result<usize, SinkError>) {
        let count = drained as f64;
        let secs = duration.as_secs_f64();
        if self.cycles == 0 {
            self.avg_write_count = count;
            self.avg_write_duration_secs = secs;
        } else {
            self.avg_write_count += EWMA_ALPHA * (count - self.avg_write_count);
            self.avg_write_duration_secs += EWMA_ALPHA * (secs - self.avg_write_duration_secs);
        }
        self.cycles += 1;
        self.last_write_time = Some(Utc::now());
        match outcome {
            Ok(written) => self.samples_written += *written as u64,
            Err(_) => {
                self.failed_cycles += 1;
                self.samples_lost += drained as u64;
            }
        }
    }
}

/// Result of one write cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub drained: usize,
    pub written: usize,
    pub duration: Duration,
    /// The batch cap was reached with samples left in some buffer.
    pub capped: bool,
    pub error: Option<SinkError>,
}

impl CycleReport {
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

struct PeriodicTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct WriteScheduler {
    sink: Arc<dyn SampleSink>,
    batch_size: usize,
    write_timeout: Duration,
    channels: RwLock<Vec<Arc<ArchiveChannel>>>,
    cursor: AtomicUsize,
    cycle_lock: tokio::sync::Mutex<()>,
    stats: Mutex<WriteStats>,
    task: Mutex<Option<PeriodicTask>>,
}

impl WriteScheduler {
    pub fn new(sink: Arc<dyn SampleSink>, batch_size: usize, write_timeout: Duration) -> Self {
        Self {
            sink,
            batch_size: batch_size.max(1),
            write_timeout,
            channels: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            cycle_lock: tokio::sync::Mutex::new(()),
            stats: Mutex::new(WriteStats::default()),
            task: Mutex::new(None),
        }
    }

    fn lock_stats(&self) -> MutexGuard<'_, WriteStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_task(&self) -> MutexGuard<'_, Option<PeriodicTask>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Registers a channel for draining; a name already registered is ignored.
    pub fn add_channel(&self, channel: Arc<ArchiveChannel>) -> bool {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        if channels.iter().any(|c| c.name() == channel.name()) {
            return false;
        }
        channels.push(channel);
        true
    }

    pub fn clear_channels(&self) {
        self.channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.cursor.store(0, Ordering::Relaxed);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_running(&self) -> bool {
        self.lock_task().is_some()
    }

    /// Spawns the periodic cycle. Does nothing if it is already running.
    pub fn start(self: &Arc<Self>, period: Duration) {
        let mut task = self.lock_task();
        if task.is_some() {
            warn!("Write scheduler already running");
            return;
        }
        let period = period.max(MIN_PERIOD);
        let token = CancellationToken::new();
        let scheduler = Arc::clone(self);
        let loop_token = token.clone();
        let handle = tokio::spawn(async move { scheduler.run(period, loop_token).await });
        *task = Some(PeriodicTask { token, handle });
        info!(period_secs = period.as_secs_f64(), batch_size = self.batch_size, "Write scheduler started");
    }

    async fn run(&self, period: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.write_cycle(Some(self.batch_size), Some(&token)).await;
                    if report.drained > 0 {
                        debug!(
                            drained = report.drained,
                            written = report.written,
                            capped = report.capped,
                            "Write cycle finished"
                        );
                    }
                }
            }
        }
    }

    /// Runs one capped cycle immediately.
    pub async fn run_cycle(&self) -> CycleReport {
        self.write_cycle(Some(self.batch_size), None).await
    }

    /// Stops the periodic task, then drains and writes everything left.
    pub async fn shutdown(&self) -> CycleReport {
        let task = self.lock_task().take();
        if let Some(task) = task {
            task.token.cancel();
            if let Err(e) = task.handle.await {
                error!(error = %e, "Write task ended abnormally");
            }
        }
        let report = self.write_cycle(None, None).await;
        let lost = if report.failed() { report.drained } else { 0 };
        info!(flushed = report.written, lost, "Write scheduler shut down");
        report
    }

    async fn write_cycle(&self, cap: Option<usize>, cancel: Option<&CancellationToken>) -> CycleReport {
        let _cycle = self.cycle_lock.lock().await;
        let started = Instant::now();

        let (batch, capped) = self.collect_batch(cap.unwrap_or(usize::MAX), cancel);
        let drained = batch.len();
        let outcome = if batch.is_empty() {
            Ok(0)
        } else {
            self.persist(&batch).await
        };
        let duration = started.elapsed();

        if let Err(e) = &outcome {
            error!(samples = drained, error = %e, "Batch write failed, samples lost");
        }
        self.lock_stats().record(drained, duration, &outcome);

        CycleReport {
            drained,
            written: *outcome.as_ref().unwrap_or(&0),
            duration,
            capped,
            error: outcome.err(),
        }
    }

    fn collect_batch(&self, cap: usize, cancel: Option<&CancellationToken>) -> (Vec<ArchiveSample>, bool) {
        let channels = self
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if channels.is_empty() {
            return (Vec::new(), false);
        }

        let count = channels.len();
        let start = self.cursor.load(Ordering::Relaxed) % count;
        let mut resume = start;
        let mut remaining = cap;
        let mut capped = false;
        let mut batch = Vec::new();

        for step in 0..count {
            let index = (start + step) % count;
            if remaining == 0 {
                resume = index;
                capped = true;
                break;
            }
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                resume = index;
                break;
            }

            let channel = &channels[index];
            let drained = channel.drain(remaining);
            remaining -= drained.len();
            batch.extend(drained.into_iter().map(|s| ArchiveSample::new(channel.name(), s)));

            if remaining == 0 && channel.buffered_count() > 0 {
                // The capped channel goes last next time round.
                resume = (index + 1) % count;
                capped = true;
                break;
            }
        }

        self.cursor.store(resume, Ordering::Relaxed);
        (batch, capped)
    }

    async fn persist(&self, batch: &[ArchiveSample]) -> Result<usize, SinkError> {
        match tokio::time::timeout(self.write_timeout, self.sink.write_batch(batch)).await {
            Ok(result) => result,
            Err(_) => Err(SinkError::Timeout(self.write_timeout)),
        }
    }

    pub fn stats(&self) -> WriteStats {
        self.lock_stats().clone()
    }

    pub fn last_write_time(&self) -> Option<DateTime<Utc>> {
        self.lock_stats().last_write_time
    }

    pub fn avg_write_count(&self) -> f64 {
        self.lock_stats().avg_write_count
    }

    pub fn avg_write_duration(&self) -> Duration {
        Duration::from_secs_f64(self.lock_stats().avg_write_duration_secs.max(0.0))
    }

    /// Zeroes the statistics. Registered channels and their buffers are untouched.
    pub fn reset(&self) {
        *self.lock_stats() = WriteStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::memory::MemorySampleSink;
    use crate::core::sample::SampleValue;
    use crate::core::sample_mode::SampleMode;
    use crate::core::services::Enablement;

    fn channel(name: &str, samples: usize) -> Arc<ArchiveChannel> {
        let channel = Arc::new(ArchiveChannel::new(
            0,
            name,
            SampleMode::Monitor,
            Enablement::Passive,
            samples.max(1),
            Duration::from_secs(3600),
        ));
        let base = Utc::now() - chrono::Duration::hours(1);
        for i in 0..samples {
            channel.ingest(
                SampleValue::Long(i as i64),
                base + chrono::Duration::milliseconds(i as i64),
            );
        }
        channel
    }

    fn scheduler(sink: &Arc<MemorySampleSink>, batch_size: usize) -> Arc<WriteScheduler> {
        Arc::new(WriteScheduler::new(
            sink.clone(),
            batch_size,
            Duration::from_secs(5),
        ))
    }

    #[tokio::test]
    async fn test_cap_resumes_after_capped_channel() {
        let sink = Arc::new(MemorySampleSink::new());
        let scheduler = scheduler(&sink, 500);
        let (a, b, c) = (channel("A", 300), channel("B", 300), channel("C", 300));
        for ch in [&a, &b, &c] {
            scheduler.add_channel(Arc::clone(ch));
        }

        let first = scheduler.run_cycle().await;
        assert_eq!(first.drained, 500);
        assert!(first.capped);
        assert_eq!((a.buffered_count(), b.buffered_count(), c.buffered_count()), (0, 100, 300));

        let second = scheduler.run_cycle().await;
        assert_eq!(second.drained, 400);
        assert!(!second.capped);
        assert_eq!(sink.sample_count(), 900);

        // Second batch starts with C, B's remainder follows.
        let batches = sink.batches();
        assert_eq!(batches[1].first().map(|s| s.channel.as_str()), Some("C"));
        assert_eq!(batches[1].last().map(|s| s.channel.as_str()), Some("B"));
    }

    #[tokio::test]
    async fn test_busy_channel_does_not_starve_the_next_one() {
        let sink = Arc::new(MemorySampleSink::new());
        let scheduler = scheduler(&sink, 500);
        let busy = channel("A", 600);
        let quiet = channel("B", 10);
        scheduler.add_channel(Arc::clone(&busy));
        scheduler.add_channel(Arc::clone(&quiet));

        for cycle in 0..3 {
            let base = Utc::now() + chrono::Duration::seconds(cycle);
            for i in 0..600 {
                busy.ingest(SampleValue::Long(i), base + chrono::Duration::microseconds(i));
            }
            let report = scheduler.run_cycle().await;
            assert_eq!(report.drained, 500);
        }

        assert_eq!(quiet.buffered_count(), 0);
        assert_eq!(sink.samples().iter().filter(|s| s.channel == "B").count(), 10);
    }

    #[tokio::test]
    async fn test_uncapped_shutdown_flushes_everything() {
        let sink = Arc::new(MemorySampleSink::new());
        let scheduler = scheduler(&sink, 10);
        scheduler.add_channel(channel("A", 30));
        scheduler.add_channel(channel("B", 25));

        let report = scheduler.shutdown().await;
        assert_eq!(report.drained, 55);
        assert_eq!(sink.sample_count(), 55);
    }

    #[tokio::test]
    async fn test_failed_batch_is_not_requeued() {
        let sink = Arc::new(MemorySampleSink::new());
        sink.set_failing(true);
        let scheduler = scheduler(&sink, 100);
        let a = channel("A", 20);
        scheduler.add_channel(Arc::clone(&a));

        let report = scheduler.run_cycle().await;
        assert!(report.failed());
        assert_eq!(a.buffered_count(), 0);

        sink.set_failing(false);
        assert_eq!(scheduler.run_cycle().await.drained, 0);
        assert_eq!(sink.sample_count(), 0);

        let stats = scheduler.stats();
        assert_eq!(stats.failed_cycles, 1);
        assert_eq!(stats.samples_lost, 20);
        assert_eq!(stats.cycles, 2);
        assert!(stats.last_write_time.is_some());
    }

    #[tokio::test]
    async fn test_ewma_seeded_by_first_cycle() {
        let sink = Arc::new(MemorySampleSink::new());
        let scheduler = scheduler(&sink, 1000);
        let a = channel("A", 100);
        scheduler.add_channel(Arc::clone(&a));

        scheduler.run_cycle().await;
        assert_eq!(scheduler.avg_write_count(), 100.0);

        scheduler.run_cycle().await;
        assert!((scheduler.avg_write_count() - 90.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_reset_zeroes_statistics_only() {
        let sink = Arc::new(MemorySampleSink::new());
        let scheduler = scheduler(&sink, 5);
        let a = channel("A", 10);
        scheduler.add_channel(Arc::clone(&a));
        scheduler.run_cycle().await;

        scheduler.reset();
        assert_eq!(scheduler.stats(), WriteStats::default());
        assert_eq!(a.buffered_count(), 5);
        assert_eq!(scheduler.channel_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_timeout_counts_as_failure() {
        let sink = Arc::new(MemorySampleSink::new());
        sink.set_delay(Duration::from_secs(60));
        let scheduler = scheduler(&sink, 5);
        scheduler.add_channel(channel("A", 3));

        let report = scheduler.run_cycle().await;
        assert!(matches!(report.error, Some(SinkError::Timeout(_))));
        assert_eq!(scheduler.stats().samples_lost, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_writes_each_period() {
        let sink = Arc::new(MemorySampleSink::new());
        let scheduler = scheduler(&sink, 500);
        let a = channel("A", 10);
        scheduler.add_channel(Arc::clone(&a));

        scheduler.start(Duration::from_secs(30));
        assert!(scheduler.is_running());
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(sink.sample_count(), 10);

        scheduler.shutdown().await;
        assert!(!scheduler.is_running());
    }

    #[test]
    fn test_duplicate_channel_registration_ignored() {
        let sink = Arc::new(MemorySampleSink::new());
        let scheduler = scheduler(&sink, 5);
        assert!(scheduler.add_channel(channel("A", 0)));
        assert!(!scheduler.add_channel(channel("A", 0)));
        assert_eq!(scheduler.channel_count(), 1);
    }
}
