//! # In-Memory Collaborators
//!
//! Process-local implementations of every collaborator contract. They keep
//! what they are given in memory and expose failure injection, which makes
//! them the backbone of the engine's tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::core::error::{AuditError, SinkError, SourceError, StoreError};
use crate::core::sample::{ArchiveSample, Sample, SampleValue};
use crate::core::services::{
    AuditSink, ChannelConfigStore, ChannelDescriptor, EngineDescriptor, GroupDescriptor,
    MgmtEventKind, SampleListener, SampleSink, ValueSource,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// --- Configuration store ---

#[derive(Default)]
struct StoreContents {
    engines: Vec<EngineDescriptor>,
    groups: HashMap<i64, Vec<GroupDescriptor>>,
    channels: HashMap<i64, Vec<ChannelDescriptor>>,
}

/// Configuration store backed by plain collections.
#[derive(Default)]
pub struct MemoryConfigStore {
    contents: Mutex<StoreContents>,
    failure: Mutex<Option<StoreError>>,
    failing_group: Mutex<Option<(i64, StoreError)>>,
    invalidations: AtomicUsize,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_engine(&self, engine: EngineDescriptor) {
        lock(&self.contents).engines.push(engine);
    }

    pub fn add_group(&self, engine_id: i64, group: GroupDescriptor) {
        lock(&self.contents).groups.entry(engine_id).or_default().push(group);
    }

    pub fn add_channel(&self, group_id: i64, channel: ChannelDescriptor) {
        lock(&self.contents)
            .channels
            .entry(group_id)
            .or_default()
            .push(channel);
    }

    /// Makes every request fail with `error` until cleared with `None`.
    pub fn fail_with(&self, error: Option<StoreError>) {
        *lock(&self.failure) = error;
    }

    /// Makes channel lookups of one group fail.
    pub fn fail_group(&self, group_id: i64, error: StoreError) {
        *lock(&self.failing_group) = Some((group_id, error));
    }

    /// How often the engine asked the store to drop cached reads.
    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::Acquire)
    }

    fn check(&self) -> Result<(), StoreError> {
        match lock(&self.failure).clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ChannelConfigStore for MemoryConfigStore {
    async fn find_engine(&self, name: &str) -> Result<Option<EngineDescriptor>, StoreError> {
        self.check()?;
        Ok(lock(&self.contents)
            .engines
            .iter()
            .find(|e| e.name == name)
            .cloned())
    }

    async fn groups_for_engine(&self, engine_id: i64) -> Result<Vec<GroupDescriptor>, StoreError> {
        self.check()?;
        Ok(lock(&self.contents)
            .groups
            .get(&engine_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn channels_by_group_id(&self, group_id: i64) -> Result<Vec<ChannelDescriptor>, StoreError> {
        self.check()?;
        if let Some((failing, err)) = lock(&self.failing_group).clone() {
            if failing == group_id {
                return Err(err);
            }
        }
        Ok(lock(&self.contents)
            .channels
            .get(&group_id)
            .cloned()
            .unwrap_or_default())
    }

    fn invalidate_cache(&self) {
        self.invalidations.fetch_add(1, Ordering::AcqRel);
    }
}

// --- Sample sink ---

/// Sample sink keeping every written batch.
#[derive(Default)]
pub struct MemorySampleSink {
    batches: Mutex<Vec<Vec<ArchiveSample>>>,
    failing: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl MemorySampleSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    /// Delays every write by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = Some(delay);
    }

    pub fn batches(&self) -> Vec<Vec<ArchiveSample>> {
        lock(&self.batches).clone()
    }

    pub fn samples(&self) -> Vec<ArchiveSample> {
        lock(&self.batches).iter().flatten().cloned().collect()
    }

    pub fn sample_count(&self) -> usize {
        lock(&self.batches).iter().map(Vec::len).sum()
    }

    pub fn samples_for(&self, channel: &str) -> Vec<ArchiveSample> {
        lock(&self.batches)
            .iter()
            .flatten()
            .filter(|s| s.channel == channel)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SampleSink for MemorySampleSink {
    async fn write_batch(&self, samples: &[ArchiveSample]) -> Result<usize, SinkError> {
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::Acquire) {
            return Err(SinkError::Unavailable("memory sink set to fail".into()));
        }
        lock(&self.batches).push(samples.to_vec());
        Ok(samples.len())
    }
}

// --- Audit sink ---

#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    pub engine_id: i64,
    pub kind: MgmtEventKind,
    pub timestamp: DateTime<Utc>,
}

/// Audit sink keeping every management event.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
    failing: AtomicBool,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        lock(&self.events).clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record_event(
        &self,
        engine_id: i64,
        kind: MgmtEventKind,
        timestamp: DateTime<Utc>,
    ) -> Result<(), AuditError> {
        if self.failing.load(Ordering::Acquire) {
            return Err(AuditError("memory audit sink set to fail".into()));
        }
        lock(&self.events).push(AuditEvent {
            engine_id,
            kind,
            timestamp,
        });
        Ok(())
    }
}

// --- Value source ---

/// Value source driven by the test (or host) through [`publish`](Self::publish)
/// and [`set_value`](Self::set_value).
#[derive(Default)]
pub struct MemoryValueSource {
    listeners: Mutex<HashMap<String, Arc<dyn SampleListener>>>,
    values: Mutex<HashMap<String, SampleValue>>,
    failing: Mutex<HashSet<String>>,
    failing_unsubscribe: AtomicBool,
}

impl MemoryValueSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subscribe and read fail for `channel`.
    pub fn fail_channel(&self, channel: &str) {
        lock(&self.failing).insert(channel.to_string());
    }

    pub fn set_unsubscribe_failing(&self, failing: bool) {
        self.failing_unsubscribe.store(failing, Ordering::Release);
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        lock(&self.listeners).contains_key(channel)
    }

    pub fn subscription_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    /// Sets the value returned by scanned reads of `channel`.
    pub fn set_value(&self, channel: &str, value: impl Into<SampleValue>) {
        lock(&self.values).insert(channel.to_string(), value.into());
    }

    /// Delivers an update to the subscriber of `channel`. Returns `false` when
    /// nobody is subscribed.
    pub fn publish(&self, channel: &str, value: impl Into<SampleValue>, timestamp: DateTime<Utc>) -> bool {
        let value = value.into();
        self.set_value(channel, value.clone());
        let listener = lock(&self.listeners).get(channel).cloned();
        match listener {
            Some(listener) => {
                listener.on_value(value, timestamp);
                true
            }
            None => false,
        }
    }

    /// Reports a connection change to the subscriber of `channel`.
    pub fn set_connected(&self, channel: &str, connected: bool) {
        let listener = lock(&self.listeners).get(channel).cloned();
        if let Some(listener) = listener {
            listener.on_connection(connected);
        }
    }

    fn check(&self, channel: &str) -> Result<(), SourceError> {
        if lock(&self.failing).contains(channel) {
            Err(SourceError::Disconnected(format!("'{channel}' unreachable")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ValueSource for MemoryValueSource {
    async fn subscribe(&self, channel: &str, listener: Arc<dyn SampleListener>) -> Result<(), SourceError> {
        self.check(channel)?;
        lock(&self.listeners).insert(channel.to_string(), listener);
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), SourceError> {
        lock(&self.listeners).remove(channel);
        if self.failing_unsubscribe.load(Ordering::Acquire) {
            return Err(SourceError::Protocol(format!("unsubscribe of '{channel}' failed")));
        }
        Ok(())
    }

    async fn read(&self, channel: &str) -> Result<Sample, SourceError> {
        self.check(channel)?;
        lock(&self.values)
            .get(channel)
            .cloned()
            .map(|value| Sample::new(value, Utc::now()))
            .ok_or_else(|| SourceError::NotFound(channel.to_string()))
    }
}
