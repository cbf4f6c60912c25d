//! # Bounded Sample Buffer
//!
//! Per-channel FIFO between the ingestion path (subscription callbacks, scan
//! tasks) and the write scheduler's drain.
//!
//! ## Core Guarantees:
//!
//! - **Bounded memory**: capacity is fixed at construction. A push into a full
//!   buffer evicts the oldest sample and counts it as dropped, so a producer is
//!   never blocked waiting for the writer.
//! - **Short critical section**: the lock is held only to push one sample or to
//!   hand over a segment. When the drain asks for everything, the whole deque is
//!   swapped out and the producer continues on a fresh one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::core::sample::Sample;

pub struct SampleBuffer {
    capacity: usize,
    samples: Mutex<VecDeque<Sample>>,
    dropped: AtomicU64,
}

impl SampleBuffer {
    /// Creates a buffer holding at most `capacity` samples (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            dropped: AtomicU64::new(0),
        }
    }

    /// # Capacity Estimate
    ///
    /// Number of samples a channel updating every `update_period` produces in
    /// one `write_period`, multiplied by `reserve`. A channel slower than the
    /// write period still gets `reserve` slots.
    pub fn capacity_for(write_period: Duration, update_period: Duration, reserve: f64) -> usize {
        let reserve = if reserve.is_finite() && reserve > 0.0 { reserve } else { 1.0 };
        let floor = reserve.ceil();
        let update = update_period.as_secs_f64();
        let estimate = if update > 0.0 {
            (write_period.as_secs_f64() / update * reserve).ceil()
        } else {
            floor
        };
        estimate.max(floor).max(1.0) as usize
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Sample>> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a sample. Returns `false` when the oldest sample had to be
    /// dropped to make room.
    pub fn push(&self, sample: Sample) -> bool {
        let mut samples = self.lock();
        let overflow = samples.len() >= self.capacity;
        if overflow {
            samples.pop_front();
        }
        samples.push_back(sample);
        drop(samples);

        if overflow {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        !overflow
    }

    /// Removes and returns up to `max` samples in arrival order.
    pub fn drain(&self, max: usize) -> Vec<Sample> {
        if max == 0 {
            return Vec::new();
        }
        let mut samples = self.lock();
        if max >= samples.len() {
            let segment = std::mem::take(&mut *samples);
            drop(samples);
            Vec::from(segment)
        } else {
            samples.drain(..max).collect()
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples evicted by overflow since the last reset.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn reset_counters(&self) {
        self.dropped.store(0, Ordering::Relaxed);
    }
}
