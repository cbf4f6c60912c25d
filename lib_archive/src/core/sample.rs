//! # Samples
//!
//! The value types that flow from a value source, through a channel buffer and
//! into the sample sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single observed process-variable value.
///
/// Serialized untagged so that a JSON `3` is a `Long`, `3.5` is a `Double`
/// and `"open"` is a `Text`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SampleValue {
    /// Integral value (counters, enums, booleans).
    Long(i64),
    /// Floating point value.
    Double(f64),
    /// Anything else, archived verbatim.
    Text(String),
}

impl SampleValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SampleValue::Long(v) => Some(*v as f64),
            SampleValue::Double(v) => Some(*v),
            SampleValue::Text(_) => None,
        }
    }

    /// Truthiness used by enabling/disabling channels.
    pub fn is_nonzero(&self) -> bool {
        match self {
            SampleValue::Long(v) => *v != 0,
            SampleValue::Double(v) => *v != 0.0,
            SampleValue::Text(s) => !s.is_empty() && s != "0",
        }
    }

    /// `true` when `self` moved away from `previous` by more than `threshold`.
    ///
    /// Values without a numeric view only compare for equality.
    pub fn exceeds_delta(&self, previous: &SampleValue, threshold: f64) -> bool {
        match (self.as_f64(), previous.as_f64()) {
            (Some(now), Some(before)) => (now - before).abs() > threshold,
            _ => self != previous,
        }
    }
}

impl fmt::Display for SampleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleValue::Long(v) => write!(f, "{v}"),
            SampleValue::Double(v) => write!(f, "{v}"),
            SampleValue::Text(s) => write!(f, "'{s}'"),
        }
    }
}

impl From<f64> for SampleValue {
    fn from(v: f64) -> Self {
        SampleValue::Double(v)
    }
}

impl From<i64> for SampleValue {
    fn from(v: i64) -> Self {
        SampleValue::Long(v)
    }
}

impl From<&str> for SampleValue {
    fn from(v: &str) -> Self {
        SampleValue::Text(v.to_string())
    }
}

/// A value with the time it was observed at the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub value: SampleValue,
    pub timestamp: DateTime<Utc>,
}

impl Sample {
    pub fn new(value: impl Into<SampleValue>, timestamp: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            timestamp,
        }
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.value, self.timestamp.to_rfc3339())
    }
}

/// # Archive Sample
///
/// One row handed to the [`SampleSink`](crate::core::services::SampleSink):
/// the channel it belongs to plus the drained sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchiveSample {
    pub channel: String,
    pub value: SampleValue,
    pub timestamp: DateTime<Utc>,
}

impl ArchiveSample {
    pub fn new(channel: &str, sample: Sample) -> Self {
        Self {
            channel: channel.to_string(),
            value: sample.value,
            timestamp: sample.timestamp,
        }
    }
}
