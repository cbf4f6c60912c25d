//! # Sample Modes
//!
//! How a channel decides which incoming values are worth archiving.
//!
//! ## Variants:
//!
//! - **`Monitor`**: every update is buffered.
//! - **`Delta`**: the first value is buffered, afterwards only values that moved
//!   more than the threshold away from the last buffered one.
//! - **`Scan`**: the channel is polled every period. Identical consecutive
//!   readings are suppressed until the run of repeats exceeds `max_repeats`,
//!   at which point the value is archived again so the archive shows the
//!   channel is still alive.

use std::fmt;
use std::time::Duration;

use crate::core::error::{ConfigError, ConfigErrorKind};
use crate::core::sample::SampleValue;
use crate::core::services::ChannelDescriptor;

/// Update period assumed when a descriptor carries none.
pub const DEFAULT_UPDATE_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub enum SampleMode {
    Monitor,
    Delta { threshold: f64 },
    Scan { period: Duration, max_repeats: u32 },
}

/// Result of offering a value to a [`SampleMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Buffer,
    Suppress,
}

/// Per-channel memory of the filter.
#[derive(Debug, Default)]
pub struct FilterState {
    last_buffered: Option<SampleValue>,
    repeats: u32,
}

impl FilterState {
    pub fn clear(&mut self) {
        self.last_buffered = None;
        self.repeats = 0;
    }
}

impl SampleMode {
    /// Maps a stored descriptor onto a mode.
    pub fn from_descriptor(desc: &ChannelDescriptor, max_repeats: u32) -> Result<Self, ConfigError> {
        match desc.sample_mode.trim().to_ascii_lowercase().as_str() {
            "monitor" if desc.sample_value > 0.0 => Ok(SampleMode::Delta {
                threshold: desc.sample_value,
            }),
            "monitor" => Ok(SampleMode::Monitor),
            "scan" if desc.sample_period > 0.0 && desc.sample_period.is_finite() => {
                let period = Duration::try_from_secs_f64(desc.sample_period).map_err(|e| {
                    ConfigError::with_source(
                        ConfigErrorKind::MalformedDescriptor,
                        format!(
                            "channel '{}' has an unusable scan period {}",
                            desc.name, desc.sample_period
                        ),
                        e,
                    )
                })?;
                Ok(SampleMode::Scan { period, max_repeats })
            }
            other => Err(ConfigError::new(
                ConfigErrorKind::UnsupportedChannelType,
                format!(
                    "channel '{}' has sample mode '{}' with period {}",
                    desc.name, other, desc.sample_period
                ),
            )),
        }
    }

    /// Expected time between updates, used to size the channel buffer.
    pub fn update_period(desc: &ChannelDescriptor) -> Duration {
        if desc.sample_period > 0.0 {
            Duration::try_from_secs_f64(desc.sample_period).unwrap_or(DEFAULT_UPDATE_PERIOD)
        } else {
            DEFAULT_UPDATE_PERIOD
        }
    }

    pub fn is_scanned(&self) -> bool {
        matches!(self, SampleMode::Scan { .. })
    }

    /// Decides whether `value` is buffered and updates `state` accordingly.
    pub fn admit(&self, value: &SampleValue, state: &mut FilterState) -> Admission {
        let admission = match (self, state.last_buffered.as_ref()) {
            (SampleMode::Monitor, _) | (_, None) => Admission::Buffer,
            (SampleMode::Delta { threshold }, Some(last)) => {
                if value.exceeds_delta(last, *threshold) {
                    Admission::Buffer
                } else {
                    Admission::Suppress
                }
            }
            (SampleMode::Scan { max_repeats, .. }, Some(last)) => {
                if value != last {
                    Admission::Buffer
                } else if state.repeats >= *max_repeats {
                    Admission::Buffer
                } else {
                    state.repeats += 1;
                    Admission::Suppress
                }
            }
        };

        if admission == Admission::Buffer {
            state.last_buffered = Some(value.clone());
            state.repeats = 0;
        }
        admission
    }
}

impl fmt::Display for SampleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleMode::Monitor => f.write_str("Monitor"),
            SampleMode::Delta { threshold } => write!(f, "Delta {threshold}"),
            SampleMode::Scan {
                period,
                max_repeats,
            } => write!(
                f,
                "Scan {:.3}s (max repeats {max_repeats})",
                period.as_secs_f64()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(mode: &str, value: f64, period: f64) -> ChannelDescriptor {
        ChannelDescriptor {
            id: 1,
            name: "PV:TEST".into(),
            sample_mode: mode.into(),
            sample_value: value,
            sample_period: period,
            last_archived_time: None,
            enablement: Default::default(),
        }
    }

    #[test]
    fn test_descriptor_mapping() {
        assert_eq!(
            SampleMode::from_descriptor(&desc("monitor", 0.0, 1.0), 60).unwrap(),
            SampleMode::Monitor
        );
        assert_eq!(
            SampleMode::from_descriptor(&desc("MONITOR", 0.5, 1.0), 60).unwrap(),
            SampleMode::Delta { threshold: 0.5 }
        );
        assert_eq!(
            SampleMode::from_descriptor(&desc("scan", 0.0, 2.0), 10).unwrap(),
            SampleMode::Scan {
                period: Duration::from_secs(2),
                max_repeats: 10
            }
        );

        let err = SampleMode::from_descriptor(&desc("scan", 0.0, 0.0), 60).unwrap_err();
        assert_eq!(err.kind, ConfigErrorKind::UnsupportedChannelType);
        let err = SampleMode::from_descriptor(&desc("event", 0.0, 1.0), 60).unwrap_err();
        assert_eq!(err.kind, ConfigErrorKind::UnsupportedChannelType);
    }

    #[test]
    fn test_out_of_range_scan_period_is_malformed() {
        let err = SampleMode::from_descriptor(&desc("scan", 0.0, 1e30), 60).unwrap_err();
        assert_eq!(err.kind, ConfigErrorKind::MalformedDescriptor);
        assert_eq!(SampleMode::update_period(&desc("monitor", 0.0, 1e30)), DEFAULT_UPDATE_PERIOD);
    }

    #[test]
    fn test_update_period_defaults_to_one_second() {
        assert_eq!(SampleMode::update_period(&desc("monitor", 0.0, 0.0)), DEFAULT_UPDATE_PERIOD);
        assert_eq!(
            SampleMode::update_period(&desc("monitor", 0.0, 0.25)),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_monitor_buffers_everything() {
        let mode = SampleMode::Monitor;
        let mut state = FilterState::default();
        for _ in 0..3 {
            assert_eq!(mode.admit(&SampleValue::Long(1), &mut state), Admission::Buffer);
        }
    }

    #[test]
    fn test_delta_measures_against_last_buffered_value() {
        let mode = SampleMode::Delta { threshold: 1.0 };
        let mut state = FilterState::default();
        let admit = |v: f64, state: &mut FilterState| mode.admit(&SampleValue::Double(v), state);

        assert_eq!(admit(10.0, &mut state), Admission::Buffer);
        assert_eq!(admit(10.6, &mut state), Admission::Suppress);
        // Drift is measured from 10.0, not from the suppressed 10.6.
        assert_eq!(admit(10.9, &mut state), Admission::Suppress);
        assert_eq!(admit(11.1, &mut state), Admission::Buffer);
        assert_eq!(admit(10.5, &mut state), Admission::Suppress);
    }

    #[test]
    fn test_scan_repeat_suppression() {
        let mode = SampleMode::Scan {
            period: Duration::from_secs(1),
            max_repeats: 60,
        };
        let mut state = FilterState::default();
        let value = SampleValue::Double(4.2);

        let buffered = (0..61)
            .filter(|_| mode.admit(&value, &mut state) == Admission::Buffer)
            .count();
        assert_eq!(buffered, 1);

        // The 62nd identical reading exceeds the allowed run of 60 repeats.
        assert_eq!(mode.admit(&value, &mut state), Admission::Buffer);
        // And the run restarts.
        assert_eq!(mode.admit(&value, &mut state), Admission::Suppress);
    }

    #[test]
    fn test_scan_distinct_value_always_buffered() {
        let mode = SampleMode::Scan {
            period: Duration::from_secs(1),
            max_repeats: 60,
        };
        let mut state = FilterState::default();
        assert_eq!(mode.admit(&SampleValue::Long(1), &mut state), Admission::Buffer);
        assert_eq!(mode.admit(&SampleValue::Long(1), &mut state), Admission::Suppress);
        assert_eq!(mode.admit(&SampleValue::Long(2), &mut state), Admission::Buffer);
        assert_eq!(mode.admit(&SampleValue::Long(1), &mut state), Admission::Buffer);
    }
}
