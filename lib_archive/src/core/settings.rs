//! Engine tunables.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_ENGINE_NAME: &str = "Archive Engine";
pub const DEFAULT_WRITE_PERIOD_SECS: u64 = 30;
pub const DEFAULT_MAX_REPEATS: u32 = 60;
pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const DEFAULT_BUFFER_RESERVE: f64 = 2.0;
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_IGNORED_FUTURE_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Seconds between write cycles.
    pub write_period_secs: u64,
    /// Repeated identical scan readings tolerated before one is archived anyway.
    pub max_repeats: u32,
    /// Upper bound of samples per periodic write cycle.
    pub batch_size: usize,
    /// Multiplier applied to the expected samples per write period when sizing a buffer.
    pub buffer_reserve: f64,
    /// Upper bound on a single sink write.
    pub write_timeout_secs: u64,
    /// Samples stamped further than this into the future are rejected.
    pub ignored_future_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            write_period_secs: DEFAULT_WRITE_PERIOD_SECS,
            max_repeats: DEFAULT_MAX_REPEATS,
            batch_size: DEFAULT_BATCH_SIZE,
            buffer_reserve: DEFAULT_BUFFER_RESERVE,
            write_timeout_secs: DEFAULT_WRITE_TIMEOUT_SECS,
            ignored_future_secs: DEFAULT_IGNORED_FUTURE_SECS,
        }
    }
}

impl EngineSettings {
    pub fn write_period(&self) -> Duration {
        Duration::from_secs(self.write_period_secs.max(1))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs.max(1))
    }

    pub fn ignored_future(&self) -> Duration {
        Duration::from_secs(self.ignored_future_secs)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let settings: EngineSettings = serde_json::from_str(r#"{"batch_size": 100}"#).unwrap();
        assert_eq!(settings.batch_size, 100);
        assert_eq!(settings.write_period(), Duration::from_secs(30));
        assert_eq!(settings.max_repeats, 60);
    }

    #[test]
    fn test_zero_values_are_clamped() {
        let settings = EngineSettings {
            write_period_secs: 0,
            batch_size: 0,
            ..EngineSettings::default()
        };
        assert_eq!(settings.write_period(), Duration::from_secs(1));
        assert_eq!(settings.batch_size(), 1);
    }
}
