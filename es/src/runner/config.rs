//! Task runner configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Cadence and retry settings for a recurring service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Minimum time between the starts of two iterations (0 = back to back)
    #[serde(rename = "run-min-time-between-ms")]
    pub run_min_time_between_ms: u64,

    /// Attempts per iteration before a failure stops the service (1 = no retry)
    #[serde(rename = "retry-max-attempts")]
    pub retry_max_attempts: u32,

    /// Delay between retry attempts in milliseconds
    #[serde(rename = "retry-time-between-ms")]
    pub retry_time_between_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            run_min_time_between_ms: 0,
            retry_max_attempts: 1,
            retry_time_between_ms: 1000,
        }
    }
}

impl RunnerConfig {
    /// Minimum interval between iteration starts, if any
    pub fn min_interval(&self) -> Option<Duration> {
        (self.run_min_time_between_ms > 0).then(|| Duration::from_millis(self.run_min_time_between_ms))
    }

    /// Delay between retry attempts
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_time_between_ms)
    }

    /// True if failed iterations should be retried
    pub fn retries_enabled(&self) -> bool {
        self.retry_max_attempts > 1
    }
}
