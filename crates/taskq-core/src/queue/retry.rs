//! Retry policy: decides backoff delays.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const MIN_RETRY_DELAY: Duration = Duration::from_millis(200);
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Exponential backoff between attempts of a failed task.
///
/// `delay = min(max_delay, min_delay * 2^(retry_count - 1))`
///
/// Example with the defaults (0.2s / 60s):
/// - retry 1: 0.2s
/// - retry 2: 0.4s
/// - retry 5: 3.2s
/// - retry 10 and later: 60s
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(rename = "min_delay_ms", with = "duration_ms", default = "default_min")]
    pub min_delay: Duration,

    #[serde(rename = "max_delay_ms", with = "duration_ms", default = "default_max")]
    pub max_delay: Duration,
}

fn default_min() -> Duration {
    MIN_RETRY_DELAY
}

fn default_max() -> Duration {
    MAX_RETRY_DELAY
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_delay: MIN_RETRY_DELAY,
            max_delay: MAX_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            min_delay,
            max_delay,
        }
    }

    /// Delay before the next attempt, given how many attempts have failed so far
    /// (1-indexed; 0 is treated as 1).
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.min_delay.as_secs_f64() * 2f64.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
