//! Retry policy for outbound hub connections.
//!
//! Delays grow linearly with the attempt number (`base * n`), not
//! exponentially. [`LinearBuilder`] implements `backon::BackoffBuilder`, but
//! only as a source of delays: the supervisor pulls them from the iterator
//! and runs the cancellable retry loop itself.

use std::time::Duration;

use backon::BackoffBuilder;
use serde::Deserialize;

/// Default number of connection attempts per target.
pub const DEFAULT_MAX_ATTEMPTS: usize = 5;
/// Default base delay between attempts.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(5);

/// Linear backoff builder.
///
/// - Base delay: 5s
/// - Max delays: 4 (one between each of 5 attempts)
#[derive(Debug, Clone, Copy)]
pub struct LinearBuilder {
    base_delay: Duration,
    max_times: usize,
}

impl Default for LinearBuilder {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_times: DEFAULT_MAX_ATTEMPTS - 1,
        }
    }
}

impl LinearBuilder {
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_times(mut self, max_times: usize) -> Self {
        self.max_times = max_times;
        self
    }
}

impl BackoffBuilder for LinearBuilder {
    type Backoff = LinearBackoff;

    fn build(self) -> Self::Backoff {
        LinearBackoff {
            base_delay: self.base_delay,
            max_times: self.max_times,
            attempt: 0,
        }
    }
}

/// Yields `base`, `2 * base`, ... for at most `max_times` delays.
#[derive(Debug)]
pub struct LinearBackoff {
    base_delay: Duration,
    max_times: usize,
    attempt: usize,
}

impl Iterator for LinearBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_times {
            return None;
        }
        self.attempt += 1;
        Some(self.base_delay.saturating_mul(self.attempt as u32))
    }
}

/// Retry limits for a supervised connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total connection attempts before giving up.
    pub max_attempts: usize,
    /// Delay unit; the wait after attempt `n` is `base_delay * n`.
    #[serde(rename = "base_delay_ms", deserialize_with = "duration_ms::deserialize")]
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Delays to wait between consecutive attempts.
    pub fn backoff(&self) -> LinearBackoff {
        LinearBuilder::default()
            .with_base_delay(self.base_delay)
            .with_max_times(self.max_attempts.saturating_sub(1))
            .build()
    }
}

/// Serde adapter for durations expressed in milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_delays() {
        let delays: Vec<Duration> = RetryPolicy::default().backoff().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(15),
                Duration::from_secs(20),
            ]
        );
    }

    #[test]
    fn test_single_attempt_has_no_delays() {
        let policy = RetryPolicy::new(1, Duration::from_secs(1));
        assert_eq!(policy.backoff().count(), 0);
    }

    #[test]
    fn test_zero_attempts_has_no_delays() {
        let policy = RetryPolicy::new(0, Duration::from_secs(1));
        assert_eq!(policy.backoff().count(), 0);
    }

    #[test]
    fn test_builder_custom_base() {
        let delays: Vec<Duration> = LinearBuilder::default()
            .with_base_delay(Duration::from_millis(100))
            .with_max_times(3)
            .build()
            .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300),
            ]
        );
    }
}
