//! Retry policy and backoff computation.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay shape between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed {
        #[serde(with = "super::duration_ms", rename = "delay_ms")]
        delay: Duration,
    },
    /// `base_delay * 2^(attempt - 1)`.
    Exponential {
        #[serde(with = "super::duration_ms", rename = "base_delay_ms")]
        base_delay: Duration,
    },
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed { delay }
    }

    pub fn exponential(base_delay: Duration) -> Self {
        Self::Exponential { base_delay }
    }

    /// Delay before the retry that follows failed attempt number `attempt` (1-indexed),
    /// never longer than `ceiling`.
    pub fn delay_for(&self, attempt: u32, ceiling: Duration) -> Duration {
        let delay = match *self {
            Self::Fixed { delay } => delay,
            Self::Exponential { base_delay } => {
                let exponent = attempt.saturating_sub(1).min(31);
                base_delay
                    .checked_mul(1u32 << exponent)
                    .unwrap_or(Duration::MAX)
            }
        };
        delay.min(ceiling)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(1))
    }
}

/// How often and how patiently a failing job is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt. A job runs at most `max_attempts + 1` times.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Never retry.
    pub fn none() -> Self {
        Self::new(0, Backoff::fixed(Duration::ZERO))
    }

    /// Whether a job that has made `attempt_count` attempts may run again.
    pub fn allows_retry(&self, attempt_count: u32) -> bool {
        attempt_count <= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Backoff::default())
    }
}
