use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy attached to a single activity call.
///
/// `max_attempts` counts every execution including the first one. Without a
/// back-off coefficient the delay between attempts is fixed at
/// `first_retry_interval_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub first_retry_interval_ms: u64,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_coefficient: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retry_interval_ms: Option<u64>,
}

impl RetryPolicy {
    pub fn new(first_retry_interval: Duration, max_attempts: u32) -> Self {
        Self {
            first_retry_interval_ms: first_retry_interval.as_millis() as u64,
            max_attempts,
            backoff_coefficient: None,
            max_retry_interval_ms: None,
        }
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = Some(coefficient);
        self
    }

    pub fn with_max_retry_interval(mut self, max: Duration) -> Self {
        self.max_retry_interval_ms = Some(max.as_millis() as u64);
        self
    }

    /// Total number of executions allowed, never less than one.
    pub fn attempts_allowed(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn has_attempts_remaining(&self, failed_attempt: u32) -> bool {
        failed_attempt < self.attempts_allowed()
    }

    /// Delay to wait after `failed_attempt` (1-based) fails, before the next attempt starts.
    pub fn delay_for_attempt(&self, failed_attempt: u32) -> Duration {
        let base = self.first_retry_interval_ms as f64;
        let exponent = failed_attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = match self.backoff_coefficient {
            Some(c) if c > 0.0 && c.is_finite() => base * c.powi(exponent),
            _ => base,
        };
        // f64 -> u64 casts saturate, NaN becomes 0
        let mut ms = raw as u64;
        if let Some(cap) = self.max_retry_interval_ms {
            ms = ms.min(cap);
        }
        Duration::from_millis(ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 3)
    }
}
