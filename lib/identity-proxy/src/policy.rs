//! Retry policy for session introspection calls

use std::time::Duration;

/// Bounded retry with exponential backoff
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// HTTP status codes that trigger a retry
    pub retryable_status_codes: Vec<u16>,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retryable_status_codes: vec![429, 502, 503, 504], // Too Many Requests, Bad Gateway, Service Unavailable, Gateway Timeout
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Check if a status code should trigger a retry
    pub fn should_retry(&self, status: u16) -> bool {
        self.retryable_status_codes.contains(&status)
    }

    /// Whether another attempt is allowed after `attempts` have been made
    pub fn has_attempts_left(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Calculate backoff duration for the given retry count
    pub fn backoff_duration(&self, retry_count: u32) -> Duration {
        let base = self.initial_backoff.as_millis() as u64;
        let exponential = 2u64.saturating_pow(retry_count);
        let backoff_ms = base
            .saturating_mul(exponential)
            .min(self.max_backoff.as_millis() as u64);
        Duration::from_millis(backoff_ms)
    }
}
