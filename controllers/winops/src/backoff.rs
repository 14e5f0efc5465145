//! # Exponential Backoff
//!
//! Capped exponential backoff used for instance retries and for polling
//! while a step waits on the cluster. The delay is a pure function of the
//! attempt count, so step logic only records attempts and the caller decides
//! how long to wait.
//!
//! Sequence for `min = 5s, max = 300s`: 5s, 10s, 20s, 40s, 80s, 160s, 300s (max).

use std::time::Duration;

/// Backoff bounds: delay `min * 2^attempt`, capped at `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    min: Duration,
    max: Duration,
}

impl BackoffPolicy {
    /// Create a policy with the given minimum and maximum delay
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max: max.max(min) }
    }

    /// Delay before attempt number `attempt` (0-indexed)
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        ExponentialBackoff::calculate_for_error_count(attempt, self.min, self.max)
    }

    /// Start a stateful sequence for a polling loop
    #[must_use]
    pub fn start(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.min, self.max)
    }
}

/// Stateful exponential backoff calculator
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    min: Duration,
    max: Duration,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Create a new backoff with the given minimum and maximum delay
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max, attempt: 0 }
    }

    /// Get the next delay and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let delay = Self::calculate_for_error_count(self.attempt, self.min, self.max);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Calculate the delay for a given error count (stateless)
    ///
    /// `min` for error count 0, doubling per error, capped at `max`.
    #[must_use]
    pub fn calculate_for_error_count(error_count: u32, min: Duration, max: Duration) -> Duration {
        // 2^31 already exceeds any sensible cap
        let factor = 1u32.checked_shl(error_count.min(31)).unwrap_or(u32::MAX);
        min.checked_mul(factor).map_or(max, |d| d.min(max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_sequence() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(5), Duration::from_secs(300));

        assert_eq!(backoff.next_backoff(), Duration::from_secs(5));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(10));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(20));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(40));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(80));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(160));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(300)); // max
        assert_eq!(backoff.next_backoff(), Duration::from_secs(300));
    }

    #[test]
    fn test_large_error_counts_stay_capped() {
        let policy = BackoffPolicy::new(Duration::from_secs(5), Duration::from_secs(300));
        assert_eq!(policy.delay_for(0), Duration::from_secs(5));
        assert_eq!(policy.delay_for(40), Duration::from_secs(300));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(300));
    }
}
