//! Exponential backoff for repeated worker failures.

use std::time::Duration;

use crate::config::BackoffConfig;

/// Delay tracker for consecutive failures of one thread.
///
/// The first failure waits `min`, every further failure doubles the delay up
/// to `max`. A success resets both the delay and the failure count.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    min: Duration,
    max: Duration,
    max_consecutive_failures: Option<u32>,
    delay: Duration,
    failures: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(&BackoffConfig::default())
    }
}

impl ExponentialBackoff {
    /// Create a backoff from configuration.
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            min: config.min_backoff(),
            max: config.max_backoff(),
            max_consecutive_failures: config.max_consecutive_failures,
            delay: Duration::ZERO,
            failures: 0,
        }
    }

    /// Reset after a successful run.
    pub fn record_success(&mut self) {
        self.failures = 0;
        self.delay = Duration::ZERO;
    }

    /// Register a failure.
    ///
    /// Returns `true` once the consecutive-failure ceiling has been reached.
    pub fn record_failure(&mut self) -> bool {
        self.failures = self.failures.saturating_add(1);
        let next = if self.delay < self.min {
            self.min
        } else {
            self.delay.saturating_mul(2)
        };
        self.delay = next.min(self.max);

        self.max_consecutive_failures
            .is_some_and(|ceiling| self.failures >= ceiling)
    }

    /// Delay to apply before the next attempt.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Number of failures since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    /// Sleep for the current delay, if any.
    pub fn wait(&self) {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_failures: Option<u32>) -> BackoffConfig {
        BackoffConfig {
            min_backoff_ms: 100,
            max_backoff_ms: 1000,
            max_consecutive_failures: max_failures,
        }
    }

    #[test]
    fn test_starts_without_delay() {
        let backoff = ExponentialBackoff::new(&config(Some(6)));
        assert_eq!(backoff.delay(), Duration::ZERO);
        assert_eq!(backoff.consecutive_failures(), 0);
    }

    #[test]
    fn test_failures_double_up_to_max() {
        let mut backoff = ExponentialBackoff::new(&config(None));
        let delays: Vec<u128> = (0..6)
            .map(|_| {
                backoff.record_failure();
                backoff.delay().as_millis()
            })
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn test_ceiling_reached() {
        let mut backoff = ExponentialBackoff::new(&config(Some(3)));
        assert!(!backoff.record_failure());
        assert!(!backoff.record_failure());
        assert!(backoff.record_failure());
        assert_eq!(backoff.consecutive_failures(), 3);
    }

    #[test]
    fn test_unlimited_never_reaches_ceiling() {
        let mut backoff = ExponentialBackoff::new(&config(None));
        for _ in 0..50 {
            assert!(!backoff.record_failure());
        }
    }

    #[test]
    fn test_success_resets() {
        let mut backoff = ExponentialBackoff::new(&config(Some(3)));
        backoff.record_failure();
        backoff.record_failure();
        backoff.record_success();
        assert_eq!(backoff.delay(), Duration::ZERO);
        assert!(!backoff.record_failure());
        assert_eq!(backoff.delay(), Duration::from_millis(100));
    }
}
