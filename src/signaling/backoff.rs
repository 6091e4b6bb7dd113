//! Bounded exponential reconnect backoff

use crate::config::SignalingConfig;
use std::time::Duration;

/// Reconnect delay policy: `min(base * 2^attempt, max)`, for at most
/// `max_attempts` consecutive retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts,
        }
    }

    pub fn from_config(config: &SignalingConfig) -> Self {
        Self::new(
            config.reconnect_base(),
            config.reconnect_max(),
            config.max_reconnect_attempts,
        )
    }

    /// Delay before the retry scheduled at `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map(|d| d.min(self.max))
            .unwrap_or(self.max)
    }

    /// Whether another retry may be scheduled after `attempt` retries
    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Full delay sequence for an uninterrupted run of failures
    pub fn schedule(&self) -> Vec<Duration> {
        (0..self.max_attempts).map(|a| self.delay(a)).collect()
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&SignalingConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_caps_at_thirty_seconds() {
        let secs: Vec<u64> = Backoff::default().schedule().iter().map(|d| d.as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 30, 30, 30, 30, 30]);
    }

    #[test]
    fn nth_retry_matches_closed_form() {
        let backoff = Backoff::default();
        for n in 1..=40u32 {
            let expected = 1000u64
                .checked_mul(1u64.checked_shl(n - 1).unwrap_or(u64::MAX))
                .unwrap_or(u64::MAX)
                .min(30_000);
            assert_eq!(backoff.delay(n - 1), Duration::from_millis(expected), "retry {}", n);
        }
    }

    #[test]
    fn huge_attempt_saturates() {
        let backoff = Backoff::new(Duration::from_millis(250), Duration::from_secs(5), 3);
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(5));
        assert!(backoff.allows(2));
        assert!(!backoff.allows(3));
    }
}
