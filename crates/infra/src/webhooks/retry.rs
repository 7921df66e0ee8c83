//! Delivery retry policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// base * 2^(attempt-1)
    #[default]
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total delivery attempts before a message is dead.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Ceiling for a single delay, jitter included.
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    /// 30s doubling per failure, capped at 6h, dead after 8 attempts.
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(6 * 60 * 60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay after the `attempt`-th failure (1-indexed).
    ///
    /// `salt` spreads jitter across messages failing at the same moment.
    pub fn delay_for_attempt(&self, attempt: u32, salt: u64) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
        };

        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as u64 * 17).wrapping_add(salt) % 100) as f64 / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).clamp(0.0, max_ms) as u64)
    }

    /// Whether another attempt is allowed after `attempts` failures.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// When to try again after `attempts` failures, or `None` once exhausted.
    pub fn next_attempt_at(&self, attempts: u32, salt: u64, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.should_retry(attempts) {
            return None;
        }
        let delay = chrono::Duration::from_std(self.delay_for_attempt(attempts, salt)).unwrap_or_else(|_| chrono::Duration::hours(6));
        Some(now + delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_until_the_ceiling() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::exponential(20, Duration::from_secs(30), Duration::from_secs(300))
        };
        assert_eq!(policy.delay_for_attempt(1, 0), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(2, 0), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(4, 0), Duration::from_secs(240));
        assert_eq!(policy.delay_for_attempt(5, 0), Duration::from_secs(300));
        assert_eq!(policy.delay_for_attempt(19, 0), Duration::from_secs(300));
    }

    #[test]
    fn jitter_stays_within_ten_percent_and_under_ceiling() {
        let policy = RetryPolicy::default();
        for salt in 0..100 {
            let d = policy.delay_for_attempt(2, salt).as_millis();
            assert!((54_000..=66_000).contains(&d), "delay {d}ms out of range");
        }
        assert!(policy.delay_for_attempt(40, 7) <= policy.max_delay);
    }

    #[test]
    fn exhaustion_after_max_attempts() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(1));
        let now = Utc::now();
        assert_eq!(policy.next_attempt_at(2, 0, now), Some(now + chrono::Duration::seconds(1)));
        assert_eq!(policy.next_attempt_at(3, 0, now), None);
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }
}
