//! Retry pacing: exponential backoff and the injectable sleep seam.

use crate::config::FetchTuning;
use rand::Rng;
use std::time::Duration;

/// Blocking wait used for every backoff, cool-down and pacing delay.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// [`Sleeper`] backed by `std::thread::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Capped exponential backoff with proportional jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    base_ms: u64,
    max_ms: u64,
    jitter_percent: u64,
}

impl ExponentialBackoff {
    pub const fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms,
            jitter_percent: 10,
        }
    }

    pub fn with_jitter(mut self, jitter_percent: u64) -> Self {
        self.jitter_percent = jitter_percent;
        self
    }

    /// Upper bound applied to every computed delay.
    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponential_delay = self
            .base_ms
            .saturating_mul(2u64.saturating_pow(attempt.min(20)));
        let capped_delay = exponential_delay.min(self.max_ms);
        let jitter = if self.jitter_percent > 0 && capped_delay > 0 {
            let spread = capped_delay.saturating_mul(self.jitter_percent) / 100;
            rand::thread_rng().gen_range(0..=spread)
        } else {
            0
        };
        Duration::from_millis(capped_delay.saturating_add(jitter).min(self.max_ms))
    }
}

/// Bounded retry policy driving the fetch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: ExponentialBackoff,
    pub multiplier_cap: u32,
}

impl RetryPolicy {
    /// Build the policy described by `tuning`.
    pub fn from_tuning(tuning: &FetchTuning) -> Self {
        Self {
            max_attempts: tuning.max_attempts.max(1),
            backoff: ExponentialBackoff::new(tuning.backoff_base_ms, tuning.backoff_max_ms),
            multiplier_cap: tuning.throttle_multiplier_cap.max(1),
        }
    }

    /// Backoff before retry `attempt` (one-based), scaled by the throttle multiplier.
    pub fn delay(&self, attempt: u32, multiplier: u32) -> Duration {
        let base = self.backoff.delay(attempt.saturating_sub(1));
        base.saturating_mul(multiplier.max(1)).min(self.backoff.max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially() {
        let backoff = ExponentialBackoff::new(100, 10_000).with_jitter(0);
        assert_eq!(backoff.delay(0).as_millis(), 100);
        assert_eq!(backoff.delay(1).as_millis(), 200);
        assert_eq!(backoff.delay(2).as_millis(), 400);
    }

    #[test]
    fn backoff_respects_cap_with_jitter() {
        let backoff = ExponentialBackoff::new(100, 1_000);
        for attempt in 0..30 {
            assert!(backoff.delay(attempt).as_millis() <= 1_000);
        }
    }

    #[test]
    fn multiplier_scales_but_stays_capped() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff: ExponentialBackoff::new(100, 1_000).with_jitter(0),
            multiplier_cap: 16,
        };
        assert_eq!(policy.delay(1, 1).as_millis(), 100);
        assert_eq!(policy.delay(1, 4).as_millis(), 400);
        assert_eq!(policy.delay(3, 8).as_millis(), 1_000);
    }
}
