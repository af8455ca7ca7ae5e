//! Adaptive coarse-loop interval.
//!
//! Consistently fast cycles narrow the interval step by step towards the
//! minimum; slow cycles widen it towards the maximum. Failures switch to a
//! geometric backoff capped at [`MAXIMUM_BACKOFF_INTERVAL`], and the first
//! success after a failure resets everything to the base interval.

use std::time::Duration;

use crate::constants::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdaptiveInterval {
    base: Duration,
    min: Duration,
    max: Duration,
    current: Duration,
    failures: u32,
    fast_streak: u32,
}

impl AdaptiveInterval {
    pub fn new(base: Duration, min: Duration, max: Duration) -> Self {
        let min = min.min(base);
        let max = max.max(base);
        Self {
            base,
            min,
            max,
            current: base,
            failures: 0,
            fast_streak: 0,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Interval to wait before the next cycle. Near a transition window the
    /// minimum applies, unless we are backing off.
    pub fn effective(&self, near_window: bool) -> Duration {
        if near_window && self.failures == 0 {
            self.current.min(self.min)
        } else {
            self.current
        }
    }

    pub fn record_success(&mut self, elapsed: Duration) -> Duration {
        if self.failures > 0 {
            self.failures = 0;
            self.fast_streak = 0;
            self.current = self.base;
            return self.current;
        }

        let step = Duration::from_secs(COARSE_INTERVAL_STEP_SECS);
        if elapsed <= Duration::from_millis(FAST_CYCLE_MS) {
            self.fast_streak += 1;
            if self.fast_streak >= FAST_CYCLES_BEFORE_NARROWING {
                self.fast_streak = 0;
                self.current = self.current.saturating_sub(step).max(self.min);
            }
        } else if elapsed >= Duration::from_millis(SLOW_CYCLE_MS) {
            self.fast_streak = 0;
            self.current = (self.current * 2).min(self.max);
        } else {
            self.fast_streak = 0;
        }
        self.current
    }

    pub fn record_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.fast_streak = 0;
        let factor = 2u32.saturating_pow(self.failures.min(16));
        self.current = self
            .base
            .saturating_mul(factor)
            .min(Duration::from_secs(MAXIMUM_BACKOFF_INTERVAL));
        self.current
    }

    /// Replace the limits, keeping the failure count.
    pub fn set_limits(&mut self, base: Duration, min: Duration, max: Duration) {
        let failures = self.failures;
        *self = Self::new(base, min, max);
        if failures > 0 {
            self.failures = failures - 1;
            self.record_failure();
        }
    }
}

impl Default for AdaptiveInterval {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(DEFAULT_COARSE_INTERVAL),
            Duration::from_secs(DEFAULT_MIN_COARSE_INTERVAL),
            Duration::from_secs(DEFAULT_MAX_COARSE_INTERVAL),
        )
    }
}
