//! Time sources for the scheduler.
//!
//! The scheduler reads wall-clock time for solar lookups and monotonic time
//! for tick spacing. Comparing the two reveals system sleep and manual clock
//! changes.

use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::utils::lock;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn monotonic(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}

/// Clock moved by hand, for driving the scheduler deterministically.
#[derive(Debug)]
pub struct ManualClock {
    wall: Mutex<DateTime<Utc>>,
    monotonic: Mutex<Instant>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            wall: Mutex::new(start),
            monotonic: Mutex::new(Instant::now()),
        }
    }

    /// Advance both clocks, as if time passed normally.
    pub fn advance(&self, by: Duration) {
        *lock(&self.wall) += TimeDelta::from_std(by).unwrap_or(TimeDelta::zero());
        *lock(&self.monotonic) += by;
    }

    /// Move only the wall clock, as after a suspend or a manual change.
    pub fn jump(&self, by: TimeDelta) {
        *lock(&self.wall) += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *lock(&self.wall) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.wall)
    }

    fn monotonic(&self) -> Instant {
        *lock(&self.monotonic)
    }
}
