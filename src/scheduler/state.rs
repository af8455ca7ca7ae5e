//! Scheduler state exposed to collaborators as immutable snapshots.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::color::{ColorTemperature, Period};
use crate::geo::Location;
use crate::geo::solar::SolarTimes;
use crate::transition::TransitionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPhase {
    Initializing,
    Running,
    Paused,
    Stopped,
}

impl SchedulerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerPhase::Initializing => "initializing",
            SchedulerPhase::Running => "running",
            SchedulerPhase::Paused => "paused",
            SchedulerPhase::Stopped => "stopped",
        }
    }
}

/// Whether filtering currently works, independent of a user pause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Available,
    Unavailable { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseRequest {
    Indefinitely,
    For(Duration),
    /// Resume at the next sunrise for the current location.
    UntilSunrise,
}

/// Snapshot of everything the scheduler knows.
#[derive(Debug, Clone, PartialEq)]
pub struct AppState {
    pub phase: SchedulerPhase,
    /// Set once initialisation succeeds and cleared by a stop. A pause
    /// leaves it set.
    pub enabled: bool,
    pub paused: bool,
    pub resume_at: Option<DateTime<Utc>>,
    pub active_profile: String,
    pub location: Option<Location>,
    pub solar_times: Option<SolarTimes>,
    pub period: Option<Period>,
    /// Last temperature the hardware accepted.
    pub applied: Option<ColorTemperature>,
    /// Temperature the profile asks for right now.
    pub target: Option<ColorTemperature>,
    pub transition: Option<TransitionState>,
    pub availability: Availability,
    pub consecutive_failures: u32,
    pub coarse_interval: Duration,
}

impl AppState {
    pub fn new(active_profile: impl Into<String>, coarse_interval: Duration) -> Self {
        Self {
            phase: SchedulerPhase::Initializing,
            enabled: false,
            paused: false,
            resume_at: None,
            active_profile: active_profile.into(),
            location: None,
            solar_times: None,
            period: None,
            applied: None,
            target: None,
            transition: None,
            availability: Availability::Available,
            consecutive_failures: 0,
            coarse_interval,
        }
    }

    /// True when a filter is actively being maintained on the displays.
    pub fn is_filtering(&self) -> bool {
        self.enabled
            && self.phase == SchedulerPhase::Running
            && !self.paused
            && self.availability == Availability::Available
    }

    /// Short status, distinguishing a user pause from a failure.
    pub fn status(&self) -> &'static str {
        match (&self.phase, self.paused, &self.availability) {
            (SchedulerPhase::Stopped, _, _) => "stopped",
            (SchedulerPhase::Initializing, _, _) => "starting",
            (_, true, _) => "paused by user",
            (_, false, Availability::Unavailable { .. }) => "filtering unavailable",
            (_, false, Availability::Available) => "active",
        }
    }
}
