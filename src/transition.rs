//! Temperature transitions.
//!
//! [`TransitionEngine`] turns a pair of temperatures and a progress fraction
//! into a temperature, either by interpolating Kelvin directly or by moving
//! along the Kelvin curve at an even pace in CIELAB. [`TransitionState`] tracks one time-parameterised
//! transition owned by the scheduler.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::color::{ColorTemperature, Easing, EasingContext, ease, lab};
use crate::error::{CoreError, CoreResult};
use crate::utils::interpolate_u32;

/// How the underlying colour is interpolated, independent of easing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterpolationMode {
    /// Straight Kelvin interpolation.
    #[default]
    Linear,
    /// Follow the Kelvin curve at an even CIELAB pace.
    Perceptual,
}

impl InterpolationMode {
    pub fn from_flag(use_perceptual: bool) -> Self {
        if use_perceptual {
            InterpolationMode::Perceptual
        } else {
            InterpolationMode::Linear
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TransitionEngine {
    mode: InterpolationMode,
}

impl TransitionEngine {
    pub fn new(mode: InterpolationMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> InterpolationMode {
        self.mode
    }

    /// Sample a transition at `progress`, inferring the easing context from
    /// the direction of change. Fails with [`CoreError::Range`] when progress
    /// is outside [0, 1].
    pub fn sample(
        &self,
        from: ColorTemperature,
        to: ColorTemperature,
        progress: f64,
        easing: Easing,
    ) -> CoreResult<ColorTemperature> {
        self.sample_with_context(from, to, progress, easing, EasingContext::between(from, to, false))
    }

    pub fn sample_with_context(
        &self,
        from: ColorTemperature,
        to: ColorTemperature,
        progress: f64,
        easing: Easing,
        context: EasingContext,
    ) -> CoreResult<ColorTemperature> {
        if !(0.0..=1.0).contains(&progress) {
            return Err(CoreError::Range(format!(
                "transition progress {} is outside [0, 1]",
                progress
            )));
        }

        let eased = ease(progress, easing, context);
        let sample = match self.mode {
            InterpolationMode::Linear => {
                ColorTemperature::clamped(interpolate_u32(from.kelvin(), to.kelvin(), eased) as f64)
            }
            InterpolationMode::Perceptual => lab::interpolate_kelvin(from, to, eased),
        };
        Ok(sample)
    }
}

/// One in-flight transition. Terminal once elapsed time reaches the duration.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionState {
    pub from: ColorTemperature,
    pub to: ColorTemperature,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub easing: Easing,
    pub context: EasingContext,
}

impl TransitionState {
    pub fn new(
        from: ColorTemperature,
        to: ColorTemperature,
        started_at: DateTime<Utc>,
        duration: Duration,
        easing: Easing,
        evening: bool,
    ) -> Self {
        Self {
            from,
            to,
            started_at,
            duration,
            easing,
            context: EasingContext::between(from, to, evening),
        }
    }

    /// `elapsed / duration` clamped to [0, 1]. A zero duration is complete
    /// immediately; a clock that moved backwards reads as no progress.
    pub fn progress_at(&self, now: DateTime<Utc>) -> f64 {
        let total = self.duration.as_millis() as f64;
        if total <= 0.0 {
            return 1.0;
        }
        let elapsed = (now - self.started_at).num_milliseconds() as f64;
        (elapsed / total).clamp(0.0, 1.0)
    }

    pub fn is_complete_at(&self, now: DateTime<Utc>) -> bool {
        self.progress_at(now) >= 1.0
    }

    pub fn current_at(&self, engine: &TransitionEngine, now: DateTime<Utc>) -> ColorTemperature {
        engine
            .sample_with_context(self.from, self.to, self.progress_at(now), self.easing, self.context)
            .unwrap_or(self.to)
    }

    /// Remaining time until completion.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        let elapsed = (now - self.started_at).to_std().unwrap_or_default();
        self.duration.saturating_sub(elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn k(kelvin: u32) -> ColorTemperature {
        ColorTemperature::new(kelvin).unwrap()
    }

    #[test]
    fn test_linear_midpoint() {
        let engine = TransitionEngine::new(InterpolationMode::Linear);
        let mid = engine.sample(k(6500), k(2700), 0.5, Easing::Linear).unwrap();
        assert!(mid.delta(k(4600)) <= 10, "got {}", mid);
    }

    #[test]
    fn test_progress_out_of_range_is_rejected() {
        let engine = TransitionEngine::default();
        for progress in [-0.01, 1.01, f64::NAN] {
            assert!(matches!(
                engine.sample(k(6500), k(2700), progress, Easing::Sigmoid),
                Err(CoreError::Range(_))
            ));
        }
    }

    #[test]
    fn test_endpoints_for_both_modes() {
        for mode in [InterpolationMode::Linear, InterpolationMode::Perceptual] {
            let engine = TransitionEngine::new(mode);
            for easing in Easing::ALL {
                assert_eq!(engine.sample(k(6000), k(3000), 0.0, easing).unwrap(), k(6000));
                assert_eq!(engine.sample(k(6000), k(3000), 1.0, easing).unwrap(), k(3000));
            }
        }
    }

    #[test]
    fn test_state_progress_and_completion() {
        let start = Utc::now();
        let state = TransitionState::new(
            k(6500),
            k(3500),
            start,
            Duration::from_secs(30),
            Easing::Linear,
            true,
        );
        let engine = TransitionEngine::default();

        assert_eq!(state.progress_at(start), 0.0);
        assert!((state.progress_at(start + TimeDelta::seconds(15)) - 0.5).abs() < 1e-9);
        assert_eq!(state.current_at(&engine, start + TimeDelta::seconds(15)), k(5000));
        assert!(!state.is_complete_at(start + TimeDelta::seconds(29)));
        assert!(state.is_complete_at(start + TimeDelta::seconds(30)));
        assert_eq!(state.current_at(&engine, start + TimeDelta::seconds(45)), k(3500));
        assert_eq!(state.progress_at(start - TimeDelta::seconds(5)), 0.0);
        assert_eq!(state.remaining_at(start + TimeDelta::seconds(10)), Duration::from_secs(20));
    }

    #[test]
    fn test_zero_duration_completes_immediately() {
        let now = Utc::now();
        let state = TransitionState::new(k(6500), k(3500), now, Duration::ZERO, Easing::Sigmoid, false);
        assert!(state.is_complete_at(now));
        assert_eq!(state.current_at(&TransitionEngine::default(), now), k(3500));
    }
}
