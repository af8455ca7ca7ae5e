//! Easing curves for temperature transitions.
//!
//! Every curve maps progress in [0, 1] onto [0, 1] with `ease(0) == 0`,
//! `ease(1) == 1` and no decrease in between.

use chrono::{NaiveTime, Timelike};
use serde::Deserialize;

use crate::color::ColorTemperature;
use crate::constants::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Easing {
    Linear,
    QuadIn,
    QuadOut,
    QuadInOut,
    CubicIn,
    CubicOut,
    CubicInOut,
    /// S-curve with imperceptible motion at both ends. Default for
    /// unattended transitions.
    #[default]
    Sigmoid,
    /// Exponential decay towards the target.
    Exponential,
    /// Shape chosen from the direction of change and the time of day.
    Circadian,
}

impl Easing {
    pub const ALL: [Easing; 10] = [
        Easing::Linear,
        Easing::QuadIn,
        Easing::QuadOut,
        Easing::QuadInOut,
        Easing::CubicIn,
        Easing::CubicOut,
        Easing::CubicInOut,
        Easing::Sigmoid,
        Easing::Exponential,
        Easing::Circadian,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Easing::Linear => "linear",
            Easing::QuadIn => "quad_in",
            Easing::QuadOut => "quad_out",
            Easing::QuadInOut => "quad_in_out",
            Easing::CubicIn => "cubic_in",
            Easing::CubicOut => "cubic_out",
            Easing::CubicInOut => "cubic_in_out",
            Easing::Sigmoid => "sigmoid",
            Easing::Exponential => "exponential",
            Easing::Circadian => "circadian",
        }
    }
}

/// Direction of a temperature change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// Kelvin falls, blue content is removed.
    #[default]
    Warming,
    /// Kelvin rises, blue content is added.
    Cooling,
}

impl Direction {
    pub fn between(from: ColorTemperature, to: ColorTemperature) -> Self {
        if to > from {
            Direction::Cooling
        } else {
            Direction::Warming
        }
    }
}

/// Inputs the circadian curve needs besides progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EasingContext {
    pub direction: Direction,
    pub evening: bool,
}

impl EasingContext {
    pub fn new(direction: Direction, evening: bool) -> Self {
        Self { direction, evening }
    }

    pub fn between(from: ColorTemperature, to: ColorTemperature, evening: bool) -> Self {
        Self::new(Direction::between(from, to), evening)
    }
}

/// Apply `easing` to `progress`. Progress outside [0, 1] (and NaN) is
/// clamped; range checking belongs to the caller.
pub fn ease(progress: f64, easing: Easing, context: EasingContext) -> f64 {
    if progress.is_nan() || progress <= 0.0 {
        return 0.0;
    }
    if progress >= 1.0 {
        return 1.0;
    }

    let p = progress;
    let value = match easing {
        Easing::Linear => p,
        Easing::QuadIn => p * p,
        Easing::QuadOut => quad_out(p),
        Easing::QuadInOut => {
            if p < 0.5 {
                2.0 * p * p
            } else {
                1.0 - (-2.0 * p + 2.0).powi(2) / 2.0
            }
        }
        Easing::CubicIn => p.powi(3),
        Easing::CubicOut => 1.0 - (1.0 - p).powi(3),
        Easing::CubicInOut => {
            if p < 0.5 {
                4.0 * p.powi(3)
            } else {
                1.0 - (-2.0 * p + 2.0).powi(3) / 2.0
            }
        }
        Easing::Sigmoid => sigmoid(p),
        Easing::Exponential => {
            (1.0 - (-EXPONENTIAL_RATE * p).exp()) / (1.0 - (-EXPONENTIAL_RATE).exp())
        }
        Easing::Circadian => circadian(p, context),
    };

    value.clamp(0.0, 1.0)
}

fn quad_out(p: f64) -> f64 {
    1.0 - (1.0 - p) * (1.0 - p)
}

fn sigmoid_raw(x: f64, steepness: f64) -> f64 {
    1.0 / (1.0 + (-steepness * x).exp())
}

/// Logistic curve over x in [-1, 1], rescaled to hit 0 and 1 exactly.
fn sigmoid_norm(x: f64, steepness: f64) -> f64 {
    let low = sigmoid_raw(-1.0, steepness);
    let high = sigmoid_raw(1.0, steepness);
    (sigmoid_raw(x, steepness) - low) / (high - low)
}

fn sigmoid(p: f64) -> f64 {
    sigmoid_norm(2.0 * p - 1.0, SIGMOID_STEEPNESS)
}

// Adding blue in the evening starts slowly; restoring it in the morning
// front-loads the change; warming always uses the S-curve.
fn circadian(p: f64, context: EasingContext) -> f64 {
    match (context.direction, context.evening) {
        (Direction::Cooling, true) => p.powi(3),
        (Direction::Cooling, false) => quad_out(p),
        (Direction::Warming, _) => sigmoid(p),
    }
}

pub fn is_evening(local_time: NaiveTime) -> bool {
    (EVENING_START_HOUR..=EVENING_END_HOUR).contains(&local_time.hour())
}

/// Recommend an easing curve for a change of `delta_kelvin` at `local_time`.
///
/// Small changes go linear. Large changes near the evening transition get the
/// circadian curve, large changes at other times the sigmoid.
pub fn recommend_easing(delta_kelvin: u32, local_time: NaiveTime) -> Easing {
    if delta_kelvin < SMALL_DELTA_KELVIN {
        Easing::Linear
    } else if is_evening(local_time) {
        Easing::Circadian
    } else {
        Easing::Sigmoid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contexts() -> [EasingContext; 4] {
        [
            EasingContext::new(Direction::Warming, false),
            EasingContext::new(Direction::Warming, true),
            EasingContext::new(Direction::Cooling, false),
            EasingContext::new(Direction::Cooling, true),
        ]
    }

    #[test]
    fn test_endpoints_are_exact() {
        for easing in Easing::ALL {
            for ctx in contexts() {
                assert_eq!(ease(0.0, easing, ctx), 0.0, "{:?}", easing);
                assert_eq!(ease(1.0, easing, ctx), 1.0, "{:?}", easing);
            }
        }
    }

    #[test]
    fn test_monotonic_over_eleven_points() {
        for easing in Easing::ALL {
            for ctx in contexts() {
                let samples: Vec<f64> = (0..=10).map(|i| ease(i as f64 / 10.0, easing, ctx)).collect();
                for pair in samples.windows(2) {
                    assert!(pair[1] >= pair[0], "{:?} {:?}: {:?}", easing, ctx, samples);
                }
            }
        }
    }

    #[test]
    fn test_sigmoid_is_symmetric() {
        let ctx = EasingContext::default();
        assert!((ease(0.5, Easing::Sigmoid, ctx) - 0.5).abs() < 1e-12);
        let low = ease(0.2, Easing::Sigmoid, ctx);
        let high = ease(0.8, Easing::Sigmoid, ctx);
        assert!((low + high - 1.0).abs() < 1e-12);
        // Gentle start
        assert!(ease(0.05, Easing::Sigmoid, ctx) < 0.05);
    }

    #[test]
    fn test_circadian_is_slower_adding_blue_in_the_evening() {
        let evening = EasingContext::new(Direction::Cooling, true);
        let morning = EasingContext::new(Direction::Cooling, false);
        for i in 1..10 {
            let p = i as f64 / 10.0;
            assert!(ease(p, Easing::Circadian, evening) < ease(p, Easing::Circadian, morning));
        }
    }

    #[test]
    fn test_out_of_range_progress_is_clamped() {
        let ctx = EasingContext::default();
        assert_eq!(ease(-0.3, Easing::QuadIn, ctx), 0.0);
        assert_eq!(ease(1.7, Easing::CubicOut, ctx), 1.0);
        assert_eq!(ease(f64::NAN, Easing::Linear, ctx), 0.0);
    }

    #[test]
    fn test_recommendation() {
        let noon = NaiveTime::from_hms_opt(12, 0, 0).unwrap();
        let dusk = NaiveTime::from_hms_opt(19, 30, 0).unwrap();
        assert_eq!(recommend_easing(100, dusk), Easing::Linear);
        assert_eq!(recommend_easing(2000, dusk), Easing::Circadian);
        assert_eq!(recommend_easing(2000, noon), Easing::Sigmoid);
    }
}
