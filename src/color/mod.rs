//! Color temperature model and profile-driven temperature lookup.
//!
//! A [`ColorProfile`] decides which two temperatures bound the current period
//! of the day and how far into a transition window we are. The
//! [`TransitionEngine`](crate::transition::TransitionEngine) decides how the
//! value moves between them.

use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use std::time::Duration;

use crate::constants::*;
use crate::error::{CoreError, CoreResult};
use crate::geo::solar::{DayKind, SolarTimes};
use crate::transition::TransitionEngine;

pub mod easing;
pub mod lab;

pub use easing::{Direction, Easing, EasingContext, ease, recommend_easing};

/// Integer Kelvin value within [`MINIMUM_TEMP`, `MAXIMUM_TEMP`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColorTemperature(u32);

impl ColorTemperature {
    pub const MIN: ColorTemperature = ColorTemperature(MINIMUM_TEMP);
    pub const MAX: ColorTemperature = ColorTemperature(MAXIMUM_TEMP);
    /// D65, the identity ramp.
    pub const NEUTRAL: ColorTemperature = ColorTemperature(6500);

    /// Validate a Kelvin value. Values outside the supported range are
    /// rejected rather than clamped.
    pub fn new(kelvin: u32) -> CoreResult<Self> {
        if !(MINIMUM_TEMP..=MAXIMUM_TEMP).contains(&kelvin) {
            return Err(CoreError::InvalidInput(format!(
                "temperature {}K must be between {}K and {}K",
                kelvin, MINIMUM_TEMP, MAXIMUM_TEMP
            )));
        }
        Ok(Self(kelvin))
    }

    /// Round and clamp a computed value into range.
    pub fn clamped(kelvin: f64) -> Self {
        if kelvin.is_nan() {
            return Self::NEUTRAL;
        }
        Self(kelvin.round().clamp(MINIMUM_TEMP as f64, MAXIMUM_TEMP as f64) as u32)
    }

    pub fn kelvin(self) -> u32 {
        self.0
    }

    pub fn rgb_gain(self) -> RgbGain {
        kelvin_to_rgb_gain(self.0)
    }

    /// Absolute difference in Kelvin.
    pub fn delta(self, other: ColorTemperature) -> u32 {
        self.0.abs_diff(other.0)
    }
}

impl std::fmt::Display for ColorTemperature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}K", self.0)
    }
}

impl TryFrom<u32> for ColorTemperature {
    type Error = CoreError;

    fn try_from(kelvin: u32) -> CoreResult<Self> {
        Self::new(kelvin)
    }
}

/// Per-channel multipliers in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RgbGain {
    pub red: f64,
    pub green: f64,
    pub blue: f64,
}

impl RgbGain {
    pub const IDENTITY: RgbGain = RgbGain {
        red: 1.0,
        green: 1.0,
        blue: 1.0,
    };

    pub fn channels(&self) -> [f64; 3] {
        [self.red, self.green, self.blue]
    }
}

/// Convert Kelvin to RGB gains using a blackbody curve fit.
///
/// Below 6600K red is saturated and blue rises strictly with temperature;
/// above it red and green fall off while blue stays saturated. The result is
/// normalised so every channel lies in [0, 1].
pub fn kelvin_to_rgb_gain(kelvin: u32) -> RgbGain {
    let temp = kelvin.clamp(MINIMUM_TEMP, MAXIMUM_TEMP) as f64 / 100.0;

    let (red, green, blue) = if temp <= 66.0 {
        let green = 99.4708025861 * temp.ln() - 161.1195681661;
        let blue = if temp <= 19.0 {
            0.0
        } else {
            138.5177312231 * (temp - 10.0).ln() - 305.0447927307
        };
        (255.0, green, blue)
    } else {
        let red = 329.698727446 * (temp - 60.0).powf(-0.1332047592);
        let green = 288.1221695283 * (temp - 60.0).powf(-0.0755148492);
        (red, green, 255.0)
    };

    RgbGain {
        red: (red / 255.0).clamp(0.0, 1.0),
        green: (green / 255.0).clamp(0.0, 1.0),
        blue: (blue / 255.0).clamp(0.0, 1.0),
    }
}

/// Closest temperature for a gain triple, searched perceptually.
pub fn rgb_gain_to_kelvin(gain: RgbGain) -> ColorTemperature {
    lab::nearest_kelvin(gain, MINIMUM_TEMP, MAXIMUM_TEMP)
}

/// Where transition windows sit relative to sunrise and sunset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowAlignment {
    /// Morning transition ends at sunrise, evening starts at sunset.
    #[default]
    Outside,
    /// Morning transition starts at sunrise, evening ends at sunset.
    Inside,
    /// Windows are centred on the solar events.
    Centered,
}

impl WindowAlignment {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowAlignment::Outside => "outside",
            WindowAlignment::Inside => "inside",
            WindowAlignment::Centered => "centered",
        }
    }
}

/// Half-open interval `[start, end)` during which the temperature moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TransitionWindow {
    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        time >= self.start && time < self.end
    }

    pub fn length(&self) -> TimeDelta {
        self.end - self.start
    }

    /// Linear progress through the window, clamped to [0, 1].
    pub fn progress_at(&self, time: DateTime<Utc>) -> f64 {
        let total = self.length().num_milliseconds();
        if total <= 0 {
            return 1.0;
        }
        ((time - self.start).num_milliseconds() as f64 / total as f64).clamp(0.0, 1.0)
    }

    /// True when `time` is inside the window or within `margin` of it.
    pub fn is_near(&self, time: DateTime<Utc>, margin: TimeDelta) -> bool {
        time >= self.start - margin && time < self.end + margin
    }
}

/// Period of the day at a given instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Period {
    Day,
    Night,
    Sunrise(f64),
    Sunset(f64),
}

impl Period {
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Period::Sunrise(_) | Period::Sunset(_))
    }
}

/// User profile: the temperatures to target and how to move between them.
#[derive(Debug, Clone, PartialEq)]
pub struct ColorProfile {
    pub id: String,
    pub day: ColorTemperature,
    pub night: ColorTemperature,
    pub transition_duration: Duration,
    pub sunrise_offset: TimeDelta,
    pub sunset_offset: TimeDelta,
    pub alignment: WindowAlignment,
    pub easing: Easing,
}

impl ColorProfile {
    pub fn new(id: impl Into<String>, day: ColorTemperature, night: ColorTemperature) -> Self {
        Self {
            id: id.into(),
            day,
            night,
            transition_duration: Duration::from_secs(DEFAULT_TRANSITION_DURATION * 60),
            sunrise_offset: TimeDelta::zero(),
            sunset_offset: TimeDelta::zero(),
            alignment: WindowAlignment::default(),
            easing: Easing::default(),
        }
    }

    pub fn with_transition_duration(mut self, duration: Duration) -> Self {
        self.transition_duration = duration;
        self
    }

    pub fn with_offsets(mut self, sunrise: TimeDelta, sunset: TimeDelta) -> Self {
        self.sunrise_offset = sunrise;
        self.sunset_offset = sunset;
        self
    }

    pub fn with_alignment(mut self, alignment: WindowAlignment) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn with_easing(mut self, easing: Easing) -> Self {
        self.easing = easing;
        self
    }

    /// Reject profiles with an empty id or durations/offsets outside limits.
    pub fn validate(&self) -> CoreResult<()> {
        if self.id.trim().is_empty() {
            return Err(CoreError::InvalidInput("profile id must not be empty".into()));
        }
        let minutes = self.transition_duration.as_secs() / 60;
        if !(MINIMUM_TRANSITION_DURATION..=MAXIMUM_TRANSITION_DURATION).contains(&minutes) {
            return Err(CoreError::InvalidInput(format!(
                "profile '{}': transition duration {} minutes must be between {} and {}",
                self.id, minutes, MINIMUM_TRANSITION_DURATION, MAXIMUM_TRANSITION_DURATION
            )));
        }
        for (label, offset) in [("sunrise", self.sunrise_offset), ("sunset", self.sunset_offset)] {
            if offset.num_minutes().abs() > MAXIMUM_SOLAR_OFFSET {
                return Err(CoreError::InvalidInput(format!(
                    "profile '{}': {} offset {} minutes exceeds ±{}",
                    self.id,
                    label,
                    offset.num_minutes(),
                    MAXIMUM_SOLAR_OFFSET
                )));
            }
        }
        Ok(())
    }

    pub fn min_temperature(&self) -> ColorTemperature {
        self.day.min(self.night)
    }

    pub fn max_temperature(&self) -> ColorTemperature {
        self.day.max(self.night)
    }

    /// Morning and evening transition windows for a normal day.
    ///
    /// Returns `None` for polar dates and when the offsets leave no daytime.
    /// Windows that would meet or cross are cut at the midpoint of the day.
    pub fn windows(&self, solar: &SolarTimes) -> Option<(TransitionWindow, TransitionWindow)> {
        if solar.kind() != DayKind::Normal {
            return None;
        }

        let sunrise = solar.sunrise() + self.sunrise_offset;
        let sunset = solar.sunset() + self.sunset_offset;
        if sunset <= sunrise {
            return None;
        }

        let duration = TimeDelta::from_std(self.transition_duration)
            .unwrap_or_else(|_| TimeDelta::minutes(DEFAULT_TRANSITION_DURATION as i64));
        let half = duration / 2;

        let (mut morning, mut evening) = match self.alignment {
            WindowAlignment::Outside => (
                TransitionWindow { start: sunrise - duration, end: sunrise },
                TransitionWindow { start: sunset, end: sunset + duration },
            ),
            WindowAlignment::Inside => (
                TransitionWindow { start: sunrise, end: sunrise + duration },
                TransitionWindow { start: sunset - duration, end: sunset },
            ),
            WindowAlignment::Centered => (
                TransitionWindow { start: sunrise - half, end: sunrise + half },
                TransitionWindow { start: sunset - half, end: sunset + half },
            ),
        };

        let midday = sunrise + (sunset - sunrise) / 2;
        if morning.end > midday {
            morning.end = midday;
            morning.start = morning.start.min(midday);
        }
        if evening.start < midday {
            evening.start = midday;
            evening.end = evening.end.max(midday);
        }

        Some((morning, evening))
    }

    pub fn period_at(&self, time: DateTime<Utc>, solar: &SolarTimes) -> Period {
        match solar.kind() {
            DayKind::PolarDay => return Period::Day,
            DayKind::PolarNight => return Period::Night,
            DayKind::Normal => {}
        }

        let Some((morning, evening)) = self.windows(solar) else {
            return Period::Night;
        };

        if morning.contains(time) {
            Period::Sunrise(morning.progress_at(time))
        } else if evening.contains(time) {
            Period::Sunset(evening.progress_at(time))
        } else if time >= morning.end && time < evening.start {
            Period::Day
        } else {
            Period::Night
        }
    }

    /// Target temperature at `time`.
    ///
    /// Day and night values apply outside the windows; inside a window the
    /// engine produces the value between them using the profile's easing.
    pub fn temperature_at(
        &self,
        time: DateTime<Utc>,
        solar: &SolarTimes,
        engine: &TransitionEngine,
    ) -> ColorTemperature {
        match self.period_at(time, solar) {
            Period::Day => self.day,
            Period::Night => self.night,
            Period::Sunrise(progress) => engine
                .sample_with_context(
                    self.night,
                    self.day,
                    progress,
                    self.easing,
                    EasingContext::between(self.night, self.day, false),
                )
                .unwrap_or(self.day),
            Period::Sunset(progress) => engine
                .sample_with_context(
                    self.day,
                    self.night,
                    progress,
                    self.easing,
                    EasingContext::between(self.day, self.night, true),
                )
                .unwrap_or(self.night),
        }
    }
}

impl Default for ColorProfile {
    fn default() -> Self {
        Self::new(
            DEFAULT_PROFILE_ID,
            ColorTemperature(DEFAULT_DAY_TEMP),
            ColorTemperature(DEFAULT_NIGHT_TEMP),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Location;
    use crate::geo::solar::SolarCalculator;
    use crate::transition::InterpolationMode;
    use chrono::{NaiveDate, TimeZone};

    fn nyc_solstice() -> SolarTimes {
        let location = Location::new(40.7128, -74.0060).unwrap();
        SolarCalculator::default()
            .calculate(&location, NaiveDate::from_ymd_opt(2024, 6, 21).unwrap())
            .unwrap()
    }

    fn profile() -> ColorProfile {
        ColorProfile::new(
            "test",
            ColorTemperature::new(6500).unwrap(),
            ColorTemperature::new(3000).unwrap(),
        )
        .with_transition_duration(Duration::from_secs(30 * 60))
    }

    #[test]
    fn test_temperature_validation() {
        assert!(ColorTemperature::new(999).is_err());
        assert!(ColorTemperature::new(10001).is_err());
        assert_eq!(ColorTemperature::new(1000).unwrap(), ColorTemperature::MIN);
        assert_eq!(ColorTemperature::clamped(12345.6), ColorTemperature::MAX);
        assert_eq!(ColorTemperature::clamped(4599.6).kelvin(), 4600);
        assert_eq!(ColorTemperature::new(2700).unwrap().to_string(), "2700K");
    }

    #[test]
    fn test_gain_at_neutral_is_close_to_identity() {
        let gain = kelvin_to_rgb_gain(6500);
        assert_eq!(gain.red, 1.0);
        assert!(gain.green > 0.95);
        assert!(gain.blue > 0.95);
    }

    #[test]
    fn test_blue_rises_and_red_holds_below_6600() {
        let mut previous = kelvin_to_rgb_gain(2000);
        for kelvin in (2100..=6600).step_by(100) {
            let gain = kelvin_to_rgb_gain(kelvin);
            assert!(gain.blue > previous.blue, "blue flat at {}K", kelvin);
            assert!(gain.red + 1e-9 >= previous.red, "red fell at {}K", kelvin);
            previous = gain;
        }
    }

    #[test]
    fn test_gains_stay_in_unit_range() {
        for kelvin in (MINIMUM_TEMP..=MAXIMUM_TEMP).step_by(50) {
            for channel in kelvin_to_rgb_gain(kelvin).channels() {
                assert!((0.0..=1.0).contains(&channel), "{}K -> {}", kelvin, channel);
            }
        }
    }

    #[test]
    fn test_inverse_model_finds_source_temperature() {
        let found = rgb_gain_to_kelvin(kelvin_to_rgb_gain(3400));
        assert!(found.delta(ColorTemperature::new(3400).unwrap()) <= 10);
    }

    #[test]
    fn test_day_and_night_outside_windows() {
        let solar = nyc_solstice();
        let profile = profile();
        let engine = TransitionEngine::new(InterpolationMode::Linear);

        let after_sunrise = solar.sunrise() + TimeDelta::minutes(1);
        let before_sunset = solar.sunset() - TimeDelta::minutes(1);
        assert_eq!(profile.temperature_at(after_sunrise, &solar, &engine), profile.day);
        assert_eq!(profile.temperature_at(before_sunset, &solar, &engine), profile.day);

        let midnight = chrono_tz::America::New_York
            .with_ymd_and_hms(2024, 6, 21, 0, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(profile.temperature_at(midnight, &solar, &engine), profile.night);
    }

    #[test]
    fn test_window_values_lie_between_endpoints() {
        let solar = nyc_solstice();
        let profile = profile();
        let engine = TransitionEngine::new(InterpolationMode::Linear);

        let mid_evening = solar.sunset() + TimeDelta::minutes(15);
        assert!(matches!(profile.period_at(mid_evening, &solar), Period::Sunset(p) if (p - 0.5).abs() < 1e-6));
        let value = profile.temperature_at(mid_evening, &solar, &engine);
        assert!(value > profile.night && value < profile.day);

        let dawn = solar.sunrise() - TimeDelta::minutes(10);
        assert!(matches!(profile.period_at(dawn, &solar), Period::Sunrise(_)));
    }

    #[test]
    fn test_alignment_moves_windows() {
        let solar = nyc_solstice();
        let duration = TimeDelta::minutes(30);

        let (m, e) = profile().windows(&solar).unwrap();
        assert_eq!(m.end, solar.sunrise());
        assert_eq!(e.start, solar.sunset());

        let (m, e) = profile().with_alignment(WindowAlignment::Inside).windows(&solar).unwrap();
        assert_eq!(m.start, solar.sunrise());
        assert_eq!(e.end, solar.sunset());
        assert_eq!(m.length(), duration);

        let (m, _) = profile().with_alignment(WindowAlignment::Centered).windows(&solar).unwrap();
        assert_eq!(m.start, solar.sunrise() - duration / 2);
    }

    #[test]
    fn test_offsets_shift_windows() {
        let solar = nyc_solstice();
        let shifted = profile().with_offsets(TimeDelta::minutes(20), TimeDelta::minutes(-20));
        let (m, e) = shifted.windows(&solar).unwrap();
        assert_eq!(m.end, solar.sunrise() + TimeDelta::minutes(20));
        assert_eq!(e.start, solar.sunset() - TimeDelta::minutes(20));
    }

    #[test]
    fn test_overlapping_inside_windows_are_cut_at_midday() {
        let location = Location::new(66.0, 0.0).unwrap();
        let solar = SolarCalculator::default()
            .calculate(&location, NaiveDate::from_ymd_opt(2024, 12, 21).unwrap())
            .unwrap();
        let long = profile()
            .with_alignment(WindowAlignment::Inside)
            .with_transition_duration(Duration::from_secs(120 * 60));
        let (m, e) = long.windows(&solar).unwrap();
        assert!(m.end <= e.start);
    }

    #[test]
    fn test_polar_dates_hold_a_single_value() {
        let location = Location::new(80.0, 15.0).unwrap();
        let calc = SolarCalculator::default();
        let engine = TransitionEngine::default();

        let summer = calc
            .calculate(&location, NaiveDate::from_ymd_opt(2024, 6, 21).unwrap())
            .unwrap();
        let winter = calc
            .calculate(&location, NaiveDate::from_ymd_opt(2024, 12, 21).unwrap())
            .unwrap();
        assert_eq!(profile().temperature_at(summer.solar_noon(), &summer, &engine), profile().day);
        assert_eq!(profile().temperature_at(winter.solar_noon(), &winter, &engine), profile().night);
    }

    #[test]
    fn test_profile_validation() {
        assert!(profile().validate().is_ok());
        assert!(profile().with_transition_duration(Duration::from_secs(60)).validate().is_err());
        assert!(
            profile()
                .with_offsets(TimeDelta::minutes(181), TimeDelta::zero())
                .validate()
                .is_err()
        );
        let mut unnamed = profile();
        unnamed.id = " ".into();
        assert!(unnamed.validate().is_err());
    }
}
