//! Solar event calculation for a location and calendar date.
//!
//! The calculator follows the NOAA solar equations: the date is turned into
//! a continuous Julian day, corrected to terrestrial time with ΔT, and the
//! orbital elements (mean anomaly, apparent ecliptic longitude, corrected
//! obliquity) give the solar declination and the equation of time. The
//! hour-angle equation is then solved for the configured zenith, refined
//! by re-evaluating the sun's position at the event time itself until the
//! estimate settles below a second.
//!
//! Results are UTC timestamps anchored to the location's local calendar
//! date. When the hour-angle equation has no real solution the date is
//! classified as polar day or polar night and sentinel times are returned.

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Deserialize;

use crate::constants::*;
use crate::error::{CoreError, CoreResult};
use crate::geo::{Location, validate_coordinates};
use crate::logger::Log;

/// Zenith definition used for sunrise and sunset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TwilightMode {
    /// Upper limb on the horizon, 90.833° with standard refraction.
    #[default]
    Official,
    /// Civil twilight, 96.0°.
    Civil,
    /// Strict civil twilight, 96.5°.
    CivilStrict,
}

impl TwilightMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TwilightMode::Official => "official",
            TwilightMode::Civil => "civil",
            TwilightMode::CivilStrict => "civil_strict",
        }
    }

    /// Zenith angle in degrees. Refraction only shifts the official horizon;
    /// the civil angles are defined below it already.
    pub fn zenith(self, refraction: f64) -> f64 {
        match self {
            TwilightMode::Official => OFFICIAL_ZENITH_BASE + refraction,
            TwilightMode::Civil => CIVIL_ZENITH,
            TwilightMode::CivilStrict => CIVIL_STRICT_ZENITH,
        }
    }
}

/// Classification of a date at a location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayKind {
    Normal,
    /// The sun never crosses the zenith threshold downwards.
    PolarDay,
    /// The sun never rises above the zenith threshold.
    PolarNight,
}

/// Sunrise, solar noon and sunset for one local calendar date.
///
/// For [`DayKind::PolarDay`] sunrise and sunset are the start and end of
/// the local date. For [`DayKind::PolarNight`] both equal the start of the
/// date, giving a zero-length day.
#[derive(Debug, Clone, PartialEq)]
pub struct SolarTimes {
    sunrise: DateTime<Utc>,
    solar_noon: DateTime<Utc>,
    sunset: DateTime<Utc>,
    date: NaiveDate,
    location: Location,
    kind: DayKind,
}

impl SolarTimes {
    pub fn sunrise(&self) -> DateTime<Utc> {
        self.sunrise
    }

    pub fn solar_noon(&self) -> DateTime<Utc> {
        self.solar_noon
    }

    pub fn sunset(&self) -> DateTime<Utc> {
        self.sunset
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn kind(&self) -> DayKind {
        self.kind
    }

    pub fn is_polar(&self) -> bool {
        self.kind != DayKind::Normal
    }

    pub fn timezone(&self) -> Tz {
        self.location.timezone()
    }

    pub fn local_sunrise(&self) -> DateTime<Tz> {
        self.sunrise.with_timezone(&self.timezone())
    }

    pub fn local_solar_noon(&self) -> DateTime<Tz> {
        self.solar_noon.with_timezone(&self.timezone())
    }

    pub fn local_sunset(&self) -> DateTime<Tz> {
        self.sunset.with_timezone(&self.timezone())
    }

    pub fn day_length(&self) -> TimeDelta {
        self.sunset - self.sunrise
    }

    /// The same events moved by whole days onto `date`.
    ///
    /// Used to keep yesterday's window in effect when today's calculation
    /// fails.
    pub fn shifted_to(&self, date: NaiveDate) -> SolarTimes {
        let shift = TimeDelta::days((date - self.date).num_days());
        SolarTimes {
            sunrise: self.sunrise + shift,
            solar_noon: self.solar_noon + shift,
            sunset: self.sunset + shift,
            date,
            location: self.location.clone(),
            kind: self.kind,
        }
    }
}

/// Sun parameters at one instant.
struct SolarParams {
    declination: f64,      // degrees
    equation_of_time: f64, // minutes
}

enum HourAngle {
    Angle(f64),
    AlwaysAbove,
    AlwaysBelow,
}

enum EventSolution {
    At(f64),
    NoConvergence(f64),
}

/// Computes [`SolarTimes`]. Pure and deterministic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolarCalculator {
    mode: TwilightMode,
    sunrise_refraction: f64,
    sunset_refraction: f64,
    max_iterations: usize,
}

impl Default for SolarCalculator {
    fn default() -> Self {
        Self::new(TwilightMode::default())
    }
}

impl SolarCalculator {
    pub fn new(mode: TwilightMode) -> Self {
        Self {
            mode,
            sunrise_refraction: DEFAULT_REFRACTION_DEG,
            sunset_refraction: DEFAULT_REFRACTION_DEG,
            max_iterations: SOLAR_MAX_ITERATIONS,
        }
    }

    /// Set the refraction correction in degrees for each event separately.
    pub fn with_refraction(mut self, sunrise: f64, sunset: f64) -> Self {
        self.sunrise_refraction = sunrise;
        self.sunset_refraction = sunset;
        self
    }

    /// Limit the refinement loop. Values above five are capped.
    pub fn with_max_iterations(mut self, iterations: usize) -> Self {
        self.max_iterations = iterations.clamp(1, SOLAR_MAX_ITERATIONS);
        self
    }

    pub fn mode(&self) -> TwilightMode {
        self.mode
    }

    /// Calculate solar events for `location` on its local calendar `date`.
    ///
    /// A solver that does not settle within the iteration limit is retried
    /// once with a relaxed tolerance before `TransientCalculation` is
    /// returned.
    pub fn calculate(&self, location: &Location, date: NaiveDate) -> CoreResult<SolarTimes> {
        validate_coordinates(location.latitude(), location.longitude())?;

        match self.calculate_with_tolerance(location, date, SOLAR_TOLERANCE_MINUTES) {
            Err(CoreError::TransientCalculation(reason)) => {
                Log::log_debug(&format!(
                    "Solar solver did not settle for {} on {} ({}), retrying with relaxed tolerance",
                    location, date, reason
                ));
                self.calculate_with_tolerance(location, date, SOLAR_RELAXED_TOLERANCE_MINUTES)
            }
            other => other,
        }
    }

    /// Validate raw coordinates and calculate.
    pub fn calculate_at(
        &self,
        latitude: f64,
        longitude: f64,
        date: NaiveDate,
    ) -> CoreResult<SolarTimes> {
        let location = Location::new(latitude, longitude)?;
        self.calculate(&location, date)
    }

    /// First regular sunrise strictly after `now`, looking up to three local
    /// dates ahead. `None` during an extended polar day or night.
    pub fn next_sunrise_after(
        &self,
        location: &Location,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let today = now.with_timezone(&location.timezone()).date_naive();
        today
            .iter_days()
            .take(3)
            .filter_map(|date| self.calculate(location, date).ok())
            .filter(|times| times.kind() == DayKind::Normal)
            .map(|times| times.sunrise())
            .find(|sunrise| *sunrise > now)
    }

    fn calculate_with_tolerance(
        &self,
        location: &Location,
        date: NaiveDate,
        tolerance: f64,
    ) -> CoreResult<SolarTimes> {
        let latitude = location.latitude();
        let longitude = location.longitude();
        let tz = location.timezone();

        let next_date = date
            .succ_opt()
            .ok_or_else(|| CoreError::InvalidInput(format!("date {} is out of range", date)))?;
        let day_start = local_midnight(tz, date);
        let day_end = local_midnight(tz, next_date);

        // The UTC date whose solar noon lands inside the local date.
        let mut base = date;
        let mut noon = solar_noon_minutes(base, longitude);
        for _ in 0..2 {
            let noon_at = utc_at(base, noon);
            let shifted = if noon_at < day_start {
                base.succ_opt()
            } else if noon_at >= day_end {
                base.pred_opt()
            } else {
                break;
            };
            match shifted {
                Some(d) => {
                    base = d;
                    noon = solar_noon_minutes(base, longitude);
                }
                None => break,
            }
        }
        let solar_noon = utc_at(base, noon);

        let noon_params = solar_params(julian_day(base, noon));
        let sunrise_zenith = self.mode.zenith(self.sunrise_refraction);
        let sunset_zenith = self.mode.zenith(self.sunset_refraction);

        let kind = match hour_angle(latitude, noon_params.declination, sunrise_zenith) {
            HourAngle::AlwaysAbove => DayKind::PolarDay,
            HourAngle::AlwaysBelow => DayKind::PolarNight,
            HourAngle::Angle(_) => DayKind::Normal,
        };

        let (sunrise, sunset) = match kind {
            DayKind::PolarDay => (day_start, day_end),
            DayKind::PolarNight => (day_start, day_start),
            DayKind::Normal => {
                let rise = self.solve_event(base, latitude, longitude, sunrise_zenith, true, noon, tolerance);
                let set = self.solve_event(base, latitude, longitude, sunset_zenith, false, noon, tolerance);
                match (rise, set) {
                    (EventSolution::At(rise), EventSolution::At(set)) => {
                        (utc_at(base, rise), utc_at(base, set))
                    }
                    (EventSolution::NoConvergence(last), _) | (_, EventSolution::NoConvergence(last)) => {
                        return Err(CoreError::TransientCalculation(format!(
                            "hour angle for {} on {} still moving after {} iterations (last estimate {:.2} min)",
                            location, date, self.max_iterations, last
                        )));
                    }
                }
            }
        };

        Ok(SolarTimes {
            sunrise,
            solar_noon,
            sunset,
            date,
            location: location.clone(),
            kind,
        })
    }

    /// Refine the event time by re-evaluating the sun at the estimate.
    ///
    /// Minutes are measured from UTC midnight of `base`.
    #[allow(clippy::too_many_arguments)]
    fn solve_event(
        &self,
        base: NaiveDate,
        latitude: f64,
        longitude: f64,
        zenith: f64,
        rising: bool,
        noon: f64,
        tolerance: f64,
    ) -> EventSolution {
        let sign = if rising { 1.0 } else { -1.0 };
        let mut estimate = noon;

        for _ in 0..self.max_iterations {
            let params = solar_params(julian_day(base, estimate));
            // Near the polar boundary the event can slide to midnight or noon.
            let ha = match hour_angle(latitude, params.declination, zenith) {
                HourAngle::Angle(ha) => ha,
                HourAngle::AlwaysAbove => 180.0,
                HourAngle::AlwaysBelow => 0.0,
            };
            let next = 720.0 - 4.0 * (longitude + sign * ha) - params.equation_of_time;
            if (next - estimate).abs() < tolerance {
                return EventSolution::At(next);
            }
            estimate = next;
        }

        EventSolution::NoConvergence(estimate)
    }
}

fn deg2rad(d: f64) -> f64 {
    d.to_radians()
}

fn rad2deg(r: f64) -> f64 {
    r.to_degrees()
}

/// Julian day (UT) for `minutes` after UTC midnight of `date`.
pub(crate) fn julian_day(date: NaiveDate, minutes: f64) -> f64 {
    // 2000-01-01 is day 730120 counted from 0001-01-01, and JD 2451544.5 at midnight.
    let days = (date.num_days_from_ce() - 730_120) as f64;
    2_451_544.5 + days + minutes / 1440.0
}

/// ΔT = TT − UT in seconds (Espenak and Meeus polynomial fits).
pub(crate) fn delta_t_seconds(year: f64) -> f64 {
    if (1986.0..2005.0).contains(&year) {
        let t = year - 2000.0;
        63.86 + 0.3345 * t - 0.060374 * t.powi(2)
            + 0.0017275 * t.powi(3)
            + 0.000651814 * t.powi(4)
            + 0.00002373599 * t.powi(5)
    } else if (2005.0..2050.0).contains(&year) {
        let t = year - 2000.0;
        62.92 + 0.32217 * t + 0.005589 * t.powi(2)
    } else if (2050.0..2150.0).contains(&year) {
        let u = (year - 1820.0) / 100.0;
        -20.0 + 32.0 * u.powi(2) - 0.5628 * (2150.0 - year)
    } else {
        let u = (year - 1820.0) / 100.0;
        -20.0 + 32.0 * u.powi(2)
    }
}

fn solar_params(jd_ut: f64) -> SolarParams {
    let year = 2000.0 + (jd_ut - 2_451_545.0) / 365.25;
    let jd_tt = jd_ut + delta_t_seconds(year) / 86_400.0;
    let jc = (jd_tt - 2_451_545.0) / 36_525.0;

    let l0 = (280.46646 + jc * (36000.76983 + 0.0003032 * jc)).rem_euclid(360.0);
    let m = 357.52911 + jc * (35999.05029 - 0.0001537 * jc);
    let m_rad = deg2rad(m);
    let e = 0.016708634 - jc * (0.000042037 + 0.0000001267 * jc);

    // Equation of center
    let c = m_rad.sin() * (1.914602 - jc * (0.004817 + 0.000014 * jc))
        + (2.0 * m_rad).sin() * (0.019993 - 0.000101 * jc)
        + (3.0 * m_rad).sin() * 0.000289;

    let true_longitude = l0 + c;
    let omega = 125.04 - 1934.136 * jc;
    let apparent_longitude = true_longitude - 0.00569 - 0.00478 * deg2rad(omega).sin();

    let obliquity_mean =
        23.0 + (26.0 + (21.448 - jc * (46.815 + jc * (0.00059 - jc * 0.001813))) / 60.0) / 60.0;
    let obliquity = deg2rad(obliquity_mean + 0.00256 * deg2rad(omega).cos());

    let declination = rad2deg((obliquity.sin() * deg2rad(apparent_longitude).sin()).asin());

    let y = (obliquity / 2.0).tan().powi(2);
    let l0_rad = deg2rad(l0);
    let equation_of_time = 4.0
        * rad2deg(
            y * (2.0 * l0_rad).sin() - 2.0 * e * m_rad.sin()
                + 4.0 * e * y * m_rad.sin() * (2.0 * l0_rad).cos()
                - 0.5 * y * y * (4.0 * l0_rad).sin()
                - 1.25 * e * e * (2.0 * m_rad).sin(),
        );

    SolarParams {
        declination,
        equation_of_time,
    }
}

fn hour_angle(latitude: f64, declination: f64, zenith: f64) -> HourAngle {
    let lat = deg2rad(latitude);
    let dec = deg2rad(declination);
    let cos_ha = deg2rad(zenith).cos() / (lat.cos() * dec.cos()) - lat.tan() * dec.tan();

    if cos_ha < -1.0 {
        HourAngle::AlwaysAbove
    } else if cos_ha > 1.0 {
        HourAngle::AlwaysBelow
    } else {
        HourAngle::Angle(rad2deg(cos_ha.acos()))
    }
}

/// Solar noon in minutes after UTC midnight of `date`.
fn solar_noon_minutes(date: NaiveDate, longitude: f64) -> f64 {
    let mut noon = 720.0 - 4.0 * longitude;
    for _ in 0..2 {
        let params = solar_params(julian_day(date, noon));
        noon = 720.0 - 4.0 * longitude - params.equation_of_time;
    }
    noon
}

fn utc_at(date: NaiveDate, minutes: f64) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc() + TimeDelta::milliseconds((minutes * 60_000.0).round() as i64)
}

/// Start of the local calendar date in UTC. Falls back to 01:00 when
/// midnight is skipped by a DST change, then to UTC midnight.
pub(crate) fn local_midnight(tz: Tz, date: NaiveDate) -> DateTime<Utc> {
    let midnight = date.and_time(NaiveTime::MIN);
    tz.from_local_datetime(&midnight)
        .earliest()
        .or_else(|| {
            tz.from_local_datetime(&(midnight + TimeDelta::hours(1)))
                .earliest()
        })
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| midnight.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::test_constants::*;
    use chrono::Timelike;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_julian_day_epoch() {
        assert_eq!(julian_day(date(2000, 1, 1), 720.0), 2_451_545.0);
        assert_eq!(julian_day(date(2000, 1, 2), 0.0), 2_451_545.5);
    }

    #[test]
    fn test_delta_t_is_about_a_minute_this_century() {
        let dt = delta_t_seconds(2024.5);
        assert!(dt > 60.0 && dt < 80.0, "ΔT was {}", dt);
        assert!(delta_t_seconds(1990.0) > 50.0);
    }

    #[test]
    fn test_coordinate_validation() {
        let calc = SolarCalculator::default();
        let day = date(2024, 6, 21);

        assert!(calc.calculate_at(TEST_NYC_LATITUDE, TEST_NYC_LONGITUDE, day).is_ok());
        assert!(matches!(
            calc.calculate_at(91.0, TEST_NYC_LONGITUDE, day),
            Err(CoreError::InvalidInput(_))
        ));
        assert!(matches!(
            calc.calculate_at(TEST_NYC_LATITUDE, -181.0, day),
            Err(CoreError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_new_york_summer_solstice() {
        let calc = SolarCalculator::default();
        let times = calc
            .calculate_at(TEST_NYC_LATITUDE, TEST_NYC_LONGITUDE, date(2024, 6, 21))
            .unwrap();

        assert_eq!(times.kind(), DayKind::Normal);
        let sunrise = times.local_sunrise();
        let sunset = times.local_sunset();
        assert_eq!(sunrise.hour(), 5, "sunrise {}", sunrise);
        assert!((19..21).contains(&sunset.hour()), "sunset {}", sunset);

        let hours = times.day_length().num_seconds() as f64 / 3600.0;
        assert!((14.5..=15.5).contains(&hours), "day length {}", hours);
        assert!(times.sunrise() < times.solar_noon());
        assert!(times.solar_noon() < times.sunset());
    }

    #[test]
    fn test_arctic_circle_extremes() {
        let calc = SolarCalculator::default();

        let summer = calc.calculate_at(66.5, 0.0, date(2024, 6, 21)).unwrap();
        assert!(summer.day_length() >= TimeDelta::hours(20));

        let winter = calc.calculate_at(66.5, 0.0, date(2024, 12, 21)).unwrap();
        assert!(winter.day_length() <= TimeDelta::hours(4));
    }

    #[test]
    fn test_polar_sentinels() {
        let calc = SolarCalculator::default();

        let day = calc.calculate_at(80.0, 15.0, date(2024, 6, 21)).unwrap();
        assert_eq!(day.kind(), DayKind::PolarDay);
        assert_eq!(day.day_length(), day.sunset() - day.sunrise());
        assert!(day.sunrise() < day.solar_noon() && day.solar_noon() < day.sunset());
        assert!(day.day_length() >= TimeDelta::hours(23));

        let night = calc.calculate_at(80.0, 15.0, date(2024, 12, 21)).unwrap();
        assert_eq!(night.kind(), DayKind::PolarNight);
        assert_eq!(night.day_length(), TimeDelta::zero());
    }

    #[test]
    fn test_civil_twilight_extends_the_day() {
        let day = date(2024, 3, 20);
        let official = SolarCalculator::new(TwilightMode::Official)
            .calculate_at(48.8566, 2.3522, day)
            .unwrap();
        let civil = SolarCalculator::new(TwilightMode::Civil)
            .calculate_at(48.8566, 2.3522, day)
            .unwrap();
        let strict = SolarCalculator::new(TwilightMode::CivilStrict)
            .calculate_at(48.8566, 2.3522, day)
            .unwrap();

        assert!(civil.sunrise() < official.sunrise());
        assert!(civil.sunset() > official.sunset());
        assert!(strict.sunrise() < civil.sunrise());
        // Solar noon does not depend on the zenith
        assert_eq!(civil.solar_noon(), official.solar_noon());
    }

    #[test]
    fn test_refraction_applies_per_event() {
        let day = date(2024, 9, 1);
        let base = SolarCalculator::default().calculate_at(35.0, 139.0, day).unwrap();
        let skewed = SolarCalculator::default()
            .with_refraction(DEFAULT_REFRACTION_DEG + 0.5, DEFAULT_REFRACTION_DEG)
            .calculate_at(35.0, 139.0, day)
            .unwrap();

        assert!(skewed.sunrise() < base.sunrise());
        let sunset_diff = (skewed.sunset() - base.sunset()).num_seconds().abs();
        assert!(sunset_diff <= 1, "sunset moved by {}s", sunset_diff);
    }

    #[test]
    fn test_equator_day_length_stays_near_twelve_hours() {
        let calc = SolarCalculator::default();
        let location = Location::new(0.0, 0.0).unwrap();
        for day in date(2024, 1, 1).iter_days().take(366) {
            let times = calc.calculate(&location, day).unwrap();
            let deviation = (times.day_length() - TimeDelta::hours(12)).num_minutes().abs();
            assert!(deviation <= 30, "{}: {} minutes off", day, deviation);
        }
    }

    #[test]
    fn test_non_convergence_is_transient() {
        let calc = SolarCalculator::default().with_max_iterations(1);
        let result = calc.calculate_at(45.0, 7.0, date(2024, 4, 10));
        assert!(matches!(result, Err(CoreError::TransientCalculation(_))));
    }

    #[test]
    fn test_shifted_to_moves_whole_days() {
        let calc = SolarCalculator::default();
        let times = calc.calculate_at(52.52, 13.405, date(2024, 5, 1)).unwrap();
        let shifted = times.shifted_to(date(2024, 5, 3));

        assert_eq!(shifted.date(), date(2024, 5, 3));
        assert_eq!(shifted.sunrise() - times.sunrise(), TimeDelta::days(2));
        assert_eq!(shifted.day_length(), times.day_length());
    }

    #[test]
    fn test_next_sunrise_after() {
        let calc = SolarCalculator::default();
        let location = Location::new(TEST_NYC_LATITUDE, TEST_NYC_LONGITUDE).unwrap();
        let today = calc.calculate(&location, date(2024, 6, 21)).unwrap();

        let before = today.sunrise() - TimeDelta::hours(1);
        assert_eq!(calc.next_sunrise_after(&location, before), Some(today.sunrise()));

        let after = today.sunrise() + TimeDelta::hours(1);
        let next = calc.next_sunrise_after(&location, after).unwrap();
        assert!(next > after);
        assert!(next - today.sunrise() < TimeDelta::hours(25));
    }
}
