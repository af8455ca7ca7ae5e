//! Rolling table of upcoming target temperatures.
//!
//! The table covers [`PREDICTIVE_CACHE_HORIZON_HOURS`] from the current
//! quarter hour at [`PREDICTIVE_CACHE_RESOLUTION_MINUTES`] spacing. It is
//! built in one go and published behind an `Arc`, so readers always see a
//! complete table.

use chrono::{DateTime, DurationRound, NaiveDate, TimeDelta, Utc};
use std::collections::BTreeMap;

use crate::color::{ColorProfile, ColorTemperature, Period, TransitionWindow};
use crate::constants::*;
use crate::error::{CoreError, CoreResult};
use crate::geo::Location;
use crate::geo::solar::{SolarCalculator, SolarTimes};
use crate::logger::Log;
use crate::transition::TransitionEngine;

#[derive(Debug, Clone, PartialEq)]
pub struct PredictiveCacheEntry {
    pub at: DateTime<Utc>,
    pub temperature: ColorTemperature,
    pub period: Period,
}

/// Exact evaluation of a profile at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub temperature: ColorTemperature,
    pub period: Period,
    /// Window the instant falls in, if any.
    pub window: Option<TransitionWindow>,
    /// Solar times of the local date containing the instant.
    pub solar: SolarTimes,
}

/// Solar times per local date, computed on demand.
///
/// A date the calculator cannot solve reuses the closest earlier known day
/// shifted onto it, so the previous window stays in effect.
pub struct SolarDays<'a> {
    location: &'a Location,
    calculator: &'a SolarCalculator,
    days: BTreeMap<NaiveDate, SolarTimes>,
    fallback: Option<SolarTimes>,
}

impl<'a> SolarDays<'a> {
    pub fn new(
        location: &'a Location,
        calculator: &'a SolarCalculator,
        fallback: Option<&SolarTimes>,
    ) -> Self {
        Self {
            location,
            calculator,
            days: BTreeMap::new(),
            fallback: fallback.cloned(),
        }
    }

    pub fn local_date(&self, time: DateTime<Utc>) -> NaiveDate {
        time.with_timezone(&self.location.timezone()).date_naive()
    }

    pub fn get(&mut self, date: NaiveDate) -> CoreResult<SolarTimes> {
        if let Some(times) = self.days.get(&date) {
            return Ok(times.clone());
        }

        let times = match self.calculator.calculate(self.location, date) {
            Ok(times) => times,
            Err(CoreError::TransientCalculation(reason)) => {
                let previous = self
                    .days
                    .range(..date)
                    .next_back()
                    .map(|(_, times)| times.clone())
                    .or_else(|| self.fallback.clone())
                    .ok_or_else(|| CoreError::TransientCalculation(reason.clone()))?;
                Log::log_warning(&format!(
                    "Solar times for {} unknown ({}), keeping the window of {}",
                    date,
                    reason,
                    previous.date()
                ));
                previous.shifted_to(date)
            }
            Err(e) => return Err(e),
        };
        self.days.insert(date, times.clone());
        Ok(times)
    }

    /// Evaluate `profile` at `time`.
    ///
    /// Windows of the neighbouring dates are checked too, since an evening
    /// window can run past local midnight.
    pub fn evaluate(
        &mut self,
        time: DateTime<Utc>,
        profile: &ColorProfile,
        engine: &TransitionEngine,
    ) -> CoreResult<Evaluation> {
        let date = self.local_date(time);
        let today = self.get(date)?;

        let mut candidates = vec![today.clone()];
        for neighbour in [date.pred_opt(), date.succ_opt()].into_iter().flatten() {
            if let Ok(times) = self.get(neighbour) {
                candidates.push(times);
            }
        }

        for solar in &candidates {
            if let Some((morning, evening)) = profile.windows(solar) {
                let window = [morning, evening].into_iter().find(|w| w.contains(time));
                if window.is_some() {
                    return Ok(Evaluation {
                        temperature: profile.temperature_at(time, solar, engine),
                        period: profile.period_at(time, solar),
                        window,
                        solar: today,
                    });
                }
            }
        }

        Ok(Evaluation {
            temperature: profile.temperature_at(time, &today, engine),
            period: profile.period_at(time, &today),
            window: None,
            solar: today,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PredictiveCache {
    start: DateTime<Utc>,
    resolution: TimeDelta,
    entries: Vec<PredictiveCacheEntry>,
    windows: Vec<TransitionWindow>,
    solar_today: SolarTimes,
    profile_id: String,
    built_at: DateTime<Utc>,
}

impl PredictiveCache {
    pub fn build(
        now: DateTime<Utc>,
        location: &Location,
        profile: &ColorProfile,
        calculator: &SolarCalculator,
        engine: &TransitionEngine,
        fallback: Option<&SolarTimes>,
    ) -> CoreResult<Self> {
        let resolution = TimeDelta::minutes(PREDICTIVE_CACHE_RESOLUTION_MINUTES);
        let count = (PREDICTIVE_CACHE_HORIZON_HOURS * 60 / PREDICTIVE_CACHE_RESOLUTION_MINUTES)
            as usize;
        let start = now.duration_trunc(resolution).unwrap_or(now);

        let mut days = SolarDays::new(location, calculator, fallback);
        let solar_today = days.get(days.local_date(now))?;

        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let at = start + resolution * i as i32;
            let evaluation = days.evaluate(at, profile, engine)?;
            entries.push(PredictiveCacheEntry {
                at,
                temperature: evaluation.temperature,
                period: evaluation.period,
            });
        }

        let end = start + resolution * count as i32;
        let mut windows = Vec::new();
        let first = days.local_date(start).pred_opt().unwrap_or(solar_today.date());
        let last = days.local_date(end).succ_opt().unwrap_or(solar_today.date());
        for date in first.iter_days().take_while(|d| *d <= last) {
            if let Ok(solar) = days.get(date) {
                if let Some((morning, evening)) = profile.windows(&solar) {
                    windows.push(morning);
                    windows.push(evening);
                }
            }
        }
        windows.sort_by_key(|w| w.start);
        windows.dedup();

        Log::log_debug(&format!(
            "Predictive cache rebuilt: {} entries from {} for profile '{}'",
            entries.len(),
            start.format("%Y-%m-%d %H:%M UTC"),
            profile.id
        ));

        Ok(Self {
            start,
            resolution,
            entries,
            windows,
            solar_today,
            profile_id: profile.id.clone(),
            built_at: now,
        })
    }

    pub fn entries(&self) -> &[PredictiveCacheEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.start + self.resolution * self.entries.len() as i32
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    pub fn profile_id(&self) -> &str {
        &self.profile_id
    }

    /// Solar times of the local date the cache was built on.
    pub fn solar_today(&self) -> &SolarTimes {
        &self.solar_today
    }

    pub fn windows(&self) -> &[TransitionWindow] {
        &self.windows
    }

    /// Entry nearest to `time`, if one lies within `tolerance`.
    pub fn lookup(&self, time: DateTime<Utc>, tolerance: TimeDelta) -> Option<&PredictiveCacheEntry> {
        let step = self.resolution.num_milliseconds();
        if step <= 0 {
            return None;
        }
        let offset = (time - self.start).num_milliseconds();
        let index = (offset as f64 / step as f64).round();
        if index < 0.0 || index >= self.entries.len() as f64 {
            return None;
        }
        let entry = &self.entries[index as usize];
        let gap = (entry.at - time).num_milliseconds().abs();
        (gap <= tolerance.num_milliseconds()).then_some(entry)
    }

    pub fn window_containing(&self, time: DateTime<Utc>) -> Option<TransitionWindow> {
        self.windows.iter().copied().find(|w| w.contains(time))
    }

    pub fn near_window(&self, time: DateTime<Utc>, margin: TimeDelta) -> bool {
        self.windows.iter().any(|w| w.is_near(time, margin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::test_constants::*;
    use crate::geo::solar::TwilightMode;
    use chrono::TimeZone;

    fn nyc() -> Location {
        Location::new(TEST_NYC_LATITUDE, TEST_NYC_LONGITUDE).unwrap()
    }

    fn profile() -> ColorProfile {
        ColorProfile::new(
            "test",
            ColorTemperature::new(TEST_STANDARD_DAY_TEMP).unwrap(),
            ColorTemperature::new(TEST_STANDARD_NIGHT_TEMP).unwrap(),
        )
    }

    fn build_at(now: DateTime<Utc>, location: &Location) -> PredictiveCache {
        PredictiveCache::build(
            now,
            location,
            &profile(),
            &SolarCalculator::new(TwilightMode::Official),
            &TransitionEngine::default(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_build_has_96_entries_within_profile_range() {
        let now = Utc.with_ymd_and_hms(2024, 6, 21, 13, 7, 42).unwrap();
        let cache = build_at(now, &nyc());

        assert_eq!(cache.len(), 96);
        assert_eq!(cache.start(), Utc.with_ymd_and_hms(2024, 6, 21, 13, 0, 0).unwrap());
        for entry in cache.entries() {
            let k = entry.temperature.kelvin();
            assert!(
                (TEST_STANDARD_NIGHT_TEMP..=TEST_STANDARD_DAY_TEMP).contains(&k),
                "{} out of range at {}",
                k,
                entry.at
            );
        }
        assert!(cache.entries().iter().any(|e| e.period.is_transitioning()));
    }

    #[test]
    fn test_lookup_respects_tolerance() {
        let now = Utc.with_ymd_and_hms(2024, 6, 21, 12, 0, 0).unwrap();
        let cache = build_at(now, &nyc());
        let tolerance = TimeDelta::minutes(DEFAULT_CACHE_MISS_TOLERANCE as i64);

        let hit = cache.lookup(now + TimeDelta::minutes(7), tolerance).unwrap();
        assert_eq!(hit.at, now);
        let hit = cache.lookup(now + TimeDelta::minutes(8), tolerance).unwrap();
        assert_eq!(hit.at, now + TimeDelta::minutes(15));

        assert!(cache.lookup(now - TimeDelta::hours(1), tolerance).is_none());
        assert!(cache.lookup(cache.end() + TimeDelta::hours(1), tolerance).is_none());
        assert!(cache
            .lookup(now + TimeDelta::minutes(7), TimeDelta::minutes(1))
            .is_none());
    }

    #[test]
    fn test_windows_cover_the_horizon() {
        let now = Utc.with_ymd_and_hms(2024, 6, 21, 12, 0, 0).unwrap();
        let cache = build_at(now, &nyc());

        // Evening of the 21st, morning of the 22nd at least
        assert!(cache.windows().len() >= 2);
        let evening = cache
            .windows()
            .iter()
            .find(|w| w.start > now)
            .copied()
            .unwrap();
        let inside = evening.start + TimeDelta::minutes(10);
        assert_eq!(cache.window_containing(inside), Some(evening));
        assert!(cache.near_window(evening.start - TimeDelta::minutes(20), TimeDelta::minutes(30)));
        assert!(!cache.near_window(now, TimeDelta::minutes(30)));
    }

    #[test]
    fn test_evaluate_checks_neighbouring_days() {
        // A long outside window after a late sunset runs past local midnight
        let location = Location::new(60.17, 24.94).unwrap();
        let calculator = SolarCalculator::new(TwilightMode::Official);
        let profile = profile().with_transition_duration(std::time::Duration::from_secs(120 * 60));
        let engine = TransitionEngine::default();
        let mut days = SolarDays::new(&location, &calculator, None);

        let date = NaiveDate::from_ymd_opt(2024, 6, 21).unwrap();
        let solar = days.get(date).unwrap();
        let (_, evening) = profile.windows(&solar).unwrap();
        let late_evening = evening.end - TimeDelta::minutes(5);

        let evaluation = days.evaluate(late_evening, &profile, &engine).unwrap();
        assert_eq!(evaluation.window, Some(evening));
        assert!(matches!(evaluation.period, Period::Sunset(_)));
    }

    #[test]
    fn test_polar_location_still_fills_the_table() {
        let arctic = Location::new(78.22, 15.65).unwrap();
        for month in [6, 12] {
            let now = Utc.with_ymd_and_hms(2024, month, 21, 0, 0, 0).unwrap();
            let cache = build_at(now, &arctic);
            assert_eq!(cache.len(), 96);
            let expected = if month == 6 {
                TEST_STANDARD_DAY_TEMP
            } else {
                TEST_STANDARD_NIGHT_TEMP
            };
            assert!(cache.entries().iter().all(|e| e.temperature.kelvin() == expected));
        }
    }
}
