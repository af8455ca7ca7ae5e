use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;

use kelvind::color::{ColorProfile, ColorTemperature, Period};
use kelvind::config::Config;
use kelvind::gamma::virtual_display::VirtualDisplay;
use kelvind::gamma::{AdapterSettings, GammaAdapter, GammaRamp};
use kelvind::geo::{Location, StaticLocationProvider};
use kelvind::logger::Log;
use kelvind::scheduler::{
    ConfigProfileStore, ManualClock, PauseRequest, PredictiveScheduler, SchedulerPhase,
    SchedulerSettings,
};
use kelvind::transition::InterpolationMode;

fn k(kelvin: u32) -> ColorTemperature {
    ColorTemperature::new(kelvin).unwrap()
}

struct Rig {
    scheduler: PredictiveScheduler,
    display: Arc<VirtualDisplay>,
    clock: Arc<ManualClock>,
    locations: Arc<StaticLocationProvider>,
}

fn rig(
    location: Location,
    profiles: ConfigProfileStore,
    settings: SchedulerSettings,
    start: DateTime<Utc>,
) -> Rig {
    Log::set_enabled(false);
    let display = Arc::new(VirtualDisplay::new(&[("eDP-1", 128)]));
    let adapter = Arc::new(GammaAdapter::new(display.clone(), settings.adapter));
    let locations = Arc::new(StaticLocationProvider::new(Some(location)));
    let clock = Arc::new(ManualClock::new(start));
    let scheduler = PredictiveScheduler::with_clock(
        adapter,
        locations.clone(),
        Arc::new(profiles),
        settings,
        clock.clone(),
    );
    Rig {
        scheduler,
        display,
        clock,
        locations,
    }
}

fn new_york() -> Location {
    Location::new(40.7128, -74.0060).unwrap()
}

fn default_profile() -> ConfigProfileStore {
    ConfigProfileStore::single(ColorProfile::new("default", k(6500), k(3300)))
}

fn linear() -> SchedulerSettings {
    SchedulerSettings {
        interpolation: InterpolationMode::Linear,
        ..SchedulerSettings::default()
    }
}

// 2024-06-21 12:00 EDT
fn nyc_noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 21, 16, 0, 0).unwrap()
}

#[test]
fn test_configured_scheduler_follows_config() {
    let config = Config::parse(
        r#"
latitude = 52.52
longitude = 13.405
location_name = "Berlin"
active_profile = "reading"
use_perceptual_interpolation = false
transition_threshold = 100
catchup_duration = 1

[profiles.reading]
day_temp = 6000
night_temp = 2700
"#,
    )
    .unwrap();

    let settings = SchedulerSettings::from_config(&config);
    assert_eq!(settings.transition_threshold, 100);
    assert_eq!(settings.interpolation, InterpolationMode::Linear);

    let profiles =
        ConfigProfileStore::new(config.to_profiles().unwrap(), config.active_profile_id()).unwrap();
    let location = config.location().unwrap().unwrap();
    // 12:00 CEST
    let start = Utc.with_ymd_and_hms(2024, 6, 21, 10, 0, 0).unwrap();
    let r = rig(location, profiles, settings, start);

    r.scheduler.initialize().unwrap();
    r.scheduler.run_coarse_cycle();
    assert_eq!(r.scheduler.current_state().target, Some(k(6000)));

    r.clock.advance(Duration::from_secs(2));
    r.scheduler.run_fine_tick();
    let state = r.scheduler.current_state();
    assert_eq!(state.active_profile, "reading");
    assert!(state.transition.is_none());
    assert_eq!(state.period, Some(Period::Day));
    assert_eq!(state.applied, Some(k(6000)));
    assert_eq!(
        r.display.current_ramp("eDP-1"),
        Some(GammaRamp::for_temperature(128, k(6000)))
    );
}

#[test]
fn test_evening_warms_without_ever_cooling() {
    let r = rig(new_york(), default_profile(), linear(), nyc_noon());
    r.scheduler.initialize().unwrap();
    let sunset = r.scheduler.current_state().solar_times.unwrap().sunset();

    r.clock.set(sunset - TimeDelta::hours(3));
    r.scheduler.run_coarse_cycle();
    assert_eq!(r.scheduler.current_state().applied, Some(k(6500)));

    let mut previous = k(6500);
    let mut saw_sunset = false;
    let mut at = sunset - TimeDelta::hours(3);
    while at <= sunset + TimeDelta::hours(3) {
        r.clock.set(at);
        r.scheduler.run_fine_tick();
        let state = r.scheduler.current_state();
        let applied = state.applied.unwrap();
        assert!(applied <= previous, "{} after {} at {}", applied, previous, at);
        if matches!(state.period, Some(Period::Sunset(_))) {
            saw_sunset = true;
        }
        previous = applied;
        at += TimeDelta::minutes(1);
    }
    assert!(saw_sunset);

    r.scheduler.run_coarse_cycle();
    let state = r.scheduler.current_state();
    assert_eq!(state.period, Some(Period::Night));
    assert_eq!(state.applied, Some(k(3300)));
}

#[test]
fn test_location_change_is_picked_up() {
    let r = rig(new_york(), default_profile(), linear(), nyc_noon());
    r.scheduler.initialize().unwrap();
    r.scheduler.run_coarse_cycle();
    assert_eq!(r.scheduler.current_state().target, Some(k(6500)));

    // 01:00 in Tokyo
    let tokyo = Location::new(35.6762, 139.6503).unwrap();
    r.locations.set(Some(tokyo.clone()));
    r.scheduler.refresh_location();

    let state = r.scheduler.current_state();
    assert!(state.location.unwrap().same_position(&tokyo));
    assert_eq!(state.target, Some(k(3300)));
    assert_eq!(state.period, Some(Period::Night));
    assert!(state.transition.is_some());
}

#[test]
fn test_missing_location_keeps_the_last_one() {
    let r = rig(new_york(), default_profile(), linear(), nyc_noon());
    r.scheduler.initialize().unwrap();

    r.locations.set(None);
    r.scheduler.refresh_location();
    let state = r.scheduler.current_state();
    assert!(state.location.unwrap().same_position(&new_york()));
    assert_eq!(state.applied, Some(k(6500)));
}

#[test]
fn test_polar_summer_and_winter_use_flat_targets() {
    let tromso = Location::new(69.6492, 18.9553).unwrap();

    let summer = Utc.with_ymd_and_hms(2024, 6, 21, 22, 0, 0).unwrap();
    let r = rig(tromso.clone(), default_profile(), linear(), summer);
    r.scheduler.initialize().unwrap();
    assert!(r.scheduler.predictive_cache().unwrap().windows().is_empty());
    r.scheduler.run_coarse_cycle();
    assert_eq!(r.scheduler.current_state().period, Some(Period::Day));
    assert_eq!(r.scheduler.current_state().applied, Some(k(6500)));

    let winter = Utc.with_ymd_and_hms(2024, 12, 21, 11, 0, 0).unwrap();
    let r = rig(
        tromso,
        default_profile(),
        SchedulerSettings {
            catchup_duration: Duration::ZERO,
            ..linear()
        },
        winter,
    );
    r.scheduler.initialize().unwrap();
    r.scheduler.run_coarse_cycle();
    assert_eq!(r.scheduler.current_state().period, Some(Period::Night));
    assert_eq!(r.scheduler.current_state().applied, Some(k(3300)));
}

#[test]
fn test_stop_during_catchup_restores_display() {
    // 23:00 EDT
    let late = Utc.with_ymd_and_hms(2024, 6, 22, 3, 0, 0).unwrap();
    let r = rig(new_york(), default_profile(), linear(), late);
    assert!(!r.scheduler.current_state().enabled);
    r.scheduler.initialize().unwrap();
    assert!(r.scheduler.current_state().enabled);
    r.scheduler.run_coarse_cycle();

    r.clock.advance(Duration::from_secs(5));
    r.scheduler.run_fine_tick();
    let state = r.scheduler.current_state();
    assert!(state.transition.is_some());
    assert_ne!(r.display.current_ramp("eDP-1"), Some(GammaRamp::identity(128)));

    r.scheduler.stop().unwrap();
    let state = r.scheduler.current_state();
    assert_eq!(state.phase, SchedulerPhase::Stopped);
    assert!(!state.enabled);
    assert!(!state.is_filtering());
    assert!(state.transition.is_none());
    assert_eq!(r.display.current_ramp("eDP-1"), Some(GammaRamp::identity(128)));
}

#[test]
fn test_pause_before_initialize_starts_paused() {
    let r = rig(new_york(), default_profile(), linear(), nyc_noon());
    let updates = r.scheduler.subscribe();

    r.scheduler.pause(PauseRequest::Indefinitely);
    r.scheduler.initialize().unwrap();
    let state = r.scheduler.current_state();
    assert_eq!(state.phase, SchedulerPhase::Paused);
    assert!(state.enabled);
    assert!(!state.is_filtering());
    r.scheduler.run_coarse_cycle();
    assert_eq!(r.display.write_count("eDP-1"), 0);

    r.scheduler.resume();
    let latest = updates.try_iter().last().unwrap();
    assert_eq!(latest.phase, SchedulerPhase::Running);
    assert_eq!(latest.applied, Some(k(6500)));
}

#[test]
fn test_small_pool_settings_still_drive_the_display() {
    let settings = SchedulerSettings {
        adapter: AdapterSettings {
            pool_size: 1,
            cache_max_entries: 2,
            ..AdapterSettings::default()
        },
        catchup_duration: Duration::ZERO,
        ..linear()
    };
    let r = rig(new_york(), default_profile(), settings, nyc_noon());
    r.scheduler.initialize().unwrap();
    r.scheduler.run_coarse_cycle();

    assert_eq!(r.scheduler.current_state().applied, Some(k(6500)));
    assert_eq!(r.scheduler.adapter().pool_stats().created, 1);
}
