//! The predictive scheduler.
//!
//! Owns the application state and drives the gamma adapter. A single worker
//! thread runs two independently timed loops:
//!
//! - the coarse cycle refreshes location and solar data when they are due,
//!   looks the current target up in the [`PredictiveCache`] and starts a
//!   catch-up transition when the applied temperature has drifted;
//! - the fine tick advances an active transition, or follows the exact
//!   target while inside a sunrise/sunset window.
//!
//! The predictive cache is rebuilt on its own cadence and swapped in
//! whole. Only one cycle runs at a time; a tick that finds another one in
//! flight is skipped rather than queued.
//!
//! Lock order: `cycle`, then `state`, then `cache`, then `interval`. The
//! state lock is never held across a hardware call.

pub mod clock;
pub mod interval;
pub mod predictive_cache;
pub mod profiles;
pub mod state;

pub use clock::{Clock, ManualClock, SystemClock};
pub use interval::AdaptiveInterval;
pub use predictive_cache::{Evaluation, PredictiveCache, PredictiveCacheEntry, SolarDays};
pub use profiles::{ConfigProfileStore, ProfileStore};
pub use state::{AppState, Availability, PauseRequest, SchedulerPhase};

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, RwLock, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::color::easing::is_evening;
use crate::color::{ColorTemperature, Period, TransitionWindow, recommend_easing};
use crate::config::Config;
use crate::constants::*;
use crate::error::{CoreError, CoreResult, GammaResult};
use crate::gamma::{AdapterSettings, ApplyReport, GammaAdapter, Strategy};
use crate::geo::LocationProvider;
use crate::geo::solar::SolarCalculator;
use crate::logger::Log;
use crate::transition::{InterpolationMode, TransitionEngine, TransitionState};
use crate::utils::{format_delta, lock, read, write};

/// Tunables read from the configuration. Replacing them at runtime takes
/// effect on the next coarse cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    /// Drift in Kelvin above which a catch-up transition starts.
    pub transition_threshold: u32,
    pub catchup_duration: Duration,
    pub coarse_interval: Duration,
    pub min_coarse_interval: Duration,
    pub max_coarse_interval: Duration,
    pub fine_interval: Duration,
    /// Fine interval inside a window or during a transition.
    pub active_fine_interval: Duration,
    /// Margin around a window in which the coarse loop runs at its minimum.
    pub near_transition_window: TimeDelta,
    /// Maximum distance to a predictive entry before it counts as a miss.
    pub cache_miss_tolerance: TimeDelta,
    pub cache_rebuild_interval: Duration,
    pub location_refresh_interval: TimeDelta,
    /// Wall-clock jump treated as a suspend/resume or clock change.
    pub sleep_threshold: Duration,
    pub interpolation: InterpolationMode,
    pub calculator: SolarCalculator,
    pub adapter: AdapterSettings,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            transition_threshold: DEFAULT_TRANSITION_THRESHOLD,
            catchup_duration: Duration::from_secs(DEFAULT_CATCHUP_DURATION),
            coarse_interval: Duration::from_secs(DEFAULT_COARSE_INTERVAL),
            min_coarse_interval: Duration::from_secs(DEFAULT_MIN_COARSE_INTERVAL),
            max_coarse_interval: Duration::from_secs(DEFAULT_MAX_COARSE_INTERVAL),
            fine_interval: Duration::from_millis(DEFAULT_FINE_INTERVAL_MS),
            active_fine_interval: Duration::from_millis(DEFAULT_ACTIVE_FINE_INTERVAL_MS),
            near_transition_window: TimeDelta::minutes(DEFAULT_NEAR_TRANSITION_WINDOW as i64),
            cache_miss_tolerance: TimeDelta::minutes(DEFAULT_CACHE_MISS_TOLERANCE as i64),
            cache_rebuild_interval: Duration::from_secs(PREDICTIVE_CACHE_REBUILD_MINUTES * 60),
            location_refresh_interval: TimeDelta::hours(LOCATION_REFRESH_HOURS),
            sleep_threshold: Duration::from_secs(SLEEP_DETECTION_THRESHOLD_SECS),
            interpolation: InterpolationMode::default(),
            calculator: SolarCalculator::default(),
            adapter: AdapterSettings::default(),
        }
    }
}

impl SchedulerSettings {
    /// Settings from a validated configuration, defaults for unset keys.
    pub fn from_config(config: &Config) -> Self {
        let defaults = Self::default();
        let minutes = |value: Option<u64>, default: u64| TimeDelta::minutes(value.unwrap_or(default) as i64);

        let refraction = DEFAULT_REFRACTION_DEG;
        let calculator = SolarCalculator::new(config.twilight.unwrap_or_default())
            .with_refraction(
                config.sunrise_refraction.unwrap_or(refraction),
                config.sunset_refraction.unwrap_or(refraction),
            );

        Self {
            transition_threshold: config
                .transition_threshold
                .unwrap_or(DEFAULT_TRANSITION_THRESHOLD),
            catchup_duration: Duration::from_secs(
                config.catchup_duration.unwrap_or(DEFAULT_CATCHUP_DURATION),
            ),
            coarse_interval: Duration::from_secs(
                config.coarse_interval.unwrap_or(DEFAULT_COARSE_INTERVAL),
            ),
            min_coarse_interval: Duration::from_secs(
                config.min_coarse_interval.unwrap_or(DEFAULT_MIN_COARSE_INTERVAL),
            ),
            max_coarse_interval: Duration::from_secs(
                config.max_coarse_interval.unwrap_or(DEFAULT_MAX_COARSE_INTERVAL),
            ),
            fine_interval: Duration::from_millis(
                config.fine_interval_ms.unwrap_or(DEFAULT_FINE_INTERVAL_MS),
            ),
            active_fine_interval: Duration::from_millis(
                config
                    .active_fine_interval_ms
                    .unwrap_or(DEFAULT_ACTIVE_FINE_INTERVAL_MS),
            ),
            near_transition_window: minutes(
                config.near_transition_window,
                DEFAULT_NEAR_TRANSITION_WINDOW,
            ),
            cache_miss_tolerance: minutes(config.cache_miss_tolerance, DEFAULT_CACHE_MISS_TOLERANCE),
            interpolation: InterpolationMode::from_flag(
                config
                    .use_perceptual_interpolation
                    .unwrap_or(DEFAULT_USE_PERCEPTUAL_INTERPOLATION),
            ),
            calculator,
            adapter: AdapterSettings {
                cache_ttl: Duration::from_secs(
                    config.curve_cache_ttl.unwrap_or(DEFAULT_CURVE_CACHE_TTL) * 60,
                ),
                cache_max_entries: config
                    .curve_cache_max_entries
                    .unwrap_or(DEFAULT_CURVE_CACHE_MAX_ENTRIES),
                pool_size: config.handle_pool_size.unwrap_or(DEFAULT_HANDLE_POOL_SIZE),
                acquire_timeout: Duration::from_millis(
                    config
                        .handle_acquire_timeout_ms
                        .unwrap_or(DEFAULT_HANDLE_ACQUIRE_TIMEOUT_MS),
                ),
            },
            ..defaults
        }
    }

    pub fn engine(&self) -> TransitionEngine {
        TransitionEngine::new(self.interpolation)
    }
}

/// Result of one coarse cycle or fine tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Ran,
    /// Another cycle was in flight.
    Skipped,
    /// Not running, paused or backing off.
    Inactive,
}

enum Command {
    Wake,
    Stop,
}

/// What the profile asks for at one instant.
struct Target {
    temperature: ColorTemperature,
    period: Period,
    window: Option<TransitionWindow>,
}

struct Shared {
    adapter: Arc<GammaAdapter>,
    locations: Arc<dyn LocationProvider>,
    profiles: Arc<dyn ProfileStore>,
    clock: Arc<dyn Clock>,
    settings: RwLock<SchedulerSettings>,
    pending_settings: Mutex<Option<SchedulerSettings>>,
    state: Mutex<AppState>,
    cache: RwLock<Option<Arc<PredictiveCache>>>,
    cycle: Mutex<()>,
    dirty: AtomicBool,
    interval: Mutex<AdaptiveInterval>,
    subscribers: Mutex<Vec<Sender<AppState>>>,
    last_published: Mutex<Option<AppState>>,
    last_location_refresh: Mutex<Option<DateTime<Utc>>>,
    commands: Mutex<Option<Sender<Command>>>,
}

pub struct PredictiveScheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PredictiveScheduler {
    pub fn new(
        adapter: Arc<GammaAdapter>,
        locations: Arc<dyn LocationProvider>,
        profiles: Arc<dyn ProfileStore>,
        settings: SchedulerSettings,
    ) -> Self {
        Self::with_clock(adapter, locations, profiles, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(
        adapter: Arc<GammaAdapter>,
        locations: Arc<dyn LocationProvider>,
        profiles: Arc<dyn ProfileStore>,
        settings: SchedulerSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let interval = AdaptiveInterval::new(
            settings.coarse_interval,
            settings.min_coarse_interval,
            settings.max_coarse_interval,
        );
        let state = AppState::new(profiles.active_profile().id, interval.current());

        let shared = Arc::new(Shared {
            adapter,
            locations,
            profiles: Arc::clone(&profiles),
            clock,
            settings: RwLock::new(settings),
            pending_settings: Mutex::new(None),
            state: Mutex::new(state),
            cache: RwLock::new(None),
            cycle: Mutex::new(()),
            dirty: AtomicBool::new(true),
            interval: Mutex::new(interval),
            subscribers: Mutex::new(Vec::new()),
            last_published: Mutex::new(None),
            last_location_refresh: Mutex::new(None),
            commands: Mutex::new(None),
        });

        let weak = Arc::downgrade(&shared);
        profiles.on_profile_changed(Box::new(move |profile| {
            if let Some(shared) = weak.upgrade() {
                Log::log_debug(&format!(
                    "Active profile is now '{}', predictive cache marked stale",
                    profile.id
                ));
                shared.dirty.store(true, Ordering::SeqCst);
                shared.wake();
            }
        }));

        Self {
            shared,
            worker: Mutex::new(None),
        }
    }

    /// Compute location, solar times and the predictive cache, then enter
    /// `Running` (or `Paused` if a pause was requested before).
    pub fn initialize(&self) -> CoreResult<()> {
        let _cycle = lock(&self.shared.cycle);
        lock(&self.shared.state).phase = SchedulerPhase::Initializing;

        let now = self.shared.clock.now();
        self.shared.refresh_inputs(now, true)?;

        match self.shared.adapter.enumerate_monitors() {
            Ok(monitors) => {
                let names: Vec<_> = monitors.iter().map(|m| m.id.as_str()).collect();
                Log::log_debug(&format!(
                    "{} monitor(s) on {}: {}",
                    monitors.len(),
                    self.shared.adapter.device_name(),
                    names.join(", ")
                ));
            }
            Err(e) => Log::log_warning(&format!("Cannot enumerate monitors yet: {}", e)),
        }

        {
            let mut state = lock(&self.shared.state);
            state.enabled = true;
            state.phase = if state.paused {
                SchedulerPhase::Paused
            } else {
                SchedulerPhase::Running
            };
        }
        self.shared.publish();
        Ok(())
    }

    /// Initialize if needed and spawn the worker thread.
    pub fn start(&self) -> Result<()> {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return Ok(());
        }

        let phase = lock(&self.shared.state).phase;
        if matches!(phase, SchedulerPhase::Initializing | SchedulerPhase::Stopped) {
            self.initialize()
                .context("Failed to compute initial solar data")?;
        }

        let (commands, receiver) = mpsc::channel();
        *lock(&self.shared.commands) = Some(commands);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("kelvind-scheduler".into())
            .spawn(move || run_worker(shared, receiver))
            .context("Failed to spawn scheduler thread")?;
        *worker = Some(handle);
        Ok(())
    }

    /// Stop the worker and restore the original display curves.
    ///
    /// The restore runs even when the worker was never started.
    pub fn stop(&self) -> GammaResult<()> {
        if let Some(commands) = lock(&self.shared.commands).take() {
            let _ = commands.send(Command::Stop);
        }
        let worker = lock(&self.worker).take();
        if let Some(handle) = worker {
            if handle.join().is_err() {
                Log::log_error("Scheduler worker panicked");
            }
        }

        let _cycle = lock(&self.shared.cycle);
        {
            let mut state = lock(&self.shared.state);
            state.phase = SchedulerPhase::Stopped;
            state.enabled = false;
            state.transition = None;
            state.applied = None;
        }
        let result = self.shared.adapter.restore_original();
        if let Err(e) = &result {
            Log::log_error(&format!("Failed to restore original gamma: {}", e));
        }
        self.shared.publish();
        result
    }

    pub fn current_state(&self) -> AppState {
        lock(&self.shared.state).clone()
    }

    /// Suspend filtering and restore the original curves.
    ///
    /// Waits for an in-flight cycle to finish; no hardware write starts
    /// afterwards until the pause ends.
    pub fn pause(&self, request: PauseRequest) {
        {
            let _cycle = lock(&self.shared.cycle);
            let now = self.shared.clock.now();

            let resume_at = match request {
                PauseRequest::Indefinitely => None,
                PauseRequest::For(duration) => TimeDelta::from_std(duration)
                    .ok()
                    .and_then(|d| now.checked_add_signed(d)),
                PauseRequest::UntilSunrise => {
                    let location = lock(&self.shared.state).location.clone();
                    let calculator = read(&self.shared.settings).calculator;
                    let sunrise = location.and_then(|l| calculator.next_sunrise_after(&l, now));
                    if sunrise.is_none() {
                        Log::log_warning("No sunrise ahead, pausing until resumed");
                    }
                    sunrise
                }
            };

            {
                let mut state = lock(&self.shared.state);
                state.paused = true;
                state.resume_at = resume_at;
                state.transition = None;
                state.applied = None;
                if state.phase == SchedulerPhase::Running {
                    state.phase = SchedulerPhase::Paused;
                }
            }

            match resume_at {
                Some(at) => Log::log_info(&format!(
                    "Paused for {}",
                    format_delta(at - now)
                )),
                None => Log::log_info("Paused"),
            }

            if let Err(e) = self.shared.adapter.restore_original() {
                Log::log_warning(&format!("Failed to restore gamma while pausing: {}", e));
            }
        }
        self.shared.publish();
        self.shared.wake();
    }

    /// End a pause and apply the current target right away.
    pub fn resume(&self) {
        {
            let _cycle = lock(&self.shared.cycle);
            self.shared.unpause();
        }
        self.shared.publish();
        self.shared.coarse_cycle();
    }

    pub fn set_active_profile(&self, id: &str) -> CoreResult<()> {
        self.shared.profiles.set_active(id)?;
        lock(&self.shared.state).active_profile = id.to_string();
        self.shared.dirty.store(true, Ordering::SeqCst);
        self.trigger_immediate_update();
        Ok(())
    }

    /// Recompute inputs and run a coarse cycle now, on the worker if one is
    /// running.
    pub fn trigger_immediate_update(&self) {
        self.shared.dirty.store(true, Ordering::SeqCst);
        if !self.shared.wake() {
            self.shared.coarse_cycle();
        }
    }

    /// Receive a snapshot after every state change, starting with the
    /// current one.
    pub fn subscribe(&self) -> Receiver<AppState> {
        let (sender, receiver) = mpsc::channel();
        let mut subscribers = lock(&self.shared.subscribers);
        let _ = sender.send(self.current_state());
        subscribers.push(sender);
        receiver
    }

    /// Ask the location provider again on the next coarse cycle.
    pub fn refresh_location(&self) {
        *lock(&self.shared.last_location_refresh) = None;
        self.trigger_immediate_update();
    }

    /// Queue new settings for the next coarse cycle.
    pub fn update_settings(&self, settings: SchedulerSettings) {
        *lock(&self.shared.pending_settings) = Some(settings);
        self.shared.wake();
    }

    pub fn settings(&self) -> SchedulerSettings {
        read(&self.shared.settings).clone()
    }

    pub fn run_coarse_cycle(&self) -> CycleOutcome {
        self.shared.coarse_cycle()
    }

    pub fn run_fine_tick(&self) -> CycleOutcome {
        self.shared.fine_tick()
    }

    /// Replace the predictive cache. Returns the number of entries.
    pub fn rebuild_predictive_cache(&self) -> CoreResult<usize> {
        let now = self.shared.clock.now();
        self.shared.refresh_inputs(now, false)
    }

    pub fn predictive_cache(&self) -> Option<Arc<PredictiveCache>> {
        read(&self.shared.cache).clone()
    }

    pub fn adapter(&self) -> &Arc<GammaAdapter> {
        &self.shared.adapter
    }
}

impl Drop for PredictiveScheduler {
    fn drop(&mut self) {
        let phase = lock(&self.shared.state).phase;
        if phase != SchedulerPhase::Stopped {
            let _ = self.stop();
        }
    }
}

impl Shared {
    fn settings(&self) -> SchedulerSettings {
        read(&self.settings).clone()
    }

    /// Nudge the worker. False when there is none.
    fn wake(&self) -> bool {
        match lock(&self.commands).as_ref() {
            Some(commands) => commands.send(Command::Wake).is_ok(),
            None => false,
        }
    }

    fn is_active(&self) -> bool {
        let state = lock(&self.state);
        state.phase == SchedulerPhase::Running && !state.paused
    }

    fn unpause(&self) {
        let mut state = lock(&self.state);
        state.paused = false;
        state.resume_at = None;
        if state.phase == SchedulerPhase::Paused {
            state.phase = SchedulerPhase::Running;
        }
    }

    /// Resume when a scheduled pause deadline has passed.
    fn check_auto_resume(&self, now: DateTime<Utc>) -> bool {
        let due = {
            let state = lock(&self.state);
            state.paused && state.resume_at.is_some_and(|at| now >= at)
        };
        if due {
            self.unpause();
            Log::log_info("Pause ended, resuming");
        }
        due
    }

    fn apply_pending_settings(&self) {
        let Some(next) = lock(&self.pending_settings).take() else {
            return;
        };
        if *read(&self.settings) == next {
            return;
        }
        lock(&self.interval).set_limits(
            next.coarse_interval,
            next.min_coarse_interval,
            next.max_coarse_interval,
        );
        self.adapter.update_settings(next.adapter);
        *write(&self.settings) = next;
        self.dirty.store(true, Ordering::SeqCst);
        Log::log_info("Updated settings are now in effect");
    }

    /// Whether inputs need recomputing. `Some(true)` also asks the location
    /// provider again.
    fn refresh_due(&self, now: DateTime<Utc>, settings: &SchedulerSettings) -> Option<bool> {
        let location_due = lock(&self.last_location_refresh)
            .is_none_or(|at| now - at >= settings.location_refresh_interval || now < at);
        if location_due {
            return Some(true);
        }

        let cache = read(&self.cache).clone();
        let Some(cache) = cache else {
            return Some(false);
        };
        let rebuild_age = TimeDelta::from_std(settings.cache_rebuild_interval)
            .unwrap_or(TimeDelta::minutes(PREDICTIVE_CACHE_REBUILD_MINUTES as i64));
        let today = now
            .with_timezone(&cache.solar_today().timezone())
            .date_naive();

        let stale = self.dirty.load(Ordering::SeqCst)
            || cache.solar_today().date() != today
            || now < cache.start()
            || now - cache.built_at() >= rebuild_age;
        stale.then_some(false)
    }

    /// Recompute solar data and rebuild the predictive cache.
    fn refresh_inputs(&self, now: DateTime<Utc>, refresh_location: bool) -> CoreResult<usize> {
        self.dirty.store(false, Ordering::SeqCst);
        let result = self.rebuild(now, refresh_location);
        if result.is_err() {
            self.dirty.store(true, Ordering::SeqCst);
        }
        result
    }

    fn rebuild(&self, now: DateTime<Utc>, refresh_location: bool) -> CoreResult<usize> {
        let settings = self.settings();
        let (known, fallback) = {
            let state = lock(&self.state);
            (state.location.clone(), state.solar_times.clone())
        };

        let location = if refresh_location || known.is_none() {
            match self.locations.current_location() {
                Some(location) => {
                    *lock(&self.last_location_refresh) = Some(now);
                    if known.as_ref().is_none_or(|k| !k.same_position(&location)) {
                        Log::log_debug(&format!("Location set to {}", location));
                    }
                    Some(location)
                }
                None => {
                    if let Some(known) = &known {
                        Log::log_warning(&format!(
                            "Location provider has no position, keeping {}",
                            known
                        ));
                    }
                    known
                }
            }
        } else {
            known
        };
        let location = location
            .ok_or_else(|| CoreError::InvalidInput("no location available".into()))?;

        let profile = self.profiles.active_profile();
        let fallback = fallback.filter(|times| times.location().same_position(&location));
        let cache = PredictiveCache::build(
            now,
            &location,
            &profile,
            &settings.calculator,
            &settings.engine(),
            fallback.as_ref(),
        )?;
        let entries = cache.len();

        {
            let mut state = lock(&self.state);
            state.location = Some(location);
            state.solar_times = Some(cache.solar_today().clone());
            state.active_profile = profile.id.clone();
        }
        *write(&self.cache) = Some(Arc::new(cache));
        Ok(entries)
    }

    /// Exact evaluation, bypassing the predictive cache.
    fn exact_target(&self, now: DateTime<Utc>, settings: &SchedulerSettings) -> CoreResult<Target> {
        let (location, fallback) = {
            let state = lock(&self.state);
            (state.location.clone(), state.solar_times.clone())
        };
        let location = location
            .ok_or_else(|| CoreError::InvalidInput("no location available".into()))?;
        let profile = self.profiles.active_profile();

        let mut days = SolarDays::new(&location, &settings.calculator, fallback.as_ref());
        let evaluation = days.evaluate(now, &profile, &settings.engine())?;
        Ok(Target {
            temperature: evaluation.temperature,
            period: evaluation.period,
            window: evaluation.window,
        })
    }

    /// Target for `now`: exact inside a window, otherwise the nearest
    /// predictive entry unless a window lies between it and `now`.
    fn evaluate_target(&self, now: DateTime<Utc>, settings: &SchedulerSettings) -> CoreResult<Target> {
        let cache = read(&self.cache).clone();
        if let Some(cache) = cache {
            if cache.window_containing(now).is_none() {
                if let Some(entry) = cache.lookup(now, settings.cache_miss_tolerance) {
                    let (from, to) = if entry.at <= now {
                        (entry.at, now)
                    } else {
                        (now, entry.at)
                    };
                    let crosses_window = cache
                        .windows()
                        .iter()
                        .any(|w| w.start <= to && w.end > from);
                    if !entry.period.is_transitioning() && !crosses_window {
                        return Ok(Target {
                            temperature: entry.temperature,
                            period: entry.period,
                            window: None,
                        });
                    }
                }
                Log::log_debug(&format!(
                    "Predictive cache miss at {}, computing exactly",
                    now.format("%H:%M:%S UTC")
                ));
            }
        }
        self.exact_target(now, settings)
    }

    /// Push `temperature` to every monitor. On success it becomes the
    /// applied temperature.
    fn apply_temperature(&self, temperature: ColorTemperature) -> Result<(), String> {
        match self.adapter.apply_detailed(None, temperature) {
            Ok(reports) if !reports.is_empty() && reports.iter().all(ApplyReport::succeeded) => {
                for report in &reports {
                    if let Some(strategy) = report.strategy() {
                        if strategy != Strategy::DirectRamp {
                            Log::log_debug(&format!(
                                "{} on {} applied through {}",
                                temperature,
                                report.monitor,
                                strategy.as_str()
                            ));
                        }
                    }
                }
                lock(&self.state).applied = Some(temperature);
                Ok(())
            }
            Ok(reports) => Err(reports
                .iter()
                .find_map(ApplyReport::error)
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no monitors to apply to".into())),
            Err(e) => Err(e.to_string()),
        }
    }

    fn finish_transition_if_complete(&self, now: DateTime<Utc>) {
        let mut state = lock(&self.state);
        let complete = state
            .transition
            .as_ref()
            .is_some_and(|t| t.is_complete_at(now) && state.applied == Some(t.to));
        if complete {
            state.transition = None;
            Log::log_debug("Transition complete");
        }
    }

    fn record_outcome(&self, result: Result<(), String>, elapsed: Duration) {
        let mut state = lock(&self.state);
        let mut interval = lock(&self.interval);
        match result {
            Ok(()) => {
                if state.consecutive_failures > 0 {
                    Log::log_info("Display filtering recovered");
                }
                state.consecutive_failures = 0;
                state.availability = Availability::Available;
                interval.record_success(elapsed);
            }
            Err(reason) => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                let next = interval.record_failure();
                Log::log_warning(&format!(
                    "Update failed ({} in a row): {}. Next attempt in {}s",
                    state.consecutive_failures,
                    reason,
                    next.as_secs()
                ));
                state.availability = Availability::Unavailable { reason };
            }
        }
        state.coarse_interval = interval.current();
    }

    fn coarse_cycle(&self) -> CycleOutcome {
        let _cycle = match self.cycle.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                Log::log_debug("Coarse cycle still in flight, skipping");
                return CycleOutcome::Skipped;
            }
        };

        self.apply_pending_settings();
        let settings = self.settings();
        let now = self.clock.now();
        let started = self.clock.monotonic();

        self.check_auto_resume(now);
        if !self.is_active() {
            self.publish();
            return CycleOutcome::Inactive;
        }

        let result = self.coarse_update(now, &settings);
        let elapsed = self.clock.monotonic().saturating_duration_since(started);
        self.record_outcome(result, elapsed);
        self.publish();
        CycleOutcome::Ran
    }

    fn coarse_update(&self, now: DateTime<Utc>, settings: &SchedulerSettings) -> Result<(), String> {
        if let Some(refresh_location) = self.refresh_due(now, settings) {
            if let Err(e) = self.refresh_inputs(now, refresh_location) {
                Log::log_warning(&format!("Failed to refresh solar data: {}", e));
                if read(&self.cache).is_none() {
                    return Err(e.to_string());
                }
            }
        }

        let target = self.evaluate_target(now, settings).map_err(|e| e.to_string())?;
        let engine = settings.engine();
        let threshold = settings.transition_threshold;

        let next = {
            let mut state = lock(&self.state);
            state.target = Some(target.temperature);
            state.period = Some(target.period);

            let current = match &state.transition {
                Some(transition) => transition.current_at(&engine, now),
                None => state.applied.unwrap_or(ColorTemperature::NEUTRAL),
            };
            let start_transition = match &state.transition {
                Some(transition) => {
                    target.window.is_none() && transition.to.delta(target.temperature) > threshold
                }
                None => current.delta(target.temperature) > threshold,
            };

            if start_transition {
                let local = match &state.location {
                    Some(location) => now.with_timezone(&location.timezone()).time(),
                    None => now.time(),
                };
                let delta = current.delta(target.temperature);
                let transition = TransitionState::new(
                    current,
                    target.temperature,
                    now,
                    settings.catchup_duration,
                    recommend_easing(delta, local),
                    is_evening(local),
                );
                Log::log_debug(&format!(
                    "Transition {} -> {} over {}s ({})",
                    current,
                    target.temperature,
                    settings.catchup_duration.as_secs(),
                    transition.easing.as_str()
                ));
                let first = transition.current_at(&engine, now);
                state.transition = Some(transition);
                (state.applied != Some(first)).then_some(first)
            } else if state.transition.is_some() {
                None
            } else if state.applied != Some(target.temperature) {
                Some(target.temperature)
            } else {
                None
            }
        };

        if let Some(temperature) = next {
            self.apply_temperature(temperature)?;
        }
        self.finish_transition_if_complete(now);
        Ok(())
    }

    fn fine_tick(&self) -> CycleOutcome {
        let _cycle = match self.cycle.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return CycleOutcome::Skipped,
        };

        let now = self.clock.now();
        if self.check_auto_resume(now) {
            self.wake();
        }
        {
            let state = lock(&self.state);
            if state.phase != SchedulerPhase::Running
                || state.paused
                || state.consecutive_failures > 0
            {
                return CycleOutcome::Inactive;
            }
        }

        let settings = self.settings();
        let engine = settings.engine();

        let sample = lock(&self.state)
            .transition
            .as_ref()
            .map(|t| t.current_at(&engine, now));
        let next = match sample {
            Some(sample) => Some(sample),
            None => {
                let in_window = read(&self.cache)
                    .as_ref()
                    .is_some_and(|c| c.window_containing(now).is_some());
                if !in_window {
                    return CycleOutcome::Ran;
                }
                match self.exact_target(now, &settings) {
                    Ok(target) => {
                        let mut state = lock(&self.state);
                        state.target = Some(target.temperature);
                        state.period = Some(target.period);
                        Some(target.temperature)
                    }
                    Err(e) => {
                        Log::log_debug(&format!("Fine tick could not evaluate target: {}", e));
                        return CycleOutcome::Ran;
                    }
                }
            }
        };

        let applied = lock(&self.state).applied;
        if let Some(temperature) = next.filter(|t| applied != Some(*t)) {
            if let Err(reason) = self.apply_temperature(temperature) {
                self.record_outcome(Err(reason), Duration::ZERO);
            }
        }
        self.finish_transition_if_complete(now);
        self.publish();
        CycleOutcome::Ran
    }

    fn coarse_delay(&self, now: DateTime<Utc>, settings: &SchedulerSettings) -> Duration {
        let near_window = read(&self.cache)
            .as_ref()
            .is_some_and(|c| c.near_window(now, settings.near_transition_window));
        let transitioning = lock(&self.state).transition.is_some();
        lock(&self.interval).effective(near_window || transitioning)
    }

    fn fine_delay(&self, now: DateTime<Utc>, settings: &SchedulerSettings) -> Duration {
        let in_window = read(&self.cache)
            .as_ref()
            .is_some_and(|c| c.window_containing(now).is_some());
        let transitioning = lock(&self.state).transition.is_some();
        if in_window || transitioning {
            settings.active_fine_interval
        } else {
            settings.fine_interval
        }
    }

    fn publish(&self) {
        let snapshot = lock(&self.state).clone();
        {
            let mut last = lock(&self.last_published);
            if last.as_ref() == Some(&snapshot) {
                return;
            }
            *last = Some(snapshot.clone());
        }
        lock(&self.subscribers).retain(|subscriber| subscriber.send(snapshot.clone()).is_ok());
    }
}

/// Run `f`, logging instead of unwinding out of the worker.
fn guarded(label: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        Log::log_critical(&format!("Scheduler {} panicked, continuing", label));
    }
}

fn run_worker(shared: Arc<Shared>, commands: Receiver<Command>) {
    let start = shared.clock.monotonic();
    let mut next_coarse = start;
    let mut next_fine = start;
    let mut next_rebuild = start + shared.settings().cache_rebuild_interval;
    let mut last_wall = shared.clock.now();
    let mut last_mono = start;

    loop {
        let mono = shared.clock.monotonic();
        let deadline = next_coarse.min(next_fine).min(next_rebuild);
        match commands.recv_timeout(deadline.saturating_duration_since(mono)) {
            Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(Command::Wake) => next_coarse = mono,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let settings = shared.settings();
        let wall = shared.clock.now();
        let mono: Instant = shared.clock.monotonic();

        // Wall time moving differently from monotonic time means a suspend
        // or a clock change
        let wall_elapsed = (wall - last_wall).num_milliseconds();
        let mono_elapsed = mono.saturating_duration_since(last_mono).as_millis() as i64;
        if (wall_elapsed - mono_elapsed).unsigned_abs() > settings.sleep_threshold.as_millis() as u64 {
            Log::log_info(&format!(
                "Clock jumped by {}, refreshing",
                format_delta(TimeDelta::milliseconds(wall_elapsed - mono_elapsed))
            ));
            shared.dirty.store(true, Ordering::SeqCst);
            next_coarse = mono;
        }
        last_wall = wall;
        last_mono = mono;

        if mono >= next_rebuild {
            guarded("cache rebuild", || {
                if let Err(e) = shared.refresh_inputs(wall, false) {
                    Log::log_warning(&format!("Predictive cache rebuild failed: {}", e));
                }
            });
            next_rebuild = mono + settings.cache_rebuild_interval;
        }
        if mono >= next_coarse {
            guarded("coarse cycle", || {
                shared.coarse_cycle();
            });
            next_coarse = mono + shared.coarse_delay(shared.clock.now(), &settings);
        }
        if mono >= next_fine {
            guarded("fine tick", || {
                shared.fine_tick();
            });
            next_fine = mono + shared.fine_delay(shared.clock.now(), &settings);
        }
    }
    Log::log_debug("Scheduler worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::ColorProfile;
    use crate::constants::test_constants::*;
    use crate::gamma::GammaRamp;
    use crate::gamma::virtual_display::VirtualDisplay;
    use crate::geo::{Location, StaticLocationProvider};
    use chrono::TimeZone;

    struct Harness {
        scheduler: PredictiveScheduler,
        display: Arc<VirtualDisplay>,
        clock: Arc<ManualClock>,
        profiles: Arc<ConfigProfileStore>,
    }

    fn k(kelvin: u32) -> ColorTemperature {
        ColorTemperature::new(kelvin).unwrap()
    }

    fn harness(start: DateTime<Utc>) -> Harness {
        Log::set_enabled(false);
        let display = Arc::new(VirtualDisplay::new(&[("DP-1", 256), ("HDMI-A-1", 256)]));
        let adapter = Arc::new(GammaAdapter::new(display.clone(), AdapterSettings::default()));
        let location = Location::new(TEST_NYC_LATITUDE, TEST_NYC_LONGITUDE).unwrap();
        let profiles = Arc::new(
            ConfigProfileStore::new(
                vec![
                    ColorProfile::new("default", k(6500), k(3300)),
                    ColorProfile::new("deep", k(6500), k(2200)),
                ],
                "default",
            )
            .unwrap(),
        );
        let clock = Arc::new(ManualClock::new(start));
        let scheduler = PredictiveScheduler::with_clock(
            adapter,
            Arc::new(StaticLocationProvider::new(Some(location))),
            profiles.clone(),
            SchedulerSettings::default(),
            clock.clone(),
        );
        Harness {
            scheduler,
            display,
            clock,
            profiles,
        }
    }

    // 2024-06-21 12:00 EDT
    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 21, 16, 0, 0).unwrap()
    }

    // 2024-06-21 00:00 EDT
    fn midnight() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 21, 4, 0, 0).unwrap()
    }

    #[test]
    fn test_initialize_enters_running_with_full_cache() {
        let h = harness(noon());
        assert_eq!(h.scheduler.current_state().phase, SchedulerPhase::Initializing);
        assert_eq!(h.scheduler.run_coarse_cycle(), CycleOutcome::Inactive);

        h.scheduler.initialize().unwrap();
        let state = h.scheduler.current_state();
        assert_eq!(state.phase, SchedulerPhase::Running);
        assert!(state.solar_times.is_some());
        assert_eq!(h.scheduler.predictive_cache().unwrap().len(), 96);
    }

    #[test]
    fn test_daytime_target_applied_directly() {
        let h = harness(noon());
        h.scheduler.initialize().unwrap();
        assert_eq!(h.scheduler.run_coarse_cycle(), CycleOutcome::Ran);

        let state = h.scheduler.current_state();
        assert_eq!(state.target, Some(k(6500)));
        assert_eq!(state.applied, Some(k(6500)));
        assert_eq!(state.period, Some(Period::Day));
        assert!(state.transition.is_none());
        assert!(state.is_filtering());
    }

    #[test]
    fn test_drift_starts_catchup_transition() {
        let h = harness(midnight());
        h.scheduler.initialize().unwrap();
        h.scheduler.run_coarse_cycle();

        let state = h.scheduler.current_state();
        assert_eq!(state.target, Some(k(3300)));
        let transition = state.transition.expect("catch-up transition");
        assert_eq!(transition.from, ColorTemperature::NEUTRAL);
        assert_eq!(transition.to, k(3300));

        h.clock.advance(Duration::from_secs(10));
        h.scheduler.run_fine_tick();
        let mid = h.scheduler.current_state().applied.unwrap();
        assert!(mid < k(6500) && mid > k(3300), "got {}", mid);

        h.clock.advance(Duration::from_secs(DEFAULT_CATCHUP_DURATION));
        h.scheduler.run_fine_tick();
        let state = h.scheduler.current_state();
        assert_eq!(state.applied, Some(k(3300)));
        assert!(state.transition.is_none());
    }

    #[test]
    fn test_zero_catchup_applies_target_in_one_cycle() {
        let h = harness(midnight());
        h.scheduler.update_settings(SchedulerSettings {
            catchup_duration: Duration::ZERO,
            ..SchedulerSettings::default()
        });
        h.scheduler.initialize().unwrap();
        h.scheduler.run_coarse_cycle();

        let state = h.scheduler.current_state();
        assert_eq!(state.applied, Some(k(3300)));
        assert!(state.transition.is_none());
    }

    #[test]
    fn test_pause_restores_and_resume_reapplies() {
        let h = harness(noon());
        h.scheduler.initialize().unwrap();
        h.scheduler.set_active_profile("deep").unwrap();
        h.clock.set(midnight());
        h.scheduler.update_settings(SchedulerSettings {
            catchup_duration: Duration::ZERO,
            ..SchedulerSettings::default()
        });
        h.scheduler.run_coarse_cycle();
        assert_ne!(h.display.current_ramp("DP-1"), Some(GammaRamp::identity(256)));

        h.scheduler.pause(PauseRequest::Indefinitely);
        let state = h.scheduler.current_state();
        assert_eq!(state.status(), "paused by user");
        assert_eq!(state.applied, None);
        assert_eq!(h.display.current_ramp("DP-1"), Some(GammaRamp::identity(256)));

        let writes = h.display.write_count("DP-1");
        assert_eq!(h.scheduler.run_coarse_cycle(), CycleOutcome::Inactive);
        assert_eq!(h.scheduler.run_fine_tick(), CycleOutcome::Inactive);
        assert_eq!(h.display.write_count("DP-1"), writes);

        h.scheduler.resume();
        let state = h.scheduler.current_state();
        assert_eq!(state.phase, SchedulerPhase::Running);
        assert_eq!(state.applied, Some(k(2200)));
    }

    #[test]
    fn test_timed_pause_resumes_at_deadline() {
        let h = harness(noon());
        h.scheduler.initialize().unwrap();
        h.scheduler.run_coarse_cycle();

        h.scheduler.pause(PauseRequest::For(Duration::from_secs(600)));
        let state = h.scheduler.current_state();
        assert_eq!(state.resume_at, Some(noon() + TimeDelta::minutes(10)));

        h.clock.advance(Duration::from_secs(300));
        assert_eq!(h.scheduler.run_coarse_cycle(), CycleOutcome::Inactive);

        h.clock.advance(Duration::from_secs(301));
        assert_eq!(h.scheduler.run_coarse_cycle(), CycleOutcome::Ran);
        let state = h.scheduler.current_state();
        assert!(!state.paused);
        assert_eq!(state.applied, Some(k(6500)));
    }

    #[test]
    fn test_pause_until_sunrise_targets_next_sunrise() {
        let h = harness(midnight());
        h.scheduler.initialize().unwrap();
        h.scheduler.pause(PauseRequest::UntilSunrise);

        let state = h.scheduler.current_state();
        let sunrise = state.solar_times.unwrap().sunrise();
        assert_eq!(state.resume_at, Some(sunrise));
    }

    #[test]
    fn test_hardware_failure_reports_unavailable_and_backs_off() {
        let h = harness(noon());
        h.scheduler.initialize().unwrap();
        h.display.refuse("DP-1");

        h.scheduler.run_coarse_cycle();
        let state = h.scheduler.current_state();
        assert_eq!(state.consecutive_failures, 1);
        assert_eq!(state.status(), "filtering unavailable");
        assert_eq!(state.coarse_interval, Duration::from_secs(60));
        assert_eq!(h.scheduler.run_fine_tick(), CycleOutcome::Inactive);

        h.scheduler.run_coarse_cycle();
        assert_eq!(h.scheduler.current_state().coarse_interval, Duration::from_secs(120));
    }

    #[test]
    fn test_overlapping_cycle_is_skipped() {
        let h = harness(noon());
        h.scheduler.initialize().unwrap();
        let _in_flight = h.scheduler.shared.cycle.lock().unwrap();
        assert_eq!(h.scheduler.run_coarse_cycle(), CycleOutcome::Skipped);
        assert_eq!(h.scheduler.run_fine_tick(), CycleOutcome::Skipped);
    }

    #[test]
    fn test_profile_change_rebuilds_cache() {
        let h = harness(noon());
        h.scheduler.initialize().unwrap();
        h.scheduler.run_coarse_cycle();
        assert_eq!(h.scheduler.predictive_cache().unwrap().profile_id(), "default");

        h.profiles.set_active("deep").unwrap();
        h.scheduler.run_coarse_cycle();
        assert_eq!(h.scheduler.predictive_cache().unwrap().profile_id(), "deep");
        assert_eq!(h.scheduler.current_state().active_profile, "deep");
    }

    #[test]
    fn test_date_rollover_refreshes_solar_times() {
        let h = harness(noon());
        h.scheduler.initialize().unwrap();
        h.scheduler.run_coarse_cycle();
        let first = h.scheduler.current_state().solar_times.unwrap().date();

        h.clock.advance(Duration::from_secs(24 * 3600));
        h.scheduler.run_coarse_cycle();
        let second = h.scheduler.current_state().solar_times.unwrap().date();
        assert_eq!(second, first.succ_opt().unwrap());
    }

    #[test]
    fn test_pending_settings_wait_for_coarse_cycle() {
        let h = harness(noon());
        h.scheduler.initialize().unwrap();
        let updated = SchedulerSettings {
            transition_threshold: 200,
            ..SchedulerSettings::default()
        };
        h.scheduler.update_settings(updated.clone());
        assert_eq!(h.scheduler.settings().transition_threshold, DEFAULT_TRANSITION_THRESHOLD);

        h.scheduler.run_coarse_cycle();
        assert_eq!(h.scheduler.settings(), updated);
    }

    #[test]
    fn test_subscribers_receive_snapshots() {
        let h = harness(noon());
        let updates = h.scheduler.subscribe();
        assert_eq!(updates.recv().unwrap().phase, SchedulerPhase::Initializing);

        h.scheduler.initialize().unwrap();
        h.scheduler.run_coarse_cycle();
        let latest = updates.try_iter().last().unwrap();
        assert_eq!(latest.applied, Some(k(6500)));
    }

    #[test]
    fn test_stop_restores_original_curves() {
        let h = harness(midnight());
        h.scheduler.update_settings(SchedulerSettings {
            catchup_duration: Duration::ZERO,
            ..SchedulerSettings::default()
        });
        h.scheduler.initialize().unwrap();
        h.scheduler.run_coarse_cycle();
        assert_ne!(h.display.current_ramp("HDMI-A-1"), Some(GammaRamp::identity(256)));

        h.scheduler.stop().unwrap();
        assert_eq!(h.scheduler.current_state().phase, SchedulerPhase::Stopped);
        assert_eq!(h.display.current_ramp("DP-1"), Some(GammaRamp::identity(256)));
        assert_eq!(h.display.current_ramp("HDMI-A-1"), Some(GammaRamp::identity(256)));
    }

    #[test]
    fn test_worker_applies_and_stops() {
        let h = harness(noon());
        h.scheduler.start().unwrap();
        let updates = h.scheduler.subscribe();

        let mut applied = None;
        while let Ok(state) = updates.recv_timeout(Duration::from_secs(5)) {
            if state.applied.is_some() {
                applied = state.applied;
                break;
            }
        }
        assert_eq!(applied, Some(k(6500)));

        h.scheduler.stop().unwrap();
        assert_eq!(h.scheduler.current_state().phase, SchedulerPhase::Stopped);
    }
}
