//! The gamma hardware adapter.
//!
//! Applies a temperature to one or all monitors through an ordered chain of
//! [`Strategy`] values. Each strategy handles one failure class by passing
//! control to the next; any other error ends the chain. Computed ramps are
//! cached per `(monitor, kelvin)`, device handles are pooled, and writes to
//! the same monitor are serialised while distinct monitors proceed in
//! parallel.
//!
//! The first time a monitor is touched its current curve is recorded so
//! [`GammaAdapter::restore_original`] can put it back.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use crate::color::ColorTemperature;
use crate::constants::*;
use crate::error::{GammaError, GammaResult};
use crate::gamma::cache::{CacheStats, CurveCache};
use crate::gamma::pool::{HandlePool, PoolStats};
use crate::gamma::{ColorProfileSink, DeviceHandle, GammaDevice, GammaRamp, MonitorInfo};
use crate::logger::Log;
use crate::utils::{lock, read, write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterSettings {
    pub cache_ttl: Duration,
    pub cache_max_entries: usize,
    pub pool_size: usize,
    pub acquire_timeout: Duration,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(DEFAULT_CURVE_CACHE_TTL * 60),
            cache_max_entries: DEFAULT_CURVE_CACHE_MAX_ENTRIES,
            pool_size: DEFAULT_HANDLE_POOL_SIZE,
            acquire_timeout: Duration::from_millis(DEFAULT_HANDLE_ACQUIRE_TIMEOUT_MS),
        }
    }
}

/// One link of the fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Write a gamma ramp through a pooled device handle.
    DirectRamp,
    /// Hand the temperature to the persistent color-profile mechanism.
    ColorProfile,
}

impl Strategy {
    pub const CHAIN: [Strategy; 2] = [Strategy::DirectRamp, Strategy::ColorProfile];

    /// True when `error` is the failure class this strategy hands over to
    /// the next one.
    pub fn handles(self, error: &GammaError) -> bool {
        match self {
            Strategy::DirectRamp => matches!(
                error,
                GammaError::HardwareUnsupported { .. } | GammaError::Device(_)
            ),
            Strategy::ColorProfile => matches!(
                error,
                GammaError::ProfileUnavailable(_) | GammaError::Device(_)
            ),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::DirectRamp => "direct ramp",
            Strategy::ColorProfile => "color profile",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Applied,
    /// Failed with the class this strategy handles; the next one was tried.
    FellThrough(GammaError),
    /// Failed with an error no strategy handles; the chain stopped.
    Aborted(GammaError),
}

/// What happened when applying to one monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyReport {
    pub monitor: String,
    pub temperature: ColorTemperature,
    pub attempts: Vec<(Strategy, AttemptOutcome)>,
    pub cache_hit: bool,
}

impl ApplyReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.attempts.last(), Some((_, AttemptOutcome::Applied)))
    }

    /// Strategy that applied the temperature, if any.
    pub fn strategy(&self) -> Option<Strategy> {
        match self.attempts.last() {
            Some((strategy, AttemptOutcome::Applied)) => Some(*strategy),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<GammaError> {
        if self.succeeded() {
            return None;
        }
        match self.attempts.last() {
            Some((_, AttemptOutcome::Aborted(e))) => Some(e.clone()),
            _ => Some(GammaError::AllStrategiesFailed {
                monitor: self.monitor.clone(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
enum OriginalCurve {
    Recorded(GammaRamp),
    /// The device cannot read ramps back; its reset restores the original.
    DeviceDefault,
}

pub struct GammaAdapter {
    device: Arc<dyn GammaDevice>,
    sink: Option<Arc<dyn ColorProfileSink>>,
    pool: HandlePool<Box<dyn DeviceHandle>>,
    cache: Mutex<CurveCache>,
    acquire_timeout: RwLock<Duration>,
    monitor_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    originals: Mutex<HashMap<String, OriginalCurve>>,
    profiled: Mutex<HashSet<String>>,
    monitors: RwLock<Vec<MonitorInfo>>,
}

impl GammaAdapter {
    pub fn new(device: Arc<dyn GammaDevice>, settings: AdapterSettings) -> Self {
        let factory_device = Arc::clone(&device);
        Self {
            device,
            sink: None,
            pool: HandlePool::new(settings.pool_size, move || factory_device.open_handle()),
            cache: Mutex::new(CurveCache::new(settings.cache_ttl, settings.cache_max_entries)),
            acquire_timeout: RwLock::new(settings.acquire_timeout),
            monitor_locks: Mutex::new(HashMap::new()),
            originals: Mutex::new(HashMap::new()),
            profiled: Mutex::new(HashSet::new()),
            monitors: RwLock::new(Vec::new()),
        }
    }

    pub fn with_profile_sink(mut self, sink: Arc<dyn ColorProfileSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn device_name(&self) -> &'static str {
        self.device.name()
    }

    pub fn profile_sink_name(&self) -> Option<&'static str> {
        self.sink.as_ref().map(|s| s.name())
    }

    /// Ask the device for its monitors and remember them.
    pub fn enumerate_monitors(&self) -> GammaResult<Vec<MonitorInfo>> {
        let monitors = self.device.enumerate()?;
        *write(&self.monitors) = monitors.clone();
        Ok(monitors)
    }

    /// Apply `temperature` to one monitor, or to all when `monitor` is `None`.
    /// Returns true only when every targeted monitor took the change.
    pub fn apply(&self, monitor: Option<&str>, temperature: ColorTemperature) -> bool {
        match self.apply_detailed(monitor, temperature) {
            Ok(reports) => !reports.is_empty() && reports.iter().all(ApplyReport::succeeded),
            Err(e) => {
                Log::log_error(&format!("Cannot apply {}: {}", temperature, e));
                false
            }
        }
    }

    /// Like [`GammaAdapter::apply`], reporting every attempt per monitor.
    pub fn apply_detailed(
        &self,
        monitor: Option<&str>,
        temperature: ColorTemperature,
    ) -> GammaResult<Vec<ApplyReport>> {
        self.apply_with_chain(monitor, temperature, &Strategy::CHAIN)
    }

    /// Apply using only strategies whose effect outlives this process.
    ///
    /// Direct ramps are skipped when the device drops them on exit. If that
    /// leaves nothing to try, fails before touching any monitor.
    pub fn apply_persistent(
        &self,
        monitor: Option<&str>,
        temperature: ColorTemperature,
    ) -> GammaResult<Vec<ApplyReport>> {
        if self.device.persists_after_exit() {
            return self.apply_detailed(monitor, temperature);
        }
        if self.sink.is_none() {
            return Err(GammaError::ProfileUnavailable(format!(
                "{} gamma is reset when kelvind exits and no color profile mechanism is available",
                self.device.name()
            )));
        }
        self.apply_with_chain(monitor, temperature, &[Strategy::ColorProfile])
    }

    fn apply_with_chain(
        &self,
        monitor: Option<&str>,
        temperature: ColorTemperature,
        chain: &[Strategy],
    ) -> GammaResult<Vec<ApplyReport>> {
        let targets = self.resolve_targets(monitor)?;

        if targets.len() == 1 {
            return Ok(vec![self.apply_to_monitor(&targets[0], temperature, chain)]);
        }

        let reports = thread::scope(|scope| {
            let workers: Vec<_> = targets
                .iter()
                .map(|target| scope.spawn(move || self.apply_to_monitor(target, temperature, chain)))
                .collect();

            workers
                .into_iter()
                .zip(&targets)
                .map(|(worker, target)| {
                    worker.join().unwrap_or_else(|_| ApplyReport {
                        monitor: target.id.clone(),
                        temperature,
                        attempts: vec![(
                            chain.first().copied().unwrap_or(Strategy::DirectRamp),
                            AttemptOutcome::Aborted(GammaError::Device(
                                "apply worker panicked".into(),
                            )),
                        )],
                        cache_hit: false,
                    })
                })
                .collect()
        });
        Ok(reports)
    }

    /// Return every touched monitor to the curve recorded before its first
    /// modification, and remove any installed color profile.
    ///
    /// Safe to call at any time, repeatedly. Attempts every monitor even if
    /// some fail and reports the first failure.
    pub fn restore_original(&self) -> GammaResult<()> {
        let mut first_error = None;

        let recorded: Vec<(String, OriginalCurve)> = lock(&self.originals)
            .iter()
            .map(|(id, curve)| (id.clone(), curve.clone()))
            .collect();

        for (id, curve) in recorded {
            let Some(monitor) = self.find_monitor(&id) else {
                Log::log_debug(&format!("Monitor {} is gone, nothing to restore", id));
                lock(&self.originals).remove(&id);
                continue;
            };

            match self.restore_monitor(&monitor, &curve) {
                Ok(()) => {
                    lock(&self.originals).remove(&id);
                    Log::log_debug(&format!("Restored original gamma on {}", id));
                }
                Err(e) => {
                    Log::log_warning(&format!("Failed to restore gamma on {}: {}", id, e));
                    first_error.get_or_insert(e);
                }
            }
        }

        let had_profiles = !lock(&self.profiled).is_empty();
        if let (true, Some(sink)) = (had_profiles, &self.sink) {
            match sink.clear() {
                Ok(()) => lock(&self.profiled).clear(),
                Err(e) => {
                    Log::log_warning(&format!("Failed to clear {} profile: {}", sink.name(), e));
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Reset every monitor to the device default and clear any color
    /// profile, whether or not this adapter touched them.
    pub fn reset_all(&self) -> GammaResult<()> {
        let mut first_error = None;
        for monitor in self.enumerate_monitors()? {
            let curve = lock(&self.originals)
                .remove(&monitor.id)
                .unwrap_or(OriginalCurve::DeviceDefault);
            if let Err(e) = self.restore_monitor(&monitor, &curve) {
                Log::log_warning(&format!("Failed to reset gamma on {}: {}", monitor.id, e));
                first_error.get_or_insert(e);
            }
        }

        if let Some(sink) = &self.sink {
            match sink.clear() {
                Ok(()) => lock(&self.profiled).clear(),
                Err(e) => {
                    Log::log_debug(&format!("No {} profile to clear: {}", sink.name(), e));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        lock(&self.cache).stats()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Apply new cache limits and acquire timeout. The pool keeps its size.
    pub fn update_settings(&self, settings: AdapterSettings) {
        lock(&self.cache).set_limits(settings.cache_ttl, settings.cache_max_entries);
        *write(&self.acquire_timeout) = settings.acquire_timeout;
    }

    fn resolve_targets(&self, monitor: Option<&str>) -> GammaResult<Vec<MonitorInfo>> {
        let mut monitors = read(&self.monitors).clone();
        let known = match monitor {
            Some(id) => monitors.iter().any(|m| m.id == id),
            None => !monitors.is_empty(),
        };
        if !known {
            monitors = self.enumerate_monitors()?;
        }

        match monitor {
            Some(id) => monitors
                .into_iter()
                .find(|m| m.id == id)
                .map(|m| vec![m])
                .ok_or_else(|| GammaError::UnknownMonitor(id.to_string())),
            None if monitors.is_empty() => {
                Err(GammaError::Device(format!("{} reports no monitors", self.device.name())))
            }
            None => Ok(monitors),
        }
    }

    fn find_monitor(&self, id: &str) -> Option<MonitorInfo> {
        let cached = read(&self.monitors).iter().find(|m| m.id == id).cloned();
        cached.or_else(|| {
            self.enumerate_monitors()
                .ok()
                .and_then(|monitors| monitors.into_iter().find(|m| m.id == id))
        })
    }

    fn monitor_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = lock(&self.monitor_locks);
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    fn apply_to_monitor(
        &self,
        monitor: &MonitorInfo,
        temperature: ColorTemperature,
        chain: &[Strategy],
    ) -> ApplyReport {
        let monitor_lock = self.monitor_lock(&monitor.id);
        let _serialized = lock(&monitor_lock);

        let mut report = ApplyReport {
            monitor: monitor.id.clone(),
            temperature,
            attempts: Vec::with_capacity(chain.len()),
            cache_hit: false,
        };

        for &strategy in chain {
            let result = match strategy {
                Strategy::DirectRamp => self.apply_direct(monitor, temperature, &mut report.cache_hit),
                Strategy::ColorProfile => self.apply_profile(monitor, temperature),
            };

            match result {
                Ok(()) => {
                    report.attempts.push((strategy, AttemptOutcome::Applied));
                    break;
                }
                Err(e) if strategy.handles(&e) => {
                    Log::log_debug(&format!(
                        "{} failed on {}: {}, trying next strategy",
                        strategy.as_str(),
                        monitor.id,
                        e
                    ));
                    report.attempts.push((strategy, AttemptOutcome::FellThrough(e)));
                }
                Err(e) => {
                    report.attempts.push((strategy, AttemptOutcome::Aborted(e)));
                    break;
                }
            }
        }

        if !report.succeeded() {
            if let Some(e) = report.error() {
                Log::log_error(&format!("Failed to apply {} to {}: {}", temperature, monitor.id, e));
            }
        }
        report
    }

    fn apply_direct(
        &self,
        monitor: &MonitorInfo,
        temperature: ColorTemperature,
        cache_hit: &mut bool,
    ) -> GammaResult<()> {
        let timeout = *read(&self.acquire_timeout);
        let mut handle = self.pool.acquire(timeout)?;

        let original = if lock(&self.originals).contains_key(&monitor.id) {
            None
        } else {
            match handle.read_ramp(monitor) {
                Ok(Some(ramp)) => Some(OriginalCurve::Recorded(ramp)),
                Ok(None) => Some(OriginalCurve::DeviceDefault),
                Err(e) => {
                    if matches!(e, GammaError::Device(_)) {
                        handle.discard();
                    }
                    return Err(e);
                }
            }
        };

        let ramp = self.ramp_for(monitor, temperature, cache_hit);
        match handle.write_ramp(monitor, &ramp) {
            Ok(()) => {
                // Only monitors we actually changed have something to restore
                if let Some(original) = original {
                    lock(&self.originals)
                        .entry(monitor.id.clone())
                        .or_insert(original);
                }
                Ok(())
            }
            Err(e) => {
                if matches!(e, GammaError::Device(_)) {
                    handle.discard();
                }
                Err(e)
            }
        }
    }

    fn ramp_for(
        &self,
        monitor: &MonitorInfo,
        temperature: ColorTemperature,
        cache_hit: &mut bool,
    ) -> Arc<GammaRamp> {
        let now = Instant::now();
        if let Some(ramp) = lock(&self.cache).get(&monitor.id, temperature.kelvin(), now) {
            *cache_hit = true;
            return ramp;
        }

        Log::log_debug(&format!("Curve cache miss for {} at {}", monitor.id, temperature));
        let ramp = Arc::new(GammaRamp::for_temperature(monitor.ramp_size, temperature));
        lock(&self.cache).insert(&monitor.id, temperature.kelvin(), Arc::clone(&ramp), now);
        ramp
    }

    fn apply_profile(&self, monitor: &MonitorInfo, temperature: ColorTemperature) -> GammaResult<()> {
        let Some(sink) = &self.sink else {
            return Err(GammaError::ProfileUnavailable(
                "no color profile mechanism configured".into(),
            ));
        };
        sink.apply(monitor, temperature)?;
        lock(&self.profiled).insert(monitor.id.clone());
        Ok(())
    }

    fn restore_monitor(&self, monitor: &MonitorInfo, curve: &OriginalCurve) -> GammaResult<()> {
        let monitor_lock = self.monitor_lock(&monitor.id);
        let _serialized = lock(&monitor_lock);

        let timeout = *read(&self.acquire_timeout);
        let mut handle = self.pool.acquire(timeout)?;
        match curve {
            OriginalCurve::Recorded(ramp) => handle.write_ramp(monitor, ramp),
            OriginalCurve::DeviceDefault => handle.reset(monitor),
        }
    }
}

impl Drop for GammaAdapter {
    fn drop(&mut self) {
        self.pool.drain_idle();
    }
}
