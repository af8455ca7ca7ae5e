use anyhow::{Context, Result};
use chrono::Utc;
use fs2::FileExt;
use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
    sync::mpsc::{Receiver, RecvTimeoutError},
    time::Duration,
};

use kelvind::args::{CliAction, ParsedArgs};
use kelvind::color::Period;
use kelvind::config::Config;
use kelvind::constants::*;
use kelvind::gamma::{self, AdapterSettings, GammaAdapter};
use kelvind::geo::solar::DayKind;
use kelvind::geo::{Location, StaticLocationProvider};
use kelvind::logger::Log;
use kelvind::scheduler::{
    AppState, Availability, ConfigProfileStore, PredictiveScheduler, ProfileStore,
    SchedulerPhase, SchedulerSettings, SolarDays,
};
use kelvind::signals::{SignalMessage, SignalState, setup_signal_handler};
use kelvind::utils::path_for_display;

const CHECK_INTERVAL: Duration = Duration::from_secs(CHECK_INTERVAL_SECS);

/// Everything the daemon keeps so a reload can reach it.
struct Daemon {
    scheduler: PredictiveScheduler,
    profiles: Arc<ConfigProfileStore>,
    locations: Arc<StaticLocationProvider>,
    config_path: Option<PathBuf>,
}

/// Load from `--config` when given, otherwise from the XDG location
/// (creating a default file there if needed).
fn load_config(path: Option<&Path>) -> Result<(Config, PathBuf)> {
    match path {
        Some(path) => Ok((Config::load_from_path(path)?, path.to_path_buf())),
        None => Ok((Config::load()?, Config::get_config_path()?)),
    }
}

fn configured_location(config: &Config) -> Result<Location> {
    match config.location()? {
        Some(location) => Ok(location),
        None => {
            Log::log_warning(&format!(
                "No coordinates configured, using {:.4}, {:.4}",
                FALLBACK_LATITUDE, FALLBACK_LONGITUDE
            ));
            Location::new(FALLBACK_LATITUDE, FALLBACK_LONGITUDE)
                .context("Invalid fallback coordinates")
        }
    }
}

fn build_adapter(config: &Config, settings: AdapterSettings, dry_run: bool) -> Result<GammaAdapter> {
    let device = gamma::detect_device(config.backend.unwrap_or(DEFAULT_BACKEND), dry_run)?;
    let mut adapter = GammaAdapter::new(device, settings);
    if !dry_run {
        if let Some(sink) = gamma::detect_profile_sink(
            config.profile_fallback.unwrap_or(DEFAULT_PROFILE_FALLBACK),
        ) {
            Log::log_decorated(&format!("Color profile fallback: {}", sink.name()));
            adapter = adapter.with_profile_sink(sink);
        }
    }
    Ok(adapter)
}

fn build_daemon(config: &Config, config_path: Option<PathBuf>, dry_run: bool) -> Result<Daemon> {
    let settings = SchedulerSettings::from_config(config);
    let adapter = build_adapter(config, settings.adapter, dry_run)?;
    let locations = Arc::new(StaticLocationProvider::new(Some(configured_location(config)?)));
    let profiles = Arc::new(
        ConfigProfileStore::new(config.to_profiles()?, config.active_profile_id())
            .context("Invalid profile configuration")?,
    );

    let scheduler = PredictiveScheduler::new(
        Arc::new(adapter),
        locations.clone(),
        profiles.clone(),
        settings,
    );

    Ok(Daemon {
        scheduler,
        profiles,
        locations,
        config_path,
    })
}

/// Print today's solar times and transition windows for the active profile.
fn show_times(config: &Config) -> Result<()> {
    let settings = SchedulerSettings::from_config(config);
    let location = configured_location(config)?;
    let profiles = config.to_profiles()?;
    let active = config.active_profile_id();
    let profile = profiles
        .iter()
        .find(|p| p.id == active)
        .with_context(|| format!("Unknown profile '{}'", active))?;

    let now = Utc::now();
    let mut days = SolarDays::new(&location, &settings.calculator, None);
    let evaluation = days
        .evaluate(now, profile, &settings.engine())
        .context("Failed to compute solar times")?;
    let solar = &evaluation.solar;
    let tz = location.timezone();

    Log::log_block_start(&format!("Solar times for {} on {}", location, solar.date()));
    Log::log_indented(&format!("Timezone: {}", tz.name()));
    match solar.kind() {
        DayKind::PolarDay => Log::log_indented("Polar day: the sun does not set"),
        DayKind::PolarNight => Log::log_indented("Polar night: the sun does not rise"),
        DayKind::Normal => {
            Log::log_indented(&format!(
                "Sunrise: {}",
                solar.local_sunrise().format("%H:%M:%S")
            ));
            Log::log_indented(&format!(
                "Solar noon: {}",
                solar.local_solar_noon().format("%H:%M:%S")
            ));
            Log::log_indented(&format!(
                "Sunset: {}",
                solar.local_sunset().format("%H:%M:%S")
            ));
            if let Some((morning, evening)) = profile.windows(solar) {
                for (label, window) in [("Sunrise", morning), ("Sunset", evening)] {
                    Log::log_indented(&format!(
                        "{} transition: {} - {}",
                        label,
                        window.start.with_timezone(&tz).format("%H:%M:%S"),
                        window.end.with_timezone(&tz).format("%H:%M:%S")
                    ));
                }
            }
        }
    }
    Log::log_indented(&format!(
        "Now: {} ({})",
        evaluation.temperature,
        describe_period(evaluation.period)
    ));
    Log::log_end();
    Ok(())
}

/// Apply the current target once, without a catch-up transition.
///
/// Only strategies that outlive the process are used, so on wlr gamma this
/// needs the color profile fallback.
fn run_once(config: &Config, dry_run: bool) -> Result<()> {
    let settings = SchedulerSettings::from_config(config);
    let adapter = build_adapter(config, settings.adapter, dry_run)?;
    let location = configured_location(config)?;
    let profiles = ConfigProfileStore::new(config.to_profiles()?, config.active_profile_id())
        .context("Invalid profile configuration")?;
    let profile = profiles.active_profile();

    let mut days = SolarDays::new(&location, &settings.calculator, None);
    let evaluation = days
        .evaluate(Utc::now(), &profile, &settings.engine())
        .context("Failed to compute the current target")?;

    let reports = adapter
        .apply_persistent(None, evaluation.temperature)
        .context("Failed to apply temperature")?;
    for report in &reports {
        match (report.strategy(), report.error()) {
            (Some(strategy), _) => Log::log_indented(&format!(
                "{}: {} via {}",
                report.monitor,
                evaluation.temperature,
                strategy.as_str()
            )),
            (None, Some(error)) => {
                Log::log_error(&format!("{}: {}", report.monitor, error));
            }
            (None, None) => {}
        }
    }
    if !reports.iter().all(|r| r.succeeded()) {
        anyhow::bail!("Temperature could not be applied to every monitor");
    }
    Log::log_block_start(&format!(
        "Applied {} ({})",
        evaluation.temperature,
        describe_period(evaluation.period)
    ));
    Log::log_end();
    Ok(())
}

fn reset(config: &Config, dry_run: bool) -> Result<()> {
    let settings = SchedulerSettings::from_config(config);
    let adapter = build_adapter(config, settings.adapter, dry_run)?;
    adapter
        .reset_all()
        .context("Failed to reset gamma")?;
    Log::log_block_start("Original gamma restored");
    Log::log_end();
    Ok(())
}

fn describe_period(period: Period) -> String {
    match period {
        Period::Day => "day".to_string(),
        Period::Night => "night".to_string(),
        Period::Sunrise(progress) => format!("sunrise {:.0}%", progress * 100.0),
        Period::Sunset(progress) => format!("sunset {:.0}%", progress * 100.0),
    }
}

/// Log the parts of a new snapshot that differ from the previous one.
fn log_state_change(previous: Option<&AppState>, current: &AppState) {
    let Some(previous) = previous else {
        if let Some(applied) = current.applied {
            Log::log_block_start(&format!("Initial temperature {} applied", applied));
        }
        return;
    };

    if previous.phase != current.phase {
        match current.phase {
            SchedulerPhase::Paused => Log::log_block_start("Filtering paused"),
            SchedulerPhase::Running if previous.phase == SchedulerPhase::Paused => {
                Log::log_block_start("Filtering resumed")
            }
            SchedulerPhase::Stopped => Log::log_block_start("Scheduler stopped"),
            _ => {}
        }
    }

    if previous.availability != current.availability {
        match &current.availability {
            Availability::Unavailable { reason } => {
                Log::log_warning(&format!("Filtering unavailable: {}", reason))
            }
            Availability::Available => Log::log_block_start("Filtering available again"),
        }
    }

    match (previous.period, current.period) {
        (Some(Period::Day) | Some(Period::Night) | None, Some(Period::Sunset(_))) => {
            Log::log_block_start("Commencing sunset 󰖛 ")
        }
        (Some(Period::Day) | Some(Period::Night) | None, Some(Period::Sunrise(_))) => {
            Log::log_block_start("Commencing sunrise 󰖜 ")
        }
        (Some(Period::Sunset(_)), Some(Period::Night)) => {
            Log::log_block_start("Completed sunset 󰖛 ")
        }
        (Some(Period::Sunrise(_)), Some(Period::Day)) => {
            Log::log_block_start("Completed sunrise 󰖜 ")
        }
        _ => {}
    }

    if previous.active_profile != current.active_profile {
        Log::log_block_start(&format!("Active profile: {}", current.active_profile));
    }

    if previous.transition.is_none() && current.transition.is_some() {
        if let Some(target) = current.target {
            Log::log_decorated(&format!("Catching up to {}", target));
        }
    }

    if current.coarse_interval != previous.coarse_interval && current.consecutive_failures > 0 {
        Log::log_warning(&format!(
            "Backing off: next attempt in {}s",
            current.coarse_interval.as_secs()
        ));
    }
}

fn reload(daemon: &Daemon) {
    let Some(path) = daemon.config_path.as_deref() else {
        Log::log_warning("No configuration file to reload");
        return;
    };

    let result = Config::load_from_path(path).and_then(|config| {
        let location = configured_location(&config)?;
        let profiles = config.to_profiles()?;
        daemon
            .profiles
            .replace(profiles, config.active_profile_id())
            .context("Invalid profile configuration")?;
        daemon.locations.set(Some(location));
        daemon
            .scheduler
            .update_settings(SchedulerSettings::from_config(&config));
        Ok(config)
    });

    match result {
        Ok(config) => {
            config.log_config(Some(path));
            daemon.scheduler.refresh_location();
        }
        Err(e) => {
            Log::log_error(&format!("Configuration reload failed: {:#}", e));
            Log::log_decorated("Keeping the previous configuration");
        }
    }
}

fn run_loop(daemon: &Daemon, signal_state: &SignalState, updates: &Receiver<AppState>) {
    let mut last_state: Option<AppState> = None;

    while signal_state.is_running() {
        match signal_state.signal_receiver.recv_timeout(CHECK_INTERVAL) {
            Ok(SignalMessage::Shutdown) => break,
            Ok(SignalMessage::Trigger) => daemon.scheduler.trigger_immediate_update(),
            Ok(SignalMessage::Reload) => reload(daemon),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        for state in updates.try_iter() {
            log_state_change(last_state.as_ref(), &state);
            last_state = Some(state);
        }
    }
}

fn lock_path() -> PathBuf {
    match std::env::var("XDG_RUNTIME_DIR") {
        Ok(dir) => PathBuf::from(dir).join("kelvind.lock"),
        Err(_) => std::env::temp_dir().join(format!(
            "kelvind-{}.lock",
            nix::unistd::getuid().as_raw()
        )),
    }
}

fn cleanup(lock_file: File, lock_path: &Path) {
    drop(lock_file);
    if let Err(e) = std::fs::remove_file(lock_path) {
        Log::log_decorated(&format!("Warning: Failed to remove lock file: {}", e));
    }
}

fn run_daemon(config: Config, config_path: PathBuf, dry_run: bool, debug_enabled: bool) -> Result<()> {
    let lock_path = lock_path();
    let mut lock_file = File::create(&lock_path)
        .with_context(|| format!("Failed to create lock file {}", lock_path.display()))?;

    if lock_file.try_lock_exclusive().is_err() {
        Log::log_error(
            "Another instance of kelvind is already running.\n\
            • Stop it before starting a new one.",
        );
        std::process::exit(EXIT_FAILURE);
    }
    writeln!(lock_file, "{}", std::process::id()).context("Failed to write lock file")?;
    Log::log_decorated(&format!(
        "Lock acquired at {}",
        path_for_display(&lock_path)
    ));

    let signal_state = setup_signal_handler(debug_enabled)?;
    let daemon = build_daemon(&config, Some(config_path), dry_run)?;
    let updates = daemon.scheduler.subscribe();

    daemon
        .scheduler
        .start()
        .context("Failed to start the scheduler")?;
    Log::log_block_start(&format!(
        "Scheduler running on {}",
        daemon.scheduler.adapter().device_name()
    ));

    run_loop(&daemon, &signal_state, &updates);

    Log::log_block_start("Shutting down kelvind...");
    if let Err(e) = daemon.scheduler.stop() {
        Log::log_error(&format!("Failed to restore original gamma: {}", e));
    }
    cleanup(lock_file, &lock_path);
    Log::log_end();
    Ok(())
}

fn main() -> Result<()> {
    let args = ParsedArgs::from_env();
    Log::set_debug(args.debug_enabled);
    Log::log_version();

    let (config, config_path) = load_config(args.config_path.as_deref())?;
    config.log_config(Some(&config_path));

    match args.action {
        CliAction::ShowTimes => show_times(&config),
        CliAction::Reset => reset(&config, args.dry_run),
        CliAction::Once => run_once(&config, args.dry_run),
        CliAction::Run => run_daemon(config, config_path, args.dry_run, args.debug_enabled),
    }
}
