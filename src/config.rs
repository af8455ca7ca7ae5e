//! Configuration system for kelvind.
//!
//! Settings live in `kelvind.toml` under the XDG config directory
//! (`$XDG_CONFIG_HOME/kelvind/kelvind.toml`), or at the path given with
//! `--config`. A commented default file is written on first start.
//!
//! ## Configuration Structure
//!
//! ```toml
//! backend = "auto"                  # "auto", "wayland" or "virtual"
//! profile_fallback = true           # Use hyprsunset when direct gamma is refused
//!
//! latitude = 40.7128
//! longitude = -74.0060
//! location_name = "New York"
//! twilight = "official"             # "official", "civil" or "civil_strict"
//!
//! active_profile = "default"
//! transition_threshold = 50         # Kelvin of drift before a catch-up transition
//! catchup_duration = 30             # Seconds
//! use_perceptual_interpolation = false
//!
//! [profiles.default]
//! day_temp = 6500
//! night_temp = 3300
//! transition_duration = 45          # Minutes
//! sunrise_offset = 0                # Signed minutes
//! sunset_offset = 0
//! alignment = "outside"             # "outside", "inside" or "centered"
//! easing = "sigmoid"
//! ```
//!
//! Every value is range checked. Out-of-range values are rejected with an
//! error naming the key, never silently clamped.

use anyhow::{Context, Result};
use chrono::TimeDelta;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::color::{ColorProfile, ColorTemperature, Easing, WindowAlignment};
use crate::constants::*;
use crate::geo::Location;
use crate::geo::solar::TwilightMode;
use crate::logger::Log;
use crate::utils::path_for_display;

/// Gamma device selection.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Wayland when a compositor is reachable, otherwise an error.
    Auto,
    /// wlr-gamma-control-unstable-v1 direct gamma ramps.
    Wayland,
    /// In-memory display, nothing on screen changes.
    Virtual,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Auto => "auto",
            Backend::Wayland => "wayland",
            Backend::Virtual => "virtual",
        }
    }
}

/// One `[profiles.<id>]` table.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct ProfileConfig {
    pub day_temp: Option<u32>,
    pub night_temp: Option<u32>,
    pub transition_duration: Option<u64>, // minutes
    pub sunrise_offset: Option<i64>,      // signed minutes
    pub sunset_offset: Option<i64>,       // signed minutes
    pub alignment: Option<WindowAlignment>,
    pub easing: Option<Easing>,
}

/// Configuration loaded from `kelvind.toml`.
///
/// All fields are optional in the file. [`Config::load_from_path`] fills in
/// defaults, so a loaded configuration has every scalar set and at least
/// one profile.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct Config {
    pub backend: Option<Backend>,
    /// Hand the temperature to a color-profile daemon when the compositor
    /// refuses direct gamma control.
    pub profile_fallback: Option<bool>,

    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub location_name: Option<String>,
    pub twilight: Option<TwilightMode>,
    pub sunrise_refraction: Option<f64>, // degrees
    pub sunset_refraction: Option<f64>,  // degrees

    pub active_profile: Option<String>,
    pub transition_threshold: Option<u32>, // Kelvin
    pub catchup_duration: Option<u64>,     // seconds
    pub use_perceptual_interpolation: Option<bool>,

    pub coarse_interval: Option<u64>,     // seconds
    pub min_coarse_interval: Option<u64>, // seconds
    pub max_coarse_interval: Option<u64>, // seconds
    pub fine_interval_ms: Option<u64>,
    pub active_fine_interval_ms: Option<u64>,
    pub near_transition_window: Option<u64>, // minutes
    pub cache_miss_tolerance: Option<u64>,   // minutes

    pub curve_cache_ttl: Option<u64>, // minutes
    pub curve_cache_max_entries: Option<usize>,
    pub handle_pool_size: Option<usize>,
    pub handle_acquire_timeout_ms: Option<u64>,

    #[serde(default)]
    pub profiles: BTreeMap<String, ProfileConfig>,
}

impl Config {
    pub fn get_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("Could not determine config directory")?;
        Ok(config_dir.join("kelvind").join("kelvind.toml"))
    }

    /// Write a commented default configuration to `path`.
    ///
    /// Coordinates default to a placeholder city so the daemon can start;
    /// the comment asks the user to replace them.
    pub fn create_default_config(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = ConfigBuilder::new()
            .add_section("kelvind configuration")
            .add_setting(
                "backend",
                &format!("\"{}\"", DEFAULT_BACKEND.as_str()),
                "Gamma device: \"auto\", \"wayland\" or \"virtual\"",
            )
            .add_setting(
                "profile_fallback",
                &DEFAULT_PROFILE_FALLBACK.to_string(),
                "Use hyprsunset when direct gamma control is refused",
            )
            .add_section("Location")
            .add_setting(
                "latitude",
                &format!("{:.4}", FALLBACK_LATITUDE),
                "Degrees north, replace with your own",
            )
            .add_setting(
                "longitude",
                &format!("{:.4}", FALLBACK_LONGITUDE),
                "Degrees east, replace with your own",
            )
            .add_setting(
                "twilight",
                &format!("\"{}\"", TwilightMode::default().as_str()),
                "Sun position: \"official\", \"civil\" or \"civil_strict\"",
            )
            .add_section("Transitions")
            .add_setting(
                "active_profile",
                &format!("\"{}\"", DEFAULT_PROFILE_ID),
                "Profile to use at startup",
            )
            .add_setting(
                "transition_threshold",
                &DEFAULT_TRANSITION_THRESHOLD.to_string(),
                &format!(
                    "Kelvin of drift before a catch-up transition ({}-{})",
                    MINIMUM_TRANSITION_THRESHOLD, MAXIMUM_TRANSITION_THRESHOLD
                ),
            )
            .add_setting(
                "catchup_duration",
                &DEFAULT_CATCHUP_DURATION.to_string(),
                &format!(
                    "Seconds for a catch-up transition ({}-{})",
                    MINIMUM_CATCHUP_DURATION, MAXIMUM_CATCHUP_DURATION
                ),
            )
            .add_setting(
                "use_perceptual_interpolation",
                &DEFAULT_USE_PERCEPTUAL_INTERPOLATION.to_string(),
                "Blend temperatures in CIELAB for smoother midtones",
            )
            .add_section("Scheduling")
            .add_setting(
                "coarse_interval",
                &DEFAULT_COARSE_INTERVAL.to_string(),
                "Seconds between scheduling cycles",
            )
            .add_setting(
                "fine_interval_ms",
                &DEFAULT_FINE_INTERVAL_MS.to_string(),
                "Milliseconds between ticks outside transitions",
            )
            .add_setting(
                "active_fine_interval_ms",
                &DEFAULT_ACTIVE_FINE_INTERVAL_MS.to_string(),
                "Milliseconds between ticks during transitions",
            )
            .add_setting(
                "curve_cache_ttl",
                &DEFAULT_CURVE_CACHE_TTL.to_string(),
                "Minutes a computed gamma curve is reused",
            )
            .add_table("profiles.default")
            .add_setting(
                "day_temp",
                &DEFAULT_DAY_TEMP.to_string(),
                &format!("Kelvin ({}-{})", MINIMUM_TEMP, MAXIMUM_TEMP),
            )
            .add_setting(
                "night_temp",
                &DEFAULT_NIGHT_TEMP.to_string(),
                &format!("Kelvin ({}-{})", MINIMUM_TEMP, MAXIMUM_TEMP),
            )
            .add_setting(
                "transition_duration",
                &DEFAULT_TRANSITION_DURATION.to_string(),
                &format!(
                    "Minutes ({}-{})",
                    MINIMUM_TRANSITION_DURATION, MAXIMUM_TRANSITION_DURATION
                ),
            )
            .add_setting(
                "alignment",
                &format!("\"{}\"", WindowAlignment::default().as_str()),
                "Window around sunrise/sunset: \"outside\", \"inside\" or \"centered\"",
            )
            .add_setting(
                "easing",
                &format!("\"{}\"", Easing::default().as_str()),
                "Curve shape, e.g. \"sigmoid\", \"linear\", \"circadian\"",
            )
            .build();

        fs::write(path, content)
            .with_context(|| format!("Failed to write default config to {}", path.display()))?;
        Ok(())
    }

    fn apply_defaults_and_validate_fields(config: &mut Config) -> Result<()> {
        if config.backend.is_none() {
            config.backend = Some(DEFAULT_BACKEND);
        }
        if config.profile_fallback.is_none() {
            config.profile_fallback = Some(DEFAULT_PROFILE_FALLBACK);
        }
        if config.twilight.is_none() {
            config.twilight = Some(TwilightMode::default());
        }

        check_range_f64(
            "sunrise_refraction",
            config.sunrise_refraction.get_or_insert(DEFAULT_REFRACTION_DEG),
            0.0,
            MAXIMUM_REFRACTION_DEG,
        )?;
        check_range_f64(
            "sunset_refraction",
            config.sunset_refraction.get_or_insert(DEFAULT_REFRACTION_DEG),
            0.0,
            MAXIMUM_REFRACTION_DEG,
        )?;

        check_range(
            "transition_threshold",
            *config
                .transition_threshold
                .get_or_insert(DEFAULT_TRANSITION_THRESHOLD),
            MINIMUM_TRANSITION_THRESHOLD,
            MAXIMUM_TRANSITION_THRESHOLD,
        )?;
        check_range(
            "catchup_duration",
            *config.catchup_duration.get_or_insert(DEFAULT_CATCHUP_DURATION),
            MINIMUM_CATCHUP_DURATION,
            MAXIMUM_CATCHUP_DURATION,
        )?;
        if config.use_perceptual_interpolation.is_none() {
            config.use_perceptual_interpolation = Some(DEFAULT_USE_PERCEPTUAL_INTERPOLATION);
        }

        for (key, value, default) in [
            ("coarse_interval", &mut config.coarse_interval, DEFAULT_COARSE_INTERVAL),
            (
                "min_coarse_interval",
                &mut config.min_coarse_interval,
                DEFAULT_MIN_COARSE_INTERVAL,
            ),
            (
                "max_coarse_interval",
                &mut config.max_coarse_interval,
                DEFAULT_MAX_COARSE_INTERVAL,
            ),
        ] {
            check_range(
                key,
                *value.get_or_insert(default),
                MINIMUM_COARSE_INTERVAL,
                MAXIMUM_COARSE_INTERVAL,
            )?;
        }

        for (key, value, default) in [
            ("fine_interval_ms", &mut config.fine_interval_ms, DEFAULT_FINE_INTERVAL_MS),
            (
                "active_fine_interval_ms",
                &mut config.active_fine_interval_ms,
                DEFAULT_ACTIVE_FINE_INTERVAL_MS,
            ),
        ] {
            check_range(
                key,
                *value.get_or_insert(default),
                MINIMUM_FINE_INTERVAL_MS,
                MAXIMUM_FINE_INTERVAL_MS,
            )?;
        }

        for (key, value, default) in [
            (
                "near_transition_window",
                &mut config.near_transition_window,
                DEFAULT_NEAR_TRANSITION_WINDOW,
            ),
            (
                "cache_miss_tolerance",
                &mut config.cache_miss_tolerance,
                DEFAULT_CACHE_MISS_TOLERANCE,
            ),
        ] {
            check_range(key, *value.get_or_insert(default), 1, MAXIMUM_SCHEDULING_WINDOW)?;
        }

        check_range(
            "curve_cache_ttl",
            *config.curve_cache_ttl.get_or_insert(DEFAULT_CURVE_CACHE_TTL),
            1,
            MAXIMUM_CURVE_CACHE_TTL,
        )?;
        check_range(
            "curve_cache_max_entries",
            *config
                .curve_cache_max_entries
                .get_or_insert(DEFAULT_CURVE_CACHE_MAX_ENTRIES),
            1,
            MAXIMUM_CURVE_CACHE_ENTRIES,
        )?;
        check_range(
            "handle_pool_size",
            *config.handle_pool_size.get_or_insert(DEFAULT_HANDLE_POOL_SIZE),
            1,
            MAXIMUM_HANDLE_POOL_SIZE,
        )?;
        check_range(
            "handle_acquire_timeout_ms",
            *config
                .handle_acquire_timeout_ms
                .get_or_insert(DEFAULT_HANDLE_ACQUIRE_TIMEOUT_MS),
            1,
            MAXIMUM_HANDLE_ACQUIRE_TIMEOUT_MS,
        )?;

        if let Some(lat) = config.latitude {
            if !(-90.0..=90.0).contains(&lat) {
                anyhow::bail!("Latitude must be between -90 and 90 degrees (got {})", lat);
            }
        }
        if let Some(lon) = config.longitude {
            if !(-180.0..=180.0).contains(&lon) {
                anyhow::bail!(
                    "Longitude must be between -180 and 180 degrees (got {})",
                    lon
                );
            }
        }

        if config.profiles.is_empty() {
            config
                .profiles
                .insert(DEFAULT_PROFILE_ID.to_string(), ProfileConfig::default());
        }
        for (id, profile) in config.profiles.iter_mut() {
            Self::apply_profile_defaults(id, profile)?;
        }
        if config.active_profile.is_none() {
            let first = config.profiles.keys().next().cloned();
            config.active_profile = if config.profiles.contains_key(DEFAULT_PROFILE_ID) {
                Some(DEFAULT_PROFILE_ID.to_string())
            } else {
                first
            };
        }

        Ok(())
    }

    fn apply_profile_defaults(id: &str, profile: &mut ProfileConfig) -> Result<()> {
        for (key, value, default) in [
            ("day_temp", &mut profile.day_temp, DEFAULT_DAY_TEMP),
            ("night_temp", &mut profile.night_temp, DEFAULT_NIGHT_TEMP),
        ] {
            check_range(
                &format!("profiles.{}.{}", id, key),
                *value.get_or_insert(default),
                MINIMUM_TEMP,
                MAXIMUM_TEMP,
            )?;
        }

        check_range(
            &format!("profiles.{}.transition_duration", id),
            *profile
                .transition_duration
                .get_or_insert(DEFAULT_TRANSITION_DURATION),
            MINIMUM_TRANSITION_DURATION,
            MAXIMUM_TRANSITION_DURATION,
        )?;

        for (key, value) in [
            ("sunrise_offset", &mut profile.sunrise_offset),
            ("sunset_offset", &mut profile.sunset_offset),
        ] {
            check_range(
                &format!("profiles.{}.{}", id, key),
                *value.get_or_insert(0),
                -MAXIMUM_SOLAR_OFFSET,
                MAXIMUM_SOLAR_OFFSET,
            )?;
        }

        if profile.alignment.is_none() {
            profile.alignment = Some(WindowAlignment::default());
        }
        if profile.easing.is_none() {
            profile.easing = Some(Easing::default());
        }
        Ok(())
    }

    /// Load and validate a configuration file. Does not create one.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!(
                "Configuration file not found at specified path: {}",
                path.display()
            );
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to load config from {}", path.display()))
    }

    /// Parse, fill in defaults and validate TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content).context("Invalid TOML")?;
        Self::apply_defaults_and_validate_fields(&mut config)?;
        validate_config(&config)?;
        Ok(config)
    }

    /// Load from the default location, creating a default file first when
    /// none exists.
    pub fn load() -> Result<Self> {
        let config_path = Self::get_config_path()?;

        if !config_path.exists() {
            Self::create_default_config(&config_path)
                .context("Failed to create default config during load")?;
            Log::log_indented(&format!(
                "Created default configuration at {}",
                path_for_display(&config_path)
            ));
        }

        Self::load_from_path(&config_path).with_context(|| {
            format!(
                "Failed to load configuration from {}",
                config_path.display()
            )
        })
    }

    /// The configured location, if both coordinates are set.
    pub fn location(&self) -> Result<Option<Location>> {
        let (Some(lat), Some(lon)) = (self.latitude, self.longitude) else {
            return Ok(None);
        };
        let location = Location::new(lat, lon).context("Invalid coordinates in config")?;
        Ok(Some(match &self.location_name {
            Some(name) => location.with_name(name.clone()),
            None => location,
        }))
    }

    /// Convert the profile tables into validated profiles.
    pub fn to_profiles(&self) -> Result<Vec<ColorProfile>> {
        self.profiles
            .iter()
            .map(|(id, table)| -> Result<ColorProfile> {
                let temperature = |value: Option<u32>, default: u32, key: &str| {
                    ColorTemperature::new(value.unwrap_or(default))
                        .with_context(|| format!("profiles.{}.{}", id, key))
                };
                let profile = ColorProfile::new(
                    id.clone(),
                    temperature(table.day_temp, DEFAULT_DAY_TEMP, "day_temp")?,
                    temperature(table.night_temp, DEFAULT_NIGHT_TEMP, "night_temp")?,
                )
                .with_transition_duration(Duration::from_secs(
                    table
                        .transition_duration
                        .unwrap_or(DEFAULT_TRANSITION_DURATION)
                        * 60,
                ))
                .with_offsets(
                    TimeDelta::minutes(table.sunrise_offset.unwrap_or(0)),
                    TimeDelta::minutes(table.sunset_offset.unwrap_or(0)),
                )
                .with_alignment(table.alignment.unwrap_or_default())
                .with_easing(table.easing.unwrap_or_default());

                profile
                    .validate()
                    .with_context(|| format!("Invalid profile '{}'", id))?;
                Ok(profile)
            })
            .collect()
    }

    pub fn active_profile_id(&self) -> &str {
        self.active_profile.as_deref().unwrap_or(DEFAULT_PROFILE_ID)
    }

    pub fn log_config(&self, path: Option<&Path>) {
        match path {
            Some(path) => Log::log_block_start(&format!(
                "Loaded configuration from {}",
                path_for_display(path)
            )),
            None => Log::log_block_start("Loaded configuration"),
        }

        Log::log_indented(&format!(
            "Backend: {}",
            self.backend.unwrap_or(DEFAULT_BACKEND).as_str()
        ));
        Log::log_indented(&format!(
            "Color profile fallback: {}",
            self.profile_fallback.unwrap_or(DEFAULT_PROFILE_FALLBACK)
        ));

        if let (Some(lat), Some(lon)) = (self.latitude, self.longitude) {
            let lat_dir = if lat >= 0.0 { "N" } else { "S" };
            let lon_dir = if lon >= 0.0 { "E" } else { "W" };
            let name = self
                .location_name
                .as_deref()
                .map(|n| format!(" ({})", n))
                .unwrap_or_default();
            Log::log_indented(&format!(
                "Location: {:.4}°{}, {:.4}°{}{}",
                lat.abs(),
                lat_dir,
                lon.abs(),
                lon_dir,
                name
            ));
        }
        Log::log_indented(&format!(
            "Twilight: {}",
            self.twilight.unwrap_or_default().as_str()
        ));

        Log::log_indented(&format!("Active profile: {}", self.active_profile_id()));
        for (id, profile) in &self.profiles {
            Log::log_indented(&format!(
                "  {}: {}K day, {}K night, {} min {} transitions ({})",
                id,
                profile.day_temp.unwrap_or(DEFAULT_DAY_TEMP),
                profile.night_temp.unwrap_or(DEFAULT_NIGHT_TEMP),
                profile
                    .transition_duration
                    .unwrap_or(DEFAULT_TRANSITION_DURATION),
                profile.alignment.unwrap_or_default().as_str(),
                profile.easing.unwrap_or_default().as_str()
            ));
        }

        Log::log_indented(&format!(
            "Catch-up: above {}K drift, over {} seconds",
            self.transition_threshold
                .unwrap_or(DEFAULT_TRANSITION_THRESHOLD),
            self.catchup_duration.unwrap_or(DEFAULT_CATCHUP_DURATION)
        ));
        Log::log_indented(&format!(
            "Interpolation: {}",
            if self
                .use_perceptual_interpolation
                .unwrap_or(DEFAULT_USE_PERCEPTUAL_INTERPOLATION)
            {
                "perceptual"
            } else {
                "linear"
            }
        ));
        Log::log_indented(&format!(
            "Coarse interval: {}s ({}-{}s)",
            self.coarse_interval.unwrap_or(DEFAULT_COARSE_INTERVAL),
            self.min_coarse_interval
                .unwrap_or(DEFAULT_MIN_COARSE_INTERVAL),
            self.max_coarse_interval
                .unwrap_or(DEFAULT_MAX_COARSE_INTERVAL)
        ));
        Log::log_indented(&format!(
            "Curve cache: {} entries for {} minutes",
            self.curve_cache_max_entries
                .unwrap_or(DEFAULT_CURVE_CACHE_MAX_ENTRIES),
            self.curve_cache_ttl.unwrap_or(DEFAULT_CURVE_CACHE_TTL)
        ));
    }
}

/// Cross-field validation of a configuration with defaults applied.
pub fn validate_config(config: &Config) -> Result<()> {
    if config.latitude.is_some() != config.longitude.is_some() {
        anyhow::bail!("latitude and longitude must be set together");
    }

    let coarse = config.coarse_interval.unwrap_or(DEFAULT_COARSE_INTERVAL);
    let min = config
        .min_coarse_interval
        .unwrap_or(DEFAULT_MIN_COARSE_INTERVAL);
    let max = config
        .max_coarse_interval
        .unwrap_or(DEFAULT_MAX_COARSE_INTERVAL);
    if min > max {
        anyhow::bail!(
            "min_coarse_interval ({}s) must not exceed max_coarse_interval ({}s)",
            min,
            max
        );
    }
    if !(min..=max).contains(&coarse) {
        anyhow::bail!(
            "coarse_interval ({}s) must lie between min_coarse_interval ({}s) and max_coarse_interval ({}s)",
            coarse,
            min,
            max
        );
    }

    let fine = config.fine_interval_ms.unwrap_or(DEFAULT_FINE_INTERVAL_MS);
    let active_fine = config
        .active_fine_interval_ms
        .unwrap_or(DEFAULT_ACTIVE_FINE_INTERVAL_MS);
    if active_fine > fine {
        anyhow::bail!(
            "active_fine_interval_ms ({}) must not exceed fine_interval_ms ({})",
            active_fine,
            fine
        );
    }

    let active = config.active_profile_id();
    if !config.profiles.contains_key(active) {
        let known: Vec<_> = config.profiles.keys().map(String::as_str).collect();
        anyhow::bail!(
            "active_profile '{}' names no profile (known: {})",
            active,
            known.join(", ")
        );
    }

    config.to_profiles()?;

    let catchup = config.catchup_duration.unwrap_or(DEFAULT_CATCHUP_DURATION);
    if Duration::from_secs(catchup) < Duration::from_millis(fine) {
        Log::log_warning(&format!(
            "catchup_duration ({}s) is shorter than one fine tick ({}ms), catch-up will be abrupt",
            catchup, fine
        ));
    }

    Ok(())
}

fn check_range<T>(key: &str, value: T, min: T, max: T) -> Result<()>
where
    T: PartialOrd + std::fmt::Display + Copy,
{
    if value < min || value > max {
        anyhow::bail!("{} must be between {} and {} (got {})", key, min, max, value);
    }
    Ok(())
}

fn check_range_f64(key: &str, value: &mut f64, min: f64, max: f64) -> Result<()> {
    if !value.is_finite() {
        anyhow::bail!("{} must be a finite number", key);
    }
    check_range(key, *value, min, max)
}

/// Builder for configuration files with aligned trailing comments.
struct ConfigBuilder {
    entries: Vec<Entry>,
}

enum Entry {
    Section(String),
    Table(String),
    Setting { line: String, comment: String },
}

impl ConfigBuilder {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    fn add_section(mut self, title: &str) -> Self {
        self.entries.push(Entry::Section(format!("#[{}]", title)));
        self
    }

    fn add_table(mut self, name: &str) -> Self {
        self.entries.push(Entry::Table(format!("[{}]", name)));
        self
    }

    fn add_setting(mut self, key: &str, value: &str, comment: &str) -> Self {
        self.entries.push(Entry::Setting {
            line: format!("{} = {}", key, value),
            comment: format!("# {}", comment),
        });
        self
    }

    fn build(self) -> String {
        let width = self
            .entries
            .iter()
            .filter_map(|entry| match entry {
                Entry::Setting { line, .. } => Some(line.len()),
                _ => None,
            })
            .max()
            .unwrap_or(0)
            + 1;

        let mut lines = Vec::new();
        for entry in self.entries {
            match entry {
                Entry::Section(header) | Entry::Table(header) => {
                    if !lines.is_empty() {
                        lines.push(String::new());
                    }
                    lines.push(header);
                }
                Entry::Setting { line, comment } => {
                    let padding = " ".repeat(width - line.len());
                    lines.push(format!("{}{}{}", line, padding, comment));
                }
            }
        }
        lines.push(String::new());
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::test_constants::*;
    use serial_test::serial;
    use tempfile::tempdir;

    fn parse(content: &str) -> Result<Config> {
        Log::set_enabled(false);
        Config::parse(content)
    }

    #[test]
    #[serial]
    fn test_config_load_default_creation() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("kelvind").join("kelvind.toml");

        let original = std::env::var("XDG_CONFIG_HOME").ok();
        unsafe {
            std::env::set_var("XDG_CONFIG_HOME", temp_dir.path());
        }

        Log::set_enabled(false);
        let result = Config::load();

        unsafe {
            match original {
                Some(val) => std::env::set_var("XDG_CONFIG_HOME", val),
                None => std::env::remove_var("XDG_CONFIG_HOME"),
            }
        }

        let config = result.unwrap();
        assert!(config_path.exists());
        assert_eq!(config.active_profile_id(), DEFAULT_PROFILE_ID);
        assert_eq!(config.latitude, Some(FALLBACK_LATITUDE));
    }

    #[test]
    fn test_default_config_file_round_trips() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("kelvind.toml");

        Config::create_default_config(&config_path).unwrap();
        let content = fs::read_to_string(&config_path).unwrap();
        assert!(content.contains("[profiles.default]"));
        assert!(content.contains("transition_threshold"));

        Log::set_enabled(false);
        let config = Config::load_from_path(&config_path).unwrap();
        let profiles = config.to_profiles().unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].night.kelvin(), DEFAULT_NIGHT_TEMP);
    }

    #[test]
    fn test_defaults_fill_every_scalar() {
        let config = parse("latitude = 40.7128\nlongitude = -74.0060\n").unwrap();
        assert_eq!(config.backend, Some(Backend::Auto));
        assert_eq!(config.twilight, Some(TwilightMode::Official));
        assert_eq!(config.coarse_interval, Some(DEFAULT_COARSE_INTERVAL));
        assert_eq!(config.cache_miss_tolerance, Some(DEFAULT_CACHE_MISS_TOLERANCE));
        assert_eq!(config.near_transition_window, Some(DEFAULT_NEAR_TRANSITION_WINDOW));
        assert_eq!(config.active_profile.as_deref(), Some(DEFAULT_PROFILE_ID));
        assert_eq!(config.profiles[DEFAULT_PROFILE_ID].easing, Some(Easing::Sigmoid));
    }

    #[test]
    fn test_profile_tables_parse() {
        let config = parse(
            r#"
latitude = 52.52
longitude = 13.405
location_name = "Berlin"
active_profile = "reading"

[profiles.reading]
day_temp = 6000
night_temp = 2700
transition_duration = 60
sunset_offset = -30
alignment = "centered"
easing = "cubic_in_out"

[profiles.movie]
night_temp = 4000
"#,
        )
        .unwrap();

        let profiles = config.to_profiles().unwrap();
        assert_eq!(profiles.len(), 2);
        let reading = profiles.iter().find(|p| p.id == "reading").unwrap();
        assert_eq!(reading.day.kelvin(), 6000);
        assert_eq!(reading.sunset_offset, TimeDelta::minutes(-30));
        assert_eq!(reading.alignment, WindowAlignment::Centered);
        assert_eq!(reading.easing, Easing::CubicInOut);
        assert_eq!(reading.transition_duration, Duration::from_secs(3600));

        let location = config.location().unwrap().unwrap();
        assert_eq!(location.name(), Some("Berlin"));
    }

    #[test]
    fn test_out_of_range_values_are_rejected() {
        let cases = [
            "[profiles.default]\nnight_temp = 500\n",
            "[profiles.default]\nday_temp = 20000\n",
            "[profiles.default]\ntransition_duration = 1\n",
            "[profiles.default]\nsunrise_offset = 500\n",
            "latitude = 95.0\nlongitude = 0.0\n",
            "latitude = 0.0\nlongitude = -181.0\n",
            "transition_threshold = 0\n",
            "catchup_duration = 3600\n",
            "coarse_interval = 1\n",
            "fine_interval_ms = 10\n",
            "cache_miss_tolerance = 0\n",
            "handle_pool_size = 0\n",
            "sunrise_refraction = 5.0\n",
        ];
        for case in cases {
            assert!(parse(case).is_err(), "accepted: {}", case);
        }
    }

    #[test]
    fn test_cross_field_validation() {
        assert!(parse("min_coarse_interval = 60\nmax_coarse_interval = 30\n").is_err());
        assert!(parse("coarse_interval = 200\n").is_err());
        assert!(parse("fine_interval_ms = 100\nactive_fine_interval_ms = 500\n").is_err());
        assert!(parse("active_profile = \"missing\"\n").is_err());
        assert!(parse("latitude = 40.0\n").is_err());
    }

    #[test]
    fn test_unknown_enum_values_fail_to_parse() {
        assert!(parse("backend = \"hyprland\"\n").is_err());
        assert!(parse("twilight = \"nautical\"\n").is_err());
        assert!(parse("[profiles.default]\neasing = \"bounce\"\n").is_err());
    }

    #[test]
    fn test_missing_path_is_an_error() {
        let temp_dir = tempdir().unwrap();
        assert!(Config::load_from_path(&temp_dir.path().join("absent.toml")).is_err());
    }

    #[test]
    fn test_nyc_location() {
        let config = parse(&format!(
            "latitude = {}\nlongitude = {}\n",
            TEST_NYC_LATITUDE, TEST_NYC_LONGITUDE
        ))
        .unwrap();
        let location = config.location().unwrap().unwrap();
        assert_eq!(location.timezone(), chrono_tz::America::New_York);
    }
}
