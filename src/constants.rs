//! Application constants and default values for kelvind.
//!
//! This module contains the configuration defaults, validation limits,
//! solar geometry constants and scheduler timing values used throughout
//! the application.

use crate::config::Backend;

// ═══ Application Configuration Defaults ═══
// These values are used when config options are not specified by the user

pub const DEFAULT_BACKEND: Backend = Backend::Auto; // Auto-detect gamma device
pub const DEFAULT_PROFILE_FALLBACK: bool = true; // Use hyprsunset when direct ramps are refused
pub const DEFAULT_PROFILE_ID: &str = "default";
pub const DEFAULT_NIGHT_TEMP: u32 = 3300; // Kelvin - warm, comfortable for night viewing
pub const DEFAULT_DAY_TEMP: u32 = 6500; // Kelvin - close to natural sunlight
pub const DEFAULT_TRANSITION_DURATION: u64 = 45; // minutes - gradual change
pub const DEFAULT_TRANSITION_THRESHOLD: u32 = 50; // Kelvin of drift before a catch-up transition
pub const DEFAULT_CATCHUP_DURATION: u64 = 30; // seconds for a catch-up transition
pub const DEFAULT_USE_PERCEPTUAL_INTERPOLATION: bool = false;
pub const DEFAULT_REFRACTION_DEG: f64 = 0.5667; // Standard atmospheric refraction at the horizon
pub const FALLBACK_LATITUDE: f64 = 41.8781; // Chicago, written into a fresh config
pub const FALLBACK_LONGITUDE: f64 = -87.6298;

// ═══ Scheduler Defaults ═══

pub const DEFAULT_COARSE_INTERVAL: u64 = 30; // seconds
pub const DEFAULT_MIN_COARSE_INTERVAL: u64 = 15; // seconds when cycles are consistently fast
pub const DEFAULT_MAX_COARSE_INTERVAL: u64 = 120; // seconds under load
pub const MAXIMUM_BACKOFF_INTERVAL: u64 = 300; // seconds - ceiling for failure backoff
pub const DEFAULT_FINE_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_ACTIVE_FINE_INTERVAL_MS: u64 = 100; // inside a transition window
pub const DEFAULT_NEAR_TRANSITION_WINDOW: u64 = 30; // minutes around a solar transition window
pub const DEFAULT_CACHE_MISS_TOLERANCE: u64 = 15; // minutes to the nearest predictive entry

// ═══ Gamma Adapter Defaults ═══

pub const DEFAULT_CURVE_CACHE_TTL: u64 = 30; // minutes
pub const DEFAULT_CURVE_CACHE_MAX_ENTRIES: usize = 200;
pub const DEFAULT_HANDLE_POOL_SIZE: usize = 4;
pub const DEFAULT_HANDLE_ACQUIRE_TIMEOUT_MS: u64 = 500;

// ═══ Validation Limits ═══
// These limits ensure user inputs are within reasonable and safe ranges

// Temperature limits (Kelvin scale)
pub const MINIMUM_TEMP: u32 = 1000; // Very warm candlelight-like
pub const MAXIMUM_TEMP: u32 = 10000; // Clear blue sky

// Transition duration limits
pub const MINIMUM_TRANSITION_DURATION: u64 = 5; // minutes (prevents too-rapid changes)
pub const MAXIMUM_TRANSITION_DURATION: u64 = 120; // minutes (2 hours max)

// Offsets applied to sunrise and sunset
pub const MAXIMUM_SOLAR_OFFSET: i64 = 180; // minutes either way

// Drift threshold limits
pub const MINIMUM_TRANSITION_THRESHOLD: u32 = 1;
pub const MAXIMUM_TRANSITION_THRESHOLD: u32 = 1000;

// Catch-up transition limits
pub const MINIMUM_CATCHUP_DURATION: u64 = 1; // seconds
pub const MAXIMUM_CATCHUP_DURATION: u64 = 600; // seconds

// Loop interval limits
pub const MINIMUM_COARSE_INTERVAL: u64 = 5; // seconds
pub const MAXIMUM_COARSE_INTERVAL: u64 = 300; // seconds
pub const MINIMUM_FINE_INTERVAL_MS: u64 = 50;
pub const MAXIMUM_FINE_INTERVAL_MS: u64 = 5000;
pub const MAXIMUM_SCHEDULING_WINDOW: u64 = 180; // minutes for near-window and miss tolerance

// Gamma adapter limits
pub const MAXIMUM_CURVE_CACHE_TTL: u64 = 1440; // minutes (one day)
pub const MAXIMUM_CURVE_CACHE_ENTRIES: usize = 10_000;
pub const MAXIMUM_HANDLE_POOL_SIZE: usize = 32;
pub const MAXIMUM_HANDLE_ACQUIRE_TIMEOUT_MS: u64 = 10_000;

// Refraction limits (degrees)
pub const MAXIMUM_REFRACTION_DEG: f64 = 2.0;

// ═══ Solar Geometry Constants ═══

pub const OFFICIAL_ZENITH_BASE: f64 = 90.2667; // Geometric horizon plus the solar semidiameter
pub const CIVIL_ZENITH: f64 = 96.0;
pub const CIVIL_STRICT_ZENITH: f64 = 96.5;
pub const SOLAR_MAX_ITERATIONS: usize = 5;
pub const SOLAR_TOLERANCE_MINUTES: f64 = 0.01;
pub const SOLAR_RELAXED_TOLERANCE_MINUTES: f64 = 0.5;

// ═══ Easing Constants ═══

pub const SIGMOID_STEEPNESS: f64 = 6.0;
pub const EXPONENTIAL_RATE: f64 = 4.0;
pub const SMALL_DELTA_KELVIN: u32 = 300; // Below this a linear curve is recommended
pub const EVENING_START_HOUR: u32 = 16;
pub const EVENING_END_HOUR: u32 = 23;

// ═══ Operational Timing Constants ═══
// Internal timing values for application operation

pub const PREDICTIVE_CACHE_HORIZON_HOURS: i64 = 24;
pub const PREDICTIVE_CACHE_RESOLUTION_MINUTES: i64 = 15;
pub const PREDICTIVE_CACHE_REBUILD_MINUTES: u64 = 15;
pub const LOCATION_REFRESH_HOURS: i64 = 24;
pub const SLEEP_DETECTION_THRESHOLD_SECS: u64 = 300; // 5 minutes - detect system sleep/resume
pub const CHECK_INTERVAL_SECS: u64 = 1; // How often the daemon polls for signals
pub const FAST_CYCLE_MS: u64 = 50; // A coarse cycle this quick counts towards narrowing
pub const SLOW_CYCLE_MS: u64 = 2000; // A coarse cycle this slow widens the interval
pub const FAST_CYCLES_BEFORE_NARROWING: u32 = 3;
pub const COARSE_INTERVAL_STEP_SECS: u64 = 5;

// ═══ Socket Communication Constants ═══
// Settings for hyprsunset IPC communication

pub const SOCKET_TIMEOUT_MS: u64 = 1000; // 1 second timeout for socket operations
pub const SOCKET_BUFFER_SIZE: usize = 1024; // Buffer size for socket communication
pub const MAX_RETRIES: u32 = 3; // Maximum attempts for failed operations
pub const RETRY_DELAY_MS: u64 = 100; // Delay between retry attempts

// ═══ Exit Codes ═══

pub const EXIT_FAILURE: i32 = 1; // General failure
