//! # kelvind
//!
//! A solar-driven display color temperature daemon.
//!
//! kelvind computes sunrise and sunset for the configured location, derives
//! a target color temperature from the active profile, and drives display
//! gamma through a pooled, cached hardware adapter. A predictive scheduler
//! precomputes the next 24 hours so steady-state ticks are lookups.
//!
//! ## Architecture
//!
//! - **config**: Configuration loading, validation, and default generation
//! - **constants**: Application-wide constants and defaults
//! - **geo**: Locations, timezone lookup and the solar calculator
//! - **color**: Temperature model, profiles, easing and perceptual space
//! - **transition**: Interpolation between temperatures over time
//! - **gamma**: Ramp generation, curve cache, handle pool and devices
//! - **scheduler**: The predictive scheduler and its state
//! - **logger**: Structured logging with visual formatting
//! - **signals**: POSIX signal bridge for the daemon

pub mod args;
pub mod color;
pub mod config;
pub mod constants;
pub mod error;
pub mod gamma;
pub mod geo;
pub mod logger;
pub mod scheduler;
pub mod signals;
pub mod transition;
pub mod utils;

// Re-export important types for easier access
pub use color::{ColorProfile, ColorTemperature, Easing, Period, WindowAlignment};
pub use config::Config;
pub use error::{CoreError, CoreResult, GammaError, GammaResult};
pub use gamma::{GammaAdapter, GammaDevice};
pub use geo::Location;
pub use geo::solar::{SolarCalculator, SolarTimes, TwilightMode};
pub use logger::{Log, LogLevel};
pub use scheduler::{AppState, PauseRequest, PredictiveScheduler, SchedulerPhase};
pub use transition::{InterpolationMode, TransitionEngine, TransitionState};
