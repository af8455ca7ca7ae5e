//! Display gamma control.
//!
//! The [`GammaAdapter`](adapter::GammaAdapter) is the single entry point the
//! scheduler uses. It owns a curve cache and a pool of device handles, and
//! drives an ordered chain of strategies:
//!
//! 1. **Direct ramp**: write a gamma lookup table through a [`GammaDevice`]
//!    (wlr-gamma-control on Wayland, or the in-memory virtual display).
//! 2. **Color profile**: hand the temperature to a persistent
//!    [`ColorProfileSink`] (hyprsunset over its IPC socket).
//! 3. **Report failure** to the caller.
//!
//! ## Device selection
//!
//! - `backend = "virtual"` or `--dry-run`: in-memory virtual display
//! - `backend = "wayland"`: wlr-gamma-control, error if unavailable
//! - `backend = "auto"`: wlr-gamma-control when `WAYLAND_DISPLAY` is set

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::color::ColorTemperature;
use crate::config::Backend;
use crate::error::GammaResult;
use crate::logger::Log;

pub mod adapter;
pub mod cache;
pub mod hyprsunset;
pub mod pool;
pub mod ramp;
pub mod virtual_display;
pub mod wayland;

pub use adapter::{AdapterSettings, ApplyReport, AttemptOutcome, GammaAdapter, Strategy};
pub use cache::CacheStats;
pub use ramp::GammaRamp;

/// A display whose gamma can be controlled.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MonitorInfo {
    pub id: String,
    pub name: String,
    /// Entries per channel in the hardware lookup table.
    pub ramp_size: usize,
}

/// A source of display handles for direct gamma writes.
pub trait GammaDevice: Send + Sync {
    fn name(&self) -> &'static str;

    fn enumerate(&self) -> GammaResult<Vec<MonitorInfo>>;

    /// Open a handle able to issue gamma calls. Handles are pooled and
    /// reused by the adapter.
    fn open_handle(&self) -> GammaResult<Box<dyn DeviceHandle>>;

    /// Whether written ramps stay in effect after this process exits.
    fn persists_after_exit(&self) -> bool {
        true
    }
}

/// An open connection to a [`GammaDevice`].
pub trait DeviceHandle: Send {
    /// Current ramp for the monitor. `None` means the device cannot read
    /// ramps back and [`DeviceHandle::reset`] restores the original instead.
    fn read_ramp(&mut self, monitor: &MonitorInfo) -> GammaResult<Option<GammaRamp>>;

    fn write_ramp(&mut self, monitor: &MonitorInfo, ramp: &GammaRamp) -> GammaResult<()>;

    /// Return the monitor to the curve it had before we touched it.
    fn reset(&mut self, monitor: &MonitorInfo) -> GammaResult<()>;
}

/// A persistent color-profile mechanism used when direct ramps are refused.
#[cfg_attr(test, mockall::automock)]
pub trait ColorProfileSink: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(&self, monitor: &MonitorInfo, temperature: ColorTemperature) -> GammaResult<()>;

    /// Remove any profile we installed.
    fn clear(&self) -> GammaResult<()>;
}

/// Pick the gamma device for the configured backend.
pub fn detect_device(backend: Backend, dry_run: bool) -> Result<Arc<dyn GammaDevice>> {
    if dry_run || backend == Backend::Virtual {
        Log::log_decorated("Using virtual display (no hardware changes)");
        return Ok(Arc::new(virtual_display::VirtualDisplay::new(&[(
            "virtual-0",
            256,
        )])));
    }

    if std::env::var("WAYLAND_DISPLAY").is_err() {
        Log::log_pipe();
        match backend {
            Backend::Wayland => anyhow::bail!(
                "Configuration specifies backend=\"wayland\" but WAYLAND_DISPLAY is not set.\n\
                Are you running on Wayland?"
            ),
            _ => anyhow::bail!(
                "No gamma backend available: WAYLAND_DISPLAY is not set.\n\
                Run inside a Wayland session or set backend = \"virtual\"."
            ),
        }
    }

    let device = wayland::WaylandDevice::connect()
        .context("Failed to initialize wlr-gamma-control")?;
    Ok(Arc::new(device))
}

/// The color-profile fallback, if enabled and reachable in this session.
pub fn detect_profile_sink(enabled: bool) -> Option<Arc<dyn ColorProfileSink>> {
    if !enabled || std::env::var("HYPRLAND_INSTANCE_SIGNATURE").is_err() {
        return None;
    }
    let sink = hyprsunset::HyprsunsetProfile::from_env();
    if !sink.socket_path().exists() {
        Log::log_debug(&format!(
            "hyprsunset socket not found at {}, profile fallback disabled",
            crate::utils::path_for_display(sink.socket_path())
        ));
        return None;
    }
    Some(Arc::new(sink))
}
