//! Utility functions shared across the codebase.
//!
//! Interpolation helpers, lock helpers that survive poisoning, and a few
//! formatting functions used by logging.

use chrono::TimeDelta;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Interpolate between two u32 values based on progress (0.0 to 1.0).
///
/// # Arguments
/// * `start` - Starting value (returned when progress = 0.0)
/// * `end` - Ending value (returned when progress = 1.0)
/// * `progress` - Interpolation progress, automatically clamped to [0.0, 1.0]
///
/// # Returns
/// Interpolated value rounded to the nearest integer
///
/// # Examples
/// ```
/// use kelvind::utils::interpolate_u32;
/// assert_eq!(interpolate_u32(1000, 2000, 0.5), 1500);
/// assert_eq!(interpolate_u32(6000, 3000, 0.25), 5250);
/// ```
pub fn interpolate_u32(start: u32, end: u32, progress: f64) -> u32 {
    interpolate_f64(start as f64, end as f64, progress).round() as u32
}

/// Interpolate between two f64 values based on progress (0.0 to 1.0).
///
/// # Examples
/// ```
/// use kelvind::utils::interpolate_f64;
/// assert_eq!(interpolate_f64(90.0, 100.0, 0.5), 95.0);
/// ```
pub fn interpolate_f64(start: f64, end: f64, progress: f64) -> f64 {
    start + (end - start) * progress.clamp(0.0, 1.0)
}

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// The scheduler isolates panics per tick, so a poisoned lock only means a
/// tick was abandoned half way. The protected data stays usable.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Format a path for display, replacing the home directory with `~`.
pub fn path_for_display(path: &Path) -> String {
    if let Some(home) = dirs::home_dir() {
        if let Ok(stripped) = path.strip_prefix(&home) {
            return format!("~/{}", stripped.display());
        }
    }
    path.display().to_string()
}

/// Format a signed duration as `1h 05m` or `12m 30s`.
pub fn format_delta(delta: TimeDelta) -> String {
    let total = delta.num_seconds().abs();
    let sign = if delta.num_seconds() < 0 { "-" } else { "" };
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if hours > 0 {
        format!("{}{}h {:02}m", sign, hours, minutes)
    } else {
        format!("{}{}m {:02}s", sign, minutes, seconds)
    }
}
