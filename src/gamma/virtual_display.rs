//! In-memory gamma device.
//!
//! Used by `--dry-run` and by tests. It records every ramp written, can be
//! told to refuse gamma control for a monitor, and tracks how many writes
//! to the same monitor overlap.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::error::{GammaError, GammaResult};
use crate::gamma::{DeviceHandle, GammaDevice, GammaRamp, MonitorInfo};
use crate::utils::lock;

#[derive(Default)]
struct VirtualState {
    current: HashMap<String, GammaRamp>,
    initial: HashMap<String, GammaRamp>,
    refused: HashSet<String>,
    write_delay: Duration,
    writes: HashMap<String, usize>,
    in_flight: HashMap<String, usize>,
    max_in_flight: HashMap<String, usize>,
    handles_opened: usize,
}

pub struct VirtualDisplay {
    monitors: Vec<MonitorInfo>,
    state: Arc<Mutex<VirtualState>>,
}

impl VirtualDisplay {
    /// Create monitors from `(id, ramp size)` pairs, each starting at the
    /// identity ramp.
    pub fn new(monitors: &[(&str, usize)]) -> Self {
        let mut state = VirtualState::default();
        let monitors = monitors
            .iter()
            .map(|(id, size)| {
                let ramp = GammaRamp::identity(*size);
                state.current.insert(id.to_string(), ramp.clone());
                state.initial.insert(id.to_string(), ramp);
                MonitorInfo {
                    id: id.to_string(),
                    name: format!("Virtual {}", id),
                    ramp_size: *size,
                }
            })
            .collect();

        Self {
            monitors,
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Start a monitor from a non-identity curve, e.g. a calibrated one.
    pub fn with_initial_ramp(self, id: &str, ramp: GammaRamp) -> Self {
        {
            let mut state = lock(&self.state);
            state.current.insert(id.to_string(), ramp.clone());
            state.initial.insert(id.to_string(), ramp);
        }
        self
    }

    /// Make direct gamma writes to `id` fail as unsupported.
    pub fn refuse(&self, id: &str) {
        lock(&self.state).refused.insert(id.to_string());
    }

    pub fn set_write_delay(&self, delay: Duration) {
        lock(&self.state).write_delay = delay;
    }

    pub fn current_ramp(&self, id: &str) -> Option<GammaRamp> {
        lock(&self.state).current.get(id).cloned()
    }

    pub fn write_count(&self, id: &str) -> usize {
        lock(&self.state).writes.get(id).copied().unwrap_or(0)
    }

    /// Highest number of simultaneous writes seen for `id`.
    pub fn max_concurrent_writes(&self, id: &str) -> usize {
        lock(&self.state).max_in_flight.get(id).copied().unwrap_or(0)
    }

    pub fn handles_opened(&self) -> usize {
        lock(&self.state).handles_opened
    }
}

impl GammaDevice for VirtualDisplay {
    fn name(&self) -> &'static str {
        "virtual"
    }

    fn enumerate(&self) -> GammaResult<Vec<MonitorInfo>> {
        Ok(self.monitors.clone())
    }

    fn open_handle(&self) -> GammaResult<Box<dyn DeviceHandle>> {
        lock(&self.state).handles_opened += 1;
        Ok(Box::new(VirtualHandle {
            state: Arc::clone(&self.state),
        }))
    }
}

struct VirtualHandle {
    state: Arc<Mutex<VirtualState>>,
}

impl DeviceHandle for VirtualHandle {
    fn read_ramp(&mut self, monitor: &MonitorInfo) -> GammaResult<Option<GammaRamp>> {
        lock(&self.state)
            .current
            .get(&monitor.id)
            .cloned()
            .map(Some)
            .ok_or_else(|| GammaError::UnknownMonitor(monitor.id.clone()))
    }

    fn write_ramp(&mut self, monitor: &MonitorInfo, ramp: &GammaRamp) -> GammaResult<()> {
        let delay = {
            let mut state = lock(&self.state);
            if !state.current.contains_key(&monitor.id) {
                return Err(GammaError::UnknownMonitor(monitor.id.clone()));
            }
            if state.refused.contains(&monitor.id) {
                return Err(GammaError::HardwareUnsupported {
                    monitor: monitor.id.clone(),
                    reason: "gamma control refused".into(),
                });
            }
            if ramp.size() != monitor.ramp_size {
                return Err(GammaError::Device(format!(
                    "ramp size {} does not match {} for {}",
                    ramp.size(),
                    monitor.ramp_size,
                    monitor.id
                )));
            }
            let in_flight = state.in_flight.entry(monitor.id.clone()).or_insert(0);
            *in_flight += 1;
            let now = *in_flight;
            let max = state.max_in_flight.entry(monitor.id.clone()).or_insert(0);
            *max = (*max).max(now);
            state.write_delay
        };

        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let mut state = lock(&self.state);
        state.current.insert(monitor.id.clone(), ramp.clone());
        *state.writes.entry(monitor.id.clone()).or_insert(0) += 1;
        if let Some(in_flight) = state.in_flight.get_mut(&monitor.id) {
            *in_flight = in_flight.saturating_sub(1);
        }
        Ok(())
    }

    fn reset(&mut self, monitor: &MonitorInfo) -> GammaResult<()> {
        let mut state = lock(&self.state);
        let initial = state
            .initial
            .get(&monitor.id)
            .cloned()
            .ok_or_else(|| GammaError::UnknownMonitor(monitor.id.clone()))?;
        state.current.insert(monitor.id.clone(), initial);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::ColorTemperature;

    #[test]
    fn test_write_and_reset() {
        let display = VirtualDisplay::new(&[("DP-1", 16)]);
        let monitor = display.enumerate().unwrap().remove(0);
        let mut handle = display.open_handle().unwrap();

        let warm = GammaRamp::for_temperature(16, ColorTemperature::new(3000).unwrap());
        handle.write_ramp(&monitor, &warm).unwrap();
        assert_eq!(display.current_ramp("DP-1"), Some(warm));
        assert_eq!(display.write_count("DP-1"), 1);

        handle.reset(&monitor).unwrap();
        assert_eq!(display.current_ramp("DP-1"), Some(GammaRamp::identity(16)));
    }

    #[test]
    fn test_refused_monitor_reports_unsupported() {
        let display = VirtualDisplay::new(&[("HDMI-A-1", 8)]);
        display.refuse("HDMI-A-1");
        let monitor = display.enumerate().unwrap().remove(0);
        let mut handle = display.open_handle().unwrap();
        let result = handle.write_ramp(&monitor, &GammaRamp::identity(8));
        assert!(matches!(result, Err(GammaError::HardwareUnsupported { .. })));
    }

    #[test]
    fn test_size_mismatch_is_a_device_error() {
        let display = VirtualDisplay::new(&[("DP-1", 8)]);
        let monitor = display.enumerate().unwrap().remove(0);
        let mut handle = display.open_handle().unwrap();
        assert!(matches!(
            handle.write_ramp(&monitor, &GammaRamp::identity(4)),
            Err(GammaError::Device(_))
        ));
    }
}
