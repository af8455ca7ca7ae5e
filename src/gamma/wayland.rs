//! Wayland gamma control via wlr-gamma-control-unstable-v1.
//!
//! Covers compositors implementing the wlr protocol (Sway, Hyprland, river,
//! labwc, wayfire, niri). Ramps are handed to the compositor through a file
//! descriptor holding the R, G, B tables back to back. The protocol restores
//! the original gamma when a control object is destroyed, so resetting a
//! monitor means destroying its control and acquiring a fresh one.

use memmap2::MmapMut;
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::os::fd::AsFd;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use wayland_client::protocol::{wl_output, wl_registry};
use wayland_client::{Connection, Dispatch, EventQueue, QueueHandle, delegate_noop};
use wayland_protocols_wlr::gamma_control::v1::client::{
    zwlr_gamma_control_manager_v1::ZwlrGammaControlManagerV1,
    zwlr_gamma_control_v1::{self, ZwlrGammaControlV1},
};

use crate::error::{GammaError, GammaResult};
use crate::gamma::{DeviceHandle, GammaDevice, GammaRamp, MonitorInfo};
use crate::logger::Log;
use crate::utils::lock;

/// wl_output v4 delivers the connector name.
const WL_OUTPUT_NAME_VERSION: u32 = 4;

struct OutputState {
    output: wl_output::WlOutput,
    name: Option<String>,
    control: Option<ZwlrGammaControlV1>,
    ramp_size: u32,
    failed: bool,
}

impl OutputState {
    fn id(&self, index: usize) -> String {
        self.name.clone().unwrap_or_else(|| format!("output-{}", index))
    }
}

struct WaylandInner {
    manager: Option<ZwlrGammaControlManagerV1>,
    outputs: Vec<OutputState>,
}

impl Dispatch<wl_registry::WlRegistry, ()> for WaylandInner {
    fn event(
        state: &mut Self,
        registry: &wl_registry::WlRegistry,
        event: wl_registry::Event,
        _data: &(),
        _conn: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        if let wl_registry::Event::Global {
            name,
            interface,
            version,
        } = event
        {
            if interface == "zwlr_gamma_control_manager_v1" {
                state.manager =
                    Some(registry.bind::<ZwlrGammaControlManagerV1, _, _>(name, 1, qh, ()));
            } else if interface == "wl_output" {
                let index = state.outputs.len();
                let output = registry.bind::<wl_output::WlOutput, _, _>(
                    name,
                    version.min(WL_OUTPUT_NAME_VERSION),
                    qh,
                    index,
                );
                state.outputs.push(OutputState {
                    output,
                    name: None,
                    control: None,
                    ramp_size: 0,
                    failed: false,
                });
            }
        }
    }
}

impl Dispatch<wl_output::WlOutput, usize> for WaylandInner {
    fn event(
        state: &mut Self,
        _proxy: &wl_output::WlOutput,
        event: wl_output::Event,
        index: &usize,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let wl_output::Event::Name { name } = event {
            if let Some(out) = state.outputs.get_mut(*index) {
                out.name = Some(name);
            }
        }
    }
}

impl Dispatch<ZwlrGammaControlV1, usize> for WaylandInner {
    fn event(
        state: &mut Self,
        _proxy: &ZwlrGammaControlV1,
        event: zwlr_gamma_control_v1::Event,
        index: &usize,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let Some(out) = state.outputs.get_mut(*index) {
            match event {
                zwlr_gamma_control_v1::Event::GammaSize { size } => {
                    out.ramp_size = size;
                }
                zwlr_gamma_control_v1::Event::Failed => {
                    out.failed = true;
                    if let Some(control) = out.control.take() {
                        control.destroy();
                    }
                }
                _ => {}
            }
        }
    }
}

delegate_noop!(WaylandInner: ignore ZwlrGammaControlManagerV1);

struct Session {
    conn: Connection,
    queue: EventQueue<WaylandInner>,
    inner: WaylandInner,
}

impl Session {
    fn roundtrip(&mut self) -> GammaResult<()> {
        self.queue
            .roundtrip(&mut self.inner)
            .map(|_| ())
            .map_err(|e| GammaError::Device(format!("Wayland roundtrip failed: {}", e)))
    }

    fn index_of(&self, monitor: &MonitorInfo) -> GammaResult<usize> {
        self.inner
            .outputs
            .iter()
            .enumerate()
            .position(|(i, out)| out.id(i) == monitor.id)
            .ok_or_else(|| GammaError::UnknownMonitor(monitor.id.clone()))
    }

    fn acquire_control(&mut self, index: usize) {
        let qh = self.queue.handle();
        if let (Some(manager), Some(out)) = (&self.inner.manager, self.inner.outputs.get_mut(index))
        {
            out.control = Some(manager.get_gamma_control(&out.output, &qh, index));
            out.failed = false;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Destroying the controls restores the compositor's gamma
        for out in &mut self.inner.outputs {
            if let Some(control) = out.control.take() {
                control.destroy();
            }
        }
        let _ = self.conn.flush();
    }
}

/// Connection to a compositor exposing `zwlr_gamma_control_manager_v1`.
pub struct WaylandDevice {
    session: Arc<Mutex<Session>>,
}

impl WaylandDevice {
    pub fn connect() -> Result<Self> {
        let conn = Connection::connect_to_env().context("Failed to connect to Wayland display")?;
        let mut queue = conn.new_event_queue();
        let qh = queue.handle();
        let _registry = conn.display().get_registry(&qh, ());

        let mut inner = WaylandInner {
            manager: None,
            outputs: Vec::new(),
        };
        // Globals, then output names
        queue.roundtrip(&mut inner).context("Wayland registry roundtrip failed")?;
        queue.roundtrip(&mut inner).context("Wayland output roundtrip failed")?;

        if inner.manager.is_none() {
            anyhow::bail!("Compositor does not support wlr-gamma-control-unstable-v1");
        }
        if inner.outputs.is_empty() {
            anyhow::bail!("Compositor reported no outputs");
        }

        let mut session = Session { conn, queue, inner };
        for index in 0..session.inner.outputs.len() {
            session.acquire_control(index);
        }
        session.roundtrip().context("Failed to receive gamma sizes")?;

        let usable = session
            .inner
            .outputs
            .iter()
            .filter(|o| !o.failed && o.ramp_size > 0)
            .count();
        Log::log_decorated(&format!(
            "Connected to Wayland gamma control ({} of {} outputs usable)",
            usable,
            session.inner.outputs.len()
        ));

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
        })
    }
}

impl GammaDevice for WaylandDevice {
    fn name(&self) -> &'static str {
        "wayland"
    }

    fn enumerate(&self) -> GammaResult<Vec<MonitorInfo>> {
        let session = lock(&self.session);
        Ok(session
            .inner
            .outputs
            .iter()
            .enumerate()
            .filter(|(_, out)| out.ramp_size > 0)
            .map(|(i, out)| {
                let id = out.id(i);
                MonitorInfo {
                    name: id.clone(),
                    id,
                    ramp_size: out.ramp_size as usize,
                }
            })
            .collect())
    }

    fn open_handle(&self) -> GammaResult<Box<dyn DeviceHandle>> {
        Ok(Box::new(WaylandHandle {
            session: Arc::clone(&self.session),
            buffer: None,
        }))
    }

    /// The compositor restores its own ramps once our controls are destroyed.
    fn persists_after_exit(&self) -> bool {
        false
    }
}

/// Reusable shared-memory buffer for ramp transfer.
struct RampBuffer {
    file: File,
    map: MmapMut,
    len: usize,
}

impl RampBuffer {
    fn create(len: usize) -> GammaResult<Self> {
        let file = tempfile::tempfile()
            .map_err(|e| GammaError::Device(format!("Failed to create ramp buffer: {}", e)))?;
        file.set_len(len as u64)
            .map_err(|e| GammaError::Device(format!("Failed to size ramp buffer: {}", e)))?;
        // SAFETY: the file is private to this process and sized above
        let map = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| GammaError::Device(format!("Failed to map ramp buffer: {}", e)))?;
        Ok(Self { file, map, len })
    }
}

pub struct WaylandHandle {
    session: Arc<Mutex<Session>>,
    buffer: Option<RampBuffer>,
}

impl WaylandHandle {
    fn buffer_for(&mut self, len: usize) -> GammaResult<&mut RampBuffer> {
        if self.buffer.as_ref().is_none_or(|b| b.len != len) {
            self.buffer = Some(RampBuffer::create(len)?);
        }
        self.buffer
            .as_mut()
            .ok_or_else(|| GammaError::Device("ramp buffer unavailable".into()))
    }
}

impl DeviceHandle for WaylandHandle {
    fn read_ramp(&mut self, _monitor: &MonitorInfo) -> GammaResult<Option<GammaRamp>> {
        // The protocol cannot read gamma back; reset() restores instead
        Ok(None)
    }

    fn write_ramp(&mut self, monitor: &MonitorInfo, ramp: &GammaRamp) -> GammaResult<()> {
        let session_arc = Arc::clone(&self.session);
        let mut session = lock(&session_arc);
        let index = session.index_of(monitor)?;

        let expected = session.inner.outputs[index].ramp_size as usize;
        if ramp.size() != expected {
            return Err(GammaError::Device(format!(
                "ramp size {} does not match {} for {}",
                ramp.size(),
                expected,
                monitor.id
            )));
        }
        if session.inner.outputs[index].failed || session.inner.outputs[index].control.is_none() {
            return Err(GammaError::HardwareUnsupported {
                monitor: monitor.id.clone(),
                reason: "compositor revoked gamma control".into(),
            });
        }

        let buffer = self.buffer_for(ramp.byte_len())?;
        ramp.write_le_bytes(&mut buffer.map);
        buffer
            .map
            .flush()
            .map_err(|e| GammaError::Device(format!("Failed to flush ramp buffer: {}", e)))?;
        // The compositor shares our file offset and reads from it
        buffer
            .file
            .seek(SeekFrom::Start(0))
            .map_err(|e| GammaError::Device(format!("Failed to rewind ramp buffer: {}", e)))?;

        if let Some(control) = &session.inner.outputs[index].control {
            control.set_gamma(buffer.file.as_fd());
        }
        session
            .conn
            .flush()
            .map_err(|e| GammaError::Device(format!("Wayland flush failed: {}", e)))?;
        session.roundtrip()?;

        if session.inner.outputs[index].failed {
            return Err(GammaError::HardwareUnsupported {
                monitor: monitor.id.clone(),
                reason: "compositor rejected the gamma ramp".into(),
            });
        }
        Ok(())
    }

    fn reset(&mut self, monitor: &MonitorInfo) -> GammaResult<()> {
        let mut session = lock(&self.session);
        let index = session.index_of(monitor)?;

        if let Some(control) = session.inner.outputs[index].control.take() {
            control.destroy();
        }
        session
            .conn
            .flush()
            .map_err(|e| GammaError::Device(format!("Wayland flush failed: {}", e)))?;

        session.acquire_control(index);
        session.roundtrip()
    }
}
