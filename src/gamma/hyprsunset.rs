//! hyprsunset as a persistent color-profile mechanism.
//!
//! When the compositor refuses direct gamma control the adapter can hand the
//! temperature to a running hyprsunset daemon over Hyprland's IPC socket.
//! hyprsunset keeps the setting applied on its own until told otherwise.
//!
//! Socket path: `{XDG_RUNTIME_DIR or /run/user/<uid>}/hypr/{instance}/.hyprsunset.sock`

use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::color::ColorTemperature;
use crate::constants::*;
use crate::error::{GammaError, GammaResult};
use crate::gamma::{ColorProfileSink, MonitorInfo};
use crate::logger::Log;

pub struct HyprsunsetProfile {
    socket_path: PathBuf,
}

impl HyprsunsetProfile {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    /// Locate the socket the same way hyprsunset does.
    pub fn from_env() -> Self {
        let instance = std::env::var("HYPRLAND_INSTANCE_SIGNATURE").ok();
        let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
            .unwrap_or_else(|_| format!("/run/user/{}", nix::unistd::getuid()));

        let socket_path = match instance {
            Some(his) => PathBuf::from(format!("{}/hypr/{}/.hyprsunset.sock", runtime_dir, his)),
            None => PathBuf::from(format!("{}/hypr/.hyprsunset.sock", runtime_dir)),
        };
        Self::new(socket_path)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    fn send_command(&self, command: &str) -> GammaResult<()> {
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            match self.try_send_command(command) {
                Ok(()) => {
                    if attempt > 0 {
                        Log::log_debug(&format!(
                            "hyprsunset command succeeded on attempt {}/{}",
                            attempt + 1,
                            MAX_RETRIES
                        ));
                    }
                    return Ok(());
                }
                Err(e) => {
                    let permanent = matches!(
                        e.kind(),
                        ErrorKind::NotFound | ErrorKind::PermissionDenied
                    );
                    Log::log_debug(&format!(
                        "hyprsunset attempt {}/{} failed: {}",
                        attempt + 1,
                        MAX_RETRIES,
                        e
                    ));
                    last_error = Some(e);
                    if permanent {
                        break;
                    }
                    thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
                }
            }
        }

        Err(GammaError::ProfileUnavailable(format!(
            "hyprsunset at {} did not accept '{}': {}",
            self.socket_path.display(),
            command,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    fn try_send_command(&self, command: &str) -> std::io::Result<()> {
        let mut stream = UnixStream::connect(&self.socket_path)?;
        stream
            .set_read_timeout(Some(Duration::from_millis(SOCKET_TIMEOUT_MS)))
            .ok();
        stream.write_all(command.as_bytes())?;

        // hyprsunset may close the connection without replying
        let mut buffer = [0; SOCKET_BUFFER_SIZE];
        if let Ok(bytes_read) = stream.read(&mut buffer) {
            if bytes_read > 0 {
                let response = String::from_utf8_lossy(&buffer[..bytes_read]);
                Log::log_debug(&format!("hyprsunset response: {}", response.trim()));
            }
        }
        Ok(())
    }
}

impl ColorProfileSink for HyprsunsetProfile {
    fn name(&self) -> &'static str {
        "hyprsunset"
    }

    // hyprsunset applies to every output at once
    fn apply(&self, _monitor: &MonitorInfo, temperature: ColorTemperature) -> GammaResult<()> {
        self.send_command(&format!("temperature {}", temperature.kelvin()))
    }

    fn clear(&self) -> GammaResult<()> {
        self.send_command("identity")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;

    fn monitor() -> MonitorInfo {
        MonitorInfo {
            id: "DP-1".into(),
            name: "DP-1".into(),
            ramp_size: 256,
        }
    }

    #[test]
    fn test_sends_temperature_command() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".hyprsunset.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).unwrap();
            stream.write_all(b"ok").unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });

        let sink = HyprsunsetProfile::new(path);
        sink.apply(&monitor(), ColorTemperature::new(3300).unwrap())
            .unwrap();
        assert_eq!(server.join().unwrap(), "temperature 3300");
    }

    #[test]
    fn test_missing_socket_is_profile_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let sink = HyprsunsetProfile::new(dir.path().join("missing.sock"));
        assert!(matches!(sink.clear(), Err(GammaError::ProfileUnavailable(_))));
    }
}
