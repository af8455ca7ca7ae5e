//! POSIX signal bridge for the daemon.
//!
//! A dedicated thread turns incoming signals into [`SignalMessage`]s on a
//! channel the main loop polls between ticks:
//!
//! - SIGINT, SIGTERM, SIGHUP: shut down and restore the original gamma
//! - SIGUSR1: run a coarse cycle immediately
//! - SIGUSR2: reload the configuration file

use anyhow::{Context, Result};
use signal_hook::{
    consts::signal::{SIGHUP, SIGINT, SIGTERM, SIGUSR1, SIGUSR2},
    iterator::Signals,
};
use std::{
    sync::Arc,
    sync::atomic::{AtomicBool, Ordering},
    sync::mpsc::{Receiver, channel},
    thread,
};

use crate::logger::Log;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalMessage {
    /// Configuration reload (SIGUSR2)
    Reload,
    /// Immediate update (SIGUSR1)
    Trigger,
    /// Shutdown (SIGTERM, SIGINT, SIGHUP)
    Shutdown,
}

/// Signal handling state shared with the main loop.
pub struct SignalState {
    /// Cleared once a shutdown signal arrives.
    pub running: Arc<AtomicBool>,
    pub signal_receiver: Receiver<SignalMessage>,
}

impl SignalState {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Map a raw signal number to the message it produces.
pub fn message_for(signal: i32) -> Option<SignalMessage> {
    match signal {
        SIGUSR1 => Some(SignalMessage::Trigger),
        SIGUSR2 => Some(SignalMessage::Reload),
        SIGINT | SIGTERM | SIGHUP => Some(SignalMessage::Shutdown),
        _ => None,
    }
}

fn signal_name(signal: i32) -> &'static str {
    match signal {
        SIGINT => "SIGINT",
        SIGTERM => "SIGTERM",
        SIGHUP => "SIGHUP",
        SIGUSR1 => "SIGUSR1",
        SIGUSR2 => "SIGUSR2",
        _ => "unknown signal",
    }
}

/// Register the handlers and spawn the forwarding thread.
pub fn setup_signal_handler(debug_enabled: bool) -> Result<SignalState> {
    let running = Arc::new(AtomicBool::new(true));
    let (signal_sender, signal_receiver) = channel::<SignalMessage>();

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP, SIGUSR1, SIGUSR2])
        .context("failed to register signal handlers")?;

    let running_clone = Arc::clone(&running);
    thread::Builder::new()
        .name("kelvind-signals".to_string())
        .spawn(move || {
            for sig in signals.forever() {
                let Some(message) = message_for(sig) else {
                    continue;
                };

                if debug_enabled {
                    Log::log_debug(&format!("Received {}", signal_name(sig)));
                }

                match message {
                    SignalMessage::Shutdown => {
                        Log::log_pipe();
                        Log::log_info(&format!(
                            "Shutdown signal received: {}",
                            signal_name(sig)
                        ));
                        running_clone.store(false, Ordering::SeqCst);
                    }
                    SignalMessage::Reload => {
                        Log::log_pipe();
                        Log::log_decorated("Received configuration reload signal");
                    }
                    SignalMessage::Trigger => {
                        Log::log_pipe();
                        Log::log_decorated("Received immediate update signal");
                    }
                }

                if signal_sender.send(message).is_err() {
                    // Main loop is gone.
                    break;
                }
                if message == SignalMessage::Shutdown {
                    break;
                }
            }
        })
        .context("failed to spawn signal handler thread")?;

    Ok(SignalState {
        running,
        signal_receiver,
    })
}
