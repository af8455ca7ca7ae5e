//! Error taxonomy for the calculation core and the gamma hardware layer.
//!
//! Core components return these typed errors so callers can tell a rejected
//! input from a transient solver failure or a refused hardware call. The
//! binary and configuration loader wrap them in `anyhow` at the boundary.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the solar calculator, temperature model, transition
/// engine and profile store.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    /// Malformed location or profile data, rejected at the boundary.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The solar solver did not converge, even after a relaxed retry.
    #[error("solar calculation did not converge: {0}")]
    TransientCalculation(String),

    /// A progress fraction or other bounded value fell outside its range.
    #[error("value out of range: {0}")]
    Range(String),

    #[error("unknown profile '{0}'")]
    UnknownProfile(String),
}

/// Errors raised while driving display gamma.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GammaError {
    /// The monitor refuses direct gamma control. Triggers the fallback chain.
    #[error("monitor {monitor} refused gamma control: {reason}")]
    HardwareUnsupported { monitor: String, reason: String },

    /// A device call failed for a reason other than refusal.
    #[error("gamma device error: {0}")]
    Device(String),

    /// No pooled device handle became available before the timeout.
    #[error("no device handle became available within {0:?}")]
    ResourceExhausted(Duration),

    /// The persistent color-profile mechanism cannot be used.
    #[error("color profile mechanism unavailable: {0}")]
    ProfileUnavailable(String),

    #[error("unknown monitor '{0}'")]
    UnknownMonitor(String),

    /// Every strategy in the fallback chain failed for this monitor.
    #[error("every apply strategy failed for monitor {monitor}")]
    AllStrategiesFailed { monitor: String },
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
pub type GammaResult<T> = std::result::Result<T, GammaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_carry_context() {
        let err = GammaError::HardwareUnsupported {
            monitor: "DP-1".to_string(),
            reason: "protocol missing".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "monitor DP-1 refused gamma control: protocol missing"
        );

        let err = CoreError::UnknownProfile("reading".to_string());
        assert_eq!(err.to_string(), "unknown profile 'reading'");
    }
}
