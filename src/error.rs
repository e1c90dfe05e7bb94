//! Custom error types for the scanning library.
//!
//! This module defines the primary error type, `ScanError`, for the whole crate.
//! Using the `thiserror` crate, it provides a single, consistent way to report
//! everything that can go wrong between a scan request and the stage controller.
//!
//! ## Error Hierarchy
//!
//! - **`InvalidChannel`** / **`NoActiveChannel`**: channel selection problems. Reported
//!   before any command is written to the link.
//! - **`OutOfRange`**: a voltage failed the calibrated bounds check. Only the offending
//!   sample is aborted; samples already committed stay where they are.
//! - **`InvalidDwellTime`** / **`InvalidRange`**: a scan request was rejected before
//!   any motion began.
//! - **`Protocol`**: the controller answered with something that could not be decoded.
//!   Never retried internally.
//! - **`Link`** / **`Io`** / **`Trigger`**: failures of the external collaborators.
//! - **`SettleTimeout`** / **`SettleCancelled`**: a bounded settling wait gave up.
//! - **`Config`**: wraps [`ConfigError`] from the configuration layer.
//!
//! By using `#[from]`, `ScanError` can be created from the underlying error types,
//! so the `?` operator works across the crate.

use crate::axis::Axis;
use crate::config::ConfigError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// Which calibrated limit a voltage violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    /// At or below `volt_min`
    Lower,
    /// At or above `volt_max`
    Upper,
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bound::Lower => f.write_str("lower"),
            Bound::Upper => f.write_str("upper"),
        }
    }
}

/// Every failure the scanning library reports.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Channel id outside 1-3; nothing was sent.
    #[error("Invalid channel {0}: expected 1, 2 or 3")]
    InvalidChannel(u8),

    /// A current-channel operation ran before any channel was selected.
    #[error("No channel selected yet")]
    NoActiveChannel,

    /// Voltage outside the calibrated window; the set command was not sent.
    #[error("Voltage {voltage} on axis {axis} violates {bound} limit {limit}")]
    OutOfRange {
        /// Axis the voltage was meant for
        axis: Axis,
        /// Rejected value, as it would have gone on the wire
        voltage: f64,
        /// Which side of the window was violated
        bound: Bound,
        /// The calibrated limit on that side
        limit: f64,
    },

    /// Requested dwell is shorter than the configured minimum.
    #[error("Dwell time {dwell:?} is below the minimum of {minimum:?}")]
    InvalidDwellTime {
        /// Requested dwell
        dwell: Duration,
        /// `timing.min_dwell_ms`
        minimum: Duration,
    },

    /// A range that cannot be expanded into samples.
    #[error("Invalid scan range: {0}")]
    InvalidRange(String),

    /// Reply that could not be decoded.
    #[error("Unparseable reply to '{command}': {reply:?}")]
    Protocol {
        /// Command as sent
        command: String,
        /// Raw reply, lossily decoded
        reply: String,
    },

    /// Transport failure other than raw I/O, e.g. not connected.
    #[error("Command link error: {0}")]
    Link(String),

    /// I/O error from the serial port.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A trigger line could not be driven.
    #[error("Trigger output error: {0}")]
    Trigger(String),

    /// A deadline-bounded settling wait expired.
    #[error("Axis {axis} did not settle at {target} V before the deadline (last reading {last} V)")]
    SettleTimeout {
        /// Axis being settled
        axis: Axis,
        /// Target voltage
        target: f64,
        /// Most recent read-back
        last: f64,
    },

    /// A settling wait was cancelled by its caller.
    #[error("Settling on axis {axis} was cancelled")]
    SettleCancelled {
        /// Axis being settled
        axis: Axis,
    },

    /// Configuration could not be loaded or validated.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Built without the `instrument_serial` feature.
    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,
}

impl ScanError {
    /// True for errors raised by the safety check, i.e. before anything was transmitted.
    pub fn is_safety_violation(&self) -> bool {
        matches!(self, ScanError::OutOfRange { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ScanError::InvalidChannel(4);
        assert_eq!(err.to_string(), "Invalid channel 4: expected 1, 2 or 3");
    }

    #[test]
    fn test_out_of_range_display() {
        let err = ScanError::OutOfRange {
            axis: Axis::X,
            voltage: 10.0,
            bound: Bound::Upper,
            limit: 10.0,
        };
        assert!(err.is_safety_violation());
        assert_eq!(
            err.to_string(),
            "Voltage 10 on axis 1 (x) violates upper limit 10"
        );
    }

    #[test]
    fn test_protocol_error_keeps_reply() {
        let err = ScanError::Protocol {
            command: "MEAS:VOLT?".into(),
            reply: "garbage".into(),
        };
        assert!(!err.is_safety_violation());
        assert!(err.to_string().contains("garbage"));
    }
}
