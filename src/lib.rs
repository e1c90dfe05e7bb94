//! Scan orchestration for a three-axis piezo stage.
//!
//! The crate drives a piezo controller over a line-oriented serial link,
//! checks every commanded voltage against the axis calibration, and pulses
//! pixel, line and frame triggers in step with the motion so an external
//! imaging device can synchronise acquisition.
//!
//! Layers, leaf first:
//!
//! - [`adapters`]: the [`adapters::CommandLink`] transport (serial port, simulated controller)
//! - [`protocol`]: typed controller commands and reply decoding
//! - [`axis`] and [`safety`]: channel ids, calibration, the bounds check
//! - [`stage`]: [`stage::PiezoStage`], channel selection and calibrated voltage I/O
//! - [`trigger`]: pulse primitives over an external trigger output
//! - [`scan`]: range expansion and the [`scan::ScanEngine`]
//!
//! Configuration ([`config`]) and tracing setup ([`logging`]) are shared by
//! the `piezo_scan` binary and library users.

pub mod adapters;
pub mod axis;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod safety;
pub mod scan;
pub mod stage;
pub mod trigger;

pub use error::{ScanError, ScanResult};
