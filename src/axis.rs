//! Stage axes and their calibration.
//!
//! The controller exposes three channels:
//! - channel 1 -> x, left/right relative to the lens
//! - channel 2 -> z, up/down
//! - channel 3 -> y, along the optical path (rarely scanned)

use crate::error::ScanError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One physical stage channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Axis {
    /// Channel 1
    X,
    /// Channel 2
    Z,
    /// Channel 3
    Y,
}

impl Axis {
    /// All axes in channel order.
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Z, Axis::Y];

    /// Controller channel number (1-3).
    pub fn channel(self) -> u8 {
        match self {
            Axis::X => 1,
            Axis::Z => 2,
            Axis::Y => 3,
        }
    }

    /// Lowercase axis letter
    pub fn name(self) -> &'static str {
        match self {
            Axis::X => "x",
            Axis::Z => "z",
            Axis::Y => "y",
        }
    }
}

impl TryFrom<u8> for Axis {
    type Error = ScanError;

    fn try_from(channel: u8) -> Result<Self, Self::Error> {
        match channel {
            1 => Ok(Axis::X),
            2 => Ok(Axis::Z),
            3 => Ok(Axis::Y),
            other => Err(ScanError::InvalidChannel(other)),
        }
    }
}

impl From<Axis> for u8 {
    fn from(axis: Axis) -> Self {
        axis.channel()
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.channel(), self.name())
    }
}

/// Calibrated voltage window of one axis, as reported by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    /// Soft lower limit (exclusive)
    pub volt_min: f64,
    /// Soft upper limit (exclusive)
    pub volt_max: f64,
    /// Voltage offset; informational
    pub volt_offset: f64,
}

impl Calibration {
    /// Calibration from raw limit values. See [`Self::is_consistent`].
    pub fn new(volt_min: f64, volt_max: f64, volt_offset: f64) -> Self {
        Self {
            volt_min,
            volt_max,
            volt_offset,
        }
    }

    /// A usable window needs `volt_min < volt_max`.
    pub fn is_consistent(&self) -> bool {
        self.volt_min.is_finite() && self.volt_max.is_finite() && self.volt_min < self.volt_max
    }
}
