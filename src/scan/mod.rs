//! Scan requests and trajectories
//!
//! A frame scan is described declaratively by two [`ScanRange`]s, a dwell time,
//! a [`ScanPattern`] and a [`LineMode`]. The [`ScanEngine`] expands the ranges
//! into coordinate lists and executes them row by row:
//!
//! ```text
//! Raster               Boustrophedon
//! row 0:  → → → →      row 0:  → → → →
//! row 1:  → → → →      row 1:  ← ← ← ←
//! row 2:  → → → →      row 2:  → → → →
//! ```
//!
//! Expansion is by linear spacing between start and stop, so the stop value is
//! always the last sample exactly, whatever rounding the step implies.

pub mod engine;

pub use engine::{EngineState, ScanEngine};

use crate::error::{ScanError, ScanResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::watch;

/// Upper bound on the samples one range may expand to.
///
/// At the controller's 0.01 V resolution this covers a 1 kV sweep.
pub const MAX_SAMPLES_PER_AXIS: usize = 100_001;

/// Inclusive `(start, stop, step)` range along one axis, in volts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanRange {
    /// First sample
    pub start: f64,
    /// Last sample, always included
    pub stop: f64,
    /// Nominal spacing; must be positive
    pub step: f64,
}

impl ScanRange {
    /// Unvalidated range; errors surface from [`Self::expand`].
    pub fn new(start: f64, stop: f64, step: f64) -> Self {
        Self { start, stop, step }
    }

    /// Number of samples: `round(|stop - start| / step) + 1`.
    pub fn sample_count(&self) -> ScanResult<usize> {
        if !(self.start.is_finite() && self.stop.is_finite()) {
            return Err(ScanError::InvalidRange(format!(
                "bounds must be finite, got {} .. {}",
                self.start, self.stop
            )));
        }
        if !(self.step.is_finite() && self.step > 0.0) {
            return Err(ScanError::InvalidRange(format!(
                "step must be a positive number, got {}",
                self.step
            )));
        }

        let intervals = ((self.stop - self.start).abs() / self.step).round();
        if intervals >= MAX_SAMPLES_PER_AXIS as f64 {
            return Err(ScanError::InvalidRange(format!(
                "step {} is too small for {} .. {} (more than {} samples)",
                self.step, self.start, self.stop, MAX_SAMPLES_PER_AXIS
            )));
        }
        Ok(intervals as usize + 1)
    }

    /// Evenly spaced samples from `start` to `stop`, both included.
    pub fn expand(&self) -> ScanResult<Vec<f64>> {
        let n = self.sample_count()?;
        if n == 1 {
            return Ok(vec![self.start]);
        }

        let span = self.stop - self.start;
        let last = (n - 1) as f64;
        let mut samples: Vec<f64> = (0..n)
            .map(|i| self.start + span * i as f64 / last)
            .collect();
        samples[n - 1] = self.stop;
        Ok(samples)
    }
}

impl fmt::Display for ScanRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.start, self.stop, self.step)
    }
}

/// Parses `start,stop,step`.
impl FromStr for ScanRange {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        let [start, stop, step] = parts.as_slice() else {
            return Err(ScanError::InvalidRange(format!(
                "expected start,stop,step but got '{}'",
                s
            )));
        };
        let number = |text: &str| {
            text.parse::<f64>()
                .map_err(|_| ScanError::InvalidRange(format!("'{}' is not a number", text)))
        };
        Ok(Self::new(number(*start)?, number(*stop)?, number(*step)?))
    }
}

/// Row traversal order of a frame scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanPattern {
    /// Every row in the same direction
    #[default]
    Raster,
    /// Odd rows reversed, no fast-axis flyback between rows
    Boustrophedon,
}

impl ScanPattern {
    /// Fast-axis order for row `row` (0-based).
    pub fn row_order(self, row: usize, samples: &[f64]) -> Vec<f64> {
        match self {
            ScanPattern::Boustrophedon if row % 2 == 1 => samples.iter().rev().copied().collect(),
            _ => samples.to_vec(),
        }
    }
}

/// Pixel-pulse discipline of a line scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineMode {
    /// Background pixel pulse, channel re-selected on every sample
    #[default]
    Standard,
    /// Synchronous short pixel pulse, current-channel sets, read-back after each dwell
    Verified,
}

/// Everything needed to run one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameRequest {
    /// Fast-axis range
    pub x: ScanRange,
    /// Slow-axis range
    pub y: ScanRange,
    /// Time spent at every sample
    pub dwell: Duration,
    /// Row traversal order
    pub pattern: ScanPattern,
    /// Pixel-pulse discipline of every row
    pub mode: LineMode,
}

impl FrameRequest {
    /// Raster frame in standard mode.
    pub fn new(x: ScanRange, y: ScanRange, dwell: Duration) -> Self {
        Self {
            x,
            y,
            dwell,
            pattern: ScanPattern::Raster,
            mode: LineMode::Standard,
        }
    }

    /// Set the row traversal order
    pub fn with_pattern(mut self, pattern: ScanPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Set the line mode
    pub fn with_mode(mut self, mode: LineMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Outcome of a line scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LineReport {
    /// Voltages commanded, in the order they were sent
    pub commanded: Vec<f64>,
    /// Voltages read back after each dwell (verified mode only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readback: Option<Vec<f64>>,
}

/// Read-backs of one row of a verified frame scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowReadback {
    /// Slow axis after the row completed
    pub slow: f64,
    /// Fast axis after each dwell, in scan order
    pub fast: Vec<f64>,
}

/// Coordinate lists a frame scan actually used.
///
/// `x` and `y` are the expanded ranges in ascending-index order regardless of
/// pattern, so the sampled grid is `x × y`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FrameResult {
    /// Fast-axis samples
    pub x: Vec<f64>,
    /// Slow-axis samples
    pub y: Vec<f64>,
    /// Per-row read-backs; verified mode only
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub readback: Vec<RowReadback>,
}

/// How long [`ScanEngine::await_settled`] may block.
#[derive(Debug, Clone)]
pub enum SettleLimit {
    /// Poll until converged, however long that takes
    Unbounded,
    /// Give up after this long
    Deadline(Duration),
    /// Give up once the channel carries `true`
    Cancel(watch::Receiver<bool>),
}

impl SettleLimit {
    /// `Deadline` if a timeout is configured, otherwise `Unbounded`.
    pub fn from_timeout(timeout: Option<Duration>) -> Self {
        timeout.map_or(SettleLimit::Unbounded, SettleLimit::Deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_ascending() {
        let samples = ScanRange::new(0.0, 10.0, 2.0).expand().unwrap();
        assert_eq!(samples, vec![0.0, 2.0, 4.0, 6.0, 8.0, 10.0]);
    }

    #[test]
    fn test_expand_descending() {
        let samples = ScanRange::new(5.0, 0.0, 1.0).expand().unwrap();
        assert_eq!(samples, vec![5.0, 4.0, 3.0, 2.0, 1.0, 0.0]);
    }

    #[test]
    fn test_expand_includes_stop_when_step_does_not_divide() {
        // 1 / 0.3 rounds to 3 intervals
        let samples = ScanRange::new(0.0, 1.0, 0.3).expand().unwrap();
        assert_eq!(samples.len(), 4);
        assert_eq!(samples[0], 0.0);
        assert_eq!(*samples.last().unwrap(), 1.0);
    }

    #[test]
    fn test_expand_single_point() {
        assert_eq!(ScanRange::new(3.0, 3.0, 1.0).expand().unwrap(), vec![3.0]);
        // A step much larger than the span leaves only the start
        assert_eq!(ScanRange::new(0.0, 1.0, 5.0).expand().unwrap(), vec![0.0]);
    }

    #[test]
    fn test_invalid_steps_rejected() {
        for step in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                ScanRange::new(0.0, 1.0, step).expand(),
                Err(ScanError::InvalidRange(_))
            ));
        }
        assert!(ScanRange::new(f64::NAN, 1.0, 0.1).sample_count().is_err());
        assert!(ScanRange::new(0.0, 1.0, 1e-12).sample_count().is_err());
    }

    #[test]
    fn test_sample_cap() {
        assert_eq!(
            ScanRange::new(-500.0, 500.0, 0.01).sample_count().unwrap(),
            MAX_SAMPLES_PER_AXIS
        );
        for step in [1e-9, 0.009] {
            assert!(matches!(
                ScanRange::new(-500.0, 500.0, step).expand(),
                Err(ScanError::InvalidRange(_))
            ));
        }
        assert!(ScanRange::new(0.0, 1.0, 1e-9).expand().is_err());
    }

    #[test]
    fn test_parse_range() {
        let range: ScanRange = "0, 10, 2.5".parse().unwrap();
        assert_eq!(range, ScanRange::new(0.0, 10.0, 2.5));
        assert_eq!(range.to_string().parse::<ScanRange>().unwrap(), range);
        assert!("0,10".parse::<ScanRange>().is_err());
        assert!("0,ten,1".parse::<ScanRange>().is_err());
    }

    #[test]
    fn test_boustrophedon_row_order() {
        let x = [0.0, 1.0, 2.0, 3.0];
        let pattern = ScanPattern::Boustrophedon;
        assert_eq!(pattern.row_order(0, &x), x.to_vec());
        assert_eq!(pattern.row_order(1, &x), vec![3.0, 2.0, 1.0, 0.0]);
        assert_eq!(pattern.row_order(2, &x), x.to_vec());
        assert_eq!(ScanPattern::Raster.row_order(1, &x), x.to_vec());
    }

    #[test]
    fn test_frame_result_json() {
        let result = FrameResult {
            x: vec![0.0, 1.0],
            y: vec![0.5],
            readback: Vec::new(),
        };
        let json = serde_json::to_string(&result).unwrap();
        assert_eq!(json, r#"{"x":[0.0,1.0],"y":[0.5]}"#);
    }

    #[test]
    fn test_settle_limit_from_timeout() {
        assert!(matches!(SettleLimit::from_timeout(None), SettleLimit::Unbounded));
        assert!(matches!(
            SettleLimit::from_timeout(Some(Duration::from_secs(1))),
            SettleLimit::Deadline(d) if d == Duration::from_secs(1)
        ));
    }
}
