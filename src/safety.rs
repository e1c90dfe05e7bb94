//! Voltage bounds check.
//!
//! Every voltage-set command goes through [`check`] first, including the
//! per-sample updates issued during scans. The check is a pure predicate over
//! cached calibration data and performs no I/O.

use crate::axis::{Axis, Calibration};
use crate::error::{Bound, ScanError, ScanResult};

/// Accept `value` only if `volt_min < value < volt_max`.
///
/// The calibrated limits are soft limits, so a value exactly on a bound is
/// rejected. NaN is rejected against the lower bound.
pub fn check(axis: Axis, calibration: &Calibration, value: f64) -> ScanResult<()> {
    if value.is_nan() || value <= calibration.volt_min {
        return Err(ScanError::OutOfRange {
            axis,
            voltage: value,
            bound: Bound::Lower,
            limit: calibration.volt_min,
        });
    }
    if value >= calibration.volt_max {
        return Err(ScanError::OutOfRange {
            axis,
            voltage: value,
            bound: Bound::Upper,
            limit: calibration.volt_max,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> Calibration {
        Calibration::new(-10.0, 10.0, 0.0)
    }

    #[test]
    fn test_inside_window_passes() {
        for v in [-9.99, 0.0, 5.0, 9.99] {
            assert!(check(Axis::X, &window(), v).is_ok(), "{} should pass", v);
        }
    }

    #[test]
    fn test_bounds_are_exclusive() {
        match check(Axis::Z, &window(), -10.0) {
            Err(ScanError::OutOfRange { bound, limit, .. }) => {
                assert_eq!(bound, Bound::Lower);
                assert_eq!(limit, -10.0);
            }
            other => panic!("expected lower violation, got {:?}", other),
        }
        match check(Axis::Z, &window(), 10.0) {
            Err(ScanError::OutOfRange { bound, axis, .. }) => {
                assert_eq!(bound, Bound::Upper);
                assert_eq!(axis, Axis::Z);
            }
            other => panic!("expected upper violation, got {:?}", other),
        }
    }

    #[test]
    fn test_nan_rejected() {
        assert!(check(Axis::Y, &window(), f64::NAN).is_err());
    }
}
