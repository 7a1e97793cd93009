//! Range clamping for device setters.
//!
//! Every configuration setter on a device (wavelength, averaging time, power
//! range, attenuation, display brightness, timeout) follows one contract:
//! a request inside the device-reported range is applied as-is, a request
//! outside it is applied at the nearest bound and reported with a warning.
//! No setter fails solely because a value was out of range.
//!
//! Calibration files recorded against clamped settings depend on this
//! behaviour, so drivers must route through [`apply_clamped`] rather than
//! rejecting values themselves.

use serde::{Deserialize, Serialize};

/// Outcome of clamping a requested value into `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClampOutcome {
    /// Value the caller asked for.
    pub requested: f64,
    /// Value actually applied to the device.
    pub applied: f64,
    /// Whether `applied != requested`.
    pub was_clamped: bool,
}

/// Clamp `value` into `[min, max]`.
///
/// Returns the applied value and whether clamping occurred. If the range is
/// given reversed (`min > max`) the bounds are swapped; devices occasionally
/// report them in either order. A NaN request has no nearest bound and is
/// applied at the lower one.
pub fn clamp_to_range(value: f64, min: f64, max: f64) -> (f64, bool) {
    let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
    if value.is_nan() || value < lo {
        (lo, true)
    } else if value > hi {
        (hi, true)
    } else {
        (value, false)
    }
}

/// Clamp and emit a structured warning when the request was out of range.
///
/// `device` and `setting` name the field in the warning event so operators
/// can filter on them.
pub fn apply_clamped(device: &str, setting: &str, value: f64, min: f64, max: f64) -> ClampOutcome {
    let (applied, was_clamped) = clamp_to_range(value, min, max);
    if was_clamped {
        tracing::warn!(
            device,
            setting,
            requested = value,
            applied,
            min,
            max,
            "Requested value out of range; clamped"
        );
    }
    ClampOutcome {
        requested: value,
        applied,
        was_clamped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn in_range_is_untouched() {
        assert_eq!(clamp_to_range(5.0, 0.0, 10.0), (5.0, false));
        assert_eq!(clamp_to_range(0.0, 0.0, 10.0), (0.0, false));
        assert_eq!(clamp_to_range(10.0, 0.0, 10.0), (10.0, false));
    }

    #[test]
    fn below_and_above_clamp_to_bounds() {
        assert_eq!(clamp_to_range(-1.0, 0.0, 10.0), (0.0, true));
        assert_eq!(clamp_to_range(11.0, 0.0, 10.0), (10.0, true));
    }

    #[test]
    fn non_finite_requests_land_on_a_bound() {
        assert_eq!(clamp_to_range(f64::NAN, 0.1, 60.0), (0.1, true));
        assert_eq!(clamp_to_range(f64::INFINITY, 0.1, 60.0), (60.0, true));
        assert_eq!(clamp_to_range(f64::NEG_INFINITY, 0.1, 60.0), (0.1, true));
    }

    #[traced_test]
    #[test]
    fn nan_setter_is_reported_as_clamped() {
        let outcome = apply_clamped("pm100", "timeout_s", f64::NAN, 0.1, 60.0);
        assert!(outcome.was_clamped);
        assert_eq!(outcome.applied, 0.1);
        assert!(outcome.requested.is_nan());
        assert!(logs_contain("clamped"));
    }

    #[test]
    fn reversed_bounds_are_swapped() {
        assert_eq!(clamp_to_range(20.0, 10.0, 0.0), (10.0, true));
    }

    #[traced_test]
    #[test]
    fn clamped_setter_emits_warning() {
        let outcome = apply_clamped("pm100", "wavelength_nm", 1200.0, 400.0, 1100.0);
        assert!(outcome.was_clamped);
        assert_eq!(outcome.applied, 1100.0);
        assert!(logs_contain("clamped"));
        assert!(logs_contain("wavelength_nm"));
    }

    #[traced_test]
    #[test]
    fn in_range_setter_is_silent() {
        let outcome = apply_clamped("pm100", "wavelength_nm", 800.0, 400.0, 1100.0);
        assert!(!outcome.was_clamped);
        assert!(!logs_contain("clamped"));
    }
}
