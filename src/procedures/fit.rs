//! Linear fit of observed against predicted power, and the calibration push.
//!
//! The fit is ordinary least squares over every raw reading, not just the
//! step means. It is solved through an SVD of the design matrix with the
//! predictor centered, which stays well conditioned for the large offsets
//! typical of mW-scale predictions.

use crate::error::{SweepError, SweepOperation, SweepResultOf};
use crate::hardware::capabilities::BeamControl;
use crate::procedures::result::SweepResult;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::info;

/// `observed = intercept + slope * predicted`, both in mW.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FittedLine {
    pub intercept: f64,
    pub slope: f64,
}

impl FittedLine {
    pub fn new(intercept: f64, slope: f64) -> Self {
        Self { intercept, slope }
    }

    /// Evaluate the line at `predicted_mw`.
    pub fn evaluate(&self, predicted_mw: f64) -> f64 {
        self.intercept + self.slope * predicted_mw
    }
}

/// Goodness of fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitQuality {
    /// Coefficient of determination; 1.0 when observed power is constant and
    /// perfectly explained.
    pub r_squared: f64,
    /// Residual standard deviation in mW (`n - 2` degrees of freedom).
    pub residual_std_mw: f64,
    /// Number of points in the fit
    pub n_points: usize,
}

/// Fit observed against predicted power over all raw readings of `result`.
pub fn fit(result: &SweepResult) -> SweepResultOf<FittedLine> {
    fit_with_quality(result).map(|(line, _)| line)
}

/// Like [`fit`], also returning quality metrics.
pub fn fit_with_quality(result: &SweepResult) -> SweepResultOf<(FittedLine, FitQuality)> {
    if result.observed_power_mw.len() != result.predicted_power_mw.len() {
        return Err(SweepError::DegenerateFit(format!(
            "{} observed rows but {} predictions",
            result.observed_power_mw.len(),
            result.predicted_power_mw.len()
        )));
    }

    let (x, y): (Vec<f64>, Vec<f64>) = result
        .observed_power_mw
        .iter()
        .zip(&result.predicted_power_mw)
        .flat_map(|(row, &predicted)| row.iter().map(move |&observed| (predicted, observed)))
        .unzip();

    fit_points(&x, &y)
}

/// Ordinary least squares `y = intercept + slope * x`.
///
/// Fails with [`SweepError::DegenerateFit`] for fewer than two points,
/// non-finite values, or fewer than two distinct `x` values.
pub fn fit_points(x: &[f64], y: &[f64]) -> SweepResultOf<(FittedLine, FitQuality)> {
    if x.len() != y.len() {
        return Err(SweepError::DegenerateFit(format!(
            "{} predictors but {} observations",
            x.len(),
            y.len()
        )));
    }
    let n = x.len();
    if n < 2 {
        return Err(SweepError::DegenerateFit(format!(
            "need at least 2 points, got {n}"
        )));
    }
    if x.iter().chain(y).any(|v| !v.is_finite()) {
        return Err(SweepError::DegenerateFit("non-finite input".into()));
    }

    let x_min = x.iter().copied().fold(f64::INFINITY, f64::min);
    let x_max = x.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let scale = x_min.abs().max(x_max.abs()).max(1.0);
    if x_max - x_min <= f64::EPSILON * scale {
        return Err(SweepError::DegenerateFit(format!(
            "all predicted values equal ({x_min})"
        )));
    }

    let mean_x = x.iter().sum::<f64>() / n as f64;
    let design = DMatrix::from_fn(n, 2, |i, j| if j == 0 { 1.0 } else { x[i] - mean_x });
    let b = DVector::from_column_slice(y);

    let svd = design.svd(true, true);
    let s_max = svd.singular_values.max();
    let s_min = svd.singular_values.min();
    let tol = s_max * 1e-12;
    if s_min <= tol {
        return Err(SweepError::DegenerateFit(format!(
            "design matrix is rank deficient (singular values {s_min:e}, {s_max:e})"
        )));
    }
    let solution = svd
        .solve(&b, tol)
        .map_err(|e| SweepError::DegenerateFit(e.to_string()))?;

    let slope = solution[1];
    let intercept = solution[0] - slope * mean_x;
    let line = FittedLine::new(intercept, slope);

    let mean_y = y.iter().sum::<f64>() / n as f64;
    let ss_res: f64 = x
        .iter()
        .zip(y)
        .map(|(&xi, &yi)| (yi - line.evaluate(xi)).powi(2))
        .sum();
    let ss_tot: f64 = y.iter().map(|&yi| (yi - mean_y).powi(2)).sum();
    let r_squared = if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { 1.0 };
    let residual_std_mw = if n > 2 {
        (ss_res / (n - 2) as f64).sqrt()
    } else {
        0.0
    };

    Ok((
        line,
        FitQuality {
            r_squared,
            residual_std_mw,
            n_points: n,
        },
    ))
}

/// Fitted power (mW) at the predicted power of the first and last step.
pub fn fitted_min_max(line: &FittedLine, result: &SweepResult) -> SweepResultOf<(f64, f64)> {
    match (
        result.predicted_power_mw.first(),
        result.predicted_power_mw.last(),
    ) {
        (Some(&first), Some(&last)) => Ok((line.evaluate(first), line.evaluate(last))),
        _ => Err(SweepError::DegenerateFit(
            "result has no recorded steps".into(),
        )),
    }
}

/// Write fitted min/max power back into the beam controller as its new power
/// limits.
///
/// Each bound is rounded to the nearest mW before conversion to watts. This
/// replaces the controller's fraction-to-watts lookup, so it is never called
/// by the sweep itself.
///
/// # Returns
/// The `(min_watts, max_watts)` actually sent.
pub async fn push_calibration(
    beam: &dyn BeamControl,
    fitted_min_max_mw: (f64, f64),
    beam_index: usize,
) -> SweepResultOf<(f64, f64)> {
    let (min_mw, max_mw) = fitted_min_max_mw;
    if !min_mw.is_finite() || !max_mw.is_finite() {
        return Err(SweepError::InvalidCalibration(format!(
            "non-finite bounds ({min_mw}, {max_mw}) mW"
        )));
    }
    if beam_index >= beam.beam_count() {
        return Err(SweepError::InvalidConfig(format!(
            "beam_index {beam_index} out of range (controller has {} beams)",
            beam.beam_count()
        )));
    }

    let min_watts = min_mw.round() / 1000.0;
    let max_watts = max_mw.round() / 1000.0;
    if max_watts <= min_watts {
        return Err(SweepError::InvalidCalibration(format!(
            "max {max_watts} W must exceed min {min_watts} W after rounding"
        )));
    }

    beam.set_power_limits(min_watts, max_watts, beam_index)
        .await
        .map_err(|cause| SweepError::Device {
            operation: SweepOperation::SetPowerLimits,
            cause,
        })?;

    info!(
        beam_index,
        min_watts, max_watts, "Pushed fitted power limits to beam controller"
    );
    Ok((min_watts, max_watts))
}
