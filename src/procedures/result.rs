//! Sweep Results
//!
//! [`SweepResult`] is built fresh for each run, filled one completed step at a
//! time, finalized by the fit and then treated as read-only. It is also the
//! persisted artifact (see [`crate::storage`]).

use crate::error::SweepResultOf;
use crate::procedures::fit::{fit_with_quality, fitted_min_max, FitQuality, FittedLine};
use crate::procedures::power_sweep::SweepConfiguration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

// =============================================================================
// SweepResult
// =============================================================================

/// Observed and predicted power tables of one calibration sweep.
///
/// Rows are appended only once all repetitions of a step have been read, so
/// `observed_power_mw` never contains placeholder values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepResult {
    /// Unique run ID
    pub run_id: Uuid,

    /// Start of the run (UTC, ISO-8601 when serialized)
    pub timestamp: DateTime<Utc>,

    /// Beam the sweep was run on
    pub beam_index: usize,

    /// Wavelength requested by the configuration (nm)
    pub requested_wavelength_nm: f64,

    /// Wavelength the meter actually applied (nm)
    pub wavelength_nm: f64,

    /// Readings per step
    pub sample_reps: usize,

    /// Planned commanded percent for every step
    pub commanded_percent: Vec<f64>,

    /// Observed power in mW, one row per completed step
    pub observed_power_mw: Vec<Vec<f64>>,

    /// Power predicted by the beam controller in mW, one per completed step
    pub predicted_power_mw: Vec<f64>,

    /// Row means of `observed_power_mw`
    pub mean_observed_power_mw: Vec<f64>,

    #[serde(default)]
    pub fitted_line: Option<FittedLine>,

    #[serde(default)]
    pub fit_quality: Option<FitQuality>,

    /// Fitted power at the first and last step, in mW
    #[serde(default)]
    pub fitted_min_max_mw: Option<(f64, f64)>,

    /// Wall-clock duration of the run
    #[serde(default)]
    pub duration: Duration,
}

/// One raw reading of the sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepSample {
    pub commanded_percent: f64,
    /// 1-based position of the reading within its step
    pub repetition_index: usize,
    pub observed_mw: f64,
}

impl SweepResult {
    /// Start an empty result for a run of `config` at the applied wavelength.
    pub fn new(config: &SweepConfiguration, applied_wavelength_nm: f64) -> Self {
        let num_steps = config.num_steps;
        Self {
            run_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            beam_index: config.beam_index,
            requested_wavelength_nm: config.laser_wavelength_nm,
            wavelength_nm: applied_wavelength_nm,
            sample_reps: config.sample_reps,
            commanded_percent: config.commanded_percents(),
            observed_power_mw: Vec::with_capacity(num_steps),
            predicted_power_mw: Vec::with_capacity(num_steps),
            mean_observed_power_mw: Vec::with_capacity(num_steps),
            fitted_line: None,
            fit_quality: None,
            fitted_min_max_mw: None,
            duration: Duration::ZERO,
        }
    }

    /// Append one completed step.
    pub(crate) fn push_row(&mut self, observed_mw: Vec<f64>, predicted_mw: f64) {
        debug_assert_eq!(observed_mw.len(), self.sample_reps);
        let mean = observed_mw.iter().sum::<f64>() / observed_mw.len() as f64;
        self.observed_power_mw.push(observed_mw);
        self.predicted_power_mw.push(predicted_mw);
        self.mean_observed_power_mw.push(mean);
    }

    /// Number of steps with a full row of readings.
    pub fn completed_steps(&self) -> usize {
        self.observed_power_mw.len()
    }

    /// Number of planned steps.
    pub fn num_steps(&self) -> usize {
        self.commanded_percent.len()
    }

    /// Whether every planned step has been recorded.
    pub fn is_complete(&self) -> bool {
        self.num_steps() > 0 && self.completed_steps() == self.num_steps()
    }

    /// Iterate over raw readings in step-major order.
    pub fn samples(&self) -> impl Iterator<Item = SweepSample> + '_ {
        self.observed_power_mw
            .iter()
            .zip(&self.commanded_percent)
            .flat_map(|(row, &percent)| {
                row.iter().enumerate().map(move |(rep, &mw)| SweepSample {
                    commanded_percent: percent,
                    repetition_index: rep + 1,
                    observed_mw: mw,
                })
            })
    }

    /// Fit observed against predicted power and store the line and its
    /// evaluation at the end points.
    pub fn apply_fit(&mut self) -> SweepResultOf<FittedLine> {
        let (line, quality) = fit_with_quality(self)?;
        self.fitted_min_max_mw = Some(fitted_min_max(&line, self)?);
        self.fitted_line = Some(line);
        self.fit_quality = Some(quality);
        Ok(line)
    }

    /// Generate a human-readable summary
    pub fn summary(&self) -> String {
        let header = format!(
            "Beam {} @ {:.1} nm - {}/{} steps x {} reps",
            self.beam_index,
            self.wavelength_nm,
            self.completed_steps(),
            self.num_steps(),
            self.sample_reps
        );

        match (&self.fitted_line, &self.fitted_min_max_mw) {
            (Some(line), Some((min_mw, max_mw))) => {
                let r2 = self
                    .fit_quality
                    .as_ref()
                    .map(|q| format!(", R² {:.5}", q.r_squared))
                    .unwrap_or_default();
                format!(
                    "{header} - observed = {:.4} * predicted + {:.3} mW{r2} - fitted range {:.1}..{:.1} mW",
                    line.slope, line.intercept, min_mw, max_mw
                )
            }
            _ => format!("{header} - not fitted"),
        }
    }
}
