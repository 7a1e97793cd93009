//! Laser Power Calibration Sweep
//!
//! Steps a beam through evenly spaced power fractions, reads the power meter
//! at each one, and fits what the meter saw against what the beam controller
//! predicted.
//!
//! # Configuration
//!
//! ```toml
//! [sweep]
//! num_steps = 11
//! sample_reps = 3
//! settling_time_secs = 0.2
//! beam_index = 0
//! laser_wavelength_nm = 920.0
//! first_percent = 0.0
//! ```
//!
//! # Failure handling
//!
//! Any device failure or a cancellation aborts the sweep at once. The beam is
//! parked on every exit path, and the rows recorded so far are returned in
//! [`SweepError::PartialSweep`].

use super::{CancelToken, ProcedureState, SweepProgress, SweepResult};
use crate::error::{DeviceError, PartialSweep, SweepError, SweepOperation, SweepResultOf};
use crate::hardware::capabilities::{BeamControl, PowerMeter};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, instrument, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Parameters of one calibration sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepConfiguration {
    /// Number of power setpoints (at least 2)
    #[serde(default = "default_num_steps")]
    pub num_steps: usize,

    /// Meter readings per setpoint (at least 1)
    #[serde(default = "default_sample_reps")]
    pub sample_reps: usize,

    /// Wait after each setpoint before reading (seconds)
    #[serde(default = "default_settling_time")]
    pub settling_time_secs: f64,

    /// Beam to drive
    #[serde(default)]
    pub beam_index: usize,

    /// Meter correction wavelength (nm)
    #[serde(default = "default_wavelength")]
    pub laser_wavelength_nm: f64,

    /// Commanded percent of the first step; the last step is always 100%
    #[serde(default)]
    pub first_percent: f64,

    /// Wait after zeroing the beam, before the first step (seconds)
    #[serde(default = "default_zero_delay")]
    pub zero_delay_secs: f64,

    /// Deadline for a single meter reading (seconds)
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: f64,
}

fn default_num_steps() -> usize {
    11
}
fn default_sample_reps() -> usize {
    1
}
fn default_settling_time() -> f64 {
    0.2
}
fn default_wavelength() -> f64 {
    920.0
}
fn default_zero_delay() -> f64 {
    0.5
}
fn default_read_timeout() -> f64 {
    5.0
}

impl Default for SweepConfiguration {
    fn default() -> Self {
        Self {
            num_steps: default_num_steps(),
            sample_reps: default_sample_reps(),
            settling_time_secs: default_settling_time(),
            beam_index: 0,
            laser_wavelength_nm: default_wavelength(),
            first_percent: 0.0,
            zero_delay_secs: default_zero_delay(),
            read_timeout_secs: default_read_timeout(),
        }
    }
}

impl SweepConfiguration {
    /// Check parameter bounds.
    pub fn validate(&self) -> SweepResultOf<()> {
        let invalid = |msg: String| Err(SweepError::InvalidConfig(msg));

        if self.num_steps < 2 {
            return invalid(format!("num_steps must be >= 2, got {}", self.num_steps));
        }
        if self.sample_reps < 1 {
            return invalid("sample_reps must be >= 1".into());
        }
        if !(self.settling_time_secs.is_finite() && self.settling_time_secs >= 0.0) {
            return invalid(format!(
                "settling_time_secs must be >= 0, got {}",
                self.settling_time_secs
            ));
        }
        if !(self.laser_wavelength_nm.is_finite() && self.laser_wavelength_nm > 0.0) {
            return invalid(format!(
                "laser_wavelength_nm must be > 0, got {}",
                self.laser_wavelength_nm
            ));
        }
        if !(self.first_percent.is_finite() && (0.0..100.0).contains(&self.first_percent)) {
            return invalid(format!(
                "first_percent must be in [0, 100), got {}",
                self.first_percent
            ));
        }
        if !(self.zero_delay_secs.is_finite() && self.zero_delay_secs >= 0.0) {
            return invalid(format!(
                "zero_delay_secs must be >= 0, got {}",
                self.zero_delay_secs
            ));
        }
        if !(self.read_timeout_secs.is_finite() && self.read_timeout_secs > 0.0) {
            return invalid(format!(
                "read_timeout_secs must be > 0, got {}",
                self.read_timeout_secs
            ));
        }
        Ok(())
    }

    /// `num_steps` evenly spaced percents over `[first_percent, 100]`.
    pub fn commanded_percents(&self) -> Vec<f64> {
        match self.num_steps {
            0 => Vec::new(),
            1 => vec![self.first_percent],
            n => {
                let span = 100.0 - self.first_percent;
                let last = (n - 1) as f64;
                (0..n)
                    .map(|i| {
                        if i == n - 1 {
                            100.0
                        } else {
                            self.first_percent + span * i as f64 / last
                        }
                    })
                    .collect()
            }
        }
    }

    pub fn settling_time(&self) -> Duration {
        secs(self.settling_time_secs)
    }

    pub fn zero_delay(&self) -> Duration {
        secs(self.zero_delay_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        secs(self.read_timeout_secs)
    }

    /// Lower bound on the run time, ignoring meter latency.
    pub fn estimated_duration(&self) -> Duration {
        let settling = self.settling_time().as_secs_f64() * self.num_steps as f64;
        self.zero_delay()
            .saturating_add(Duration::try_from_secs_f64(settling).unwrap_or(Duration::MAX))
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or_default()
}

// =============================================================================
// Recorder
// =============================================================================

/// Where and why a sweep stopped early.
struct Abort {
    step: usize,
    operation: SweepOperation,
    row_mw: Vec<f64>,
    cause: Option<anyhow::Error>,
}

impl Abort {
    fn device(step: usize, operation: SweepOperation, cause: anyhow::Error) -> Self {
        Self {
            step,
            operation,
            row_mw: Vec::new(),
            cause: Some(cause),
        }
    }
}

/// Runs calibration sweeps and keeps the last successful result.
///
/// `run_sweep` borrows the recorder mutably, so one recorder never runs two
/// sweeps at once. Progress is published on a watch channel and cancellation
/// goes through a [`CancelToken`] that outlives individual runs.
pub struct SweepRecorder {
    state: ProcedureState,
    last_result: Option<SweepResult>,
    cancel: CancelToken,
    progress_tx: watch::Sender<SweepProgress>,
}

impl Default for SweepRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl SweepRecorder {
    pub fn new() -> Self {
        let (progress_tx, _rx) = watch::channel(SweepProgress::default());
        Self {
            state: ProcedureState::Idle,
            last_result: None,
            cancel: CancelToken::new(),
            progress_tx,
        }
    }

    /// Current state
    pub fn state(&self) -> ProcedureState {
        self.state
    }

    /// Whether a fitted result is available (enables save and calibration push).
    pub fn has_result(&self) -> bool {
        self.last_result.is_some()
    }

    /// Last successful result.
    pub fn last_result(&self) -> Option<&SweepResult> {
        self.last_result.as_ref()
    }

    /// Token that cancels the running sweep before its next step.
    ///
    /// A request made while no sweep is running applies to the next one. The
    /// token is cleared when a sweep ends.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Subscribe to progress updates.
    pub fn subscribe(&self) -> watch::Receiver<SweepProgress> {
        self.progress_tx.subscribe()
    }

    /// Run one sweep.
    ///
    /// Both devices must already be connected. The beam is parked before this
    /// returns, whatever the outcome. The result is not written back to the
    /// beam controller; see [`super::push_calibration`].
    #[instrument(
        skip_all,
        fields(
            beam_index = config.beam_index,
            num_steps = config.num_steps,
            sample_reps = config.sample_reps
        )
    )]
    pub async fn run_sweep(
        &mut self,
        config: &SweepConfiguration,
        beam: &dyn BeamControl,
        meter: &dyn PowerMeter,
    ) -> SweepResultOf<SweepResult> {
        let started = Instant::now();

        let checked = config.validate().and_then(|_| {
            if config.beam_index < beam.beam_count() {
                Ok(())
            } else {
                Err(SweepError::InvalidConfig(format!(
                    "beam_index {} out of range (controller has {} beams)",
                    config.beam_index,
                    beam.beam_count()
                )))
            }
        });
        if let Err(e) = checked {
            self.set_state(ProcedureState::Failed, e.to_string());
            return Err(e);
        }

        self.last_result = None;
        self.set_state(ProcedureState::Preparing, "Setting meter wavelength");
        self.progress_tx.send_modify(|p| {
            p.completed_steps = 0;
            p.total_steps = config.num_steps;
            p.commanded_percent = None;
            p.mean_observed_mw = None;
            p.predicted_mw = None;
        });

        let applied_nm = match meter.set_wavelength(config.laser_wavelength_nm).await {
            Ok(outcome) => {
                if outcome.was_clamped {
                    warn!(
                        requested_nm = outcome.requested,
                        applied_nm = outcome.applied,
                        "Meter clamped calibration wavelength; continuing with applied value"
                    );
                }
                outcome.applied
            }
            Err(cause) => {
                if let Err(park_err) = park_beam(beam, config.beam_index).await {
                    error!(error = %format!("{park_err:#}"), "Failed to park beam");
                }
                self.cancel.reset();
                self.set_state(ProcedureState::Failed, format!("{cause:#}"));
                return Err(if DeviceError::is_connection(&cause) {
                    SweepError::DeviceConnection(cause)
                } else {
                    SweepError::Device {
                        operation: SweepOperation::SetWavelength,
                        cause,
                    }
                });
            }
        };

        info!(
            wavelength_nm = applied_nm,
            estimated_secs = config.estimated_duration().as_secs_f64(),
            "Starting power calibration sweep"
        );

        let mut result = SweepResult::new(config, applied_nm);
        self.set_state(ProcedureState::Running, "Sweeping");
        let outcome = self.execute(config, beam, meter, &mut result).await;

        self.set_state(ProcedureState::Finalizing, "Parking beam");
        let parked = park_beam(beam, config.beam_index).await;
        self.cancel.reset();
        result.duration = started.elapsed();

        let abort = match (outcome, parked) {
            (Ok(()), Ok(())) => None,
            (Ok(()), Err(cause)) => Some(Abort::device(
                config.num_steps,
                SweepOperation::Park,
                cause,
            )),
            (Err(abort), parked) => {
                if let Err(park_err) = parked {
                    error!(error = %format!("{park_err:#}"), "Failed to park beam after abort");
                }
                Some(abort)
            }
        };

        if let Some(abort) = abort {
            let state = if abort.operation == SweepOperation::Cancelled {
                ProcedureState::Cancelled
            } else {
                ProcedureState::Failed
            };
            warn!(
                step = abort.step,
                operation = %abort.operation,
                completed_steps = result.completed_steps(),
                "Sweep aborted"
            );
            self.set_state(state, format!("Aborted at step {}", abort.step));
            return Err(SweepError::PartialSweep(Box::new(PartialSweep {
                step_index: abort.step,
                operation: abort.operation,
                result,
                incomplete_row_mw: abort.row_mw,
                cause: abort.cause,
            })));
        }

        if let Err(e) = result.apply_fit() {
            self.set_state(ProcedureState::Failed, e.to_string());
            return Err(e);
        }

        info!(summary = %result.summary(), "Sweep complete");
        self.last_result = Some(result.clone());
        self.set_state(ProcedureState::Completed, "Complete");
        Ok(result)
    }

    async fn execute(
        &self,
        config: &SweepConfiguration,
        beam: &dyn BeamControl,
        meter: &dyn PowerMeter,
        result: &mut SweepResult,
    ) -> Result<(), Abort> {
        let beam_index = config.beam_index;

        beam.point()
            .await
            .map_err(|e| Abort::device(0, SweepOperation::PointBeam, e))?;
        beam.set_power_fraction(0.0, beam_index)
            .await
            .map_err(|e| Abort::device(0, SweepOperation::ZeroBeam, e))?;
        sleep(config.zero_delay()).await;

        let percents = result.commanded_percent.clone();
        let read_timeout = config.read_timeout();

        for (step, &percent) in percents.iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!(step, "Sweep cancelled");
                return Err(Abort {
                    step,
                    operation: SweepOperation::Cancelled,
                    row_mw: Vec::new(),
                    cause: None,
                });
            }

            let fraction = percent / 100.0;
            beam.set_power_fraction(fraction, beam_index)
                .await
                .map_err(|e| Abort::device(step, SweepOperation::SetPowerFraction, e))?;

            sleep(config.settling_time()).await;

            let mut row_mw = Vec::with_capacity(config.sample_reps);
            for rep in 0..config.sample_reps {
                match read_power_mw(meter, read_timeout, step, rep).await {
                    Ok(mw) => row_mw.push(mw),
                    Err(cause) => {
                        return Err(Abort {
                            step,
                            operation: SweepOperation::ReadPower,
                            row_mw,
                            cause: Some(cause),
                        })
                    }
                }
            }

            let predicted_w = beam
                .power_fraction_to_watts(fraction, beam_index)
                .await
                .and_then(|w| {
                    if w.is_finite() {
                        Ok(w)
                    } else {
                        Err(DeviceError::Communication {
                            device: "beam_controller".into(),
                            reason: format!("non-finite prediction {w}"),
                        }
                        .into())
                    }
                })
                .map_err(|e| abort_with_row(step, SweepOperation::PredictPower, &row_mw, e))?;
            let predicted_mw = predicted_w * 1000.0;

            result.push_row(row_mw, predicted_mw);
            let mean_mw = result.mean_observed_power_mw[step];
            debug!(step, percent, mean_mw, predicted_mw, "Step recorded");

            self.progress_tx.send_modify(|p| {
                p.completed_steps = step + 1;
                p.commanded_percent = Some(percent);
                p.mean_observed_mw = Some(mean_mw);
                p.predicted_mw = Some(predicted_mw);
                p.message = format!("Step {}/{}", step + 1, p.total_steps);
            });
        }

        Ok(())
    }

    fn set_state(&mut self, state: ProcedureState, message: impl Into<String>) {
        self.state = state;
        let message = message.into();
        self.progress_tx.send_modify(|p| {
            p.state = state;
            p.message = message;
        });
    }
}

fn abort_with_row(
    step: usize,
    operation: SweepOperation,
    row_mw: &[f64],
    cause: anyhow::Error,
) -> Abort {
    Abort {
        step,
        operation,
        row_mw: row_mw.to_vec(),
        cause: Some(cause),
    }
}

/// One reading in mW. A timeout is retried once; anything else fails at once.
async fn read_power_mw(
    meter: &dyn PowerMeter,
    deadline: Duration,
    step: usize,
    rep: usize,
) -> anyhow::Result<f64> {
    let mut retried = false;
    loop {
        let reading = match timeout(deadline, meter.read_power()).await {
            Ok(reading) => reading,
            Err(_) => Err(DeviceError::Timeout {
                device: "power_meter".into(),
                operation: "read_power".into(),
            }
            .into()),
        };

        match reading {
            Ok(watts) if watts.is_finite() => return Ok(watts * 1000.0),
            Ok(watts) => {
                return Err(DeviceError::Communication {
                    device: "power_meter".into(),
                    reason: format!("non-finite reading {watts}"),
                }
                .into())
            }
            Err(e) if !retried && DeviceError::is_timeout(&e) => {
                warn!(step, rep, "Power meter read timed out; retrying once");
                retried = true;
            }
            Err(e) => return Err(e.context(format!("step {step}, repetition {rep}"))),
        }
    }
}

/// Zero the beam, then park it. `park()` is attempted even if zeroing fails.
async fn park_beam(beam: &dyn BeamControl, beam_index: usize) -> anyhow::Result<()> {
    let zeroed = beam.set_power_fraction(0.0, beam_index).await;
    let parked = beam.park().await;
    zeroed.and(parked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockBeamController, MockPowerMeter};
    use std::sync::Arc;

    fn fast_config(num_steps: usize, sample_reps: usize) -> SweepConfiguration {
        SweepConfiguration {
            num_steps,
            sample_reps,
            settling_time_secs: 0.0,
            zero_delay_secs: 0.0,
            read_timeout_secs: 0.5,
            ..Default::default()
        }
    }

    #[test]
    fn test_default_configuration_is_valid() {
        assert!(SweepConfiguration::default().validate().is_ok());
    }

    #[test]
    fn test_percent_sequence_eleven_steps() {
        let percents = fast_config(11, 1).commanded_percents();
        let expected: Vec<f64> = (0..=10).map(|i| i as f64 * 10.0).collect();
        assert_eq!(percents, expected);
    }

    #[test]
    fn test_percent_sequence_with_first_percent() {
        let config = SweepConfiguration {
            num_steps: 5,
            first_percent: 20.0,
            ..Default::default()
        };
        assert_eq!(config.commanded_percents(), vec![20.0, 40.0, 60.0, 80.0, 100.0]);
    }

    #[test]
    fn test_estimated_duration() {
        let config = SweepConfiguration {
            num_steps: 11,
            settling_time_secs: 0.2,
            zero_delay_secs: 0.5,
            ..Default::default()
        };
        let secs = config.estimated_duration().as_secs_f64();
        assert!((secs - 2.7).abs() < 1e-9);

        // Step counts past u32 neither wrap nor overflow.
        let huge = SweepConfiguration {
            num_steps: usize::MAX,
            settling_time_secs: 1e6,
            ..Default::default()
        };
        assert_eq!(huge.estimated_duration(), Duration::MAX);
    }

    #[test]
    fn test_validation_rejects_bad_parameters() {
        let cases = [
            SweepConfiguration {
                num_steps: 1,
                ..Default::default()
            },
            SweepConfiguration {
                sample_reps: 0,
                ..Default::default()
            },
            SweepConfiguration {
                settling_time_secs: -0.1,
                ..Default::default()
            },
            SweepConfiguration {
                laser_wavelength_nm: 0.0,
                ..Default::default()
            },
            SweepConfiguration {
                first_percent: 100.0,
                ..Default::default()
            },
            SweepConfiguration {
                read_timeout_secs: 0.0,
                ..Default::default()
            },
        ];
        for config in cases {
            assert!(
                matches!(config.validate(), Err(SweepError::InvalidConfig(_))),
                "{config:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_serde_defaults() {
        let config: SweepConfiguration =
            serde_json::from_str(r#"{"num_steps": 21, "sample_reps": 4}"#).unwrap();
        assert_eq!(config.num_steps, 21);
        assert_eq!(config.sample_reps, 4);
        assert_eq!(config.laser_wavelength_nm, 920.0);
        assert_eq!(config.read_timeout_secs, 5.0);
    }

    #[tokio::test]
    async fn test_invalid_config_touches_no_device() {
        let beam = Arc::new(MockBeamController::new(1, 1.0));
        let meter = MockPowerMeter::new(0.1);
        meter.connect().await.unwrap();

        let mut recorder = SweepRecorder::new();
        let err = recorder
            .run_sweep(&fast_config(1, 1), beam.as_ref(), &meter)
            .await
            .unwrap_err();

        assert!(matches!(err, SweepError::InvalidConfig(_)));
        assert!(beam.events().await.is_empty());
        assert_eq!(recorder.state(), ProcedureState::Failed);
    }

    #[tokio::test]
    async fn test_beam_index_checked_against_controller() {
        let beam = Arc::new(MockBeamController::new(1, 1.0));
        let meter = MockPowerMeter::new(0.1);
        meter.connect().await.unwrap();

        let config = SweepConfiguration {
            beam_index: 2,
            ..fast_config(3, 1)
        };
        let err = SweepRecorder::new()
            .run_sweep(&config, beam.as_ref(), &meter)
            .await
            .unwrap_err();
        assert!(matches!(err, SweepError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_progress_reports_last_step() {
        let beam = Arc::new(MockBeamController::new(1, 0.2));
        let meter = MockPowerMeter::following(beam.clone(), 0, |f| f * 0.2);
        meter.connect().await.unwrap();

        let mut recorder = SweepRecorder::new();
        let progress = recorder.subscribe();
        recorder
            .run_sweep(&fast_config(4, 2), beam.as_ref(), &meter)
            .await
            .unwrap();

        let last = progress.borrow().clone();
        assert_eq!(last.state, ProcedureState::Completed);
        assert_eq!(last.completed_steps, 4);
        assert_eq!(last.total_steps, 4);
        assert_eq!(last.commanded_percent, Some(100.0));
        assert!((last.predicted_mw.unwrap() - 200.0).abs() < 1e-9);
        assert!(recorder.has_result());
    }
}
