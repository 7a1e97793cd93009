//! Calibration Procedures
//!
//! The power calibration procedure drives a beam controller through a ladder
//! of power setpoints, reads a power meter at each one, and fits observed
//! against predicted power.
//!
//! # Key Concepts
//!
//! - **SweepRecorder**: runs one sweep and keeps the last completed result
//! - **SweepConfiguration**: step count, repetitions, settle time, beam, wavelength
//! - **SweepResult**: observed/predicted tables plus the fitted line
//! - **fit / push_calibration**: least-squares fit and the explicit write-back
//!   of new power limits to the beam controller
//! - **CancelToken**: cooperative cancellation checked before every step
//!
//! # Lifecycle
//!
//! ```text
//! validate → set wavelength → point + zero beam → steps → park → fit
//!                                   │                 │
//!                                   └── on failure ───┴──→ park → PartialSweep
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use laser_power_cal::procedures::{push_calibration, SweepConfiguration, SweepRecorder};
//!
//! let mut recorder = SweepRecorder::new();
//! let mut progress = recorder.subscribe();
//! let result = recorder.run_sweep(&config, beam.as_ref(), meter.as_ref()).await?;
//! println!("{}", result.summary());
//!
//! // Only on explicit operator request:
//! push_calibration(beam.as_ref(), result.fitted_min_max_mw.unwrap(), config.beam_index).await?;
//! ```

pub mod fit;
pub mod power_sweep;
pub mod result;

// Re-exports
pub use fit::{
    fit, fit_points, fit_with_quality, fitted_min_max, push_calibration, FitQuality, FittedLine,
};
pub use power_sweep::{SweepConfiguration, SweepRecorder};
pub use result::{SweepResult, SweepSample};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// Current state of a sweep recorder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcedureState {
    /// Not yet started
    Idle,
    /// Configuring the meter
    Preparing,
    /// Stepping through setpoints
    Running,
    /// Parking the beam and fitting
    Finalizing,
    /// Completed successfully
    Completed,
    /// Aborted by a device failure
    Failed,
    /// Cancelled by user
    Cancelled,
}

/// Progress published after every completed step.
///
/// Consumed by live displays; nothing in the sweep depends on it being read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepProgress {
    /// Current state
    pub state: ProcedureState,
    /// Number of completed steps
    pub completed_steps: usize,
    /// Total number of steps
    pub total_steps: usize,
    /// Commanded percent of the last completed step
    pub commanded_percent: Option<f64>,
    /// Mean observed power of the last completed step (mW)
    pub mean_observed_mw: Option<f64>,
    /// Predicted power of the last completed step (mW)
    pub predicted_mw: Option<f64>,
    /// Status message
    pub message: String,
}

impl Default for SweepProgress {
    fn default() -> Self {
        Self {
            state: ProcedureState::Idle,
            completed_steps: 0,
            total_steps: 0,
            commanded_percent: None,
            mean_observed_mw: None,
            predicted_mw: None,
            message: String::new(),
        }
    }
}

impl SweepProgress {
    /// Fraction of steps completed (0.0 - 1.0)
    pub fn overall_progress(&self) -> f64 {
        if self.total_steps == 0 {
            0.0
        } else {
            self.completed_steps as f64 / self.total_steps as f64
        }
    }
}

/// Cooperative cancellation signal shared between a sweep and its controller.
#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// Create an un-cancelled token.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request cancellation; the sweep stops before its next step.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Clear a consumed cancellation request.
    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    /// Wait until cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // Sender lives in self, so wait_for only returns Err if it is dropped.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}
