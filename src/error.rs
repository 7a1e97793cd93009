//! Custom error types for power calibration.
//!
//! Two enums cover the crate:
//!
//! - **`DeviceError`**: raised by hardware drivers. Capability traits return
//!   `anyhow::Result`, so drivers wrap a `DeviceError` in the `anyhow::Error`
//!   they return. The sweep recorder recovers the variant with
//!   [`DeviceError::classify`] to decide whether a failure is retryable.
//! - **`SweepError`**: everything a caller of the sweep, fit or calibration
//!   push can observe. A sweep that aborts mid-flight surfaces as
//!   [`SweepError::PartialSweep`], which carries the rows measured so far.
//!
//! A value clamped into a device's valid range is not an error; see
//! [`crate::hardware::clamp`].

use crate::procedures::result::SweepResult;
use thiserror::Error;

/// Convenience alias for results using the sweep error type.
pub type SweepResultOf<T> = std::result::Result<T, SweepError>;

/// Failures reported by device drivers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// Device could not be reached or opened.
    #[error("Device '{device}' not reachable: {reason}")]
    Connection { device: String, reason: String },

    /// A single operation did not complete within its deadline.
    #[error("Device '{device}' timed out during {operation}")]
    Timeout { device: String, operation: String },

    /// Device refused a command outright (as opposed to clamping it).
    #[error("Device '{device}' rejected {operation}: {reason}")]
    Rejected {
        device: String,
        operation: String,
        reason: String,
    },

    /// Malformed or unexpected response on the wire.
    #[error("Device '{device}' communication error: {reason}")]
    Communication { device: String, reason: String },

    /// Optional capability the device does not provide.
    #[error("Operation '{0}' not supported by this device")]
    Unsupported(String),
}

impl DeviceError {
    /// Find a `DeviceError` anywhere in an `anyhow` error chain.
    pub fn classify(err: &anyhow::Error) -> Option<&DeviceError> {
        err.chain().find_map(|cause| cause.downcast_ref::<DeviceError>())
    }

    /// Whether the error chain contains a timeout.
    pub fn is_timeout(err: &anyhow::Error) -> bool {
        matches!(Self::classify(err), Some(DeviceError::Timeout { .. }))
    }

    /// Whether the error chain contains a connection failure.
    pub fn is_connection(err: &anyhow::Error) -> bool {
        matches!(Self::classify(err), Some(DeviceError::Connection { .. }))
    }
}

/// Device operation that was in flight when a sweep aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOperation {
    SetWavelength,
    PointBeam,
    ZeroBeam,
    SetPowerFraction,
    ReadPower,
    PredictPower,
    Park,
    SetPowerLimits,
    Cancelled,
}

impl std::fmt::Display for SweepOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SweepOperation::SetWavelength => "set_wavelength",
            SweepOperation::PointBeam => "point_beam",
            SweepOperation::ZeroBeam => "zero_beam",
            SweepOperation::SetPowerFraction => "set_power_fraction",
            SweepOperation::ReadPower => "read_power",
            SweepOperation::PredictPower => "power_fraction_to_watts",
            SweepOperation::Park => "park",
            SweepOperation::SetPowerLimits => "set_power_limits",
            SweepOperation::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Diagnostic payload of an aborted sweep.
#[derive(Debug)]
pub struct PartialSweep {
    /// Zero-based step index at which the sweep stopped.
    pub step_index: usize,
    /// Operation that failed (or `Cancelled`).
    pub operation: SweepOperation,
    /// Completed rows only; every entry is finite.
    pub result: SweepResult,
    /// Readings (mW) of the step that did not complete.
    pub incomplete_row_mw: Vec<f64>,
    /// Underlying failure, absent for cancellation.
    pub cause: Option<anyhow::Error>,
}

impl std::fmt::Display for PartialSweep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "sweep aborted at step {} during {} ({} complete rows)",
            self.step_index,
            self.operation,
            self.result.completed_steps()
        )?;
        if let Some(cause) = &self.cause {
            write!(f, ": {cause:#}")?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum SweepError {
    #[error("Invalid sweep configuration: {0}")]
    InvalidConfig(String),

    #[error("Device not reachable before sweep start: {0:#}")]
    DeviceConnection(anyhow::Error),

    #[error("{0}")]
    PartialSweep(Box<PartialSweep>),

    #[error("Degenerate fit input: {0}")]
    DegenerateFit(String),

    #[error("Invalid calibration bounds: {0}")]
    InvalidCalibration(String),

    #[error("Device operation {operation} failed: {cause:#}")]
    Device {
        operation: SweepOperation,
        cause: anyhow::Error,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SweepError {
    /// Partial result of an aborted sweep, if this is one.
    pub fn partial(&self) -> Option<&PartialSweep> {
        match self {
            SweepError::PartialSweep(partial) => Some(partial),
            _ => None,
        }
    }
}
