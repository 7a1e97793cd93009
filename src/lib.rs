//! # Laser Power Calibration
//!
//! Calibrates the laser power actuator of a microscope against an optical
//! power meter. A sweep steps the beam through a ladder of power fractions,
//! reads the meter at each one, and fits what the meter observed against what
//! the beam controller predicted. The fit can then be pushed back into the
//! controller as new power limits.
//!
//! ## Crate Structure
//!
//! - **`hardware`**: capability traits (`PowerMeter`, `BeamControl`), the
//!   range-clamp policy, drivers (SCPI power meter, mocks) and the
//!   caller-owned `DeviceRegistry`.
//! - **`procedures`**: the `SweepRecorder`, sweep results, the linear fit and
//!   the calibration push.
//! - **`storage`**: `ResultSink` implementations for finished results.
//! - **`config`**: Figment-based configuration (TOML + `LPC_` environment).
//! - **`logging`**: `tracing-subscriber` initialization.
//! - **`error`**: `DeviceError` and `SweepError`.

pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod procedures;
pub mod storage;

pub use error::{DeviceError, SweepError};
pub use procedures::{SweepConfiguration, SweepRecorder, SweepResult};
