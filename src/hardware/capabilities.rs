//! Hardware Capabilities for Power Calibration
//!
//! The sweep recorder talks to two kinds of device, each described by a small
//! capability trait:
//!
//! - [`PowerMeter`]: an optical power meter (Thorlabs PM100-style SCPI meter,
//!   mock meter, ...). Reports power in watts.
//! - [`BeamControl`]: the laser power actuator of the microscope (Pockels cell
//!   or similar), which maps a commanded power fraction in `[0, 1]` to watts
//!   through its own calibration lookup.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors, with [`crate::error::DeviceError`]
//!   inside the chain when the failure class matters (timeouts, connection)
//! - Takes `&self`; drivers use interior mutability for state
//!
//! Optional device features (temperature readout, averaging time, ...) have
//! default implementations that return `DeviceError::Unsupported`.
//!
//! # Example
//!
//! ```rust,ignore
//! async fn spot_check<M, B>(meter: &M, beam: &B) -> anyhow::Result<f64>
//! where
//!     M: PowerMeter,
//!     B: BeamControl,
//! {
//!     beam.set_power_fraction(0.5, 0).await?;
//!     tokio::time::sleep(Duration::from_millis(200)).await;
//!     let watts = meter.read_power().await?;
//!     beam.park().await?;
//!     Ok(watts)
//! }
//! ```

use crate::error::DeviceError;
use crate::hardware::clamp::ClampOutcome;
use anyhow::Result;
use async_trait::async_trait;

/// Capability: Optical Power Measurement
///
/// # Contract
/// - `read_power()` performs one measurement and returns watts
/// - `set_wavelength()` sets the calibration wavelength and returns the value
///   actually applied, which may be clamped into the meter's range
/// - Range-limited setters never fail for out-of-range values; they clamp
///   and report through [`ClampOutcome`]
#[async_trait]
pub trait PowerMeter: Send + Sync {
    /// Open the connection and verify the device responds.
    async fn connect(&self) -> Result<()>;

    /// Release the connection. Safe to call more than once.
    async fn disconnect(&self) -> Result<()>;

    /// Set the correction wavelength in nm.
    ///
    /// # Returns
    /// Clamp outcome; `applied` is the wavelength now in effect.
    async fn set_wavelength(&self, nm: f64) -> Result<ClampOutcome>;

    /// Read optical power in watts.
    async fn read_power(&self) -> Result<f64>;

    /// Read sensor head temperature in degrees Celsius.
    async fn read_temperature(&self) -> Result<f64> {
        Err(DeviceError::Unsupported("read_temperature".into()).into())
    }

    /// Set averaging time in seconds.
    async fn set_averaging_time(&self, _seconds: f64) -> Result<ClampOutcome> {
        Err(DeviceError::Unsupported("set_averaging_time".into()).into())
    }

    /// Set the measurement range upper limit in watts.
    async fn set_power_range(&self, _watts: f64) -> Result<ClampOutcome> {
        Err(DeviceError::Unsupported("set_power_range".into()).into())
    }

    /// Set input attenuation in dB.
    async fn set_attenuation(&self, _db: f64) -> Result<ClampOutcome> {
        Err(DeviceError::Unsupported("set_attenuation".into()).into())
    }

    /// Set display brightness as a fraction in `[0, 1]`.
    async fn set_brightness(&self, _fraction: f64) -> Result<ClampOutcome> {
        Err(DeviceError::Unsupported("set_brightness".into()).into())
    }

    /// Set device-side communication timeout in seconds.
    async fn set_timeout(&self, _seconds: f64) -> Result<ClampOutcome> {
        Err(DeviceError::Unsupported("set_timeout".into()).into())
    }
}

/// Capability: Laser Beam Power Control
///
/// # Contract
/// - Fractions are in `[0, 1]`; implementations clamp anything outside
/// - `beam` is a zero-based index, valid below `beam_count()`
/// - `power_fraction_to_watts` uses the controller's current calibration;
///   `set_power_limits` replaces that calibration
/// - `park()` zeroes power and points the beam away from the sample;
///   `point()` brings it back
#[async_trait]
pub trait BeamControl: Send + Sync {
    /// Command a power fraction on one beam.
    async fn set_power_fraction(&self, fraction: f64, beam: usize) -> Result<()>;

    /// Predicted power in watts for a fraction, from the controller's lookup.
    async fn power_fraction_to_watts(&self, fraction: f64, beam: usize) -> Result<f64>;

    /// Replace the power calibration of one beam with new min/max watts.
    async fn set_power_limits(&self, min_watts: f64, max_watts: f64, beam: usize) -> Result<()>;

    /// Zero power and point the beam away.
    async fn park(&self) -> Result<()>;

    /// Point the beam at the sample.
    async fn point(&self) -> Result<()>;

    /// Number of independently controllable beams.
    fn beam_count(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FixedMeter;

    #[async_trait]
    impl PowerMeter for FixedMeter {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }

        async fn set_wavelength(&self, nm: f64) -> Result<ClampOutcome> {
            Ok(ClampOutcome {
                requested: nm,
                applied: nm,
                was_clamped: false,
            })
        }

        async fn read_power(&self) -> Result<f64> {
            Ok(0.123)
        }
    }

    #[tokio::test]
    async fn optional_meter_capabilities_default_to_unsupported() {
        let meter = FixedMeter;
        assert_eq!(meter.read_power().await.unwrap(), 0.123);

        let err = meter.read_temperature().await.unwrap_err();
        assert!(matches!(
            DeviceError::classify(&err),
            Some(DeviceError::Unsupported(op)) if op == "read_temperature"
        ));
        assert!(meter.set_averaging_time(0.1).await.is_err());
    }

    struct LinearBeam {
        fraction: Mutex<f64>,
    }

    #[async_trait]
    impl BeamControl for LinearBeam {
        async fn set_power_fraction(&self, fraction: f64, _beam: usize) -> Result<()> {
            *self.fraction.lock().unwrap() = fraction;
            Ok(())
        }

        async fn power_fraction_to_watts(&self, fraction: f64, _beam: usize) -> Result<f64> {
            Ok(fraction * 0.5)
        }

        async fn set_power_limits(&self, _min: f64, _max: f64, _beam: usize) -> Result<()> {
            Ok(())
        }

        async fn park(&self) -> Result<()> {
            *self.fraction.lock().unwrap() = 0.0;
            Ok(())
        }

        async fn point(&self) -> Result<()> {
            Ok(())
        }

        fn beam_count(&self) -> usize {
            1
        }
    }

    #[tokio::test]
    async fn beam_control_trait_object() {
        let beam: Box<dyn BeamControl> = Box::new(LinearBeam {
            fraction: Mutex::new(0.0),
        });
        beam.set_power_fraction(0.4, 0).await.unwrap();
        assert_eq!(beam.power_fraction_to_watts(0.4, 0).await.unwrap(), 0.2);
        beam.park().await.unwrap();
        assert_eq!(beam.beam_count(), 1);
    }
}
