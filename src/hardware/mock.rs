//! Mock Hardware Implementations
//!
//! Simulated power meter and beam controller for running sweeps without a
//! microscope. All mock devices use async-safe operations
//! (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `MockBeamController` - multi-beam power actuator with a linear
//!   min/max lookup and a call log
//! - `MockPowerMeter` - power meter that either returns a fixed reading or
//!   follows a `MockBeamController` through a response function
//!
//! Both mocks support failure injection so the sweep's abort paths can be
//! exercised deterministically.
//!
//! # Example
//!
//! ```rust,ignore
//! let beam = Arc::new(MockBeamController::new(1, 1.0));
//! let meter = MockPowerMeter::following(beam.clone(), 0, |f| f * 1.05 + 0.002);
//! beam.set_power_fraction(0.5, 0).await?;
//! assert!((meter.read_power().await? - 0.527).abs() < 1e-12);
//! ```

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};

use crate::error::DeviceError;
use crate::hardware::capabilities::{BeamControl, PowerMeter};
use crate::hardware::clamp::{apply_clamped, clamp_to_range, ClampOutcome};

// =============================================================================
// MockBeamController
// =============================================================================

/// One entry of the mock beam controller's call log.
#[derive(Debug, Clone, PartialEq)]
pub enum BeamEvent {
    /// `set_power_fraction(fraction, beam)` (after clamping to [0, 1])
    SetFraction { fraction: f64, beam: usize },
    /// `power_fraction_to_watts(fraction, beam)`
    Predict { fraction: f64, beam: usize },
    /// `set_power_limits(min_watts, max_watts, beam)`
    SetLimits {
        min_watts: f64,
        max_watts: f64,
        beam: usize,
    },
    /// `park()`
    Park,
    /// `point()`
    Point,
}

#[derive(Debug, Clone)]
struct BeamState {
    fraction: f64,
    min_watts: f64,
    max_watts: f64,
}

#[derive(Debug, Default)]
struct BeamFaults {
    /// Fail the N-th (0-based) `set_power_fraction` call.
    fail_set_fraction_at: Option<usize>,
    set_fraction_calls: usize,
    fail_park: bool,
}

/// Mock beam controller with a linear fraction-to-watts lookup.
///
/// Predicted power is `min_watts + fraction * (max_watts - min_watts)`, the
/// same two-point lookup a real controller rebuilds from
/// `set_power_limits`.
pub struct MockBeamController {
    beams: Mutex<Vec<BeamState>>,
    events: Mutex<Vec<BeamEvent>>,
    faults: Mutex<BeamFaults>,
    parked: Mutex<bool>,
    beam_count: usize,
}

impl MockBeamController {
    /// Create a controller with `beam_count` beams, each spanning `0..=max_watts`.
    pub fn new(beam_count: usize, max_watts: f64) -> Self {
        let beams = (0..beam_count)
            .map(|_| BeamState {
                fraction: 0.0,
                min_watts: 0.0,
                max_watts,
            })
            .collect();
        Self {
            beams: Mutex::new(beams),
            events: Mutex::new(Vec::new()),
            faults: Mutex::new(BeamFaults::default()),
            parked: Mutex::new(true),
            beam_count,
        }
    }

    /// Make the `call_index`-th (0-based) `set_power_fraction` call fail.
    pub async fn fail_set_fraction_at(&self, call_index: usize) {
        self.faults.lock().await.fail_set_fraction_at = Some(call_index);
    }

    /// Make every `park()` call fail.
    pub async fn fail_park(&self, fail: bool) {
        self.faults.lock().await.fail_park = fail;
    }

    /// Currently commanded fraction of a beam.
    pub async fn current_fraction(&self, beam: usize) -> Option<f64> {
        self.beams.lock().await.get(beam).map(|b| b.fraction)
    }

    /// Current (min, max) watts of a beam's lookup.
    pub async fn power_limits(&self, beam: usize) -> Option<(f64, f64)> {
        self.beams
            .lock()
            .await
            .get(beam)
            .map(|b| (b.min_watts, b.max_watts))
    }

    /// Snapshot of all calls made so far.
    pub async fn events(&self) -> Vec<BeamEvent> {
        self.events.lock().await.clone()
    }

    /// Number of `park()` calls made so far.
    pub async fn park_count(&self) -> usize {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| matches!(e, BeamEvent::Park))
            .count()
    }

    /// Whether the beam is currently parked.
    pub async fn is_parked(&self) -> bool {
        *self.parked.lock().await
    }

    async fn record(&self, event: BeamEvent) {
        self.events.lock().await.push(event);
    }

    fn check_beam(&self, beam: usize) -> Result<()> {
        if beam >= self.beam_count {
            return Err(DeviceError::Rejected {
                device: "mock_beam".into(),
                operation: "beam index".into(),
                reason: format!("beam {} out of range (0..{})", beam, self.beam_count),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl BeamControl for MockBeamController {
    async fn set_power_fraction(&self, fraction: f64, beam: usize) -> Result<()> {
        self.check_beam(beam)?;

        {
            let mut faults = self.faults.lock().await;
            let call = faults.set_fraction_calls;
            faults.set_fraction_calls += 1;
            if faults.fail_set_fraction_at == Some(call) {
                return Err(DeviceError::Communication {
                    device: "mock_beam".into(),
                    reason: format!("injected failure on set_power_fraction call {}", call),
                }
                .into());
            }
        }

        let (fraction, _) = clamp_to_range(fraction, 0.0, 1.0);
        if let Some(state) = self.beams.lock().await.get_mut(beam) {
            state.fraction = fraction;
        }
        self.record(BeamEvent::SetFraction { fraction, beam }).await;
        Ok(())
    }

    async fn power_fraction_to_watts(&self, fraction: f64, beam: usize) -> Result<f64> {
        self.check_beam(beam)?;
        let (fraction, _) = clamp_to_range(fraction, 0.0, 1.0);
        let watts = {
            let beams = self.beams.lock().await;
            let state = &beams[beam];
            state.min_watts + fraction * (state.max_watts - state.min_watts)
        };
        self.record(BeamEvent::Predict { fraction, beam }).await;
        Ok(watts)
    }

    async fn set_power_limits(&self, min_watts: f64, max_watts: f64, beam: usize) -> Result<()> {
        self.check_beam(beam)?;
        if !(min_watts.is_finite() && max_watts.is_finite()) || max_watts <= min_watts {
            return Err(DeviceError::Rejected {
                device: "mock_beam".into(),
                operation: "set_power_limits".into(),
                reason: format!("invalid limits [{}, {}] W", min_watts, max_watts),
            }
            .into());
        }
        if let Some(state) = self.beams.lock().await.get_mut(beam) {
            state.min_watts = min_watts;
            state.max_watts = max_watts;
        }
        self.record(BeamEvent::SetLimits {
            min_watts,
            max_watts,
            beam,
        })
        .await;
        Ok(())
    }

    async fn park(&self) -> Result<()> {
        self.record(BeamEvent::Park).await;
        if self.faults.lock().await.fail_park {
            return Err(anyhow!("injected park failure"));
        }
        for state in self.beams.lock().await.iter_mut() {
            state.fraction = 0.0;
        }
        *self.parked.lock().await = true;
        Ok(())
    }

    async fn point(&self) -> Result<()> {
        *self.parked.lock().await = false;
        self.record(BeamEvent::Point).await;
        Ok(())
    }

    fn beam_count(&self) -> usize {
        self.beam_count
    }
}

// =============================================================================
// MockPowerMeter
// =============================================================================

/// Response of the mock meter to the commanded beam fraction, in watts.
pub type ResponseFn = Arc<dyn Fn(f64) -> f64 + Send + Sync>;

enum PowerSource {
    Fixed(f64),
    Following {
        beam: Arc<MockBeamController>,
        beam_index: usize,
        response: ResponseFn,
    },
}

#[derive(Debug, Default)]
struct MeterFaults {
    /// Number of upcoming reads that report a timeout.
    timeouts_remaining: usize,
    /// Fail every read after this many successful ones.
    fail_after_reads: Option<usize>,
    /// Extra latency per read.
    read_delay: Option<Duration>,
    /// Reject wavelength requests outright.
    reject_wavelength: bool,
    /// Refuse connection.
    unreachable: bool,
}

#[derive(Debug)]
struct MeterState {
    connected: bool,
    wavelength_nm: f64,
    averaging_s: f64,
    range_w: f64,
    attenuation_db: f64,
    brightness: f64,
    timeout_s: f64,
    reads: usize,
}

/// Mock optical power meter.
///
/// Reported ranges mimic a silicon photodiode head on a PM100-class console:
/// 400–1100 nm, 1 µW–0.5 W range, 1 ms–10 s averaging.
pub struct MockPowerMeter {
    name: String,
    source: PowerSource,
    noise_std_w: f64,
    rng: Mutex<StdRng>,
    state: Mutex<MeterState>,
    faults: Mutex<MeterFaults>,
    wavelength_range_nm: (f64, f64),
}

impl MockPowerMeter {
    /// Meter that always reads `watts`.
    pub fn new(watts: f64) -> Self {
        Self::with_source(PowerSource::Fixed(watts))
    }

    /// Meter whose reading is `response(current fraction of beam_index)`.
    pub fn following<F>(beam: Arc<MockBeamController>, beam_index: usize, response: F) -> Self
    where
        F: Fn(f64) -> f64 + Send + Sync + 'static,
    {
        Self::with_source(PowerSource::Following {
            beam,
            beam_index,
            response: Arc::new(response),
        })
    }

    fn with_source(source: PowerSource) -> Self {
        Self {
            name: "mock_power_meter".to_string(),
            source,
            noise_std_w: 0.0,
            rng: Mutex::new(StdRng::seed_from_u64(0x5eed)),
            state: Mutex::new(MeterState {
                connected: false,
                wavelength_nm: 920.0,
                averaging_s: 0.1,
                range_w: 0.5,
                attenuation_db: 0.0,
                brightness: 1.0,
                timeout_s: 5.0,
                reads: 0,
            }),
            faults: Mutex::new(MeterFaults::default()),
            wavelength_range_nm: (400.0, 1100.0),
        }
    }

    /// Add uniform noise of the given standard deviation (watts) to readings.
    pub fn with_noise(mut self, std_watts: f64, seed: u64) -> Self {
        self.noise_std_w = std_watts;
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Override the accepted wavelength range.
    pub fn with_wavelength_range(mut self, min_nm: f64, max_nm: f64) -> Self {
        self.wavelength_range_nm = (min_nm, max_nm);
        self
    }

    /// Make the next `count` reads report a timeout.
    pub async fn inject_timeouts(&self, count: usize) {
        self.faults.lock().await.timeouts_remaining = count;
    }

    /// Fail every read once `count` reads have succeeded.
    pub async fn fail_after_reads(&self, count: usize) {
        self.faults.lock().await.fail_after_reads = Some(count);
    }

    /// Delay every read by `delay`.
    pub async fn set_read_delay(&self, delay: Duration) {
        self.faults.lock().await.read_delay = Some(delay);
    }

    /// Reject all wavelength requests.
    pub async fn reject_wavelength(&self, reject: bool) {
        self.faults.lock().await.reject_wavelength = reject;
    }

    /// Refuse connections.
    pub async fn set_unreachable(&self, unreachable: bool) {
        self.faults.lock().await.unreachable = unreachable;
    }

    /// Number of successful reads.
    pub async fn read_count(&self) -> usize {
        self.state.lock().await.reads
    }

    /// Wavelength currently in effect.
    pub async fn wavelength_nm(&self) -> f64 {
        self.state.lock().await.wavelength_nm
    }

    /// Whether `connect()` has been called without a later `disconnect()`.
    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connected
    }

    async fn true_power(&self) -> f64 {
        match &self.source {
            PowerSource::Fixed(watts) => *watts,
            PowerSource::Following {
                beam,
                beam_index,
                response,
            } => {
                let fraction = beam.current_fraction(*beam_index).await.unwrap_or(0.0);
                response(fraction)
            }
        }
    }

    async fn ensure_connected(&self) -> Result<()> {
        if !self.state.lock().await.connected {
            return Err(DeviceError::Connection {
                device: self.name.clone(),
                reason: "not connected".into(),
            }
            .into());
        }
        Ok(())
    }

    async fn clamped_set<F>(&self, setting: &str, value: f64, min: f64, max: f64, apply: F) -> Result<ClampOutcome>
    where
        F: FnOnce(&mut MeterState, f64) + Send,
    {
        self.ensure_connected().await?;
        let outcome = apply_clamped(&self.name, setting, value, min, max);
        apply(&mut *self.state.lock().await, outcome.applied);
        Ok(outcome)
    }
}

#[async_trait]
impl PowerMeter for MockPowerMeter {
    async fn connect(&self) -> Result<()> {
        if self.faults.lock().await.unreachable {
            return Err(DeviceError::Connection {
                device: self.name.clone(),
                reason: "injected: device unreachable".into(),
            }
            .into());
        }
        self.state.lock().await.connected = true;
        tracing::debug!(device = %self.name, "Mock power meter connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.lock().await.connected = false;
        Ok(())
    }

    async fn set_wavelength(&self, nm: f64) -> Result<ClampOutcome> {
        self.ensure_connected().await?;
        if self.faults.lock().await.reject_wavelength {
            return Err(DeviceError::Rejected {
                device: self.name.clone(),
                operation: "set_wavelength".into(),
                reason: "injected rejection".into(),
            }
            .into());
        }
        let (min, max) = self.wavelength_range_nm;
        let outcome = apply_clamped(&self.name, "wavelength_nm", nm, min, max);
        self.state.lock().await.wavelength_nm = outcome.applied;
        Ok(outcome)
    }

    async fn read_power(&self) -> Result<f64> {
        self.ensure_connected().await?;

        let delay = {
            let mut faults = self.faults.lock().await;
            if faults.timeouts_remaining > 0 {
                faults.timeouts_remaining -= 1;
                return Err(DeviceError::Timeout {
                    device: self.name.clone(),
                    operation: "read_power".into(),
                }
                .into());
            }
            if let Some(limit) = faults.fail_after_reads {
                if self.state.lock().await.reads >= limit {
                    return Err(DeviceError::Communication {
                        device: self.name.clone(),
                        reason: format!("injected failure after {} reads", limit),
                    }
                    .into());
                }
            }
            faults.read_delay
        };

        if let Some(delay) = delay {
            sleep(delay).await;
        }

        let mut watts = self.true_power().await;
        if self.noise_std_w > 0.0 {
            // Uniform on [-a, a] has std a/sqrt(3).
            let half_width = self.noise_std_w * 3f64.sqrt();
            watts += self.rng.lock().await.gen_range(-half_width..=half_width);
        }

        self.state.lock().await.reads += 1;
        Ok(watts)
    }

    async fn read_temperature(&self) -> Result<f64> {
        self.ensure_connected().await?;
        Ok(23.5)
    }

    async fn set_averaging_time(&self, seconds: f64) -> Result<ClampOutcome> {
        self.clamped_set("averaging_time_s", seconds, 0.001, 10.0, |s, v| s.averaging_s = v)
            .await
    }

    async fn set_power_range(&self, watts: f64) -> Result<ClampOutcome> {
        self.clamped_set("power_range_w", watts, 1e-6, 0.5, |s, v| s.range_w = v)
            .await
    }

    async fn set_attenuation(&self, db: f64) -> Result<ClampOutcome> {
        self.clamped_set("attenuation_db", db, -60.0, 60.0, |s, v| s.attenuation_db = v)
            .await
    }

    async fn set_brightness(&self, fraction: f64) -> Result<ClampOutcome> {
        self.clamped_set("brightness", fraction, 0.0, 1.0, |s, v| s.brightness = v)
            .await
    }

    async fn set_timeout(&self, seconds: f64) -> Result<ClampOutcome> {
        self.clamped_set("timeout_s", seconds, 0.1, 60.0, |s, v| s.timeout_s = v)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn meter_follows_beam() {
        let beam = Arc::new(MockBeamController::new(1, 1.0));
        let meter = MockPowerMeter::following(beam.clone(), 0, |f| f * 2.0 + 0.01);
        meter.connect().await.unwrap();

        beam.set_power_fraction(0.25, 0).await.unwrap();
        assert!((meter.read_power().await.unwrap() - 0.51).abs() < 1e-12);
        assert_eq!(meter.read_count().await, 1);
    }

    #[tokio::test]
    async fn read_requires_connection() {
        let meter = MockPowerMeter::new(0.1);
        let err = meter.read_power().await.unwrap_err();
        assert!(DeviceError::is_connection(&err));
    }

    #[tokio::test]
    async fn wavelength_is_clamped_not_rejected() {
        let meter = MockPowerMeter::new(0.1);
        meter.connect().await.unwrap();

        let outcome = meter.set_wavelength(1300.0).await.unwrap();
        assert!(outcome.was_clamped);
        assert_eq!(outcome.applied, 1100.0);
        assert_eq!(meter.wavelength_nm().await, 1100.0);

        let outcome = meter.set_wavelength(800.0).await.unwrap();
        assert!(!outcome.was_clamped);
    }

    #[tokio::test]
    async fn every_setter_clamps() {
        let meter = MockPowerMeter::new(0.1);
        meter.connect().await.unwrap();

        assert_eq!(meter.set_averaging_time(100.0).await.unwrap().applied, 10.0);
        assert_eq!(meter.set_power_range(2.0).await.unwrap().applied, 0.5);
        assert_eq!(meter.set_attenuation(-80.0).await.unwrap().applied, -60.0);
        assert_eq!(meter.set_brightness(1.5).await.unwrap().applied, 1.0);
        assert_eq!(meter.set_timeout(0.0).await.unwrap().applied, 0.1);
        assert!(!meter.set_timeout(2.0).await.unwrap().was_clamped);
    }

    #[tokio::test]
    async fn injected_timeouts_are_consumed() {
        let meter = MockPowerMeter::new(0.1);
        meter.connect().await.unwrap();
        meter.inject_timeouts(1).await;

        let err = meter.read_power().await.unwrap_err();
        assert!(DeviceError::is_timeout(&err));
        assert!(meter.read_power().await.is_ok());
    }

    #[tokio::test]
    async fn noise_has_expected_spread() {
        let meter = MockPowerMeter::new(1.0).with_noise(0.01, 42);
        meter.connect().await.unwrap();

        let mut readings = Vec::new();
        for _ in 0..200 {
            readings.push(meter.read_power().await.unwrap());
        }
        assert!(readings.iter().all(|r| (r - 1.0).abs() <= 0.01 * 3f64.sqrt() + 1e-12));
        assert!(readings.iter().any(|r| (r - 1.0).abs() > 1e-6));
    }

    #[tokio::test]
    async fn beam_lookup_follows_limits() {
        let beam = MockBeamController::new(2, 1.0);
        assert_eq!(beam.power_fraction_to_watts(0.5, 1).await.unwrap(), 0.5);

        beam.set_power_limits(0.002, 0.102, 1).await.unwrap();
        let watts = beam.power_fraction_to_watts(0.5, 1).await.unwrap();
        assert!((watts - 0.052).abs() < 1e-12);
        assert!(beam.power_fraction_to_watts(0.5, 2).await.is_err());
        assert!(beam.set_power_limits(0.1, 0.0, 0).await.is_err());
    }

    #[tokio::test]
    async fn beam_fraction_is_clamped_and_park_zeroes() {
        let beam = MockBeamController::new(1, 1.0);
        beam.point().await.unwrap();
        beam.set_power_fraction(1.4, 0).await.unwrap();
        assert_eq!(beam.current_fraction(0).await, Some(1.0));
        assert!(!beam.is_parked().await);

        beam.park().await.unwrap();
        assert_eq!(beam.current_fraction(0).await, Some(0.0));
        assert_eq!(beam.park_count().await, 1);
        assert!(beam.is_parked().await);
    }
}
