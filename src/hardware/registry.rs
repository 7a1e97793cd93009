//! Device Registry for Calibration Hardware
//!
//! A caller-owned registry of the power meters and beam controllers a
//! calibration session uses. It replaces a process-global device cache: the
//! registry is created once (usually from [`crate::config::AppConfig`]),
//! passed to whatever needs devices, and torn down explicitly with
//! [`DeviceRegistry::shutdown`].
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                      DeviceRegistry                       │
//! │  ┌──────────────┐  ┌───────────────┐  ┌───────────────┐   │
//! │  │ "pm100"      │  │ "mock_meter"  │  │ "beam"        │   │
//! │  └──────────────┘  └───────────────┘  └───────────────┘   │
//! ├───────────────────────────────────────────────────────────┤
//! │              Capability Traits                            │
//! │          PowerMeter | BeamControl                         │
//! ├───────────────────────────────────────────────────────────┤
//! │              Drivers                                      │
//! │  ScpiPowerMeter | MockPowerMeter | MockBeamController     │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! let mut registry = DeviceRegistry::new();
//! registry.register(DeviceConfig {
//!     id: "beam".into(),
//!     name: "Simulated Pockels cell".into(),
//!     driver: DriverType::MockBeam { beam_count: 2, max_power_w: 0.3 },
//! }).await?;
//!
//! let beam = registry.beam("beam").unwrap();
//! beam.set_power_fraction(0.1, 0).await?;
//! registry.shutdown().await;
//! ```

use crate::hardware::capabilities::{BeamControl, PowerMeter};
use crate::hardware::mock::{MockBeamController, MockPowerMeter};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Device Identification
// =============================================================================

/// Unique identifier for a registered device
///
/// Format: lowercase alphanumeric with underscores (e.g., "pm100", "beam")
pub type DeviceId = String;

/// Capabilities a device can have (for introspection)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// Measures optical power
    PowerMeter,
    /// Controls laser beam power
    BeamControl,
}

// =============================================================================
// Driver Types (Configuration)
// =============================================================================

fn default_baud_rate() -> u32 {
    115_200
}

fn default_gain() -> f64 {
    1.0
}

fn default_beam_count() -> usize {
    1
}

/// Driver configuration for instantiating hardware
///
/// Each variant corresponds to a driver with its required configuration.
/// Deserializes from a `type = "..."` tagged TOML table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriverType {
    /// PM100-style SCPI power meter on a serial/USB-CDC port
    ScpiPowerMeter {
        /// Serial port path (e.g., "/dev/ttyUSB0", "COM3")
        port: String,
        /// Baud rate
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },

    /// Mock power meter
    ///
    /// Reads `reading_w` when `follows` is unset, otherwise
    /// `gain * fraction * max_power + offset_w` of the followed mock beam.
    MockPowerMeter {
        /// Fixed reading in watts
        #[serde(default)]
        reading_w: f64,
        /// Device id of a registered mock beam controller to follow
        #[serde(default)]
        follows: Option<DeviceId>,
        /// Which beam of the followed controller
        #[serde(default)]
        beam_index: usize,
        /// Multiplicative error of the simulated beam path
        #[serde(default = "default_gain")]
        gain: f64,
        /// Additive offset in watts
        #[serde(default)]
        offset_w: f64,
        /// Reading noise standard deviation in watts
        #[serde(default)]
        noise_w: f64,
    },

    /// Mock beam controller
    MockBeam {
        /// Number of beams
        #[serde(default = "default_beam_count")]
        beam_count: usize,
        /// Power at fraction 1.0 in watts
        max_power_w: f64,
    },
}

impl DriverType {
    /// Get the capabilities this driver type provides
    pub fn capabilities(&self) -> Vec<Capability> {
        match self {
            DriverType::ScpiPowerMeter { .. } => vec![Capability::PowerMeter],
            DriverType::MockPowerMeter { .. } => vec![Capability::PowerMeter],
            DriverType::MockBeam { .. } => vec![Capability::BeamControl],
        }
    }

    /// Get human-readable driver type name
    pub fn driver_name(&self) -> &'static str {
        match self {
            DriverType::ScpiPowerMeter { .. } => "scpi_power_meter",
            DriverType::MockPowerMeter { .. } => "mock_power_meter",
            DriverType::MockBeam { .. } => "mock_beam",
        }
    }
}

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for registering a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique identifier (e.g., "pm100", "beam")
    pub id: DeviceId,
    /// Human-readable name
    #[serde(default)]
    pub name: String,
    /// Driver type and configuration
    pub driver: DriverType,
}

/// Information about a registered device (returned by list operations)
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    /// Unique identifier
    pub id: DeviceId,
    /// Human-readable name
    pub name: String,
    /// Driver type name (e.g., "scpi_power_meter")
    pub driver_type: String,
    /// Capabilities this device supports
    pub capabilities: Vec<Capability>,
}

// =============================================================================
// Registered Device (Internal)
// =============================================================================

struct RegisteredDevice {
    config: DeviceConfig,
    power_meter: Option<Arc<dyn PowerMeter>>,
    beam: Option<Arc<dyn BeamControl>>,
    /// Concrete handle kept so mock meters can follow a mock beam
    mock_beam: Option<Arc<MockBeamController>>,
}

// =============================================================================
// Device Registry
// =============================================================================

/// Central registry for calibration hardware.
///
/// Devices are kept in id order so listings are stable.
pub struct DeviceRegistry {
    devices: BTreeMap<DeviceId, RegisteredDevice>,
}

impl DeviceRegistry {
    /// Create a new empty device registry
    pub fn new() -> Self {
        Self {
            devices: BTreeMap::new(),
        }
    }

    /// Register a device from configuration
    ///
    /// Instantiates the driver and, for power meters, connects it.
    ///
    /// # Errors
    /// Returns error if:
    /// - Device ID is already registered
    /// - A followed mock beam is not registered
    /// - The driver fails to open or connect
    pub async fn register(&mut self, config: DeviceConfig) -> Result<()> {
        if self.devices.contains_key(&config.id) {
            return Err(anyhow!("Device '{}' is already registered", config.id));
        }

        let registered = self.instantiate_device(config).await?;
        if let Some(meter) = &registered.power_meter {
            meter.connect().await?;
        }
        tracing::info!(
            device = %registered.config.id,
            driver = registered.config.driver.driver_name(),
            "Device registered"
        );
        self.devices.insert(registered.config.id.clone(), registered);
        Ok(())
    }

    /// Register a pre-built power meter (already-open transport, test double).
    pub async fn register_power_meter(
        &mut self,
        id: impl Into<DeviceId>,
        name: impl Into<String>,
        driver: DriverType,
        meter: Arc<dyn PowerMeter>,
    ) -> Result<()> {
        let id = id.into();
        if self.devices.contains_key(&id) {
            return Err(anyhow!("Device '{}' is already registered", id));
        }
        meter.connect().await?;
        self.devices.insert(
            id.clone(),
            RegisteredDevice {
                config: DeviceConfig {
                    id,
                    name: name.into(),
                    driver,
                },
                power_meter: Some(meter),
                beam: None,
                mock_beam: None,
            },
        );
        Ok(())
    }

    /// Unregister a device, disconnecting it if it is a power meter
    ///
    /// # Returns
    /// true if device was found and removed, false if not found
    pub async fn unregister(&mut self, id: &str) -> bool {
        match self.devices.remove(id) {
            Some(device) => {
                if let Some(meter) = device.power_meter {
                    if let Err(e) = meter.disconnect().await {
                        tracing::warn!(device = id, "Disconnect failed: {:#}", e);
                    }
                }
                true
            }
            None => false,
        }
    }

    /// List all registered devices
    pub fn list_devices(&self) -> Vec<DeviceInfo> {
        self.devices
            .values()
            .map(|d| DeviceInfo {
                id: d.config.id.clone(),
                name: d.config.name.clone(),
                driver_type: d.config.driver.driver_name().to_string(),
                capabilities: d.config.driver.capabilities(),
            })
            .collect()
    }

    /// Check if a device is registered
    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    /// Get count of registered devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Get a device as PowerMeter (if it supports this capability)
    pub fn power_meter(&self, id: &str) -> Option<Arc<dyn PowerMeter>> {
        self.devices.get(id).and_then(|d| d.power_meter.clone())
    }

    /// Get a device as BeamControl (if it supports this capability)
    pub fn beam(&self, id: &str) -> Option<Arc<dyn BeamControl>> {
        self.devices.get(id).and_then(|d| d.beam.clone())
    }

    /// Get all devices that support a specific capability
    pub fn devices_with_capability(&self, capability: Capability) -> Vec<DeviceId> {
        self.devices
            .iter()
            .filter(|(_, d)| d.config.driver.capabilities().contains(&capability))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Disconnect every power meter and park every beam, then empty the registry.
    ///
    /// Failures are logged and do not stop the remaining devices from being
    /// shut down.
    pub async fn shutdown(&mut self) {
        for (id, device) in std::mem::take(&mut self.devices) {
            if let Some(beam) = device.beam {
                if let Err(e) = beam.park().await {
                    tracing::warn!(device = %id, "Park on shutdown failed: {:#}", e);
                }
            }
            if let Some(meter) = device.power_meter {
                if let Err(e) = meter.disconnect().await {
                    tracing::warn!(device = %id, "Disconnect on shutdown failed: {:#}", e);
                }
            }
        }
        tracing::info!("Device registry shut down");
    }

    // =========================================================================
    // Device Instantiation (Private)
    // =========================================================================

    async fn instantiate_device(&self, config: DeviceConfig) -> Result<RegisteredDevice> {
        match &config.driver {
            DriverType::MockBeam {
                beam_count,
                max_power_w,
            } => {
                if *beam_count == 0 {
                    return Err(anyhow!("Mock beam '{}' needs at least one beam", config.id));
                }
                let driver = Arc::new(MockBeamController::new(*beam_count, *max_power_w));
                Ok(RegisteredDevice {
                    config,
                    power_meter: None,
                    beam: Some(driver.clone()),
                    mock_beam: Some(driver),
                })
            }

            DriverType::MockPowerMeter {
                reading_w,
                follows,
                beam_index,
                gain,
                offset_w,
                noise_w,
            } => {
                let mut meter = match follows {
                    None => MockPowerMeter::new(*reading_w),
                    Some(beam_id) => {
                        let beam = self
                            .devices
                            .get(beam_id)
                            .and_then(|d| d.mock_beam.clone())
                            .ok_or_else(|| {
                                anyhow!(
                                    "Mock power meter '{}' follows unknown mock beam '{}'",
                                    config.id,
                                    beam_id
                                )
                            })?;
                        let max_w = beam
                            .power_limits(*beam_index)
                            .await
                            .map(|(_, max)| max)
                            .ok_or_else(|| anyhow!("Beam index {} out of range", beam_index))?;
                        let (gain, offset) = (*gain, *offset_w);
                        MockPowerMeter::following(beam, *beam_index, move |f| {
                            gain * f * max_w + offset
                        })
                    }
                };
                if *noise_w > 0.0 {
                    meter = meter.with_noise(*noise_w, 0x5eed);
                }
                Ok(RegisteredDevice {
                    config,
                    power_meter: Some(Arc::new(meter)),
                    beam: None,
                    mock_beam: None,
                })
            }

            #[cfg(feature = "instrument_serial")]
            DriverType::ScpiPowerMeter { port, baud_rate } => {
                let driver = crate::hardware::scpi_power_meter::ScpiPowerMeter::open_serial(
                    port, *baud_rate,
                )?;
                Ok(RegisteredDevice {
                    config,
                    power_meter: Some(Arc::new(driver)),
                    beam: None,
                    mock_beam: None,
                })
            }

            #[cfg(not(feature = "instrument_serial"))]
            DriverType::ScpiPowerMeter { .. } => Err(anyhow!(
                "SCPI power meter driver requires 'instrument_serial' feature"
            )),
        }
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry with a one-beam mock controller ("mock_beam") and a meter
/// ("mock_power_meter") that reads the beam's power with a 5 % gain error
/// and a 2 mW offset.
pub async fn create_mock_registry(max_power_w: f64) -> Result<DeviceRegistry> {
    let mut registry = DeviceRegistry::new();

    registry
        .register(DeviceConfig {
            id: "mock_beam".into(),
            name: "Mock Beam Controller".into(),
            driver: DriverType::MockBeam {
                beam_count: 1,
                max_power_w,
            },
        })
        .await?;

    registry
        .register(DeviceConfig {
            id: "mock_power_meter".into(),
            name: "Mock Power Meter".into(),
            driver: DriverType::MockPowerMeter {
                reading_w: 0.0,
                follows: Some("mock_beam".into()),
                beam_index: 0,
                gain: 1.05,
                offset_w: 0.002,
                noise_w: 0.0,
            },
        })
        .await?;

    Ok(registry)
}

// =============================================================================
// Tests
// =============================================================================
