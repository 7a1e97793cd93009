//! Configuration loading using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults
//! 2. A TOML file (default `config/laser_power_cal.toml`)
//! 3. Environment variables prefixed with `LPC_`, nested keys separated by
//!    `__` (e.g. `LPC_SWEEP__NUM_STEPS=21`, `LPC_APPLICATION__LOG_LEVEL=debug`)
//!
//! # Example
//! ```no_run
//! use laser_power_cal::config::AppConfig;
//!
//! let config = AppConfig::load()?;
//! config.validate()?;
//! println!("Sweeping beam {}", config.sweep.beam_index);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::hardware::registry::{Capability, DeviceConfig};
use crate::procedures::SweepConfiguration;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "config/laser_power_cal.toml";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "LPC_";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Sweep parameters
    #[serde(default)]
    pub sweep: SweepConfiguration,
    /// Which registered devices the sweep uses
    #[serde(default)]
    pub session: SessionConfig,
    /// Where results are written
    #[serde(default)]
    pub storage: StorageConfig,
    /// Device definitions
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Device roles for a sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Device id of the beam controller
    #[serde(default = "default_beam_device")]
    pub beam: String,
    /// Device id of the power meter
    #[serde(default = "default_meter_device")]
    pub power_meter: String,
}

/// Result storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Output directory for result files
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// File name prefix
    #[serde(default = "default_file_stem")]
    pub file_stem: String,
}

// Default value functions
fn default_app_name() -> String {
    "laser_power_cal".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_beam_device() -> String {
    "mock_beam".to_string()
}

fn default_meter_device() -> String {
    "mock_power_meter".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_file_stem() -> String {
    "power_calibration".to_string()
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            beam: default_beam_device(),
            power_meter: default_meter_device(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            file_stem: default_file_stem(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            sweep: SweepConfiguration::default(),
            session: SessionConfig::default(),
            storage: StorageConfig::default(),
            devices: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default file and environment variables.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path.as_ref()).extract()
    }

    /// The layered provider stack, for callers that merge extra sources.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        self.sweep.validate().map_err(|e| e.to_string())?;

        if self.storage.file_stem.is_empty() {
            return Err("storage.file_stem must not be empty".to_string());
        }

        let mut ids = std::collections::HashSet::new();
        for device in &self.devices {
            if !ids.insert(&device.id) {
                return Err(format!("Duplicate device ID: {}", device.id));
            }
        }

        // Session roles are only checked when devices are configured; an
        // empty device list means the caller supplies devices itself.
        if !self.devices.is_empty() {
            self.check_role(&self.session.beam, Capability::BeamControl)?;
            self.check_role(&self.session.power_meter, Capability::PowerMeter)?;
        }

        Ok(())
    }

    fn check_role(&self, id: &str, capability: Capability) -> Result<(), String> {
        let device = self
            .devices
            .iter()
            .find(|d| d.id == id)
            .ok_or_else(|| format!("Session refers to unknown device '{}'", id))?;
        if !device.driver.capabilities().contains(&capability) {
            return Err(format!(
                "Device '{}' ({}) has no {:?} capability",
                id,
                device.driver.driver_name(),
                capability
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::registry::DriverType;
    use figment::Jail;

    fn mock_devices() -> Vec<DeviceConfig> {
        vec![
            DeviceConfig {
                id: "mock_beam".into(),
                name: String::new(),
                driver: DriverType::MockBeam {
                    beam_count: 1,
                    max_power_w: 0.5,
                },
            },
            DeviceConfig {
                id: "mock_power_meter".into(),
                name: String::new(),
                driver: DriverType::MockPowerMeter {
                    reading_w: 0.0,
                    follows: Some("mock_beam".into()),
                    beam_index: 0,
                    gain: 1.0,
                    offset_w: 0.0,
                    noise_w: 0.0,
                },
            },
        ]
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.storage.file_stem, "power_calibration");
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = AppConfig::default();
        config.application.log_level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_sweep_rejected() {
        let mut config = AppConfig::default();
        config.sweep.num_steps = 1;
        let err = config.validate().unwrap_err();
        assert!(err.contains("num_steps"));
    }

    #[test]
    fn test_duplicate_device_ids() {
        let mut config = AppConfig {
            devices: mock_devices(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        let duplicate = config.devices[0].clone();
        config.devices.push(duplicate);
        assert!(config.validate().unwrap_err().contains("Duplicate"));
    }

    #[test]
    fn test_session_role_needs_capability() {
        let mut config = AppConfig {
            devices: mock_devices(),
            ..Default::default()
        };
        config.session.beam = "mock_power_meter".into();
        assert!(config.validate().unwrap_err().contains("BeamControl"));

        config.session.beam = "missing".into();
        assert!(config.validate().unwrap_err().contains("unknown device"));
    }

    #[test]
    fn test_load_file_and_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "cal.toml",
                r#"
                [application]
                log_level = "debug"

                [sweep]
                num_steps = 21
                sample_reps = 4
                laser_wavelength_nm = 1040.0

                [session]
                beam = "beam"
                power_meter = "meter"

                [[devices]]
                id = "beam"
                driver = { type = "mock_beam", max_power_w = 0.3 }

                [[devices]]
                id = "meter"
                driver = { type = "mock_power_meter", follows = "beam" }
                "#,
            )?;
            jail.set_env("LPC_SWEEP__SAMPLE_REPS", "2");

            let config = AppConfig::load_from("cal.toml")?;
            assert_eq!(config.application.log_level, "debug");
            assert_eq!(config.sweep.num_steps, 21);
            assert_eq!(config.sweep.sample_reps, 2);
            assert_eq!(config.sweep.laser_wavelength_nm, 1040.0);
            assert_eq!(config.sweep.settling_time_secs, 0.2);
            assert_eq!(config.devices.len(), 2);
            assert!(config.validate().is_ok());
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        Jail::expect_with(|_jail| {
            let config = AppConfig::load_from("does_not_exist.toml")?;
            assert_eq!(config, AppConfig::default());
            Ok(())
        });
    }
}
