//! The shipped configuration file loads, validates and drives a sweep.

use laser_power_cal::config::AppConfig;
use laser_power_cal::hardware::registry::{Capability, DeviceRegistry};
use laser_power_cal::procedures::SweepRecorder;
use std::path::PathBuf;

fn shipped_config() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/laser_power_cal.toml")
}

#[test]
fn test_shipped_config_is_valid() {
    let config = AppConfig::load_from(shipped_config()).unwrap();
    assert!(config.validate().is_ok());
    assert_eq!(config.session.beam, "beam");
    assert_eq!(config.devices.len(), 2);
}

#[tokio::test]
async fn test_shipped_config_runs_a_sweep() {
    let mut config = AppConfig::load_from(shipped_config()).unwrap();
    config.sweep.settling_time_secs = 0.0;
    config.sweep.zero_delay_secs = 0.0;

    let mut registry = DeviceRegistry::new();
    for device in &config.devices {
        registry.register(device.clone()).await.unwrap();
    }
    assert_eq!(
        registry.devices_with_capability(Capability::PowerMeter),
        vec!["pm100".to_string()]
    );

    let beam = registry.beam(&config.session.beam).unwrap();
    let meter = registry.power_meter(&config.session.power_meter).unwrap();
    let result = SweepRecorder::new()
        .run_sweep(&config.sweep, beam.as_ref(), meter.as_ref())
        .await
        .unwrap();

    // 5 % gain error and 2 mW offset configured on the simulated meter.
    let line = result.fitted_line.unwrap();
    assert!((line.slope - 1.05).abs() < 0.01);
    assert!((line.intercept - 2.0).abs() < 1.0);

    registry.shutdown().await;
}
