//! CLI Entry Point for laser_power_cal
//!
//! Provides command-line interface for:
//! - Running a calibration sweep against configured or simulated devices
//! - Re-fitting a saved result
//! - Listing configured devices
//!
//! # Usage
//!
//! ```bash
//! laser_power_cal sweep --mock
//! laser_power_cal --config config/laser_power_cal.toml sweep --push-calibration
//! laser_power_cal refit data/power_calibration_20240501_101500_beam0.json
//! laser_power_cal devices
//! ```

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use laser_power_cal::config::{AppConfig, DEFAULT_CONFIG_PATH};
use laser_power_cal::hardware::registry::{create_mock_registry, DeviceRegistry};
use laser_power_cal::logging::{self, OutputFormat, TracingConfig};
use laser_power_cal::procedures::{push_calibration, SweepRecorder};
use laser_power_cal::storage::{JsonFileSink, ResultSink};
use laser_power_cal::SweepError;
use std::path::PathBuf;
use tracing::{info, warn};

/// Full-scale power of the simulated beam in `--mock` mode (W)
const MOCK_MAX_POWER_W: f64 = 0.5;

#[derive(Parser)]
#[command(name = "laser_power_cal")]
#[command(about = "Laser power calibration sweeps", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Compact)]
    log_format: OutputFormat,

    /// Log span open/close events (sweep timing)
    #[arg(long, global = true)]
    log_spans: bool,

    /// Disable colored log output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one calibration sweep and save the result
    Sweep {
        /// Use simulated devices instead of the configured ones
        #[arg(long)]
        mock: bool,

        /// Write the fitted power limits back to the beam controller
        #[arg(long)]
        push_calibration: bool,

        /// Override the number of steps
        #[arg(long)]
        steps: Option<usize>,

        /// Override the readings per step
        #[arg(long)]
        reps: Option<usize>,

        /// Override the output directory
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },

    /// Re-fit a saved result and print the summary
    Refit {
        /// Path to a saved JSON result
        file: PathBuf,
    },

    /// List configured devices
    Devices {
        /// List the simulated devices instead
        #[arg(long)]
        mock: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let tracing_config = TracingConfig::from_app_config(&config)
        .map_err(|e| anyhow!(e))?
        .with_format(cli.log_format)
        .with_span_events(cli.log_spans)
        .with_ansi(!cli.no_color);
    logging::init(tracing_config).map_err(|e| anyhow!(e))?;

    match cli.command {
        Commands::Sweep {
            mock,
            push_calibration,
            steps,
            reps,
            output_dir,
        } => {
            if let Some(steps) = steps {
                config.sweep.num_steps = steps;
            }
            if let Some(reps) = reps {
                config.sweep.sample_reps = reps;
            }
            if let Some(dir) = output_dir {
                config.storage.output_dir = dir;
            }
            if mock {
                config.session = Default::default();
                config.devices.clear();
            }
            config.validate().map_err(|e| anyhow!(e))?;
            run_sweep(&config, mock, push_calibration).await
        }
        Commands::Refit { file } => refit(file).await,
        Commands::Devices { mock } => {
            if mock {
                config.session = Default::default();
                config.devices.clear();
            }
            config.validate().map_err(|e| anyhow!(e))?;
            list_devices(&config, mock).await
        }
    }
}

async fn build_registry(config: &AppConfig, mock: bool) -> Result<DeviceRegistry> {
    if mock {
        info!("Using simulated devices");
        return create_mock_registry(MOCK_MAX_POWER_W).await;
    }
    if config.devices.is_empty() {
        bail!("No devices configured; add [[devices]] to the config or pass --mock");
    }
    let mut registry = DeviceRegistry::new();
    for device in &config.devices {
        registry
            .register(device.clone())
            .await
            .with_context(|| format!("registering device '{}'", device.id))?;
    }
    Ok(registry)
}

async fn run_sweep(config: &AppConfig, mock: bool, push: bool) -> Result<()> {
    let mut registry = build_registry(config, mock).await?;
    let outcome = sweep_with_registry(config, &registry, push).await;
    registry.shutdown().await;
    outcome
}

async fn sweep_with_registry(config: &AppConfig, registry: &DeviceRegistry, push: bool) -> Result<()> {
    let beam = registry
        .beam(&config.session.beam)
        .ok_or_else(|| anyhow!("Beam controller '{}' not registered", config.session.beam))?;
    let meter = registry
        .power_meter(&config.session.power_meter)
        .ok_or_else(|| anyhow!("Power meter '{}' not registered", config.session.power_meter))?;

    let mut recorder = SweepRecorder::new();

    let cancel = recorder.cancel_token();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping after the current step");
            cancel.cancel();
        }
    });

    let mut progress = recorder.subscribe();
    let reporter = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let p = progress.borrow_and_update().clone();
            if let (Some(percent), Some(mean), Some(predicted)) =
                (p.commanded_percent, p.mean_observed_mw, p.predicted_mw)
            {
                println!(
                    "[{:>3.0}%] step {}/{}: {:6.1}% -> observed {:8.2} mW, predicted {:8.2} mW",
                    p.overall_progress() * 100.0,
                    p.completed_steps,
                    p.total_steps,
                    percent,
                    mean,
                    predicted
                );
            }
        }
    });

    let outcome = recorder.run_sweep(&config.sweep, beam.as_ref(), meter.as_ref()).await;
    ctrl_c.abort();
    reporter.abort();

    let sink = JsonFileSink::new();
    let result = match outcome {
        Ok(result) => result,
        Err(SweepError::PartialSweep(partial)) => {
            let stem = format!("{}_partial", config.storage.file_stem);
            match sink.save(&partial.result, &config.storage.output_dir, &stem).await {
                Ok(path) => warn!(path = %path.display(), "Saved partial result"),
                Err(e) => warn!("Could not save partial result: {}", e),
            }
            return Err(SweepError::PartialSweep(partial).into());
        }
        Err(e) => return Err(e.into()),
    };

    let path = sink
        .save(&result, &config.storage.output_dir, &config.storage.file_stem)
        .await?;
    println!("{}", result.summary());
    println!("Saved to {}", path.display());

    if push {
        let bounds = result
            .fitted_min_max_mw
            .ok_or_else(|| anyhow!("Result has no fitted bounds"))?;
        let (min_w, max_w) = push_calibration(beam.as_ref(), bounds, config.sweep.beam_index).await?;
        println!(
            "Pushed power limits {:.3}..{:.3} W to beam {}",
            min_w, max_w, config.sweep.beam_index
        );
    }

    Ok(())
}

async fn refit(file: PathBuf) -> Result<()> {
    let mut result = JsonFileSink::load(&file).await?;
    let previous = result.fitted_line;
    let line = result.apply_fit()?;

    if let Some(prev) = previous {
        if prev != line {
            warn!(
                stored_slope = prev.slope,
                stored_intercept = prev.intercept,
                "Stored fit differs from recomputed fit"
            );
        }
    }
    println!("{}", result.summary());
    Ok(())
}

async fn list_devices(config: &AppConfig, mock: bool) -> Result<()> {
    let mut registry = build_registry(config, mock).await?;
    for device in registry.list_devices() {
        println!(
            "{:<20} {:<18} {:<24} {:?}",
            device.id, device.driver_type, device.name, device.capabilities
        );
    }
    registry.shutdown().await;
    Ok(())
}
