//! SCPI Optical Power Meter Driver
//!
//! Reference: Thorlabs PM100 series SCPI command set
//!
//! Protocol Overview:
//! - Format: SCPI, one command per line
//! - Terminator: LF (\n)
//! - Setters are silent; queries end in `?` and answer one line
//! - Ranges are discoverable: `<setting>? MIN` / `<setting>? MAX`
//!
//! | Operation | Command |
//! |-----------|---------|
//! | identify | `*IDN?` |
//! | wavelength | `SENS:CORR:WAV <nm>` / `SENS:CORR:WAV?` |
//! | power | `MEAS:POW?` (watts) |
//! | temperature | `MEAS:TEMP?` (°C, thermal heads only) |
//! | averaging | `SENS:AVER:COUN <n>` (n × 3 ms) |
//! | range | `SENS:POW:RANG <W>` |
//! | attenuation | `SENS:CORR:LOSS:INP:MAGN <dB>` |
//! | brightness | `DISP:BRIG <0..1>` |
//!
//! # Important Notes
//!
//! - Every range-limited setter first queries MIN/MAX and clamps locally, so
//!   the meter never sees an out-of-range value
//! - The meter answers queries in order. A reply that arrives after its
//!   query timed out is still owed; the driver counts owed replies and
//!   discards late ones, so a slow answer is never read as the answer to a
//!   later query
//! - The driver is generic over its transport; any
//!   `AsyncRead + AsyncWrite` stream works (serial port, TCP socket,
//!   in-memory duplex in tests)
//!
//! # Example Usage
//!
//! ```no_run
//! # #[cfg(feature = "instrument_serial")]
//! # async fn demo() -> anyhow::Result<()> {
//! use laser_power_cal::hardware::scpi_power_meter::ScpiPowerMeter;
//! use laser_power_cal::hardware::capabilities::PowerMeter;
//!
//! let meter = ScpiPowerMeter::open_serial("/dev/ttyUSB0", 115_200)?;
//! meter.connect().await?;
//! meter.set_wavelength(920.0).await?;
//! let watts = meter.read_power().await?;
//! println!("Power: {:.3e} W", watts);
//! # Ok(())
//! # }
//! ```

use crate::error::DeviceError;
use crate::hardware::capabilities::PowerMeter;
use crate::hardware::clamp::{apply_clamped, ClampOutcome};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

/// Seconds per averaged sample on PM100-class consoles.
const AVERAGING_SAMPLE_S: f64 = 0.003;
const MAX_AVERAGING_COUNT: f64 = 10_000.0;

/// Local bounds for the driver-side timeout.
const MIN_TIMEOUT_S: f64 = 0.1;
const MAX_TIMEOUT_S: f64 = 60.0;

/// Transport plus the reply bookkeeping that must survive a dropped query.
struct Link<T> {
    reader: BufReader<T>,
    /// Bytes of a reply line read so far
    partial: Vec<u8>,
    /// Replies the meter still has to send, including late ones
    owed: usize,
}

impl<T> Link<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Next complete line, or `None` at end of stream.
    ///
    /// Cancel-safe: an interrupted read leaves its bytes in `partial`.
    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        loop {
            let read = self.reader.read_until(b'\n', &mut self.partial).await?;
            if read == 0 {
                return Ok(None);
            }
            if self.partial.last() == Some(&b'\n') {
                let line = String::from_utf8_lossy(&self.partial).trim().to_string();
                self.partial.clear();
                self.owed = self.owed.saturating_sub(1);
                return Ok(Some(line));
            }
        }
    }
}

/// Driver for a SCPI power meter over an arbitrary byte stream.
pub struct ScpiPowerMeter<T> {
    name: String,
    /// Transport protected by Mutex for exclusive access
    link: Mutex<Link<T>>,
    /// Per-command timeout
    timeout: Mutex<Duration>,
    /// Identity string reported on connect
    identity: Mutex<Option<String>>,
}

#[cfg(feature = "instrument_serial")]
impl ScpiPowerMeter<tokio_serial::SerialStream> {
    /// Open a serial (or USB-CDC) port at 8N1, no flow control.
    ///
    /// # Errors
    /// Returns `DeviceError::Connection` if the port cannot be opened
    pub fn open_serial(port_path: &str, baud_rate: u32) -> Result<Self> {
        use tokio_serial::SerialPortBuilderExt;

        let port = tokio_serial::new(port_path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| DeviceError::Connection {
                device: port_path.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self::new(port_path, port))
    }
}

impl<T> ScpiPowerMeter<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an already-open transport.
    pub fn new(name: impl Into<String>, transport: T) -> Self {
        Self {
            name: name.into(),
            link: Mutex::new(Link {
                reader: BufReader::new(transport),
                partial: Vec::new(),
                owed: 0,
            }),
            timeout: Mutex::new(Duration::from_secs(2)),
            identity: Mutex::new(None),
        }
    }

    /// Identity string from `*IDN?`, once connected.
    pub async fn identity(&self) -> Option<String> {
        self.identity.lock().await.clone()
    }

    /// Parse a numeric response; SCPI meters answer in scientific notation.
    fn parse_number(&self, command: &str, response: &str) -> Result<f64> {
        let trimmed = response.trim();
        if trimmed.is_empty() {
            return Err(self.communication(format!("empty response to '{}'", command)));
        }
        trimmed.parse::<f64>().map_err(|_| {
            self.communication(format!(
                "unparseable response to '{}': '{}'",
                command, trimmed
            ))
        })
    }

    fn communication(&self, reason: String) -> anyhow::Error {
        DeviceError::Communication {
            device: self.name.clone(),
            reason,
        }
        .into()
    }

    /// Send query and read its response line.
    ///
    /// Replies still owed to earlier, timed-out queries arrive first and are
    /// discarded.
    async fn query(&self, command: &str) -> Result<String> {
        let timeout = *self.timeout.lock().await;
        let mut link = self.link.lock().await;

        let cmd = format!("{}\n", command);
        let port = link.reader.get_mut();
        port.write_all(cmd.as_bytes())
            .await
            .with_context(|| format!("{} write failed", self.name))?;
        port.flush().await?;
        link.owed += 1;

        let reply = tokio::time::timeout(timeout, async {
            while let Some(line) = link.next_line().await? {
                if link.owed == 0 {
                    return Ok(Some(line));
                }
                tracing::debug!(device = %self.name, reply = %line, "Discarding late reply");
            }
            Ok::<_, std::io::Error>(None)
        })
        .await;

        match reply {
            Ok(Ok(Some(line))) => Ok(line),
            Ok(Ok(None)) => Err(self.communication("unexpected end of stream".into())),
            Ok(Err(e)) => Err(anyhow::Error::from(e).context(format!("{} read failed", self.name))),
            Err(_) => {
                tracing::warn!(
                    device = %self.name,
                    command,
                    owed = link.owed,
                    "Query timed out; its reply will be discarded when it arrives"
                );
                Err(DeviceError::Timeout {
                    device: self.name.clone(),
                    operation: command.to_string(),
                }
                .into())
            }
        }
    }

    async fn query_f64(&self, command: &str) -> Result<f64> {
        let response = self.query(command).await?;
        self.parse_number(command, &response)
    }

    /// Send a setter; SCPI setters produce no response.
    async fn send(&self, command: &str) -> Result<()> {
        let mut link = self.link.lock().await;
        let port = link.reader.get_mut();
        let cmd = format!("{}\n", command);
        port.write_all(cmd.as_bytes())
            .await
            .with_context(|| format!("{} write failed", self.name))?;
        port.flush().await?;
        Ok(())
    }

    /// Query the `MIN` and `MAX` of a setting.
    async fn range(&self, setting: &str) -> Result<(f64, f64)> {
        let min = self.query_f64(&format!("{}? MIN", setting)).await?;
        let max = self.query_f64(&format!("{}? MAX", setting)).await?;
        Ok((min, max))
    }

    /// Clamp against the device-reported range, then apply.
    async fn set_ranged(&self, label: &str, setting: &str, value: f64) -> Result<ClampOutcome> {
        self.ensure_connected().await?;
        let (min, max) = self.range(setting).await?;
        let outcome = apply_clamped(&self.name, label, value, min, max);
        self.send(&format!("{} {}", setting, outcome.applied)).await?;
        Ok(outcome)
    }

    async fn ensure_connected(&self) -> Result<()> {
        if self.identity.lock().await.is_none() {
            return Err(DeviceError::Connection {
                device: self.name.clone(),
                reason: "not connected".into(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl<T> PowerMeter for ScpiPowerMeter<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn connect(&self) -> Result<()> {
        let idn = self.query("*IDN?").await.map_err(|e| {
            anyhow::Error::from(DeviceError::Connection {
                device: self.name.clone(),
                reason: format!("{:#}", e),
            })
        })?;
        if idn.is_empty() {
            return Err(DeviceError::Connection {
                device: self.name.clone(),
                reason: "empty *IDN? response".into(),
            }
            .into());
        }
        tracing::info!(device = %self.name, identity = %idn, "Power meter connected");
        *self.identity.lock().await = Some(idn);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.identity.lock().await.take().is_some() {
            tracing::info!(device = %self.name, "Power meter disconnected");
        }
        Ok(())
    }

    async fn set_wavelength(&self, nm: f64) -> Result<ClampOutcome> {
        let mut outcome = self.set_ranged("wavelength_nm", "SENS:CORR:WAV", nm).await?;
        // The meter may quantize; report what it actually holds.
        let applied = self.query_f64("SENS:CORR:WAV?").await?;
        if (applied - outcome.applied).abs() > 1e-9 {
            tracing::warn!(
                device = %self.name,
                requested = nm,
                applied,
                "Meter quantized wavelength"
            );
            outcome.applied = applied;
            outcome.was_clamped = true;
        }
        Ok(outcome)
    }

    async fn read_power(&self) -> Result<f64> {
        self.ensure_connected().await?;
        self.query_f64("MEAS:POW?").await
    }

    async fn read_temperature(&self) -> Result<f64> {
        self.ensure_connected().await?;
        self.query_f64("MEAS:TEMP?").await
    }

    async fn set_averaging_time(&self, seconds: f64) -> Result<ClampOutcome> {
        self.ensure_connected().await?;
        let outcome = apply_clamped(
            &self.name,
            "averaging_time_s",
            seconds,
            AVERAGING_SAMPLE_S,
            AVERAGING_SAMPLE_S * MAX_AVERAGING_COUNT,
        );
        let count = (outcome.applied / AVERAGING_SAMPLE_S).round().max(1.0);
        self.send(&format!("SENS:AVER:COUN {}", count as u32)).await?;
        Ok(ClampOutcome {
            applied: count * AVERAGING_SAMPLE_S,
            ..outcome
        })
    }

    async fn set_power_range(&self, watts: f64) -> Result<ClampOutcome> {
        self.set_ranged("power_range_w", "SENS:POW:RANG", watts).await
    }

    async fn set_attenuation(&self, db: f64) -> Result<ClampOutcome> {
        self.set_ranged("attenuation_db", "SENS:CORR:LOSS:INP:MAGN", db)
            .await
    }

    async fn set_brightness(&self, fraction: f64) -> Result<ClampOutcome> {
        self.ensure_connected().await?;
        let outcome = apply_clamped(&self.name, "brightness", fraction, 0.0, 1.0);
        self.send(&format!("DISP:BRIG {}", outcome.applied)).await?;
        Ok(outcome)
    }

    async fn set_timeout(&self, seconds: f64) -> Result<ClampOutcome> {
        let outcome = apply_clamped(&self.name, "timeout_s", seconds, MIN_TIMEOUT_S, MAX_TIMEOUT_S);
        *self.timeout.lock().await = Duration::from_secs_f64(outcome.applied);
        Ok(outcome)
    }
}
