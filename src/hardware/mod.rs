//! Hardware abstraction for power calibration.
//!
//! - [`capabilities`]: `PowerMeter` and `BeamControl` traits
//! - [`clamp`]: shared range-clamp policy for device setters
//! - [`scpi_power_meter`]: PM100-style SCPI meter over any async transport
//! - [`mock`]: simulated devices with fault injection
//! - [`registry`]: caller-owned device registry

pub mod capabilities;
pub mod clamp;
pub mod mock;
pub mod registry;
pub mod scpi_power_meter;

pub use capabilities::{BeamControl, PowerMeter};
pub use clamp::{apply_clamped, clamp_to_range, ClampOutcome};
pub use registry::{create_mock_registry, DeviceConfig, DeviceRegistry, DriverType};
