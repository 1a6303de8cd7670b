//! Configuration module for laserclean-core.
//!
//! Provides types for loading and validating machine configuration from
//! TOML files, and the provider interface used for live reloads.

mod devices;
mod limits;
mod loader;
mod motion;
mod safety;
mod system;
pub mod units;
mod validation;

pub use devices::{HardwareConfig, OutputsConfig, TableConfig, TriggerConfig};
pub use limits::TravelLimits;
pub use loader::{load_config, parse_config, ConfigProvider, FileConfigProvider, StaticConfigProvider};
pub use motion::{MotionConfig, ProfileConfig};
pub use safety::{SafetyConfig, SensorConfig, SensorId};
pub use system::{ControlConfig, PresetName};
pub use validation::validate_config;

pub(crate) use validation::validate_profile;

// Re-export unit types at config level
pub use units::{Degrees, StepsPerSec, StepsPerSecSquared};
