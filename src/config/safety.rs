//! Safety interlock configuration from TOML.

use std::collections::BTreeMap;
use std::time::Duration;

use heapless::String;
use serde::{Deserialize, Serialize};

/// Identifier of a temperature sensor (max 32 chars).
pub type SensorId = String<32>;

/// Per-sensor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Human-readable name.
    pub name: std::string::String,

    /// Trip temperature in °C; falls back to the section default.
    #[serde(default)]
    pub high_limit: Option<f32>,
}

/// Safety interlock configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Temperature sampling period.
    pub temperature_interval_ms: u64,

    /// Hard limit switch sampling period.
    pub limit_interval_ms: u64,

    /// Trip temperature for sensors without their own limit.
    pub default_high_limit: f32,

    /// Fraction of the limit at which an advisory warning is raised.
    pub warning_ratio: f32,

    /// Keep sensor and limit trips latched until an explicit `clear()`.
    pub sticky_trip: bool,

    /// Suppress sensor and limit driven trips entirely. Discouraged.
    pub unsafe_bypass: bool,

    /// Consecutive driver failures treated as a fault.
    pub driver_fault_threshold: u32,

    /// Known sensors keyed by id.
    pub sensors: BTreeMap<SensorId, SensorConfig>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            temperature_interval_ms: 5000,
            limit_interval_ms: 50,
            default_high_limit: 50.0,
            warning_ratio: 0.9,
            sticky_trip: true,
            unsafe_bypass: false,
            driver_fault_threshold: 3,
            sensors: BTreeMap::new(),
        }
    }
}

impl SafetyConfig {
    /// Temperature sampling period.
    pub fn temperature_interval(&self) -> Duration {
        Duration::from_millis(self.temperature_interval_ms)
    }

    /// Limit switch sampling period.
    pub fn limit_interval(&self) -> Duration {
        Duration::from_millis(self.limit_interval_ms)
    }

    /// Trip temperature for a sensor.
    pub fn high_limit(&self, sensor: &str) -> f32 {
        self.sensor(sensor)
            .and_then(|s| s.high_limit)
            .unwrap_or(self.default_high_limit)
    }

    /// Display name for a sensor, falling back to its id.
    pub fn sensor_name(&self, sensor: &str) -> std::string::String {
        self.sensor(sensor)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| sensor.into())
    }

    /// Look up a sensor by id.
    pub fn sensor(&self, id: &str) -> Option<&SensorConfig> {
        self.sensors
            .iter()
            .find(|(k, _)| k.as_str() == id)
            .map(|(_, v)| v)
    }
}
