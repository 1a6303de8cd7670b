//! Control configuration - root configuration structure.

use std::collections::BTreeMap;

use heapless::String;
use serde::{Deserialize, Serialize};

use super::devices::{HardwareConfig, OutputsConfig, TableConfig, TriggerConfig};
use super::motion::MotionConfig;
use super::safety::SafetyConfig;

/// Name of a saved head position (max 32 chars).
pub type PresetName = String<32>;

/// Root configuration structure from TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Cleaning head stepper.
    pub motion: MotionConfig,

    /// Servo trigger.
    pub trigger: TriggerConfig,

    /// Reciprocating table.
    pub table: TableConfig,

    /// Interlocks and temperature limits.
    pub safety: SafetyConfig,

    /// Fan and red lights.
    pub outputs: OutputsConfig,

    /// Physical channel assignment.
    pub hardware: HardwareConfig,

    /// Preset head positions in steps.
    pub presets: BTreeMap<PresetName, i64>,
}

impl ControlConfig {
    /// Get a preset position by name.
    pub fn preset(&self, name: &str) -> Option<i64> {
        self.presets
            .iter()
            .find(|(k, _)| k.as_str() == name)
            .map(|(_, v)| *v)
    }

    /// List all preset names.
    pub fn preset_names(&self) -> impl Iterator<Item = &str> {
        self.presets.keys().map(|s| s.as_str())
    }

    /// Whether switching from `self` to `next` needs a process restart.
    ///
    /// Only the physical channel assignment is structural; everything else
    /// is applied live.
    pub fn requires_restart(&self, next: &ControlConfig) -> bool {
        self.hardware != next.hardware
    }
}
