//! Stepper (cleaning head) configuration from TOML.

use serde::{Deserialize, Serialize};

use super::limits::TravelLimits;
use super::units::{StepsPerSec, StepsPerSecSquared};

/// Speed profile for one kind of move.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfileConfig {
    /// Cruise velocity in steps/sec.
    pub speed: StepsPerSec,

    /// Acceleration rate in steps/sec².
    pub acceleration: StepsPerSecSquared,

    /// Deceleration rate in steps/sec² (optional).
    /// If not set, uses acceleration value (symmetric profile).
    #[serde(default)]
    pub deceleration: Option<StepsPerSecSquared>,
}

impl ProfileConfig {
    /// Create a symmetric profile.
    pub const fn new(speed: f32, acceleration: f32) -> Self {
        Self {
            speed: StepsPerSec(speed),
            acceleration: StepsPerSecSquared(acceleration),
            deceleration: None,
        }
    }

    /// Get effective deceleration rate.
    /// Falls back to acceleration if not specified.
    pub fn effective_deceleration(&self) -> StepsPerSecSquared {
        self.deceleration.unwrap_or(self.acceleration)
    }

    /// Check if this profile uses asymmetric acceleration.
    pub fn is_asymmetric(&self) -> bool {
        self.deceleration.map_or(false, |d| d != self.acceleration)
    }
}

/// Cleaning head configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Whether the motor starts enabled.
    pub enabled: bool,

    /// Upper travel bound in steps; unbounded when absent.
    pub max_steps: Option<i64>,

    /// Distance of one index move in steps.
    pub index_distance: i64,

    /// Default jog size used by front ends.
    pub jog_step_size: i64,

    /// Step budget for finding the home sensor.
    pub home_max_steps: u32,

    /// Distance to back off the home sensor before the slow approach.
    pub home_backoff_steps: u32,

    /// Wall-clock budget for homing, in seconds.
    pub home_timeout_secs: f32,

    /// Profile for jog moves.
    pub jog: ProfileConfig,

    /// Profile for index moves.
    pub index: ProfileConfig,

    /// Profile for absolute and preset moves.
    pub absolute: ProfileConfig,

    /// Profile for the homing search.
    pub home: ProfileConfig,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_steps: None,
            index_distance: 15842,
            jog_step_size: 20,
            home_max_steps: 50_000,
            home_backoff_steps: 200,
            home_timeout_secs: 60.0,
            jog: ProfileConfig::new(500.0, 2000.0),
            index: ProfileConfig::new(3500.0, 2000.0),
            absolute: ProfileConfig::new(3500.0, 2000.0),
            home: ProfileConfig::new(1000.0, 2000.0),
        }
    }
}

impl MotionConfig {
    /// Travel range derived from `max_steps`.
    pub fn limits(&self) -> TravelLimits {
        TravelLimits::new(self.max_steps)
    }
}
