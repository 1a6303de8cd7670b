//! Trigger, table, auxiliary output and hardware channel configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::units::Degrees;

/// Servo trigger configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Normal (safe) angle.
    pub position_a: Degrees,

    /// Fire angle.
    pub position_b: Degrees,

    /// Swap the roles of A and B.
    pub invert: bool,

    /// Delay between fiber pattern commands, in milliseconds.
    pub fiber_step_delay_ms: u64,

    /// Delay before releasing holding torque on detach, in milliseconds.
    pub detach_delay_ms: u64,

    /// Detach automatically after every `fire_stop`.
    pub auto_detach: bool,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            position_a: Degrees(0.0),
            position_b: Degrees(90.0),
            invert: false,
            fiber_step_delay_ms: 500,
            detach_delay_ms: 500,
            auto_detach: false,
        }
    }
}

impl TriggerConfig {
    /// Delay between fiber pattern commands.
    pub fn fiber_step_delay(&self) -> Duration {
        Duration::from_millis(self.fiber_step_delay_ms)
    }

    /// Delay before releasing holding torque.
    pub fn detach_delay(&self) -> Duration {
        Duration::from_millis(self.detach_delay_ms)
    }

    /// Angle of the safe state, after inversion.
    pub fn normal_angle(&self) -> Degrees {
        if self.invert {
            self.position_b
        } else {
            self.position_a
        }
    }

    /// Angle that fires the laser, after inversion.
    pub fn fire_angle(&self) -> Degrees {
        if self.invert {
            self.position_a
        } else {
            self.position_b
        }
    }
}

/// Reciprocating table configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableConfig {
    /// Default dwell at each limit during auto-cycle, in seconds.
    pub dwell_secs: f32,

    /// Time a limit reading must be stable before it is trusted.
    pub debounce_ms: u64,

    /// Limit switch polling period while a leg is running.
    pub poll_interval_ms: u64,

    /// Maximum duration of one leg before giving up, in seconds.
    pub travel_timeout_secs: f32,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            dwell_secs: 2.0,
            debounce_ms: 50,
            poll_interval_ms: 10,
            travel_timeout_secs: 30.0,
        }
    }
}

impl TableConfig {
    /// Default dwell between legs.
    pub fn dwell(&self) -> Duration {
        Duration::from_secs_f32(self.dwell_secs.max(0.0))
    }

    /// Debounce window.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Poll period.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Travel timeout per leg.
    pub fn travel_timeout(&self) -> Duration {
        Duration::from_secs_f32(self.travel_timeout_secs.max(0.0))
    }
}

/// Fan and red-light configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputsConfig {
    /// Switch fan and lights on with the trigger and off after their delays.
    pub follow_trigger: bool,

    /// Fan run-on after firing stops, in milliseconds.
    pub fan_off_delay_ms: u64,

    /// Red-light run-on after firing stops, in milliseconds.
    pub lights_off_delay_ms: u64,

    /// Timer resolution of the background tick.
    pub tick_interval_ms: u64,
}

impl Default for OutputsConfig {
    fn default() -> Self {
        Self {
            follow_trigger: true,
            fan_off_delay_ms: 600_000,
            lights_off_delay_ms: 60_000,
            tick_interval_ms: 100,
        }
    }
}

impl OutputsConfig {
    /// Fan off-delay after firing stops.
    pub fn fan_off_delay(&self) -> Duration {
        Duration::from_millis(self.fan_off_delay_ms)
    }

    /// Lights off-delay after firing stops.
    pub fn lights_off_delay(&self) -> Duration {
        Duration::from_millis(self.lights_off_delay_ms)
    }

    /// Timer tick period, at least 1 ms.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

/// Physical channel assignment. Changing any of these requires a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    /// Run against simulated drivers.
    pub simulation: bool,
    /// Stepper STEP line.
    pub step_pin: u8,
    /// Stepper DIR line.
    pub dir_pin: u8,
    /// Stepper ENABLE line.
    pub enable_pin: Option<u8>,
    /// ENABLE is active low.
    pub invert_enable_logic: bool,
    /// Home reference switch.
    pub home_pin: Option<u8>,
    /// Clockwise hard limit switch.
    pub limit_a_pin: Option<u8>,
    /// Counter-clockwise hard limit switch.
    pub limit_b_pin: Option<u8>,
    /// Servo PWM channel.
    pub servo_pwm_pin: u8,
    /// Table forward relay.
    pub table_forward_pin: u8,
    /// Table backward relay.
    pub table_backward_pin: u8,
    /// Table front end switch.
    pub table_front_switch_pin: u8,
    /// Table back end switch.
    pub table_back_switch_pin: u8,
    /// Fan relay.
    pub fan_pin: u8,
    /// Red lights relay.
    pub red_lights_pin: u8,
    /// Operator inputs a sequence can wait on, by name.
    pub inputs: BTreeMap<String, u8>,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            simulation: true,
            step_pin: 25,
            dir_pin: 26,
            enable_pin: Some(27),
            invert_enable_logic: false,
            home_pin: Some(21),
            limit_a_pin: Some(18),
            limit_b_pin: Some(19),
            servo_pwm_pin: 12,
            table_forward_pin: 13,
            table_backward_pin: 6,
            table_front_switch_pin: 21,
            table_back_switch_pin: 20,
            fan_pin: 26,
            red_lights_pin: 16,
            inputs: [("button_in", 5), ("button_out", 22), ("fire_button", 24)]
                .into_iter()
                .map(|(name, pin)| (name.to_owned(), pin))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_defaults() {
        let config = TriggerConfig::default();
        assert_eq!(config.position_a, Degrees(0.0));
        assert_eq!(config.position_b, Degrees(90.0));
        assert_eq!(config.fiber_step_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_table_durations() {
        let config = TableConfig {
            dwell_secs: 0.25,
            poll_interval_ms: 0,
            ..TableConfig::default()
        };
        assert_eq!(config.dwell(), Duration::from_millis(250));
        assert_eq!(config.poll_interval(), Duration::from_millis(1));
    }
}
