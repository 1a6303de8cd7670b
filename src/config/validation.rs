//! Configuration validation.

use crate::error::{ConfigError, Result};

use super::devices::{OutputsConfig, TableConfig, TriggerConfig};
use super::motion::{MotionConfig, ProfileConfig};
use super::safety::SafetyConfig;
use super::ControlConfig;

/// Validate a control configuration.
///
/// Checks:
/// - Motion profiles have positive speed, acceleration and deceleration
/// - Index distance and homing budgets are positive
/// - Servo angles are within [-90, 90]
/// - Sampling intervals are positive
/// - Sensor limits are positive
/// - Presets lie inside the travel range
pub fn validate_config(config: &ControlConfig) -> Result<()> {
    validate_motion(&config.motion)?;
    validate_trigger(&config.trigger)?;
    validate_table(&config.table)?;
    validate_safety(&config.safety)?;
    validate_outputs(&config.outputs)?;

    let limits = config.motion.limits();
    for (name, &position) in config.presets.iter() {
        if !limits.contains(position) {
            return Err(ConfigError::PresetOutOfRange {
                name: name.as_str().into(),
                position,
            }
            .into());
        }
    }

    Ok(())
}

/// Validate a single motion profile.
pub(crate) fn validate_profile(name: &'static str, profile: &ProfileConfig) -> Result<()> {
    let fields = [
        ("speed", profile.speed.0),
        ("acceleration", profile.acceleration.0),
        ("deceleration", profile.effective_deceleration().0),
    ];

    for (field, value) in fields {
        // NaN fails this comparison as well
        if !(value > 0.0) {
            return Err(ConfigError::InvalidProfile {
                profile: name,
                field,
                value,
            }
            .into());
        }
    }

    Ok(())
}

fn validate_motion(config: &MotionConfig) -> Result<()> {
    validate_profile("jog", &config.jog)?;
    validate_profile("index", &config.index)?;
    validate_profile("absolute", &config.absolute)?;
    validate_profile("home", &config.home)?;

    let counts = [
        ("index_distance", config.index_distance),
        ("jog_step_size", config.jog_step_size),
        ("home_max_steps", config.home_max_steps as i64),
    ];
    for (field, value) in counts {
        if value <= 0 {
            return Err(ConfigError::InvalidSteps { field, value }.into());
        }
    }

    if let Some(max) = config.max_steps {
        if max <= 0 {
            return Err(ConfigError::InvalidSteps {
                field: "max_steps",
                value: max,
            }
            .into());
        }
    }

    if !(config.home_timeout_secs > 0.0) {
        return Err(ConfigError::InvalidInterval("home_timeout_secs").into());
    }

    Ok(())
}

fn validate_trigger(config: &TriggerConfig) -> Result<()> {
    for angle in [config.position_a, config.position_b] {
        if !angle.in_servo_range() {
            return Err(ConfigError::InvalidAngle(angle.0).into());
        }
    }
    Ok(())
}

fn validate_table(config: &TableConfig) -> Result<()> {
    if config.poll_interval_ms == 0 {
        return Err(ConfigError::InvalidInterval("table.poll_interval_ms").into());
    }
    if !(config.travel_timeout_secs > 0.0) {
        return Err(ConfigError::InvalidInterval("table.travel_timeout_secs").into());
    }
    if !(config.dwell_secs >= 0.0) {
        return Err(ConfigError::InvalidInterval("table.dwell_secs").into());
    }
    Ok(())
}

fn validate_safety(config: &SafetyConfig) -> Result<()> {
    if config.temperature_interval_ms == 0 {
        return Err(ConfigError::InvalidInterval("safety.temperature_interval_ms").into());
    }
    if config.limit_interval_ms == 0 {
        return Err(ConfigError::InvalidInterval("safety.limit_interval_ms").into());
    }
    if config.driver_fault_threshold == 0 {
        return Err(ConfigError::InvalidInterval("safety.driver_fault_threshold").into());
    }
    if !(config.default_high_limit > 0.0) {
        return Err(ConfigError::InvalidHighLimit {
            sensor: "default".into(),
            limit: config.default_high_limit,
        }
        .into());
    }

    for (id, sensor) in config.sensors.iter() {
        if let Some(limit) = sensor.high_limit {
            if !(limit > 0.0) {
                return Err(ConfigError::InvalidHighLimit {
                    sensor: id.as_str().into(),
                    limit,
                }
                .into());
            }
        }
    }

    Ok(())
}

fn validate_outputs(config: &OutputsConfig) -> Result<()> {
    if config.tick_interval_ms == 0 {
        return Err(ConfigError::InvalidInterval("outputs.tick_interval_ms").into());
    }
    Ok(())
}
