//! Error types for laserclean-core.
//!
//! Every rejected command carries a specific reason so front ends can render
//! the exact blocking cause. [`Error::code`] gives a stable machine-readable
//! string for each variant.

use thiserror::Error;

use crate::safety::{Actuator, TripReason};
use crate::table::TableLeg;

/// Result type alias using the library's Error type.
pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for all control-core operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// The safety interlock is tripped (or the actuator's driver is faulted).
    #[error("interlock tripped: {0}")]
    Unsafe(TripReason),

    /// The actuator already has an operation in flight.
    #[error("{0} is busy with another operation")]
    Busy(Actuator),

    /// The stepper is disabled.
    #[error("motor is disabled")]
    MotorDisabled,

    /// A numeric argument is outside its permitted range.
    #[error("{what} {value} outside [{min}, {max}]")]
    OutOfRange {
        /// Which quantity was rejected
        what: &'static str,
        /// Requested value
        value: f64,
        /// Lowest permitted value
        min: f64,
        /// Highest permitted value (infinite when unbounded)
        max: f64,
    },

    /// An argument is malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Homing did not reach the reference within its budget.
    #[error("home reference not reached within {steps} steps")]
    HomingTimeout {
        /// Steps travelled before giving up
        steps: u32,
    },

    /// The limit switch of the requested direction is already asserted.
    #[error("{0} limit already active")]
    LimitAlreadyActive(TableLeg),

    /// Hardware I/O failed.
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    /// A sequence run is already active.
    #[error("a sequence is already running")]
    AlreadyRunning,

    /// A sequence failed validation before execution.
    #[error("invalid sequence: {0}")]
    InvalidSequence(String),

    /// The hardware reported a state the core cannot interpret.
    #[error("unexpected state: {0}")]
    Unknown(String),

    /// The operation was interrupted by `stop()`.
    #[error("operation stopped")]
    Stopped,

    /// The table did not reach its limit switch in time.
    #[error("{0} limit not reached before travel timeout")]
    TravelTimeout(TableLeg),

    /// An operator input did not assert before the step's timeout.
    #[error("input '{input}' not received within {timeout_ms} ms")]
    InputTimeout {
        /// Input name
        input: String,
        /// Timeout that elapsed
        timeout_ms: u64,
    },

    /// No preset with that name exists.
    #[error("preset '{0}' not found")]
    PresetNotFound(String),

    /// `clear()` was refused because the trip condition is still present.
    #[error("cannot clear interlock, condition still present: {0}")]
    TripConditionActive(TripReason),

    /// No sequence run is active.
    #[error("no sequence is running")]
    NotRunning,

    /// Configuration parsing or validation error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Persistence error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl Error {
    /// Stable reason code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Unsafe(_) => "unsafe",
            Error::Busy(_) => "busy",
            Error::MotorDisabled => "motor_disabled",
            Error::OutOfRange { .. } => "out_of_range",
            Error::InvalidArgument(_) => "invalid_argument",
            Error::HomingTimeout { .. } => "homing_timeout",
            Error::LimitAlreadyActive(_) => "limit_already_active",
            Error::Driver(_) => "driver_error",
            Error::AlreadyRunning => "already_running",
            Error::InvalidSequence(_) => "invalid_sequence",
            Error::Unknown(_) => "unknown",
            Error::Stopped => "stopped",
            Error::TravelTimeout(_) => "travel_timeout",
            Error::InputTimeout { .. } => "input_timeout",
            Error::PresetNotFound(_) => "preset_not_found",
            Error::TripConditionActive(_) => "trip_condition_active",
            Error::NotRunning => "not_running",
            Error::Config(_) => "config",
            Error::Store(_) => "store",
        }
    }

    /// Build an [`Error::OutOfRange`] for an integer quantity.
    pub(crate) fn out_of_range(what: &'static str, value: i64, min: i64, max: Option<i64>) -> Self {
        Error::OutOfRange {
            what,
            value: value as f64,
            min: min as f64,
            max: max.map(|m| m as f64).unwrap_or(f64::INFINITY),
        }
    }

    /// Whether this error forces the actuator into its stopped state.
    pub(crate) fn is_fault(&self) -> bool {
        matches!(self, Error::Unsafe(_) | Error::Driver(_))
    }
}

/// Hardware I/O failure reported by a driver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// A GPIO pin operation failed.
    #[error("pin operation failed on {channel}: {kind}")]
    Pin {
        /// Channel name
        channel: &'static str,
        /// HAL error kind
        kind: String,
    },

    /// PWM output failed.
    #[error("pwm operation failed on {channel}: {kind}")]
    Pwm {
        /// Channel name
        channel: &'static str,
        /// HAL error kind
        kind: String,
    },

    /// A sensor could not be read.
    #[error("sensor {sensor} read failed: {message}")]
    Sensor {
        /// Sensor identifier
        sensor: String,
        /// Failure description
        message: String,
    },

    /// The simulated or physical device is unavailable.
    #[error("device unavailable: {0}")]
    Unavailable(String),
}

/// Configuration-related errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// Failed to parse TOML configuration.
    #[error("parse error: {0}")]
    Parse(String),

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(String),

    /// A motion profile has a non-positive rate.
    #[error("profile '{profile}': {field} must be > 0 (got {value})")]
    InvalidProfile {
        /// Profile name (jog, index, absolute, home)
        profile: &'static str,
        /// Offending field
        field: &'static str,
        /// Configured value
        value: f32,
    },

    /// A servo angle is outside [-90, 90].
    #[error("servo angle {0} outside [-90, 90]")]
    InvalidAngle(f32),

    /// A step count must be positive.
    #[error("{field} must be > 0 (got {value})")]
    InvalidSteps {
        /// Offending field
        field: &'static str,
        /// Configured value
        value: i64,
    },

    /// An interval or delay must be positive.
    #[error("{0} must be > 0")]
    InvalidInterval(&'static str),

    /// A temperature limit must be positive.
    #[error("sensor '{sensor}': high limit {limit} must be > 0")]
    InvalidHighLimit {
        /// Sensor identifier
        sensor: String,
        /// Configured limit
        limit: f32,
    },

    /// A preset lies outside the travel range.
    #[error("preset '{name}' position {position} outside travel range")]
    PresetOutOfRange {
        /// Preset name
        name: String,
        /// Configured position
        position: i64,
    },
}

/// Persistence errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Underlying storage I/O failed.
    #[error("I/O error: {0}")]
    Io(String),

    /// Key or namespace contains characters the backend cannot hold.
    #[error("invalid key '{0}'")]
    InvalidKey(String),

    /// A record could not be encoded.
    #[error("cannot encode record '{key}': {message}")]
    Encode {
        /// Record key
        key: String,
        /// Encoder message
        message: String,
    },

    /// A stored record could not be decoded.
    #[error("cannot decode record '{key}': {message}")]
    Decode {
        /// Record key
        key: String,
        /// Decoder message
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(Error::MotorDisabled.code(), "motor_disabled");
        assert_eq!(Error::Busy(Actuator::Motion).code(), "busy");
        assert_eq!(
            Error::InputTimeout {
                input: "button_in".into(),
                timeout_ms: 100
            }
            .code(),
            "input_timeout"
        );
        assert_eq!(
            Error::LimitAlreadyActive(TableLeg::Forward).code(),
            "limit_already_active"
        );
        assert_eq!(
            Error::from(DriverError::Unavailable("stepper".into())).code(),
            "driver_error"
        );
    }

    #[test]
    fn test_unsafe_display_names_sensor() {
        let reason = TripReason::OverTemperature(heapless::String::try_from("laser_head").unwrap());
        let text = Error::Unsafe(reason).to_string();
        assert!(text.contains("over-temperature on sensor laser_head"), "{text}");
    }

    #[test]
    fn test_out_of_range_unbounded() {
        let err = Error::out_of_range("target", -5, 0, None);
        assert_eq!(err.to_string(), "target -5 outside [0, inf]");
    }

    #[test]
    fn test_fault_classification() {
        assert!(Error::Unsafe(TripReason::ManualStop).is_fault());
        assert!(!Error::Stopped.is_fault());
    }
}
