//! Safety interlock.
//!
//! The [`SafetyMonitor`] is the sole writer of the tripped flag. Controllers
//! read it without blocking before every motion or firing step and register
//! an [`EmergencyStop`] hook that the monitor calls when it trips.

use core::fmt;

use heapless::String;

use crate::config::SensorId;

mod monitor;

pub use monitor::SafetyMonitor;

/// Name of a hard limit switch (max 32 chars).
pub type LimitName = String<32>;

/// Bounded copy of a name, truncated at 32 bytes on a char boundary.
pub(crate) fn bounded_name(name: &str) -> String<32> {
    let mut out = String::new();
    for c in name.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

/// Actuator owned by one controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Actuator {
    /// Cleaning head stepper.
    Motion,
    /// Trigger servo.
    Trigger,
    /// Reciprocating table.
    Table,
    /// Fan and red lights.
    Outputs,
}

impl fmt::Display for Actuator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Actuator::Motion => "motion",
            Actuator::Trigger => "trigger",
            Actuator::Table => "table",
            Actuator::Outputs => "outputs",
        })
    }
}

/// Why motion and firing are blocked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TripReason {
    /// A sensor reached its high limit.
    OverTemperature(SensorId),
    /// A sensor stopped responding.
    SensorFault(SensorId),
    /// A hard limit switch asserted.
    LimitFault(LimitName),
    /// An operator or caller requested an emergency stop.
    ManualStop,
    /// An actuator's driver failed repeatedly. Local to that controller.
    DriverFault(Actuator),
}

impl TripReason {
    /// Stable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            TripReason::OverTemperature(_) => "over_temperature",
            TripReason::SensorFault(_) => "sensor_fault",
            TripReason::LimitFault(_) => "limit_fault",
            TripReason::ManualStop => "manual_stop",
            TripReason::DriverFault(_) => "driver_fault",
        }
    }

    /// Whether homing may run while this trip is active.
    ///
    /// Homing moves the head toward the reference, which is how a limit
    /// fault or a manual stop is recovered from.
    pub fn allows_homing(&self) -> bool {
        matches!(self, TripReason::LimitFault(_) | TripReason::ManualStop)
    }

    /// Whether the trip comes from a sensor or switch rather than a person.
    pub fn is_automatic(&self) -> bool {
        matches!(
            self,
            TripReason::OverTemperature(_) | TripReason::SensorFault(_) | TripReason::LimitFault(_)
        )
    }
}

impl fmt::Display for TripReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TripReason::OverTemperature(id) => write!(f, "over-temperature on sensor {}", id),
            TripReason::SensorFault(id) => write!(f, "sensor {} not responding", id),
            TripReason::LimitFault(name) => write!(f, "hard limit {} asserted", name),
            TripReason::ManualStop => write!(f, "manual stop"),
            TripReason::DriverFault(actuator) => write!(f, "{} driver fault", actuator),
        }
    }
}

/// Latest reading of one temperature sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct TemperatureReading {
    /// Sensor identifier.
    pub sensor: SensorId,
    /// Display name.
    pub name: std::string::String,
    /// Temperature in °C, `None` if the last read failed.
    pub temperature: Option<f32>,
    /// Trip temperature.
    pub high_limit: f32,
    /// Within the advisory band below the limit.
    pub warning: bool,
    /// Consecutive failed reads.
    pub failures: u32,
}

/// Latest reading of one hard limit switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitReading {
    /// Switch name.
    pub name: LimitName,
    /// Asserted, `None` if the last read failed.
    pub active: Option<bool>,
}

/// Snapshot of the interlock for status polling.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SafetyState {
    /// Motion and firing are blocked.
    pub tripped: bool,
    /// Why, while tripped.
    pub reason: Option<TripReason>,
    /// Sensors in the advisory band.
    pub warnings: Vec<SensorId>,
    /// Latest temperature readings.
    pub readings: Vec<TemperatureReading>,
    /// Latest hard limit readings.
    pub limits: Vec<LimitReading>,
    /// Sensor and limit trips are suppressed.
    pub bypass: bool,
}

/// Hook called synchronously when the interlock trips.
///
/// Implementations must not block on the operation they interrupt: set a
/// flag, drive outputs to their safe state, and return.
pub trait EmergencyStop: Send + Sync {
    /// Hard-stop in-flight motion or firing.
    fn emergency_stop(&self, reason: &TripReason);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_display() {
        let reason = TripReason::LimitFault(bounded_name("limit_a"));
        assert_eq!(reason.to_string(), "hard limit limit_a asserted");
        assert_eq!(
            TripReason::DriverFault(Actuator::Table).to_string(),
            "table driver fault"
        );
    }

    #[test]
    fn test_homing_exemptions() {
        assert!(TripReason::ManualStop.allows_homing());
        assert!(TripReason::LimitFault(bounded_name("a")).allows_homing());
        assert!(!TripReason::OverTemperature(bounded_name("head")).allows_homing());
        assert!(!TripReason::DriverFault(Actuator::Motion).allows_homing());
    }

    #[test]
    fn test_bounded_name_truncates() {
        let name = bounded_name(&"é".repeat(20));
        assert_eq!(name.len(), 32);
        assert_eq!(name.chars().count(), 16);
    }
}
