//! Actuator and sensor driver abstractions.
//!
//! The controllers only talk to hardware through these traits. Each call is
//! synchronous and fallible; an I/O failure surfaces as [`DriverError`].
//!
//! - [`hal`]: implementations over embedded-hal 1.0 pins, delays and PWM
//! - [`sim`]: simulated devices with inspection handles

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::config::units::Degrees;
use crate::error::DriverError;
use crate::motion::Direction;

pub mod hal;
pub mod sim;

/// Result type for driver calls.
pub type DriverResult<T> = core::result::Result<T, DriverError>;

/// Step/direction stepper driver.
pub trait Stepper: Send {
    /// Energize or release the motor coils.
    fn set_enabled(&mut self, enabled: bool) -> DriverResult<()>;

    /// Select the direction of subsequent steps.
    fn set_direction(&mut self, direction: Direction) -> DriverResult<()>;

    /// Emit one step pulse and hold until `interval_ns` has elapsed since
    /// the pulse started.
    fn step(&mut self, interval_ns: u32) -> DriverResult<()>;
}

/// Hobby servo on a PWM channel.
pub trait Servo: Send {
    /// Drive the horn to `angle`.
    fn set_angle(&mut self, angle: Degrees) -> DriverResult<()>;

    /// Stop the PWM signal, releasing holding torque.
    fn detach(&mut self) -> DriverResult<()>;

    /// Resume the PWM signal at the last commanded angle.
    fn attach(&mut self) -> DriverResult<()>;
}

/// On/off output such as a relay.
pub trait DigitalOutput: Send {
    /// Switch the output.
    fn set(&mut self, on: bool) -> DriverResult<()>;
}

/// End switch or reference sensor.
pub trait LimitSwitch: Send {
    /// Whether the switch is asserted (raw, undebounced).
    fn is_active(&mut self) -> DriverResult<bool>;
}

/// Temperature probe.
pub trait TemperatureSensor: Send {
    /// Sensor identifier used in configuration and trip reasons.
    fn id(&self) -> &str;

    /// Read the temperature in °C.
    fn read_celsius(&mut self) -> DriverResult<f32>;
}

impl<T: Stepper + ?Sized> Stepper for Box<T> {
    fn set_enabled(&mut self, enabled: bool) -> DriverResult<()> {
        (**self).set_enabled(enabled)
    }

    fn set_direction(&mut self, direction: Direction) -> DriverResult<()> {
        (**self).set_direction(direction)
    }

    fn step(&mut self, interval_ns: u32) -> DriverResult<()> {
        (**self).step(interval_ns)
    }
}

impl<T: LimitSwitch + ?Sized> LimitSwitch for Box<T> {
    fn is_active(&mut self) -> DriverResult<bool> {
        (**self).is_active()
    }
}

impl<T: DigitalOutput + ?Sized> DigitalOutput for Box<T> {
    fn set(&mut self, on: bool) -> DriverResult<()> {
        (**self).set(on)
    }
}

/// Tracks consecutive driver failures of one actuator.
///
/// Reaching the threshold latches a fault that only an explicit reset
/// releases; a persistent driver error is treated like a tripped interlock.
#[derive(Debug)]
pub struct DriverHealth {
    consecutive: AtomicU32,
    threshold: AtomicU32,
    latched: AtomicBool,
}

impl DriverHealth {
    /// Create a tracker latching after `threshold` consecutive failures.
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive: AtomicU32::new(0),
            threshold: AtomicU32::new(threshold.max(1)),
            latched: AtomicBool::new(false),
        }
    }

    /// Record a successful driver call.
    #[inline]
    pub fn record_success(&self) {
        self.consecutive.store(0, Ordering::Relaxed);
    }

    /// Record a failed driver call. Returns `true` if this latched the fault.
    pub fn record_failure(&self) -> bool {
        let count = self.consecutive.fetch_add(1, Ordering::AcqRel) + 1;
        count >= self.threshold.load(Ordering::Relaxed) && !self.latched.swap(true, Ordering::AcqRel)
    }

    /// Whether the fault is latched.
    #[inline]
    pub fn is_latched(&self) -> bool {
        self.latched.load(Ordering::Acquire)
    }

    /// Consecutive failures so far.
    #[inline]
    pub fn failures(&self) -> u32 {
        self.consecutive.load(Ordering::Relaxed)
    }

    /// Change the latch threshold.
    pub fn set_threshold(&self, threshold: u32) {
        self.threshold.store(threshold.max(1), Ordering::Relaxed);
    }

    /// Release the latch and forget past failures.
    pub fn reset(&self) {
        self.consecutive.store(0, Ordering::Relaxed);
        self.latched.store(false, Ordering::Release);
    }
}
