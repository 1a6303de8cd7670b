//! Drivers over embedded-hal 1.0 traits.
//!
//! Generic over pin, delay and PWM types so the same code runs against
//! real GPIO or `embedded-hal-mock` in tests.

use std::fs;
use std::path::PathBuf;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{self, InputPin, OutputPin};
use embedded_hal::pwm::{self, SetDutyCycle};

use crate::config::units::Degrees;
use crate::error::DriverError;
use crate::motion::Direction;

use super::{DigitalOutput, DriverResult, LimitSwitch, Servo, Stepper, TemperatureSensor};

/// STEP pulse width in nanoseconds.
pub const DEFAULT_PULSE_WIDTH_NS: u32 = 2_000;

fn pin_error<E: digital::Error>(channel: &'static str) -> impl FnOnce(E) -> DriverError {
    move |e| DriverError::Pin {
        channel,
        kind: format!("{:?}", e.kind()),
    }
}

fn pwm_error<E: pwm::Error>(channel: &'static str) -> impl FnOnce(E) -> DriverError {
    move |e| DriverError::Pwm {
        channel,
        kind: format!("{:?}", e.kind()),
    }
}

/// Placeholder for an unconnected optional output line.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPin;

impl digital::ErrorType for NoPin {
    type Error = core::convert::Infallible;
}

impl OutputPin for NoPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Step/direction driver (A4988, DRV8825, TMC2208 and similar).
///
/// `STEP` and `DIR` are output pins, `EN` is the optional enable line
/// ([`NoPin`] when the board ties it) and `DELAY` times the pulse width.
pub struct HalStepper<STEP, DIR, EN, DELAY> {
    /// One rising edge per step.
    step_pin: STEP,

    /// DIR pin (high = forward, low = backward, or inverted).
    dir_pin: DIR,

    /// ENABLE pin, if wired.
    enable_pin: Option<EN>,

    /// Pulse width timer.
    delay: DELAY,

    /// Last level written to DIR; `None` until the first move.
    current_direction: Option<Direction>,

    /// Swap DIR levels for motors wired in reverse.
    invert_direction: bool,

    /// Whether the ENABLE line is active low.
    enable_active_low: bool,

    /// STEP high time.
    pulse_width_ns: u32,
}

impl<STEP, DIR, EN, DELAY> HalStepper<STEP, DIR, EN, DELAY>
where
    STEP: OutputPin,
    DIR: OutputPin,
    EN: OutputPin,
    DELAY: DelayNs,
{
    /// Create a driver on the given pins.
    pub fn new(step_pin: STEP, dir_pin: DIR, enable_pin: Option<EN>, delay: DELAY) -> Self {
        Self {
            step_pin,
            dir_pin,
            enable_pin,
            delay,
            current_direction: None,
            invert_direction: false,
            enable_active_low: false,
            pulse_width_ns: DEFAULT_PULSE_WIDTH_NS,
        }
    }

    /// Invert the DIR line.
    pub fn with_inverted_direction(mut self, invert: bool) -> Self {
        self.invert_direction = invert;
        self
    }

    /// Drive ENABLE low to enable (most carrier boards).
    pub fn with_enable_active_low(mut self, active_low: bool) -> Self {
        self.enable_active_low = active_low;
        self
    }

    /// Override the STEP high time.
    pub fn with_pulse_width_ns(mut self, pulse_width_ns: u32) -> Self {
        self.pulse_width_ns = pulse_width_ns;
        self
    }

    /// Release the pins.
    pub fn release(self) -> (STEP, DIR, Option<EN>, DELAY) {
        (self.step_pin, self.dir_pin, self.enable_pin, self.delay)
    }
}

impl<STEP, DIR, EN, DELAY> Stepper for HalStepper<STEP, DIR, EN, DELAY>
where
    STEP: OutputPin + Send,
    DIR: OutputPin + Send,
    EN: OutputPin + Send,
    DELAY: DelayNs + Send,
{
    fn set_enabled(&mut self, enabled: bool) -> DriverResult<()> {
        let Some(pin) = self.enable_pin.as_mut() else {
            return Ok(());
        };

        if enabled != self.enable_active_low {
            pin.set_high().map_err(pin_error("enable"))
        } else {
            pin.set_low().map_err(pin_error("enable"))
        }
    }

    fn set_direction(&mut self, direction: Direction) -> DriverResult<()> {
        if self.current_direction == Some(direction) {
            return Ok(());
        }

        let pin_high = match direction {
            Direction::Forward => !self.invert_direction,
            Direction::Backward => self.invert_direction,
        };

        if pin_high {
            self.dir_pin.set_high().map_err(pin_error("dir"))?;
        } else {
            self.dir_pin.set_low().map_err(pin_error("dir"))?;
        }

        self.current_direction = Some(direction);
        Ok(())
    }

    fn step(&mut self, interval_ns: u32) -> DriverResult<()> {
        self.step_pin.set_high().map_err(pin_error("step"))?;
        self.delay.delay_ns(self.pulse_width_ns);
        self.step_pin.set_low().map_err(pin_error("step"))?;

        // Hold for the remainder of the interval
        let rest = interval_ns.saturating_sub(self.pulse_width_ns);
        if rest > 0 {
            self.delay.delay_ns(rest);
        }

        Ok(())
    }
}

/// Switch on a GPIO input, typically pulled up and active low.
pub struct HalLimitSwitch<P> {
    pin: P,
    active_low: bool,
}

impl<P: InputPin> HalLimitSwitch<P> {
    /// Switch that reads asserted when the line is low.
    pub fn active_low(pin: P) -> Self {
        Self {
            pin,
            active_low: true,
        }
    }

    /// Switch that reads asserted when the line is high.
    pub fn active_high(pin: P) -> Self {
        Self {
            pin,
            active_low: false,
        }
    }
}

impl<P: InputPin + Send> LimitSwitch for HalLimitSwitch<P> {
    fn is_active(&mut self) -> DriverResult<bool> {
        if self.active_low {
            self.pin.is_low().map_err(pin_error("limit"))
        } else {
            self.pin.is_high().map_err(pin_error("limit"))
        }
    }
}

/// Relay or lamp on a GPIO output.
pub struct HalOutput<P> {
    pin: P,
    active_low: bool,
}

impl<P: OutputPin> HalOutput<P> {
    /// Output energized by driving the line high.
    pub fn new(pin: P) -> Self {
        Self {
            pin,
            active_low: false,
        }
    }

    /// Output energized by driving the line low.
    pub fn active_low(pin: P) -> Self {
        Self {
            pin,
            active_low: true,
        }
    }
}

impl<P: OutputPin + Send> DigitalOutput for HalOutput<P> {
    fn set(&mut self, on: bool) -> DriverResult<()> {
        if on != self.active_low {
            self.pin.set_high().map_err(pin_error("output"))
        } else {
            self.pin.set_low().map_err(pin_error("output"))
        }
    }
}

/// Servo driven by a 50 Hz PWM channel.
///
/// -90° maps to `min_pulse_us`, +90° to `max_pulse_us`.
pub struct HalServo<PWM> {
    pwm: PWM,
    period_us: u32,
    min_pulse_us: u32,
    max_pulse_us: u32,
    last_angle: Option<Degrees>,
}

impl<PWM: SetDutyCycle> HalServo<PWM> {
    /// Servo with the usual 500-2500 µs pulse range on a 20 ms period.
    pub fn new(pwm: PWM) -> Self {
        Self::with_pulse_range(pwm, 500, 2500)
    }

    /// Servo with a custom pulse range.
    pub fn with_pulse_range(pwm: PWM, min_pulse_us: u32, max_pulse_us: u32) -> Self {
        Self {
            pwm,
            period_us: 20_000,
            min_pulse_us,
            max_pulse_us,
            last_angle: None,
        }
    }

    /// Duty cycle for an angle, clamped to the servo range.
    pub fn duty_for(&self, angle: Degrees) -> u16 {
        let clamped = angle.0.clamp(Degrees::MIN.0, Degrees::MAX.0);
        let span = (self.max_pulse_us - self.min_pulse_us) as f32;
        let pulse_us = self.min_pulse_us as f32 + (clamped + 90.0) / 180.0 * span;
        let duty = pulse_us / self.period_us as f32 * self.pwm.max_duty_cycle() as f32;
        libm::roundf(duty) as u16
    }

    /// Release the PWM channel.
    pub fn release(self) -> PWM {
        self.pwm
    }
}

impl<PWM: SetDutyCycle + Send> Servo for HalServo<PWM> {
    fn set_angle(&mut self, angle: Degrees) -> DriverResult<()> {
        let duty = self.duty_for(angle);
        self.pwm.set_duty_cycle(duty).map_err(pwm_error("servo"))?;
        self.last_angle = Some(angle);
        Ok(())
    }

    fn detach(&mut self) -> DriverResult<()> {
        self.pwm.set_duty_cycle_fully_off().map_err(pwm_error("servo"))
    }

    fn attach(&mut self) -> DriverResult<()> {
        match self.last_angle {
            Some(angle) => self.set_angle(angle),
            None => Ok(()),
        }
    }
}

/// DS18B20 probe read through the Linux 1-Wire sysfs interface.
#[derive(Debug, Clone)]
pub struct W1TemperatureSensor {
    id: String,
    path: PathBuf,
}

impl W1TemperatureSensor {
    /// Default sysfs root for 1-Wire devices.
    pub const DEVICES_ROOT: &'static str = "/sys/bus/w1/devices";

    /// Sensor with 1-Wire address `id` under the default sysfs root.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let path = PathBuf::from(Self::DEVICES_ROOT).join(&id).join("w1_slave");
        Self { id, path }
    }

    /// Sensor reading from an explicit file.
    pub fn at_path(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
        }
    }

    /// List 1-Wire thermometers (family code 28) under `root`.
    pub fn discover(root: impl Into<PathBuf>) -> Vec<Self> {
        let root = root.into();
        let Ok(entries) = fs::read_dir(&root) else {
            return Vec::new();
        };

        let mut sensors: Vec<Self> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.starts_with("28-"))
            .map(|name| {
                let path = root.join(&name).join("w1_slave");
                Self::at_path(name, path)
            })
            .collect();
        sensors.sort_by(|a, b| a.id.cmp(&b.id));
        sensors
    }
}

/// Parse the two-line `w1_slave` report, returning °C when the CRC is valid.
pub fn parse_w1_slave(report: &str) -> Option<f32> {
    let mut lines = report.lines();
    let crc_line = lines.next()?;
    if !crc_line.trim_end().ends_with("YES") {
        return None;
    }

    let data_line = lines.next()?;
    let (_, raw) = data_line.split_once("t=")?;
    let milli: i32 = raw.trim().parse().ok()?;
    Some(milli as f32 / 1000.0)
}

impl TemperatureSensor for W1TemperatureSensor {
    fn id(&self) -> &str {
        &self.id
    }

    fn read_celsius(&mut self) -> DriverResult<f32> {
        let report = fs::read_to_string(&self.path).map_err(|e| DriverError::Sensor {
            sensor: self.id.clone(),
            message: e.to_string(),
        })?;

        parse_w1_slave(&report).ok_or_else(|| DriverError::Sensor {
            sensor: self.id.clone(),
            message: "CRC check failed or report malformed".into(),
        })
    }
}
