//! Simulated devices.
//!
//! Every simulated device is `Clone`; clones share state, so a caller keeps
//! one clone as an inspection handle and hands the other to a controller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::units::Degrees;
use crate::config::ControlConfig;
use crate::error::DriverError;
use crate::machine::MachineDrivers;
use crate::motion::Direction;
use crate::table::TableLeg;

use super::{DigitalOutput, DriverResult, LimitSwitch, Servo, Stepper, TemperatureSensor};

#[derive(Debug)]
struct StepperState {
    position: i64,
    direction: Direction,
    enabled: bool,
    pulses: u64,
    fail_in: Option<u64>,
    real_time: bool,
}

/// Simulated stepper tracking the physical head position.
#[derive(Debug, Clone)]
pub struct SimStepper {
    state: Arc<Mutex<StepperState>>,
}

impl Default for SimStepper {
    fn default() -> Self {
        Self::new()
    }
}

impl SimStepper {
    /// Stepper at physical position 0 that steps without waiting.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StepperState {
                position: 0,
                direction: Direction::Forward,
                enabled: false,
                pulses: 0,
                fail_in: None,
                real_time: false,
            })),
        }
    }

    /// Honor step intervals with real sleeps.
    pub fn with_real_time(self) -> Self {
        self.state.lock().real_time = true;
        self
    }

    /// Physical head position in steps.
    pub fn position(&self) -> i64 {
        self.state.lock().position
    }

    /// Move the physical head without stepping (misplaced head, power loss).
    pub fn set_position(&self, position: i64) {
        self.state.lock().position = position;
    }

    /// Total step pulses emitted.
    pub fn pulses(&self) -> u64 {
        self.state.lock().pulses
    }

    /// Whether the coils are energized.
    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// Fail every step call after `pulses` more successful pulses.
    pub fn fail_after(&self, pulses: u64) {
        self.state.lock().fail_in = Some(pulses);
    }

    /// Stop injecting failures.
    pub fn heal(&self) {
        self.state.lock().fail_in = None;
    }

    /// Home reference switch asserted at or below physical position `at`.
    pub fn home_switch(&self, at: i64) -> SimLimitSwitch {
        let state = Arc::clone(&self.state);
        SimLimitSwitch::probe(move || state.lock().position <= at)
    }
}

impl Stepper for SimStepper {
    fn set_enabled(&mut self, enabled: bool) -> DriverResult<()> {
        self.state.lock().enabled = enabled;
        Ok(())
    }

    fn set_direction(&mut self, direction: Direction) -> DriverResult<()> {
        self.state.lock().direction = direction;
        Ok(())
    }

    fn step(&mut self, interval_ns: u32) -> DriverResult<()> {
        let real_time = {
            let mut state = self.state.lock();
            match state.fail_in {
                Some(0) => return Err(DriverError::Unavailable("simulated stepper".into())),
                Some(n) => state.fail_in = Some(n - 1),
                None => {}
            }
            state.position += state.direction.sign();
            state.pulses += 1;
            state.real_time
        };

        if real_time {
            thread::sleep(Duration::from_nanos(interval_ns as u64));
        }
        Ok(())
    }
}

#[derive(Clone)]
enum SwitchSource {
    Flag(Arc<AtomicBool>),
    Probe(Arc<dyn Fn() -> bool + Send + Sync>),
}

/// Simulated switch, either set by hand or derived from another device.
#[derive(Clone)]
pub struct SimLimitSwitch {
    source: SwitchSource,
    failing: Arc<AtomicBool>,
}

impl core::fmt::Debug for SimLimitSwitch {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SimLimitSwitch")
            .field("failing", &self.failing.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for SimLimitSwitch {
    fn default() -> Self {
        Self::new(false)
    }
}

impl SimLimitSwitch {
    /// Hand-operated switch.
    pub fn new(active: bool) -> Self {
        Self {
            source: SwitchSource::Flag(Arc::new(AtomicBool::new(active))),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Switch whose state is computed on every read.
    pub fn probe(probe: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        Self {
            source: SwitchSource::Probe(Arc::new(probe)),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Press or release a hand-operated switch. No effect on probes.
    pub fn set_active(&self, active: bool) {
        if let SwitchSource::Flag(flag) = &self.source {
            flag.store(active, Ordering::Release);
        }
    }

    /// Make reads fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    /// Current state without going through the driver trait.
    pub fn peek(&self) -> bool {
        match &self.source {
            SwitchSource::Flag(flag) => flag.load(Ordering::Acquire),
            SwitchSource::Probe(probe) => probe(),
        }
    }
}

impl LimitSwitch for SimLimitSwitch {
    fn is_active(&mut self) -> DriverResult<bool> {
        if self.failing.load(Ordering::Acquire) {
            return Err(DriverError::Unavailable("simulated switch".into()));
        }
        Ok(self.peek())
    }
}

#[derive(Debug, Default)]
struct ServoState {
    commands: Vec<Degrees>,
    attached: bool,
    detaches: u32,
    failing: bool,
}

/// Simulated servo recording every commanded angle.
#[derive(Debug, Clone, Default)]
pub struct SimServo {
    state: Arc<Mutex<ServoState>>,
}

impl SimServo {
    /// Attached servo with no command history.
    pub fn new() -> Self {
        let servo = Self::default();
        servo.state.lock().attached = true;
        servo
    }

    /// Every angle commanded so far, in order.
    pub fn commands(&self) -> Vec<Degrees> {
        self.state.lock().commands.clone()
    }

    /// Most recent commanded angle.
    pub fn angle(&self) -> Option<Degrees> {
        self.state.lock().commands.last().copied()
    }

    /// Forget recorded commands.
    pub fn clear_commands(&self) {
        self.state.lock().commands.clear();
    }

    /// Whether the servo is holding torque.
    pub fn is_attached(&self) -> bool {
        self.state.lock().attached
    }

    /// Number of detach calls.
    pub fn detaches(&self) -> u32 {
        self.state.lock().detaches
    }

    /// Make every call fail.
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().failing = failing;
    }
}

impl Servo for SimServo {
    fn set_angle(&mut self, angle: Degrees) -> DriverResult<()> {
        let mut state = self.state.lock();
        if state.failing {
            return Err(DriverError::Unavailable("simulated servo".into()));
        }
        if !state.attached {
            return Err(DriverError::Unavailable("servo detached".into()));
        }
        state.commands.push(angle);
        Ok(())
    }

    fn detach(&mut self) -> DriverResult<()> {
        let mut state = self.state.lock();
        if state.failing {
            return Err(DriverError::Unavailable("simulated servo".into()));
        }
        state.attached = false;
        state.detaches += 1;
        Ok(())
    }

    fn attach(&mut self) -> DriverResult<()> {
        let mut state = self.state.lock();
        if state.failing {
            return Err(DriverError::Unavailable("simulated servo".into()));
        }
        state.attached = true;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct OutputState {
    on: bool,
    history: Vec<bool>,
    failing: bool,
}

/// Simulated relay output.
#[derive(Debug, Clone, Default)]
pub struct SimOutput {
    state: Arc<Mutex<OutputState>>,
}

impl SimOutput {
    /// Output that starts off.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the output is on.
    pub fn is_on(&self) -> bool {
        self.state.lock().on
    }

    /// Every value written, in order.
    pub fn history(&self) -> Vec<bool> {
        self.state.lock().history.clone()
    }

    /// Make writes fail.
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().failing = failing;
    }
}

impl DigitalOutput for SimOutput {
    fn set(&mut self, on: bool) -> DriverResult<()> {
        let mut state = self.state.lock();
        if state.failing {
            return Err(DriverError::Unavailable("simulated output".into()));
        }
        state.on = on;
        state.history.push(on);
        Ok(())
    }
}

#[derive(Debug)]
struct ProbeState {
    celsius: f32,
    failing: bool,
}

/// Simulated temperature probe.
#[derive(Debug, Clone)]
pub struct SimTemperatureSensor {
    id: String,
    state: Arc<Mutex<ProbeState>>,
}

impl SimTemperatureSensor {
    /// Probe `id` reading `celsius`.
    pub fn new(id: impl Into<String>, celsius: f32) -> Self {
        Self {
            id: id.into(),
            state: Arc::new(Mutex::new(ProbeState {
                celsius,
                failing: false,
            })),
        }
    }

    /// Change the reported temperature.
    pub fn set_celsius(&self, celsius: f32) {
        self.state.lock().celsius = celsius;
    }

    /// Make reads fail.
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().failing = failing;
    }
}

impl TemperatureSensor for SimTemperatureSensor {
    fn id(&self) -> &str {
        &self.id
    }

    fn read_celsius(&mut self) -> DriverResult<f32> {
        let state = self.state.lock();
        if state.failing {
            return Err(DriverError::Sensor {
                sensor: self.id.clone(),
                message: "no response".into(),
            });
        }
        Ok(state.celsius)
    }
}

#[derive(Debug)]
struct TablePlant {
    /// 0.0 at the back switch, 1.0 at the front switch.
    position: f32,
    forward: bool,
    backward: bool,
    both_energized: bool,
    commands: Vec<(TableLeg, bool)>,
    travel_time: Duration,
    updated: Instant,
}

impl TablePlant {
    fn advance(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.updated).as_secs_f32();
        self.updated = now;

        let span = self.travel_time.as_secs_f32().max(f32::EPSILON);
        let delta = elapsed / span;
        match (self.forward, self.backward) {
            (true, false) => self.position = (self.position + delta).min(1.0),
            (false, true) => self.position = (self.position - delta).max(0.0),
            _ => {}
        }
    }
}

/// Simulated reciprocating table: two drive relays moving a carriage
/// between a back and a front end switch in `travel_time`.
#[derive(Debug, Clone)]
pub struct SimTable {
    plant: Arc<Mutex<TablePlant>>,
}

impl SimTable {
    /// Table halfway between the switches.
    pub fn new(travel_time: Duration) -> Self {
        Self {
            plant: Arc::new(Mutex::new(TablePlant {
                position: 0.5,
                forward: false,
                backward: false,
                both_energized: false,
                commands: Vec::new(),
                travel_time,
                updated: Instant::now(),
            })),
        }
    }

    /// Carriage position, 0.0 = back switch, 1.0 = front switch.
    pub fn position(&self) -> f32 {
        let mut plant = self.plant.lock();
        plant.advance();
        plant.position
    }

    /// Place the carriage.
    pub fn set_position(&self, position: f32) {
        let mut plant = self.plant.lock();
        plant.advance();
        plant.position = position.clamp(0.0, 1.0);
    }

    /// Drive commands issued so far.
    pub fn commands(&self) -> Vec<(TableLeg, bool)> {
        self.plant.lock().commands.clone()
    }

    /// Whether both relays were ever energized at once.
    pub fn was_double_driven(&self) -> bool {
        self.plant.lock().both_energized
    }

    /// Whether either relay is energized now.
    pub fn is_driving(&self) -> bool {
        let plant = self.plant.lock();
        plant.forward || plant.backward
    }

    /// Relay for one direction.
    pub fn drive(&self, leg: TableLeg) -> SimTableDrive {
        SimTableDrive {
            plant: Arc::clone(&self.plant),
            leg,
        }
    }

    /// End switch for one direction.
    pub fn limit(&self, leg: TableLeg) -> SimLimitSwitch {
        let plant = Arc::clone(&self.plant);
        SimLimitSwitch::probe(move || {
            let mut plant = plant.lock();
            plant.advance();
            match leg {
                TableLeg::Forward => plant.position >= 1.0,
                TableLeg::Backward => plant.position <= 0.0,
            }
        })
    }
}

/// One drive relay of a [`SimTable`].
#[derive(Debug, Clone)]
pub struct SimTableDrive {
    plant: Arc<Mutex<TablePlant>>,
    leg: TableLeg,
}

impl DigitalOutput for SimTableDrive {
    fn set(&mut self, on: bool) -> DriverResult<()> {
        let mut plant = self.plant.lock();
        plant.advance();
        match self.leg {
            TableLeg::Forward => plant.forward = on,
            TableLeg::Backward => plant.backward = on,
        }
        if plant.forward && plant.backward {
            plant.both_energized = true;
        }
        plant.commands.push((self.leg, on));
        Ok(())
    }
}

/// Inspection handles for a fully simulated machine.
#[derive(Debug, Clone)]
pub struct SimHandles {
    /// Cleaning head stepper.
    pub stepper: SimStepper,
    /// Trigger servo.
    pub servo: SimServo,
    /// Table carriage, relays and end switches.
    pub table: SimTable,
    /// Fan relay.
    pub fan: SimOutput,
    /// Red lights relay.
    pub lights: SimOutput,
    /// Temperature probes, one per configured sensor.
    pub sensors: Vec<SimTemperatureSensor>,
    /// Stepper hard limit switches.
    pub hard_limits: Vec<SimLimitSwitch>,
    /// Operator inputs, one per configured name.
    pub inputs: Vec<(String, SimLimitSwitch)>,
}

impl SimHandles {
    /// Operator input by name.
    pub fn input(&self, name: &str) -> Option<&SimLimitSwitch> {
        self.inputs
            .iter()
            .find(|(input, _)| input == name)
            .map(|(_, switch)| switch)
    }

    /// Probe by sensor id.
    pub fn sensor(&self, id: &str) -> Option<&SimTemperatureSensor> {
        self.sensors.iter().find(|s| s.id == id)
    }
}

/// Build simulated drivers for every channel of `config`.
///
/// The home switch asserts at physical position 0, sensors start at 20 °C
/// and the table needs 200 ms per leg.
pub fn simulated_drivers(config: &ControlConfig) -> (MachineDrivers, SimHandles) {
    let stepper = SimStepper::new();
    let servo = SimServo::new();
    let table = SimTable::new(Duration::from_millis(200));
    let fan = SimOutput::new();
    let lights = SimOutput::new();

    let sensors: Vec<SimTemperatureSensor> = config
        .safety
        .sensors
        .keys()
        .map(|id| SimTemperatureSensor::new(id.as_str(), 20.0))
        .collect();

    let hard_limits = vec![SimLimitSwitch::new(false), SimLimitSwitch::new(false)];
    let inputs: Vec<(String, SimLimitSwitch)> = config
        .hardware
        .inputs
        .keys()
        .map(|name| (name.clone(), SimLimitSwitch::new(false)))
        .collect();

    let drivers = MachineDrivers {
        stepper: Box::new(stepper.clone()),
        home_switch: Some(Box::new(stepper.home_switch(0))),
        servo: Box::new(servo.clone()),
        table_forward: Box::new(table.drive(TableLeg::Forward)),
        table_backward: Box::new(table.drive(TableLeg::Backward)),
        front_limit: Box::new(table.limit(TableLeg::Forward)),
        back_limit: Box::new(table.limit(TableLeg::Backward)),
        fan: Box::new(fan.clone()),
        lights: Box::new(lights.clone()),
        sensors: sensors
            .iter()
            .map(|s| Box::new(s.clone()) as Box<dyn TemperatureSensor>)
            .collect(),
        hard_limits: vec![
            ("limit_a".into(), Box::new(hard_limits[0].clone()) as Box<dyn LimitSwitch>),
            ("limit_b".into(), Box::new(hard_limits[1].clone()) as Box<dyn LimitSwitch>),
        ],
        inputs: inputs
            .iter()
            .map(|(name, input)| (name.clone(), Box::new(input.clone()) as Box<dyn LimitSwitch>))
            .collect(),
    };

    let handles = SimHandles {
        stepper,
        servo,
        table,
        fan,
        lights,
        sensors,
        hard_limits,
        inputs,
    };

    (drivers, handles)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stepper_tracks_position() {
        let mut stepper = SimStepper::new();
        let handle = stepper.clone();

        stepper.set_direction(Direction::Forward).unwrap();
        for _ in 0..5 {
            stepper.step(1000).unwrap();
        }
        stepper.set_direction(Direction::Backward).unwrap();
        stepper.step(1000).unwrap();

        assert_eq!(handle.position(), 4);
        assert_eq!(handle.pulses(), 6);
    }

    #[test]
    fn test_stepper_failure_injection() {
        let mut stepper = SimStepper::new();
        stepper.fail_after(2);

        assert!(stepper.step(0).is_ok());
        assert!(stepper.step(0).is_ok());
        assert!(stepper.step(0).is_err());
        assert_eq!(stepper.position(), 2);
    }

    #[test]
    fn test_home_switch_follows_stepper() {
        let stepper = SimStepper::new();
        let mut home = stepper.home_switch(0);

        stepper.set_position(10);
        assert!(!home.is_active().unwrap());
        stepper.set_position(0);
        assert!(home.is_active().unwrap());
    }

    #[test]
    fn test_table_reaches_front() {
        let table = SimTable::new(Duration::from_millis(20));
        let mut forward = table.drive(TableLeg::Forward);
        let mut front = table.limit(TableLeg::Forward);

        assert!(!front.is_active().unwrap());
        forward.set(true).unwrap();
        thread::sleep(Duration::from_millis(40));
        assert!(front.is_active().unwrap());
        assert_eq!(table.commands(), vec![(TableLeg::Forward, true)]);
    }

    #[test]
    fn test_detached_servo_rejects_angles() {
        let mut servo = SimServo::new();
        servo.detach().unwrap();
        assert!(servo.set_angle(Degrees(10.0)).is_err());
        servo.attach().unwrap();
        servo.set_angle(Degrees(10.0)).unwrap();
        assert_eq!(servo.commands(), vec![Degrees(10.0)]);
    }
}
