//! Integration tests for the safety interlock across every controller.

mod common;

use std::time::Duration;

use laserclean_core::safety::TripReason;
use laserclean_core::{Direction, Error, MotionState, TableState, TriggerState};

use common::{machine, wait_until, HEAD_SENSOR};

fn over_temperature() -> TripReason {
    TripReason::OverTemperature(HEAD_SENSOR.try_into().unwrap())
}

#[test]
fn test_over_temperature_blocks_jog() {
    let (machine, sim) = machine();
    sim.sensor(HEAD_SENSOR).unwrap().set_celsius(51.0);

    let state = machine.safety().evaluate_temperatures();

    assert!(state.tripped);
    assert_eq!(state.reason, Some(over_temperature()));
    assert_eq!(
        machine.motion().jog(Direction::Forward, 10, None).unwrap_err(),
        Error::Unsafe(over_temperature())
    );
}

#[test]
fn test_every_operation_unsafe_while_tripped() {
    let (machine, sim) = machine();
    machine.motion().jog(Direction::Forward, 300, None).unwrap();
    machine.emergency_stop();

    let pulses = sim.stepper.pulses();
    let commands = sim.servo.commands().len();
    let relays = sim.table.commands().len();
    let unsafe_stop = Error::Unsafe(TripReason::ManualStop);

    let motion = machine.motion();
    assert_eq!(motion.jog(Direction::Forward, 10, None).unwrap_err(), unsafe_stop);
    assert_eq!(motion.index(Direction::Forward, None).unwrap_err(), unsafe_stop);
    assert_eq!(motion.move_absolute(10, None).unwrap_err(), unsafe_stop);

    let trigger = machine.trigger();
    assert_eq!(trigger.fire_start().unwrap_err(), unsafe_stop);
    assert_eq!(trigger.fire_fiber_sequence(2).unwrap_err(), unsafe_stop);

    let table = machine.table();
    assert_eq!(table.move_forward().unwrap_err(), unsafe_stop);
    assert_eq!(table.move_backward().unwrap_err(), unsafe_stop);
    assert_eq!(table.start_auto_cycle(None).unwrap_err(), unsafe_stop);

    assert_eq!(machine.position(), 300);
    assert_eq!(motion.state(), MotionState::Idle);
    assert_eq!(sim.stepper.pulses(), pulses);
    assert_eq!(sim.servo.commands().len(), commands);
    assert_eq!(sim.table.commands().len(), relays);
    assert_eq!(machine.table_state(), TableState::Idle);
    assert_ne!(machine.trigger_state(), TriggerState::Firing);
}

#[test]
fn test_home_recovers_from_manual_stop() {
    let (machine, _sim) = machine();
    machine.motion().jog(Direction::Forward, 500, None).unwrap();
    machine.emergency_stop();

    machine.motion().home().expect("homing is the recovery path");
    assert_eq!(machine.position(), 0);

    machine.reset().unwrap();
    assert!(!machine.safety_state().tripped);
    machine.motion().jog(Direction::Forward, 10, None).unwrap();
}

#[test]
fn test_clear_refused_while_hot() {
    let (machine, sim) = machine();
    let probe = sim.sensor(HEAD_SENSOR).unwrap().clone();
    probe.set_celsius(60.0);
    machine.safety().evaluate_temperatures();

    assert_eq!(
        machine.reset().unwrap_err(),
        Error::TripConditionActive(over_temperature())
    );
    assert_eq!(
        machine.motion().home().unwrap_err(),
        Error::Unsafe(over_temperature())
    );

    probe.set_celsius(25.0);
    machine.reset().unwrap();
}

#[test]
fn test_background_monitor_trips_on_hard_limit() {
    let (machine, sim) = machine();
    machine.start_background().unwrap();

    sim.hard_limits[0].set_active(true);

    assert!(wait_until(Duration::from_secs(2), || machine.safety_state().tripped));
    assert!(matches!(
        machine.safety_state().reason,
        Some(TripReason::LimitFault(_))
    ));
    machine.shutdown();
}

#[test]
fn test_warning_band_does_not_trip() {
    let (machine, sim) = machine();
    sim.sensor(HEAD_SENSOR).unwrap().set_celsius(47.0);

    let state = machine.safety().evaluate_temperatures();

    assert!(!state.tripped);
    assert_eq!(state.warnings.len(), 1);
    machine.motion().jog(Direction::Forward, 10, None).unwrap();
}
