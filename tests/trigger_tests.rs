//! Integration tests for the trigger servo and the outputs that follow it.

mod common;

use std::thread;
use std::time::Duration;

use laserclean_core::trigger::Interruption;
use laserclean_core::{Degrees, Error, TriggerState, TripReason};

use common::{fast_config, machine, wait_until};

// =============================================================================
// Fiber pattern
// =============================================================================

#[test]
fn test_fiber_command_order() {
    let mut config = fast_config();
    config.trigger.position_a = Degrees(-30.0);
    config.trigger.position_b = Degrees(30.0);
    let (machine, sim) = laserclean_core::Machine::simulated(config).unwrap();
    sim.servo.clear_commands();

    let outcome = machine.trigger().fire_fiber_sequence(2).unwrap();

    assert!(outcome.is_complete());
    assert_eq!(outcome.completed_cycles, 2);
    assert_eq!(
        sim.servo.commands(),
        vec![
            Degrees(-30.0),
            Degrees(30.0),
            Degrees(-30.0),
            Degrees(30.0),
            Degrees(-30.0)
        ]
    );
    assert_eq!(machine.trigger_state(), TriggerState::Normal);
}

#[test]
fn test_fiber_interrupted_by_trip() {
    let mut config = fast_config();
    config.trigger.fiber_step_delay_ms = 20;
    let (machine, sim) = laserclean_core::Machine::simulated(config).unwrap();

    let trigger = std::sync::Arc::clone(machine.trigger());
    let pattern = thread::spawn(move || trigger.fire_fiber_sequence(50));

    assert!(wait_until(Duration::from_secs(2), || {
        machine.trigger_state() == TriggerState::FiberFiring
    }));
    thread::sleep(Duration::from_millis(50));
    machine.emergency_stop();

    let outcome = pattern.join().expect("pattern thread").unwrap();
    assert_eq!(outcome.interruption, Some(Interruption::Tripped(TripReason::ManualStop)));
    assert!(outcome.completed_cycles < 50);
    assert_eq!(sim.servo.angle(), Some(Degrees(0.0)));
    assert_eq!(machine.trigger_state(), TriggerState::Stopped);
}

#[test]
fn test_stop_interrupts_fiber() {
    let mut config = fast_config();
    config.trigger.fiber_step_delay_ms = 20;
    let (machine, _sim) = laserclean_core::Machine::simulated(config).unwrap();

    let trigger = std::sync::Arc::clone(machine.trigger());
    let pattern = thread::spawn(move || trigger.fire_fiber_sequence(50));
    assert!(wait_until(Duration::from_secs(2), || {
        machine.trigger_state() == TriggerState::FiberFiring
    }));

    machine.trigger().stop().unwrap();

    let outcome = pattern.join().expect("pattern thread").unwrap();
    assert_eq!(outcome.interruption, Some(Interruption::Stopped));
    assert_eq!(machine.trigger_state(), TriggerState::Normal);
}

// =============================================================================
// Interlock
// =============================================================================

#[test]
fn test_fire_refused_while_tripped_but_stop_allowed() {
    let (machine, sim) = machine();
    machine.trigger().fire_start().unwrap();

    machine.emergency_stop();
    assert_eq!(machine.trigger_state(), TriggerState::Stopped);
    assert_eq!(sim.servo.angle(), Some(Degrees(0.0)));

    assert_eq!(
        machine.trigger().fire_start().unwrap_err(),
        Error::Unsafe(TripReason::ManualStop)
    );
    machine.trigger().fire_stop().expect("moving to safe is always allowed");
    assert_eq!(machine.trigger_state(), TriggerState::Normal);
}

// =============================================================================
// Outputs follow the trigger
// =============================================================================

#[test]
fn test_outputs_follow_firing() {
    let mut config = fast_config();
    config.outputs.fan_off_delay_ms = 60;
    config.outputs.lights_off_delay_ms = 20;
    let (machine, sim) = laserclean_core::Machine::simulated(config).unwrap();
    machine.start_background().unwrap();

    machine.trigger().fire_start().unwrap();
    assert!(sim.fan.is_on());
    assert!(sim.lights.is_on());

    machine.trigger().fire_stop().unwrap();
    assert!(machine.output_status().fan_off_in.is_some());

    assert!(wait_until(Duration::from_secs(2), || !sim.lights.is_on()));
    assert!(wait_until(Duration::from_secs(2), || !sim.fan.is_on()));
}

#[test]
fn test_emergency_stop_keeps_fan_running() {
    let (machine, sim) = machine();
    machine.outputs().set_fan(true).unwrap();

    machine.emergency_stop();

    assert!(sim.fan.is_on());
    machine.outputs().set_fan(false).expect("outputs are not interlocked");
}
