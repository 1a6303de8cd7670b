//! Integration tests for the reciprocating table.

mod common;

use std::time::Duration;

use laserclean_core::{Error, TableLeg, TableState};

use common::{machine, wait_until};

#[test]
fn test_move_forward_with_front_asserted_issues_no_drive() {
    let (machine, sim) = machine();
    sim.table.set_position(1.0);
    let before = sim.table.commands();

    assert_eq!(
        machine.table().move_forward().unwrap_err(),
        Error::LimitAlreadyActive(TableLeg::Forward)
    );
    assert_eq!(sim.table.commands(), before);
    assert_eq!(machine.table_state(), TableState::Idle);
}

#[test]
fn test_manual_legs_reach_switches() {
    let (machine, sim) = machine();

    machine.table().move_forward().unwrap();
    assert!(sim.table.position() >= 1.0);
    assert!(!sim.table.is_driving());

    machine.table().move_backward().unwrap();
    assert!(sim.table.position() <= 0.0);
    assert_eq!(machine.table_state(), TableState::Idle);
    assert!(!sim.table.was_double_driven());

    let status = machine.table().status();
    assert_eq!(status.back_limit, Some(true));
    assert_eq!(status.front_limit, Some(false));
}

#[test]
fn test_auto_cycle_counts_complete_pairs() {
    let (machine, sim) = machine();
    let table = machine.table();

    table.start_auto_cycle(Some(Duration::from_millis(5))).unwrap();
    assert!(table.is_auto_cycling());
    assert_eq!(
        table.start_auto_cycle(None).unwrap_err(),
        Error::Busy(laserclean_core::Actuator::Table)
    );

    assert!(wait_until(Duration::from_secs(5), || table.cycle_count() >= 2));
    table.stop_auto_cycle();

    let counted = table.cycle_count();
    assert!(counted >= 2);
    assert_eq!(table.state(), TableState::Idle);
    assert!(!sim.table.is_driving());
    assert!(!sim.table.was_double_driven());

    // Counter survives the stop until reset
    assert_eq!(table.cycle_count(), counted);
    table.reset_cycle_count();
    assert_eq!(table.cycle_count(), 0);
}

#[test]
fn test_partial_leg_not_counted() {
    let (machine, _sim) = machine();
    let table = machine.table();

    table.start_auto_cycle(Some(Duration::from_millis(5))).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        table.state()
            == TableState::AutoCycling {
                leg: TableLeg::Backward,
                dwelling: false,
            }
    }));
    table.stop();

    assert_eq!(table.cycle_count(), 0);
    assert_eq!(table.state(), TableState::Idle);
}

#[test]
fn test_auto_cycle_halted_by_trip() {
    let (machine, sim) = machine();
    let table = machine.table();

    table.start_auto_cycle(None).unwrap();
    assert!(wait_until(Duration::from_secs(2), || sim.table.is_driving()));
    machine.emergency_stop();

    assert!(wait_until(Duration::from_secs(2), || {
        matches!(table.state(), TableState::Stopped(Error::Unsafe(_)))
    }));
    assert!(!sim.table.is_driving());
    assert!(!table.is_auto_cycling());
}
