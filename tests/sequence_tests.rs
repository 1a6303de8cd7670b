//! Integration tests for the sequence runner.

mod common;

use std::sync::Arc;
use std::time::Duration;

use laserclean_core::sequence::{ErrorPolicy, StepOutcome};
use laserclean_core::{
    Direction, Error, Machine, MemoryStore, RunStatus, Sequence, Step, StepAction,
};

use common::{fast_config, machine, wait_until};

fn wait(duration_ms: u64) -> StepAction {
    StepAction::Wait { duration_ms }
}

fn jog_back(steps: i64) -> StepAction {
    StepAction::Jog {
        direction: Direction::Backward,
        steps,
    }
}

// =============================================================================
// Failure handling
// =============================================================================

#[test]
fn test_failed_step_ends_run() {
    let (machine, sim) = machine();
    let sequence = Sequence::new("fails-midway")
        .with_step(StepAction::Fan { on: true })
        .with_step(jog_back(10))
        .with_step(StepAction::Lights { on: true });

    let status = machine.runner().run(&sequence).unwrap();

    assert!(matches!(status.status, RunStatus::Failed(Error::OutOfRange { .. })));
    assert_eq!(status.records.len(), 2);
    assert_eq!(status.records[0].outcome, StepOutcome::Completed);
    assert!(matches!(status.records[1].outcome, StepOutcome::Failed(_)));
    assert!(sim.fan.is_on());
    assert!(!sim.lights.is_on(), "third step must not run");
    assert!(!machine.runner().is_running());
}

#[test]
fn test_invalid_sequence_rejected_before_any_step() {
    let (machine, sim) = machine();
    let sequence = Sequence::new("bad-target")
        .with_step(StepAction::Fan { on: true })
        .with_step(StepAction::MoveAbsolute { target: 50_000 })
        .with_step(StepAction::Lights { on: true });

    let err = machine.runner().run(&sequence).unwrap_err();

    assert!(matches!(err, Error::InvalidSequence(_)));
    assert!(!sim.fan.is_on());
    assert!(!machine.runner().is_running());
}

#[test]
fn test_skip_policy_continues() {
    let (machine, sim) = machine();
    let sequence = Sequence::new("skips")
        .with_step(Step::new(jog_back(10)).with_policy(ErrorPolicy::Skip))
        .with_step(StepAction::Fan { on: true });

    let status = machine.runner().run(&sequence).unwrap();

    assert_eq!(status.status, RunStatus::Completed);
    assert!(matches!(
        status.records[0].outcome,
        StepOutcome::Skipped(Error::OutOfRange { .. })
    ));
    assert!(sim.fan.is_on());
}

#[test]
fn test_retry_policy_counts_attempts() {
    let (machine, _sim) = machine();
    let sequence = Sequence::new("retries").with_step(Step::new(jog_back(10)).with_policy(
        ErrorPolicy::Retry {
            attempts: 2,
            delay_ms: 1,
        },
    ));

    let status = machine.runner().run(&sequence).unwrap();

    assert!(matches!(status.status, RunStatus::Failed(_)));
    assert_eq!(status.records[0].attempts, 3);
}

#[test]
fn test_trip_fails_running_sequence() {
    let (machine, _sim) = machine();
    let sequence = Sequence::new("tripped")
        .with_step(wait(20))
        .with_step(StepAction::Index {
            direction: Direction::Forward,
        });

    machine.emergency_stop();
    let status = machine.runner().run(&sequence).unwrap();

    assert!(matches!(status.status, RunStatus::Failed(Error::Unsafe(_))));
    assert_eq!(machine.position(), 0);
}

// =============================================================================
// Run control
// =============================================================================

#[test]
fn test_pause_takes_effect_between_steps() {
    let (machine, sim) = machine();
    let runner = machine.runner();
    let sequence = Sequence::new("pausable")
        .with_step(wait(100))
        .with_step(StepAction::Fan { on: true });

    machine.start_sequence(sequence).unwrap();
    assert!(wait_until(Duration::from_secs(1), || runner.status().current_step == Some(0)));
    runner.pause().unwrap();

    assert!(wait_until(Duration::from_secs(1), || {
        runner.status().status == RunStatus::Paused
    }));
    std::thread::sleep(Duration::from_millis(100));
    assert!(!sim.fan.is_on());

    runner.resume().unwrap();
    let status = runner.wait();
    assert_eq!(status.status, RunStatus::Completed);
    assert!(sim.fan.is_on());
}

#[test]
fn test_abort_interrupts_wait() {
    let (machine, sim) = machine();
    let runner = machine.runner();
    let sequence = Sequence::new("long")
        .with_step(wait(10_000))
        .with_step(StepAction::Fan { on: true });

    machine.start_sequence(sequence).unwrap();
    assert!(wait_until(Duration::from_secs(1), || runner.status().current_step == Some(0)));
    runner.abort().unwrap();

    let status = runner.wait();
    assert_eq!(status.status, RunStatus::Aborted);
    assert_eq!(status.records.last().unwrap().outcome, StepOutcome::Aborted);
    assert!(status.elapsed < Duration::from_secs(5));
    assert!(!sim.fan.is_on());
}

#[test]
fn test_abort_stops_running_move() {
    let (machine, sim) = machine();
    sim.stepper.clone().with_real_time();
    let runner = machine.runner();
    let sequence = Sequence::new("slow-jog")
        .with_step(StepAction::Jog {
            direction: Direction::Forward,
            steps: 5_000,
        })
        .with_step(StepAction::Fan { on: true });

    machine.start_sequence(sequence).unwrap();
    assert!(wait_until(Duration::from_secs(2), || sim.stepper.pulses() >= 10));
    runner.abort().unwrap();

    let status = runner.wait();
    assert_eq!(status.status, RunStatus::Aborted);
    assert_eq!(status.records.len(), 1);
    assert_eq!(status.records[0].outcome, StepOutcome::Aborted);
    assert!(status.elapsed < Duration::from_secs(5));

    let position = machine.position();
    assert!(position < 5_000, "head ran on to {position}");
    assert_eq!(sim.stepper.position(), position);
    assert!(!sim.fan.is_on());
}

#[test]
fn test_wait_input_holds_until_pressed() {
    let (machine, sim) = machine();
    let runner = machine.runner();
    let sequence = Sequence::new("operator-start")
        .with_step(StepAction::WaitInput {
            input: "button_in".into(),
            timeout_ms: None,
        })
        .with_step(StepAction::Fan { on: true });

    machine.start_sequence(sequence).unwrap();
    assert!(wait_until(Duration::from_secs(1), || runner.status().current_step == Some(0)));
    std::thread::sleep(Duration::from_millis(30));
    assert!(!sim.fan.is_on());

    sim.input("button_in").unwrap().set_active(true);
    let status = runner.wait();
    assert_eq!(status.status, RunStatus::Completed);
    assert!(sim.fan.is_on());
}

#[test]
fn test_wait_input_timeout_follows_policy() {
    let (machine, sim) = machine();
    let timed_out = || StepAction::WaitInput {
        input: "fire_button".into(),
        timeout_ms: Some(30),
    };

    let skipping = Sequence::new("optional-confirm")
        .with_step(Step::new(timed_out()).with_policy(ErrorPolicy::Skip))
        .with_step(StepAction::Lights { on: true });
    let status = machine.runner().run(&skipping).unwrap();
    assert_eq!(status.status, RunStatus::Completed);
    assert!(matches!(
        status.records[0].outcome,
        StepOutcome::Skipped(Error::InputTimeout { timeout_ms: 30, .. })
    ));
    assert!(sim.lights.is_on());

    let strict = Sequence::new("required-confirm").with_step(timed_out());
    let status = machine.runner().run(&strict).unwrap();
    assert!(matches!(status.status, RunStatus::Failed(Error::InputTimeout { .. })));

    let unknown = Sequence::new("pedal").with_step(StepAction::WaitInput {
        input: "pedal".into(),
        timeout_ms: None,
    });
    assert!(matches!(
        machine.runner().run(&unknown),
        Err(Error::InvalidSequence(_))
    ));
}

#[test]
fn test_single_run_at_a_time() {
    let (machine, _sim) = machine();
    let runner = machine.runner();

    assert_eq!(runner.pause().unwrap_err(), Error::NotRunning);
    assert_eq!(runner.abort().unwrap_err(), Error::NotRunning);

    machine
        .start_sequence(Sequence::new("first").with_step(wait(10_000)))
        .unwrap();
    assert_eq!(
        machine
            .start_sequence(Sequence::new("second").with_step(wait(1)))
            .unwrap_err(),
        Error::AlreadyRunning
    );
    assert_eq!(runner.status().name, "first");

    runner.abort().unwrap();
    runner.wait();
    assert!(!runner.is_running());
}

#[test]
fn test_pass_from_toml() {
    let (machine, sim) = machine();
    let sequence = Sequence::from_toml(
        r#"
name = "pass"

[[steps]]
action = "home"

[[steps]]
action = "fan"
on = true

[[steps]]
action = "index"
direction = "forward"
post_delay_ms = 5

[[steps]]
action = "fire_fiber"
cycles = 1

[[steps]]
action = "table_forward"
"#,
    )
    .unwrap();

    let status = machine.runner().run(&sequence).unwrap();

    assert_eq!(status.status, RunStatus::Completed, "{:?}", status.records);
    assert_eq!(status.total_steps, 5);
    assert_eq!(machine.position(), 500);
    assert!(sim.servo.commands().len() >= 3);
    assert!(sim.table.position() >= 1.0);
}

// =============================================================================
// Storage
// =============================================================================

#[test]
fn test_stored_sequences() {
    let (machine, sim) = Machine::simulated(fast_config()).unwrap();
    let machine = machine.with_store(Arc::new(MemoryStore::new())).unwrap();
    let sequence = Sequence::new("lights").with_step(StepAction::Lights { on: true });

    machine.save_sequence(&sequence).unwrap();
    assert_eq!(machine.sequence_names().unwrap(), vec!["lights".to_string()]);
    assert_eq!(machine.load_sequence("lights").unwrap(), sequence);

    machine.start_stored_sequence("lights").unwrap();
    assert_eq!(machine.runner().wait().status, RunStatus::Completed);
    assert!(sim.lights.is_on());

    assert!(machine.delete_sequence("lights").unwrap());
    assert!(matches!(
        machine.load_sequence("lights"),
        Err(Error::InvalidSequence(_))
    ));
}

#[test]
fn test_storage_needs_store() {
    let (machine, _sim) = machine();

    assert_eq!(
        machine.sequence_names().unwrap_err(),
        Error::InvalidArgument("no record store attached")
    );
}
