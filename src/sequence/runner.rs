//! Sequence execution with pause, resume and abort.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::inputs::InputBank;
use crate::motion::MotionController;
use crate::outputs::OutputController;
use crate::safety::Actuator;
use crate::scheduler::{spawn_task, TaskHandle};
use crate::sync::{sleep_unless, BusyGuard};
use crate::table::TableController;
use crate::trigger::{Interruption, TriggerController};

use super::step::{ErrorPolicy, Step, StepAction, ValidationContext};
use super::Sequence;

/// How often a paused run re-checks for abort.
const PAUSE_POLL: Duration = Duration::from_millis(50);

/// The controllers a sequence drives.
#[derive(Debug, Clone)]
pub struct Actuators {
    /// Cleaning head.
    pub motion: Arc<MotionController>,
    /// Trigger servo.
    pub trigger: Arc<TriggerController>,
    /// Reciprocating table.
    pub table: Arc<TableController>,
    /// Fan and red lights.
    pub outputs: Arc<OutputController>,
    /// Operator buttons and pedals.
    pub inputs: Arc<InputBank>,
}

impl Actuators {
    /// Current travel range and preset names, for validating a sequence.
    pub fn validation_context(&self) -> ValidationContext {
        ValidationContext {
            limits: self.motion.limits(),
            presets: self
                .motion
                .presets()
                .into_iter()
                .map(|(name, _)| name)
                .collect(),
            inputs: self.inputs.names().map(str::to_owned).collect(),
        }
    }

    fn arm_stop(&self, actuator: Actuator) {
        match actuator {
            Actuator::Motion => self.motion.arm_stop(),
            Actuator::Trigger => self.trigger.arm_stop(),
            Actuator::Table => self.table.arm_stop(),
            Actuator::Outputs => {}
        }
    }

    fn disarm_stop(&self, actuator: Actuator) {
        match actuator {
            Actuator::Motion => self.motion.disarm_stop(),
            Actuator::Trigger => self.trigger.disarm_stop(),
            Actuator::Table => self.table.disarm_stop(),
            Actuator::Outputs => {}
        }
    }

    /// Forward `stop()` to the controller that owns `actuator`.
    fn stop(&self, actuator: Actuator) {
        match actuator {
            Actuator::Motion => self.motion.stop(),
            Actuator::Trigger => {
                if let Err(e) = self.trigger.stop() {
                    warn!(error = %e, "trigger stop failed during abort");
                }
            }
            Actuator::Table => self.table.stop(),
            // Switching an output is instantaneous
            Actuator::Outputs => {}
        }
    }
}

/// Lifecycle of a run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunStatus {
    /// Accepted, not started yet.
    Pending,
    /// Executing steps.
    Running,
    /// Held between steps until `resume()`.
    Paused,
    /// Every step ran.
    Completed,
    /// Ended by `abort()`.
    Aborted,
    /// A step failed under the `fail` policy.
    Failed(Error),
}

impl RunStatus {
    /// Whether the run has ended.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Aborted | RunStatus::Failed(_)
        )
    }
}

impl core::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RunStatus::Pending => f.write_str("pending"),
            RunStatus::Running => f.write_str("running"),
            RunStatus::Paused => f.write_str("paused"),
            RunStatus::Completed => f.write_str("completed"),
            RunStatus::Aborted => f.write_str("aborted"),
            RunStatus::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

/// How one step ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The operation succeeded.
    Completed,
    /// The operation failed and the `skip` policy moved on.
    Skipped(Error),
    /// The operation failed and ended the run.
    Failed(Error),
    /// `abort()` arrived while the step ran.
    Aborted,
}

/// Bookkeeping for one executed step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    /// Position in the sequence.
    pub index: usize,
    /// The step's `action` tag.
    pub action: &'static str,
    /// Result.
    pub outcome: StepOutcome,
    /// Times the operation was called, retries included.
    pub attempts: u32,
}

/// Snapshot of the current or most recent run.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceStatus {
    /// Sequence name, empty before the first run.
    pub name: String,
    /// Run lifecycle.
    pub status: RunStatus,
    /// Index of the step in flight or last executed.
    pub current_step: Option<usize>,
    /// Steps in the sequence.
    pub total_steps: usize,
    /// Time since the run started, frozen once it ends.
    pub elapsed: Duration,
    /// One record per executed step.
    pub records: Vec<StepRecord>,
}

struct RunBook {
    name: String,
    status: RunStatus,
    current_step: Option<usize>,
    total_steps: usize,
    started_at: Option<Instant>,
    finished_after: Option<Duration>,
    records: Vec<StepRecord>,
    owner: Option<Actuator>,
}

impl RunBook {
    fn idle() -> Self {
        Self {
            name: String::new(),
            status: RunStatus::Pending,
            current_step: None,
            total_steps: 0,
            started_at: None,
            finished_after: None,
            records: Vec::new(),
            owner: None,
        }
    }

    fn elapsed(&self) -> Duration {
        self.finished_after
            .or_else(|| self.started_at.map(|at| at.elapsed()))
            .unwrap_or(Duration::ZERO)
    }
}

/// Executes one [`Sequence`] at a time through the controllers' public
/// operations.
pub struct SequenceRunner {
    actuators: Actuators,
    book: Mutex<RunBook>,
    active: AtomicBool,
    abort_requested: AtomicBool,
    paused: Mutex<bool>,
    resumed: Condvar,
    task: Mutex<Option<TaskHandle>>,
}

impl core::fmt::Debug for SequenceRunner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let book = self.book.lock();
        f.debug_struct("SequenceRunner")
            .field("sequence", &book.name)
            .field("status", &book.status)
            .finish_non_exhaustive()
    }
}

impl SequenceRunner {
    /// Create an idle runner.
    pub fn new(actuators: Actuators) -> Self {
        Self {
            actuators,
            book: Mutex::new(RunBook::idle()),
            active: AtomicBool::new(false),
            abort_requested: AtomicBool::new(false),
            paused: Mutex::new(false),
            resumed: Condvar::new(),
            task: Mutex::new(None),
        }
    }

    /// Controllers this runner drives.
    pub fn actuators(&self) -> &Actuators {
        &self.actuators
    }

    /// Whether a run is active.
    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Snapshot of the current or most recent run.
    pub fn status(&self) -> SequenceStatus {
        let book = self.book.lock();
        SequenceStatus {
            name: book.name.clone(),
            status: book.status.clone(),
            current_step: book.current_step,
            total_steps: book.total_steps,
            elapsed: book.elapsed(),
            records: book.records.clone(),
        }
    }

    /// Claim the runner and validate `sequence` against the machine.
    fn admit(&self, sequence: &Sequence) -> Result<BusyGuard<'_>> {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::AlreadyRunning)?;
        let claim = BusyGuard::adopt(&self.active);

        if let Err(e) = sequence.validate(&self.actuators.validation_context()) {
            warn!(sequence = %sequence.name, error = %e, "sequence rejected");
            return Err(e);
        }

        self.abort_requested.store(false, Ordering::Release);
        *self.paused.lock() = false;
        *self.book.lock() = RunBook {
            name: sequence.name.clone(),
            total_steps: sequence.len(),
            started_at: Some(Instant::now()),
            ..RunBook::idle()
        };
        Ok(claim)
    }

    /// Validate `sequence` and run it on a background thread.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyRunning`] if a run is active
    /// - [`Error::InvalidSequence`] if any step fails validation; nothing runs
    pub fn start(self: &Arc<Self>, sequence: Sequence) -> Result<()> {
        self.admit(&sequence)?.keep();

        let runner = Arc::clone(self);
        let spawned = spawn_task("sequence-runner", move |_signal| {
            let _claim = BusyGuard::adopt(&runner.active);
            runner.execute(&sequence);
        });

        match spawned {
            Ok(task) => {
                let previous = self.task.lock().replace(task);
                drop(previous);
                Ok(())
            }
            Err(e) => {
                self.finish(RunStatus::Failed(e.clone()));
                drop(BusyGuard::adopt(&self.active));
                Err(e)
            }
        }
    }

    /// Validate `sequence` and run it on the calling thread.
    ///
    /// Step failures are reported in the returned status, not as an error.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyRunning`] if a run is active
    /// - [`Error::InvalidSequence`] if any step fails validation
    pub fn run(&self, sequence: &Sequence) -> Result<SequenceStatus> {
        let claim = self.admit(sequence)?;
        self.execute(sequence);
        drop(claim);
        Ok(self.status())
    }

    /// Block until the background run started by [`start`](Self::start)
    /// ends, then return its final status.
    pub fn wait(&self) -> SequenceStatus {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.join();
        }
        self.status()
    }

    /// Hold the run after the step in flight completes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRunning`] if no run is active.
    pub fn pause(&self) -> Result<()> {
        if !self.is_running() {
            return Err(Error::NotRunning);
        }
        *self.paused.lock() = true;
        info!("sequence pause requested");
        Ok(())
    }

    /// Continue a paused run at its next step.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRunning`] if no run is active.
    pub fn resume(&self) -> Result<()> {
        if !self.is_running() {
            return Err(Error::NotRunning);
        }
        *self.paused.lock() = false;
        self.resumed.notify_all();
        Ok(())
    }

    /// Stop the step in flight and end the run as aborted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRunning`] if no run is active.
    pub fn abort(&self) -> Result<()> {
        if !self.is_running() {
            return Err(Error::NotRunning);
        }
        self.abort_requested.store(true, Ordering::Release);

        let owner = self.book.lock().owner;
        info!(owner = ?owner, "sequence abort requested");
        if let Some(actuator) = owner {
            self.actuators.stop(actuator);
        }

        let _paused = self.paused.lock();
        self.resumed.notify_all();
        Ok(())
    }

    fn is_aborted(&self) -> bool {
        self.abort_requested.load(Ordering::Acquire)
    }

    fn set_status(&self, status: RunStatus) {
        self.book.lock().status = status;
    }

    fn execute(&self, sequence: &Sequence) {
        self.set_status(RunStatus::Running);
        info!(sequence = %sequence.name, steps = sequence.len(), "sequence started");

        let mut end = RunStatus::Completed;
        for (index, step) in sequence.steps.iter().enumerate() {
            if !self.checkpoint() {
                end = RunStatus::Aborted;
                break;
            }

            self.book.lock().current_step = Some(index);
            let record = self.run_step(index, step);
            let outcome = record.outcome.clone();
            self.book.lock().records.push(record);

            match outcome {
                StepOutcome::Aborted => {
                    end = RunStatus::Aborted;
                    break;
                }
                StepOutcome::Failed(e) => {
                    end = RunStatus::Failed(e);
                    break;
                }
                StepOutcome::Completed | StepOutcome::Skipped(_) => {}
            }

            if step.post_delay_ms > 0 && !self.delay(Duration::from_millis(step.post_delay_ms)) {
                end = RunStatus::Aborted;
                break;
            }
        }

        self.finish(end);
    }

    fn finish(&self, status: RunStatus) {
        let mut book = self.book.lock();
        book.finished_after = Some(book.elapsed());
        book.owner = None;
        match &status {
            RunStatus::Failed(e) => {
                warn!(sequence = %book.name, step = ?book.current_step, error = %e, "sequence failed")
            }
            other => info!(sequence = %book.name, status = %other, "sequence finished"),
        }
        book.status = status;
    }

    /// Between steps: honour a pending pause. Returns `false` once aborted.
    fn checkpoint(&self) -> bool {
        if self.is_aborted() {
            return false;
        }

        let mut paused = self.paused.lock();
        if *paused {
            self.set_status(RunStatus::Paused);
            info!("sequence paused");
            while *paused && !self.is_aborted() {
                let _ = self.resumed.wait_for(&mut paused, PAUSE_POLL);
            }
            if self.is_aborted() {
                return false;
            }
            self.set_status(RunStatus::Running);
            info!("sequence resumed");
        }
        true
    }

    fn delay(&self, duration: Duration) -> bool {
        sleep_unless(duration, || self.is_aborted())
    }

    /// Claim `owner` for the coming attempt. Returns `false` once aborted.
    ///
    /// Arming happens under the book lock that [`abort`](Self::abort) reads
    /// the owner through, so an abort either shows up in the check below or
    /// its forwarded stop reaches the attempt.
    fn claim(&self, owner: Option<Actuator>) -> bool {
        {
            let mut book = self.book.lock();
            book.owner = owner;
            if let Some(actuator) = owner {
                self.actuators.arm_stop(actuator);
            }
        }
        !self.is_aborted()
    }

    fn run_step(&self, index: usize, step: &Step) -> StepRecord {
        let action = step.action.name();
        let owner = step.action.actuator();

        let mut attempts = 0;
        let outcome = loop {
            attempts += 1;
            if !self.claim(owner) {
                break StepOutcome::Aborted;
            }
            debug!(index, action, attempt = attempts, "step started");

            let result = self.dispatch(&step.action);
            if let Some(actuator) = owner {
                self.actuators.disarm_stop(actuator);
            }
            if self.is_aborted() {
                break StepOutcome::Aborted;
            }

            let e = match result {
                Ok(()) => break StepOutcome::Completed,
                Err(e) => e,
            };
            match step.on_error {
                ErrorPolicy::Retry {
                    attempts: extra,
                    delay_ms,
                } if attempts <= extra => {
                    warn!(index, action, attempt = attempts, error = %e, "step failed, retrying");
                    if !self.delay(Duration::from_millis(delay_ms)) {
                        break StepOutcome::Aborted;
                    }
                }
                ErrorPolicy::Skip => {
                    warn!(index, action, error = %e, "step failed, skipped");
                    break StepOutcome::Skipped(e);
                }
                ErrorPolicy::Fail | ErrorPolicy::Retry { .. } => {
                    warn!(index, action, attempts, error = %e, "step failed");
                    break StepOutcome::Failed(e);
                }
            }
        };

        self.book.lock().owner = None;
        StepRecord {
            index,
            action,
            outcome,
            attempts,
        }
    }

    fn dispatch(&self, action: &StepAction) -> Result<()> {
        let machine = &self.actuators;
        match action {
            StepAction::Jog { direction, steps } => {
                machine.motion.jog(*direction, *steps, None).map(|_| ())
            }
            StepAction::Index { direction } => machine.motion.index(*direction, None).map(|_| ()),
            StepAction::MoveAbsolute { target } => {
                machine.motion.move_absolute(*target, None).map(|_| ())
            }
            StepAction::MoveToPreset { name } => machine.motion.move_to_preset(name).map(|_| ()),
            StepAction::Home => machine.motion.home(),
            StepAction::FireStart => machine.trigger.fire_start(),
            StepAction::FireStop => machine.trigger.fire_stop(),
            StepAction::FireFiber { cycles } => {
                let outcome = machine.trigger.fire_fiber_sequence(*cycles)?;
                match outcome.interruption {
                    None => Ok(()),
                    Some(Interruption::Tripped(reason)) => Err(Error::Unsafe(reason)),
                    Some(Interruption::Stopped) => Err(Error::Stopped),
                }
            }
            StepAction::TableForward => machine.table.move_forward(),
            StepAction::TableBackward => machine.table.move_backward(),
            StepAction::StartAutoCycle { dwell_ms } => machine
                .table
                .start_auto_cycle(dwell_ms.map(Duration::from_millis)),
            StepAction::StopAutoCycle => {
                machine.table.stop_auto_cycle();
                Ok(())
            }
            StepAction::Fan { on } => machine.outputs.set_fan(*on),
            StepAction::Lights { on } => machine.outputs.set_lights(*on),
            StepAction::WaitInput { input, timeout_ms } => {
                let timeout = timeout_ms.map(Duration::from_millis);
                if machine.inputs.wait_for(input, timeout, || self.is_aborted())? {
                    Ok(())
                } else {
                    Err(Error::Stopped)
                }
            }
            StepAction::Wait { duration_ms } => {
                if self.delay(Duration::from_millis(*duration_ms)) {
                    Ok(())
                } else {
                    Err(Error::Stopped)
                }
            }
        }
    }
}
