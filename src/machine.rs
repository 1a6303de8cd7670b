//! The machine aggregate.
//!
//! [`Machine`] is built explicitly from a configuration and a set of drivers.
//! It owns one instance of each controller, wires the emergency-stop hooks
//! and the trigger-to-outputs link, and is the entry point for live
//! configuration reloads.
//!
//! # Example
//!
//! ```rust,ignore
//! use laserclean_core::{load_config, Machine};
//! use laserclean_core::drivers::sim::simulated_drivers;
//!
//! let config = load_config("machine.toml")?;
//! let (drivers, _handles) = simulated_drivers(&config);
//! let machine = Machine::new(config, drivers)?;
//! machine.start_background()?;
//!
//! machine.motion().home()?;
//! machine.trigger().fire_fiber_sequence(5)?;
//! ```

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::{validate_config, ConfigProvider, ControlConfig};
use crate::drivers::sim::{simulated_drivers, SimHandles};
use crate::drivers::{DigitalOutput, LimitSwitch, Servo, Stepper, TemperatureSensor};
use crate::error::{Error, Result};
use crate::inputs::InputBank;
use crate::motion::{MotionController, PresetBook};
use crate::outputs::{OutputController, OutputDrivers, OutputStatus};
use crate::safety::{EmergencyStop, SafetyMonitor, SafetyState};
use crate::scheduler::TaskHandle;
use crate::sequence::{Actuators, Sequence, SequenceRunner, SequenceStatus};
use crate::store::{self, RecordStore};
use crate::table::{TableController, TableDrivers, TableState};
use crate::trigger::{FireListener, TriggerController, TriggerState};

/// Every hardware channel the machine drives.
pub struct MachineDrivers {
    /// Cleaning head stepper.
    pub stepper: Box<dyn Stepper>,
    /// Head reference switch; homing is unavailable without one.
    pub home_switch: Option<Box<dyn LimitSwitch>>,
    /// Trigger servo.
    pub servo: Box<dyn Servo>,
    /// Table forward relay.
    pub table_forward: Box<dyn DigitalOutput>,
    /// Table backward relay.
    pub table_backward: Box<dyn DigitalOutput>,
    /// Table front end switch.
    pub front_limit: Box<dyn LimitSwitch>,
    /// Table back end switch.
    pub back_limit: Box<dyn LimitSwitch>,
    /// Fan relay.
    pub fan: Box<dyn DigitalOutput>,
    /// Red lights relay.
    pub lights: Box<dyn DigitalOutput>,
    /// Temperature probes.
    pub sensors: Vec<Box<dyn TemperatureSensor>>,
    /// Named stepper hard limit switches.
    pub hard_limits: Vec<(String, Box<dyn LimitSwitch>)>,
    /// Named operator inputs for `wait_input` steps.
    pub inputs: Vec<(String, Box<dyn LimitSwitch>)>,
}

/// What a configuration reload could not apply live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadOutcome {
    /// The hardware channel assignment changed; it takes effect only after
    /// the machine is rebuilt.
    pub restart_required: bool,
}

/// One laser-cleaning machine.
pub struct Machine {
    config: RwLock<ControlConfig>,
    safety: Arc<SafetyMonitor>,
    motion: Arc<MotionController>,
    trigger: Arc<TriggerController>,
    table: Arc<TableController>,
    outputs: Arc<OutputController>,
    runner: Arc<SequenceRunner>,
    records: Option<Arc<dyn RecordStore>>,
    tasks: Mutex<Vec<TaskHandle>>,
}

impl core::fmt::Debug for Machine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Machine")
            .field("safety", &self.safety)
            .field("motion", &self.motion)
            .field("trigger", &self.trigger)
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl Machine {
    /// Validate `config` and build every controller over `drivers`.
    ///
    /// Background tasks are not started; see
    /// [`start_background`](Self::start_background).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid.
    pub fn new(config: ControlConfig, drivers: MachineDrivers) -> Result<Self> {
        validate_config(&config)?;

        let safety = Arc::new(SafetyMonitor::new(config.safety.clone()));
        for sensor in drivers.sensors {
            safety.add_sensor(sensor);
        }
        for (name, switch) in drivers.hard_limits {
            safety.add_hard_limit(&name, switch);
        }

        let motion = Arc::new(MotionController::new(
            drivers.stepper,
            drivers.home_switch,
            config.motion.clone(),
            PresetBook::from_map(&config.presets),
            Arc::clone(&safety),
        ));
        let trigger = Arc::new(TriggerController::new(
            drivers.servo,
            config.trigger.clone(),
            Arc::clone(&safety),
        ));
        let table = Arc::new(TableController::new(
            TableDrivers {
                forward: drivers.table_forward,
                backward: drivers.table_backward,
                front: drivers.front_limit,
                back: drivers.back_limit,
            },
            config.table.clone(),
            Arc::clone(&safety),
        ));
        let outputs = Arc::new(OutputController::new(
            OutputDrivers {
                fan: drivers.fan,
                lights: drivers.lights,
            },
            config.outputs.clone(),
            config.safety.driver_fault_threshold,
        ));

        let motion_hook: Arc<dyn EmergencyStop> = motion.clone();
        let trigger_hook: Arc<dyn EmergencyStop> = trigger.clone();
        let table_hook: Arc<dyn EmergencyStop> = table.clone();
        for hook in [motion_hook, trigger_hook, table_hook] {
            safety.register_stop_hook(Arc::downgrade(&hook));
        }

        let listener: Arc<dyn FireListener> = outputs.clone();
        let listener: Weak<dyn FireListener> = Arc::downgrade(&listener);
        trigger.add_fire_listener(listener);

        let runner = Arc::new(SequenceRunner::new(Actuators {
            motion: Arc::clone(&motion),
            trigger: Arc::clone(&trigger),
            table: Arc::clone(&table),
            outputs: Arc::clone(&outputs),
            inputs: Arc::new(InputBank::new(drivers.inputs, config.table.debounce())),
        }));

        info!(presets = config.presets.len(), "machine assembled");
        Ok(Self {
            config: RwLock::new(config),
            safety,
            motion,
            trigger,
            table,
            outputs,
            runner,
            records: None,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Build a machine over simulated drivers for every channel.
    pub fn simulated(config: ControlConfig) -> Result<(Self, SimHandles)> {
        let (drivers, handles) = simulated_drivers(&config);
        Ok((Self::new(config, drivers)?, handles))
    }

    /// Persist presets, settings and sequences through `records`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] if the stored presets cannot be listed.
    pub fn with_store(mut self, records: Arc<dyn RecordStore>) -> Result<Self> {
        let loaded = self.motion.attach_store(Arc::clone(&records))?;
        debug!(presets = loaded, "stored presets loaded");
        self.records = Some(records);
        Ok(self)
    }

    /// Start the safety evaluation loop and the output timers.
    ///
    /// Calling it again while they run does nothing.
    pub fn start_background(&self) -> Result<()> {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return Ok(());
        }
        tasks.push(self.safety.spawn()?);
        tasks.push(self.outputs.spawn()?);
        info!("background tasks started");
        Ok(())
    }

    /// Abort any sequence, halt every actuator and stop background tasks.
    pub fn shutdown(&self) {
        if self.runner.abort().is_ok() {
            self.runner.wait();
        }
        self.table.stop();
        self.motion.stop();
        if let Err(e) = self.trigger.stop() {
            warn!(error = %e, "trigger not parked at shutdown");
        }

        let tasks: Vec<TaskHandle> = self.tasks.lock().drain(..).collect();
        for mut task in tasks {
            task.stop();
        }
        info!("machine shut down");
    }

    /// Safety interlock.
    pub fn safety(&self) -> &Arc<SafetyMonitor> {
        &self.safety
    }

    /// Cleaning head controller.
    pub fn motion(&self) -> &Arc<MotionController> {
        &self.motion
    }

    /// Trigger controller.
    pub fn trigger(&self) -> &Arc<TriggerController> {
        &self.trigger
    }

    /// Table controller.
    pub fn table(&self) -> &Arc<TableController> {
        &self.table
    }

    /// Fan and lights controller.
    pub fn outputs(&self) -> &Arc<OutputController> {
        &self.outputs
    }

    /// Sequence runner.
    pub fn runner(&self) -> &Arc<SequenceRunner> {
        &self.runner
    }

    /// Configuration currently applied.
    pub fn config(&self) -> ControlConfig {
        self.config.read().clone()
    }

    /// Head position in steps.
    pub fn position(&self) -> i64 {
        self.motion.position()
    }

    /// Trigger state.
    pub fn trigger_state(&self) -> TriggerState {
        self.trigger.state()
    }

    /// Table state.
    pub fn table_state(&self) -> TableState {
        self.table.state()
    }

    /// Interlock snapshot.
    pub fn safety_state(&self) -> SafetyState {
        self.safety.state()
    }

    /// Current or most recent sequence run.
    pub fn sequence_status(&self) -> SequenceStatus {
        self.runner.status()
    }

    /// Fan and lights snapshot.
    pub fn output_status(&self) -> OutputStatus {
        self.outputs.status()
    }

    /// Operator emergency stop. Returns `true` if this call tripped the
    /// interlock.
    pub fn emergency_stop(&self) -> bool {
        self.safety.emergency_stop()
    }

    /// Clear the interlock and every controller-local driver fault.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TripConditionActive`] while the trip condition is
    /// still present; controller faults are left latched in that case.
    pub fn reset(&self) -> Result<()> {
        self.safety.clear()?;
        self.motion.clear_fault();
        self.trigger.clear_fault();
        self.table.clear_fault();
        self.outputs.clear_fault();
        info!("machine reset");
        Ok(())
    }

    /// Re-read the configuration from `provider` and apply it.
    pub fn reload_config(&self, provider: &dyn ConfigProvider) -> Result<ReloadOutcome> {
        let next = provider.load()?;
        self.apply_config(next)
    }

    /// Apply `next` to every controller.
    ///
    /// Everything except the hardware channel assignment takes effect
    /// immediately; a changed assignment is reported in the outcome and
    /// otherwise ignored until the machine is rebuilt. Presets that are new
    /// or changed in `next` overwrite the book; presets saved at runtime
    /// are otherwise kept.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `next` is invalid; nothing is applied.
    pub fn apply_config(&self, next: ControlConfig) -> Result<ReloadOutcome> {
        validate_config(&next)?;

        let mut current = self.config.write();
        let restart_required = current.requires_restart(&next);
        if restart_required {
            warn!("hardware assignment changed, restart required to apply it");
        }

        let threshold = next.safety.driver_fault_threshold;
        self.safety.configure(next.safety.clone());
        self.motion.configure(next.motion.clone());
        self.motion.set_fault_threshold(threshold);
        self.motion.merge_presets(&current.presets, &next.presets);
        self.trigger.configure(next.trigger.clone());
        self.trigger.set_fault_threshold(threshold);
        self.table.configure(next.table.clone());
        self.table.set_fault_threshold(threshold);
        self.outputs.configure(next.outputs.clone());
        self.outputs.set_fault_threshold(threshold);

        let hardware = current.hardware.clone();
        *current = next;
        current.hardware = hardware;

        info!(restart_required, "configuration reloaded");
        Ok(ReloadOutcome { restart_required })
    }

    fn records(&self) -> Result<&Arc<dyn RecordStore>> {
        self.records
            .as_ref()
            .ok_or(Error::InvalidArgument("no record store attached"))
    }

    /// Store `sequence` under its name, replacing any previous version.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidSequence`] if a step does not validate
    /// - [`Error::Store`] if the record cannot be written
    pub fn save_sequence(&self, sequence: &Sequence) -> Result<()> {
        let records = self.records()?;
        sequence.validate(&self.runner.actuators().validation_context())?;
        store::save_record(&**records, store::SEQUENCES, &sequence.name, sequence)?;
        info!(sequence = %sequence.name, steps = sequence.len(), "sequence saved");
        Ok(())
    }

    /// Load a stored sequence.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSequence`] if no sequence has that name or the
    /// stored record names an unknown action.
    pub fn load_sequence(&self, name: &str) -> Result<Sequence> {
        let records = self.records()?;
        let text = records
            .get(store::SEQUENCES, name)?
            .ok_or_else(|| Error::InvalidSequence(format!("sequence '{name}' not found")))?;
        Sequence::from_toml(&text)
    }

    /// Remove a stored sequence. Returns whether it existed.
    pub fn delete_sequence(&self, name: &str) -> Result<bool> {
        Ok(self.records()?.delete(store::SEQUENCES, name)?)
    }

    /// Names of the stored sequences, sorted.
    pub fn sequence_names(&self) -> Result<Vec<String>> {
        Ok(self.records()?.keys(store::SEQUENCES)?)
    }

    /// Start `sequence` on the runner's background thread.
    pub fn start_sequence(&self, sequence: Sequence) -> Result<()> {
        self.runner.start(sequence)
    }

    /// Load a stored sequence and start it.
    pub fn start_stored_sequence(&self, name: &str) -> Result<()> {
        let sequence = self.load_sequence(name)?;
        self.runner.start(sequence)
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
