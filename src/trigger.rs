//! Servo trigger controller.
//!
//! The servo sits at the Normal angle (A) while idle and moves to the Fire
//! angle (B) to pull the laser trigger. Inversion swaps the roles of the two
//! stored angles without rewriting them.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::units::Degrees;
use crate::config::TriggerConfig;
use crate::drivers::{DriverHealth, DriverResult, Servo};
use crate::error::{Error, Result};
use crate::safety::{Actuator, EmergencyStop, SafetyMonitor, TripReason};
use crate::sync::{sleep_unless, BusyGuard, StopFlag};

/// Trigger state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TriggerState {
    /// Servo at the Normal angle.
    Normal = 0,
    /// Servo held at the Fire angle.
    Firing = 1,
    /// Fiber pattern running.
    FiberFiring = 2,
    /// Returned to Normal by the interlock.
    Stopped = 3,
}

impl TriggerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => TriggerState::Firing,
            2 => TriggerState::FiberFiring,
            3 => TriggerState::Stopped,
            _ => TriggerState::Normal,
        }
    }

    /// Whether the laser is being fired.
    pub fn is_firing(self) -> bool {
        matches!(self, TriggerState::Firing | TriggerState::FiberFiring)
    }
}

impl core::fmt::Display for TriggerState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            TriggerState::Normal => "normal",
            TriggerState::Firing => "firing",
            TriggerState::FiberFiring => "fiber_firing",
            TriggerState::Stopped => "stopped",
        })
    }
}

/// Observer of firing start and stop.
pub trait FireListener: Send + Sync {
    /// The trigger moved to the Fire angle.
    fn fire_started(&self);

    /// The trigger returned to Normal.
    fn fire_stopped(&self);
}

/// Why a fiber pattern ended early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interruption {
    /// `stop()` or `fire_stop()` was called.
    Stopped,
    /// The interlock tripped.
    Tripped(TripReason),
}

/// Result of a fiber pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiberOutcome {
    /// Full B, A cycles commanded.
    pub completed_cycles: u32,
    /// Cycles asked for.
    pub requested_cycles: u32,
    /// Set when the pattern ended early.
    pub interruption: Option<Interruption>,
}

impl FiberOutcome {
    /// Whether every requested cycle ran.
    pub fn is_complete(&self) -> bool {
        self.interruption.is_none() && self.completed_cycles == self.requested_cycles
    }
}

/// Snapshot of the trigger for status polling.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerStatus {
    /// Trigger state.
    pub state: TriggerState,
    /// Servo holding torque.
    pub attached: bool,
    /// Roles of A and B swapped.
    pub inverted: bool,
    /// Stored angle A.
    pub position_a: Degrees,
    /// Stored angle B.
    pub position_b: Degrees,
    /// How long the trigger has been held, while firing.
    pub fire_duration: Option<Duration>,
    /// Latched driver fault, if any.
    pub fault: Option<TripReason>,
}

/// Servo trigger controller.
pub struct TriggerController {
    servo: Mutex<Box<dyn Servo>>,
    safety: Arc<SafetyMonitor>,
    config: RwLock<TriggerConfig>,
    state: AtomicU8,
    attached: AtomicBool,
    busy: AtomicBool,
    stop_requested: StopFlag,
    fire_started_at: Mutex<Option<Instant>>,
    listeners: RwLock<Vec<Weak<dyn FireListener>>>,
    health: DriverHealth,
}

impl core::fmt::Debug for TriggerController {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TriggerController")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl TriggerController {
    /// Create a controller and command the servo to Normal.
    pub fn new(servo: Box<dyn Servo>, config: TriggerConfig, safety: Arc<SafetyMonitor>) -> Self {
        let threshold = safety.config().driver_fault_threshold;
        let trigger = Self {
            servo: Mutex::new(servo),
            safety,
            config: RwLock::new(config),
            state: AtomicU8::new(TriggerState::Normal as u8),
            attached: AtomicBool::new(true),
            busy: AtomicBool::new(false),
            stop_requested: StopFlag::default(),
            fire_started_at: Mutex::new(None),
            listeners: RwLock::new(Vec::new()),
            health: DriverHealth::new(threshold),
        };

        let normal = trigger.config.read().normal_angle();
        if let Err(e) = trigger.command(normal) {
            error!(error = %e, "cannot move trigger to normal");
        }
        trigger
    }

    /// Register an observer of firing start and stop.
    pub fn add_fire_listener(&self, listener: Weak<dyn FireListener>) {
        let mut listeners = self.listeners.write();
        listeners.retain(|l| l.strong_count() > 0);
        listeners.push(listener);
    }

    /// Replace the configuration.
    pub fn configure(&self, config: TriggerConfig) {
        *self.config.write() = config;
    }

    /// Change how many consecutive driver errors latch a fault.
    pub fn set_fault_threshold(&self, threshold: u32) {
        self.health.set_threshold(threshold);
    }

    /// Current configuration.
    pub fn config(&self) -> TriggerConfig {
        self.config.read().clone()
    }

    /// Trigger state.
    #[inline]
    pub fn state(&self) -> TriggerState {
        TriggerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: TriggerState) -> TriggerState {
        TriggerState::from_u8(self.state.swap(state as u8, Ordering::AcqRel))
    }

    /// Snapshot for status polling.
    pub fn status(&self) -> TriggerStatus {
        let config = self.config.read().clone();
        let state = self.state();
        let fire_duration = if state.is_firing() {
            self.fire_started_at.lock().map(|at| at.elapsed())
        } else {
            None
        };

        TriggerStatus {
            state,
            attached: self.attached.load(Ordering::Acquire),
            inverted: config.invert,
            position_a: config.position_a,
            position_b: config.position_b,
            fire_duration,
            fault: self.fault(),
        }
    }

    fn fault(&self) -> Option<TripReason> {
        self.health
            .is_latched()
            .then_some(TripReason::DriverFault(Actuator::Trigger))
    }

    fn preflight(&self) -> Result<()> {
        if let Some(fault) = self.fault() {
            return Err(Error::Unsafe(fault));
        }
        self.safety.check_fire()
    }

    fn driver_call(&self, call: impl FnOnce(&mut Box<dyn Servo>) -> DriverResult<()>) -> Result<()> {
        let result = call(&mut *self.servo.lock());
        match result {
            Ok(()) => {
                self.health.record_success();
                Ok(())
            }
            Err(e) => {
                if self.health.record_failure() {
                    error!(error = %e, "servo driver fault latched");
                } else {
                    error!(error = %e, "servo driver error");
                }
                Err(e.into())
            }
        }
    }

    fn command(&self, angle: Degrees) -> Result<()> {
        debug!(angle = angle.0, "servo command");
        self.driver_call(|servo| servo.set_angle(angle))
    }

    fn ensure_attached(&self) -> Result<()> {
        if !self.attached.load(Ordering::Acquire) {
            self.driver_call(|servo| servo.attach())?;
            self.attached.store(true, Ordering::Release);
            info!("trigger servo reattached");
        }
        Ok(())
    }

    fn notify(&self, started: bool) {
        let listeners: Vec<Arc<dyn FireListener>> =
            self.listeners.read().iter().filter_map(Weak::upgrade).collect();
        for listener in listeners {
            if started {
                listener.fire_started();
            } else {
                listener.fire_stopped();
            }
        }
    }

    /// Move to the Fire angle and hold it.
    ///
    /// # Errors
    ///
    /// - [`Error::Unsafe`] while the interlock is tripped
    /// - [`Error::Busy`] while a fiber pattern runs
    pub fn fire_start(&self) -> Result<()> {
        self.preflight()?;
        let _guard = BusyGuard::acquire(&self.busy, Actuator::Trigger)?;
        if self.state() == TriggerState::Firing {
            return Ok(());
        }

        self.ensure_attached()?;
        let fire = self.config.read().fire_angle();
        self.command(fire)?;

        *self.fire_started_at.lock() = Some(Instant::now());
        self.set_state(TriggerState::Firing);
        info!(angle = fire.0, "firing started");
        self.notify(true);
        Ok(())
    }

    /// Return to the Normal angle. Always permitted.
    ///
    /// Interrupts a running fiber pattern. With `auto_detach` set, holding
    /// torque is released after `detach_delay`.
    pub fn fire_stop(&self) -> Result<()> {
        self.return_to_normal(TriggerState::Normal)?;

        let config = self.config.read().clone();
        if config.auto_detach && !self.busy.load(Ordering::Acquire) {
            thread::sleep(config.detach_delay());
            self.release()?;
        }
        Ok(())
    }

    /// Interrupt a fiber pattern or held fire and return to Normal.
    pub fn stop(&self) -> Result<()> {
        self.return_to_normal(TriggerState::Normal)
    }

    fn return_to_normal(&self, next: TriggerState) -> Result<()> {
        self.stop_requested.request();

        self.ensure_attached()?;
        let normal = self.config.read().normal_angle();
        let commanded = self.command(normal);

        let previous = self.set_state(next);
        if previous == TriggerState::Firing {
            let held = self.fire_started_at.lock().take().map(|at| at.elapsed());
            info!(?held, "firing stopped");
            self.notify(false);
        }
        commanded
    }

    /// Run the fiber pattern: `A, (B, A) x cycles` with `fiber_step_delay`
    /// between commands, ending at Normal.
    ///
    /// A trip or `stop()` ends the pattern early at Normal; the outcome
    /// reports how many cycles completed.
    pub fn fire_fiber_sequence(&self, cycles: u32) -> Result<FiberOutcome> {
        if cycles == 0 {
            return Err(Error::InvalidArgument("fiber cycles must be positive"));
        }
        self.preflight()?;
        let _guard = BusyGuard::acquire(&self.busy, Actuator::Trigger)?;
        if self.state() == TriggerState::Firing {
            return Err(Error::Busy(Actuator::Trigger));
        }

        self.stop_requested.begin();
        self.ensure_attached()?;
        let config = self.config.read().clone();
        let (normal, fire) = (config.normal_angle(), config.fire_angle());

        self.set_state(TriggerState::FiberFiring);
        *self.fire_started_at.lock() = Some(Instant::now());
        info!(cycles, "fiber pattern started");
        self.notify(true);

        let mut completed = 0;
        let result = self.fiber_pattern(cycles, normal, fire, config.fiber_step_delay(), &mut completed);

        // A full pattern already ends at Normal
        let parked = match result {
            Ok(false) => Ok(()),
            _ => self.command(normal),
        };
        self.fire_started_at.lock().take();
        let tripped = self.safety.reason();
        let next = if tripped.is_some() {
            TriggerState::Stopped
        } else {
            TriggerState::Normal
        };
        self.set_state(next);
        self.notify(false);

        let interrupted = result?;
        parked?;
        let interruption = interrupted.then(|| match tripped {
            Some(reason) => Interruption::Tripped(reason),
            None => Interruption::Stopped,
        });

        match &interruption {
            None => info!(cycles, "fiber pattern complete"),
            Some(why) => warn!(completed, cycles, ?why, "fiber pattern interrupted"),
        }
        Ok(FiberOutcome {
            completed_cycles: completed,
            requested_cycles: cycles,
            interruption,
        })
    }

    /// Returns `true` if the pattern was interrupted.
    fn fiber_pattern(
        &self,
        cycles: u32,
        normal: Degrees,
        fire: Degrees,
        delay: Duration,
        completed: &mut u32,
    ) -> Result<bool> {
        let interrupted = || self.stop_requested.is_requested() || self.safety.is_tripped();

        self.command(normal)?;
        for _ in 0..cycles {
            for angle in [fire, normal] {
                if !sleep_unless(delay, interrupted) || interrupted() {
                    return Ok(true);
                }
                self.command(angle)?;
            }
            *completed += 1;
        }
        Ok(false)
    }

    /// Release holding torque after `detach_delay`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Busy`] while firing or running a fiber pattern.
    pub fn detach(&self) -> Result<()> {
        let _guard = BusyGuard::acquire(&self.busy, Actuator::Trigger)?;
        if self.state().is_firing() {
            return Err(Error::Busy(Actuator::Trigger));
        }
        thread::sleep(self.config.read().detach_delay());
        self.release()
    }

    fn release(&self) -> Result<()> {
        if self.attached.load(Ordering::Acquire) {
            self.driver_call(|servo| servo.detach())?;
            self.attached.store(false, Ordering::Release);
            info!("trigger servo detached");
        }
        Ok(())
    }

    /// Re-engage holding torque.
    pub fn reattach(&self) -> Result<()> {
        self.ensure_attached()
    }

    /// Set the stored A and B angles.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if either angle is outside [-90, 90].
    pub fn set_positions(&self, position_a: Degrees, position_b: Degrees) -> Result<()> {
        for angle in [position_a, position_b] {
            if !angle.in_servo_range() {
                return Err(Error::OutOfRange {
                    what: "servo angle",
                    value: f64::from(angle.0),
                    min: f64::from(Degrees::MIN.0),
                    max: f64::from(Degrees::MAX.0),
                });
            }
        }

        let mut config = self.config.write();
        config.position_a = position_a;
        config.position_b = position_b;
        info!(a = position_a.0, b = position_b.0, "trigger positions set");
        Ok(())
    }

    /// Swap the roles of A and B.
    pub fn set_inverted(&self, inverted: bool) {
        self.config.write().invert = inverted;
        info!(inverted, "trigger inversion set");
    }

    /// Hand the next command a clean stop request that a [`stop`](Self::stop)
    /// issued before it starts will still reach.
    pub(crate) fn arm_stop(&self) {
        self.stop_requested.arm();
    }

    pub(crate) fn disarm_stop(&self) {
        self.stop_requested.disarm();
    }

    /// Release a latched driver fault.
    pub fn clear_fault(&self) {
        self.health.reset();
    }
}

impl EmergencyStop for TriggerController {
    fn emergency_stop(&self, reason: &TripReason) {
        let was_firing = self.state().is_firing();
        if let Err(e) = self.return_to_normal(TriggerState::Stopped) {
            error!(%reason, error = %e, "trigger could not return to normal");
        } else if was_firing {
            warn!(%reason, "firing halted by interlock");
        }
    }
}
