//! Cleaning head controller.
//!
//! Owns the logical head position and runs one move at a time on the
//! caller's thread. Every step re-checks the interlock and the stop flag, so
//! a trip or `stop()` halts the head within one step pulse.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::{validate_profile, MotionConfig, PresetName, ProfileConfig, TravelLimits};
use crate::drivers::{DriverHealth, LimitSwitch, Stepper};
use crate::error::{Error, Result};
use crate::safety::{Actuator, EmergencyStop, SafetyMonitor, TripReason};
use crate::store::{self, RecordStore};
use crate::sync::{BusyGuard, StopFlag};

use super::executor::MotionExecutor;
use super::presets::{PresetBook, PresetRecord};
use super::profile::{Direction, MotionProfile};

/// Motion controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MotionState {
    /// Ready for a command.
    Idle = 0,
    /// Searching for the home reference.
    Homing = 1,
    /// Relative jog in progress.
    Jogging = 2,
    /// Index move in progress.
    Indexing = 3,
    /// Absolute or preset move in progress.
    MovingAbsolute = 4,
    /// Last move was interrupted or failed.
    Stopped = 5,
}

impl MotionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => MotionState::Homing,
            2 => MotionState::Jogging,
            3 => MotionState::Indexing,
            4 => MotionState::MovingAbsolute,
            5 => MotionState::Stopped,
            _ => MotionState::Idle,
        }
    }

    /// Whether the head is moving.
    pub fn is_moving(self) -> bool {
        !matches!(self, MotionState::Idle | MotionState::Stopped)
    }
}

impl core::fmt::Display for MotionState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            MotionState::Idle => "idle",
            MotionState::Homing => "homing",
            MotionState::Jogging => "jogging",
            MotionState::Indexing => "indexing",
            MotionState::MovingAbsolute => "moving_absolute",
            MotionState::Stopped => "stopped",
        })
    }
}

/// Snapshot of the head for status polling.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionStatus {
    /// Controller state.
    pub state: MotionState,
    /// Logical position in steps.
    pub position: i64,
    /// Whether the motor is enabled.
    pub enabled: bool,
    /// Whether a move is in flight.
    pub busy: bool,
    /// Distance of one index move.
    pub index_distance: i64,
    /// Upper travel bound.
    pub max_steps: Option<i64>,
    /// Latched driver fault, if any.
    pub fault: Option<TripReason>,
}

/// Settings adjusted at runtime and kept in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct MotionSettings {
    index_distance: i64,
}

const SETTINGS_KEY: &str = "motion";

/// Longest single move a profile can plan.
const MAX_MOVE_STEPS: i64 = u32::MAX as i64;

struct HeadDriver {
    stepper: Box<dyn Stepper>,
    home: Option<Box<dyn LimitSwitch>>,
}

/// One leg of travel.
struct Leg {
    delta: i64,
    profile: ProfileConfig,
    /// Stop early when the home reference asserts.
    seek_home: bool,
    /// Homing may run through trips it can recover from.
    recovery: bool,
    deadline: Option<Instant>,
}

enum Halt {
    Completed,
    Reference,
}

/// Outcome of a leg: steps actually taken, and how it ended.
struct Travel {
    moved: i64,
    outcome: Result<Halt>,
}

/// Cleaning head controller.
pub struct MotionController {
    driver: Mutex<HeadDriver>,
    safety: Arc<SafetyMonitor>,
    config: RwLock<MotionConfig>,
    presets: RwLock<PresetBook>,
    store: RwLock<Option<Arc<dyn RecordStore>>>,
    position: AtomicI64,
    state: AtomicU8,
    enabled: AtomicBool,
    busy: AtomicBool,
    stop_requested: StopFlag,
    health: DriverHealth,
}

impl core::fmt::Debug for MotionController {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MotionController")
            .field("state", &self.state())
            .field("position", &self.position())
            .finish_non_exhaustive()
    }
}

impl MotionController {
    /// Create a controller with the head assumed at position 0.
    ///
    /// The ENABLE line is driven to `config.enabled`; a failure there is
    /// logged and surfaces again on the first move.
    pub fn new(
        mut stepper: Box<dyn Stepper>,
        home: Option<Box<dyn LimitSwitch>>,
        config: MotionConfig,
        presets: PresetBook,
        safety: Arc<SafetyMonitor>,
    ) -> Self {
        if let Err(e) = stepper.set_enabled(config.enabled) {
            error!(error = %e, "cannot drive stepper enable line");
        }
        if home.is_none() {
            warn!("no home sensor configured, homing is unavailable");
        }

        let threshold = safety.config().driver_fault_threshold;
        Self {
            driver: Mutex::new(HeadDriver { stepper, home }),
            safety,
            enabled: AtomicBool::new(config.enabled),
            config: RwLock::new(config),
            presets: RwLock::new(presets),
            store: RwLock::new(None),
            position: AtomicI64::new(0),
            state: AtomicU8::new(MotionState::Idle as u8),
            busy: AtomicBool::new(false),
            stop_requested: StopFlag::default(),
            health: DriverHealth::new(threshold),
        }
    }

    /// Persist presets and settings through `store` from now on.
    ///
    /// Records already in the store take precedence over configured ones.
    /// Returns how many presets were loaded.
    pub fn attach_store(&self, records: Arc<dyn RecordStore>) -> Result<usize> {
        let mut loaded = 0;
        {
            let mut book = self.presets.write();
            for key in records.keys(store::PRESETS)? {
                let record = match store::load_record::<PresetRecord>(&*records, store::PRESETS, &key) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(preset = %key, error = %e, "skipping unreadable preset");
                        continue;
                    }
                };
                if let Some(record) = record {
                    match book.save(&key, record.position) {
                        Ok(_) => loaded += 1,
                        Err(e) => warn!(preset = %key, error = %e, "skipping preset"),
                    }
                }
            }
        }

        if let Some(settings) =
            store::load_record::<MotionSettings>(&*records, store::SETTINGS, SETTINGS_KEY)?
        {
            if settings.index_distance > 0 {
                self.config.write().index_distance = settings.index_distance;
            }
        }

        *self.store.write() = Some(records);
        debug!(presets = loaded, "motion store attached");
        Ok(loaded)
    }

    /// Replace the configuration. Presets and position are kept.
    pub fn configure(&self, config: MotionConfig) {
        *self.config.write() = config;
    }

    /// Change how many consecutive driver errors latch a fault.
    pub fn set_fault_threshold(&self, threshold: u32) {
        self.health.set_threshold(threshold);
    }

    /// Current configuration.
    pub fn config(&self) -> MotionConfig {
        self.config.read().clone()
    }

    /// Logical position in steps.
    #[inline]
    pub fn position(&self) -> i64 {
        self.position.load(Ordering::Acquire)
    }

    /// Controller state.
    #[inline]
    pub fn state(&self) -> MotionState {
        MotionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the motor is enabled.
    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Travel range.
    pub fn limits(&self) -> TravelLimits {
        self.config.read().limits()
    }

    /// Snapshot for status polling.
    pub fn status(&self) -> MotionStatus {
        let (index_distance, max_steps) = {
            let config = self.config.read();
            (config.index_distance, config.max_steps)
        };
        MotionStatus {
            state: self.state(),
            position: self.position(),
            enabled: self.is_enabled(),
            busy: self.busy.load(Ordering::Acquire),
            index_distance,
            max_steps,
            fault: self.fault(),
        }
    }

    fn fault(&self) -> Option<TripReason> {
        self.health
            .is_latched()
            .then_some(TripReason::DriverFault(Actuator::Motion))
    }

    fn set_state(&self, state: MotionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Checks shared by every motion command, in reporting order.
    fn preflight(&self, recovery: bool) -> Result<()> {
        if let Some(fault) = self.fault() {
            return Err(Error::Unsafe(fault));
        }
        if recovery {
            self.safety.check_recovery()
        } else {
            self.safety.check_move()
        }
    }

    fn require_enabled(&self) -> Result<()> {
        if self.is_enabled() {
            Ok(())
        } else {
            Err(Error::MotorDisabled)
        }
    }

    fn resolve_profile(&self, requested: Option<ProfileConfig>, default: ProfileConfig) -> Result<ProfileConfig> {
        match requested {
            Some(profile) => {
                validate_profile("override", &profile)?;
                Ok(profile)
            }
            None => Ok(default),
        }
    }

    /// Move `steps` in `direction`. Returns the new position.
    ///
    /// # Errors
    ///
    /// - [`Error::Unsafe`] while the interlock is tripped
    /// - [`Error::InvalidArgument`] if `steps <= 0`
    /// - [`Error::MotorDisabled`] while disabled
    /// - [`Error::OutOfRange`] if the endpoint leaves the travel range
    /// - [`Error::Busy`] while another move is in flight
    pub fn jog(&self, direction: Direction, steps: i64, profile: Option<ProfileConfig>) -> Result<i64> {
        self.preflight(false)?;
        if steps <= 0 {
            return Err(Error::InvalidArgument("jog step size must be positive"));
        }
        self.require_enabled()?;

        let (default, limits) = {
            let config = self.config.read();
            (config.jog, config.limits())
        };
        let profile = self.resolve_profile(profile, default)?;

        self.execute(MotionState::Jogging, profile, |start| {
            let target = start.saturating_add(direction.sign() * steps);
            limits.check("jog target", target)
        })
    }

    /// Move one index distance in `direction` with the index profile.
    pub fn index(&self, direction: Direction, profile: Option<ProfileConfig>) -> Result<i64> {
        self.preflight(false)?;
        self.require_enabled()?;

        let (default, limits, distance) = {
            let config = self.config.read();
            (config.index, config.limits(), config.index_distance)
        };
        let profile = self.resolve_profile(profile, default)?;

        self.execute(MotionState::Indexing, profile, |start| {
            let target = start.saturating_add(direction.sign() * distance);
            limits.check("index target", target)
        })
    }

    /// Move to an absolute position. Already being there is a no-op.
    pub fn move_absolute(&self, target: i64, profile: Option<ProfileConfig>) -> Result<i64> {
        self.preflight(false)?;
        self.require_enabled()?;

        let (default, limits) = {
            let config = self.config.read();
            (config.absolute, config.limits())
        };
        limits.check("target", target)?;
        let profile = self.resolve_profile(profile, default)?;

        self.execute(MotionState::MovingAbsolute, profile, |_| Ok(target))
    }

    /// Run a single move from the current position to `target(position)`.
    fn execute(
        &self,
        state: MotionState,
        profile: ProfileConfig,
        target: impl FnOnce(i64) -> Result<i64>,
    ) -> Result<i64> {
        let _guard = BusyGuard::acquire(&self.busy, Actuator::Motion)?;
        self.stop_requested.begin();

        let start = self.position();
        let target = target(start)?;
        if target == start {
            debug!(position = start, "already at target");
            return Ok(start);
        }
        let length = (target - start).abs();
        if length > MAX_MOVE_STEPS {
            return Err(Error::out_of_range("move length", length, 1, Some(MAX_MOVE_STEPS)));
        }

        self.set_state(state);
        info!(%state, from = start, to = target, "move started");

        let travel = {
            let mut driver = self.driver.lock();
            self.travel(
                &mut driver,
                Leg {
                    delta: target - start,
                    profile,
                    seek_home: false,
                    recovery: false,
                    deadline: None,
                },
            )
        };

        let position = start + travel.moved;
        self.position.store(position, Ordering::Release);
        match travel.outcome {
            Ok(_) => {
                self.set_state(MotionState::Idle);
                info!(position, "move complete");
                Ok(position)
            }
            Err(e) => {
                self.set_state(MotionState::Stopped);
                warn!(position, error = %e, "move interrupted");
                Err(e)
            }
        }
    }

    /// Drive the stepper through one leg, checking the interlock, the stop
    /// flag and the enable flag before every pulse.
    fn travel(&self, driver: &mut HeadDriver, leg: Leg) -> Travel {
        let mut executor = MotionExecutor::new(MotionProfile::from_config(leg.delta, &leg.profile), 0);

        if let Err(e) = driver.stepper.set_direction(executor.direction()) {
            return Travel {
                moved: 0,
                outcome: Err(self.driver_failed(e.into())),
            };
        }

        let outcome = loop {
            let Some(interval) = executor.next_interval_ns() else {
                break Ok(Halt::Completed);
            };

            let check = if leg.recovery {
                self.safety.check_recovery()
            } else {
                self.safety.check_move()
            };
            if let Err(e) = check {
                break Err(e);
            }
            if self.stop_requested.is_requested() {
                break Err(Error::Stopped);
            }
            if !self.is_enabled() {
                break Err(Error::MotorDisabled);
            }
            if leg.deadline.map_or(false, |d| Instant::now() >= d) {
                break Err(Error::HomingTimeout {
                    steps: executor.steps_done(),
                });
            }

            if leg.seek_home {
                if let Some(home) = driver.home.as_mut() {
                    match home.is_active() {
                        Ok(true) => break Ok(Halt::Reference),
                        Ok(false) => {}
                        Err(e) => break Err(self.driver_failed(e.into())),
                    }
                }
            }

            if let Err(e) = driver.stepper.step(interval) {
                break Err(self.driver_failed(e.into()));
            }
            self.health.record_success();
            executor.advance();
        };

        Travel {
            moved: executor.position(),
            outcome,
        }
    }

    fn driver_failed(&self, e: Error) -> Error {
        if self.health.record_failure() {
            error!(error = %e, "stepper driver fault latched");
        } else {
            error!(error = %e, failures = self.health.failures(), "stepper driver error");
        }
        e
    }

    /// Find the home reference and set the position to 0.
    ///
    /// Backs off the sensor first if it is already asserted, searches
    /// backward at the home profile, backs off again and re-approaches at
    /// half speed. Allowed while a limit fault or manual stop is active.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HomingTimeout`] if the reference is not reached
    /// within `home_max_steps` or `home_timeout_secs`, or immediately when no
    /// home sensor is fitted.
    pub fn home(&self) -> Result<()> {
        self.preflight(true)?;
        self.require_enabled()?;

        let _guard = BusyGuard::acquire(&self.busy, Actuator::Motion)?;
        self.stop_requested.begin();
        let config = self.config.read().clone();

        let mut driver = self.driver.lock();
        if driver.home.is_none() {
            warn!("homing requested without a home sensor");
            return Err(Error::HomingTimeout { steps: 0 });
        }

        self.set_state(MotionState::Homing);
        info!(from = self.position(), "homing started");

        let deadline = Instant::now() + Duration::from_secs_f32(config.home_timeout_secs.max(0.0));
        let mut moved = 0;
        let result = self.home_sequence(&mut driver, &config, deadline, &mut moved);
        drop(driver);

        match result {
            Ok(()) => {
                self.position.store(0, Ordering::Release);
                self.set_state(MotionState::Idle);
                info!("homing complete");
                Ok(())
            }
            Err(e) => {
                // Unreferenced until the next successful home
                let position = (self.position() + moved).max(0);
                self.position.store(position, Ordering::Release);
                self.set_state(MotionState::Stopped);
                warn!(position, error = %e, "homing failed");
                Err(e)
            }
        }
    }

    fn home_sequence(
        &self,
        driver: &mut HeadDriver,
        config: &MotionConfig,
        deadline: Instant,
        moved: &mut i64,
    ) -> Result<()> {
        let backoff = i64::from(config.home_backoff_steps);
        let slow = ProfileConfig {
            speed: config.home.speed * 0.5,
            ..config.home
        };
        let leg = |delta: i64, profile: ProfileConfig, seek_home: bool| Leg {
            delta,
            profile,
            seek_home,
            recovery: true,
            deadline: Some(deadline),
        };

        let on_reference = match driver.home.as_mut() {
            Some(home) => home.is_active().map_err(|e| self.driver_failed(e.into()))?,
            None => false,
        };
        if on_reference && backoff > 0 {
            debug!(steps = backoff, "moving off home sensor");
            let travel = self.travel(driver, leg(backoff, config.home, false));
            *moved += travel.moved;
            travel.outcome?;
        }

        let search = self.travel(driver, leg(-i64::from(config.home_max_steps), config.home, true));
        *moved += search.moved;
        if let Halt::Completed = search.outcome? {
            return Err(Error::HomingTimeout {
                steps: config.home_max_steps,
            });
        }

        if backoff > 0 {
            let travel = self.travel(driver, leg(backoff, config.home, false));
            *moved += travel.moved;
            travel.outcome?;

            // Twice the back-off covers the return plus switch hysteresis
            let approach = self.travel(driver, leg(-2 * backoff, slow, true));
            *moved += approach.moved;
            if let Halt::Completed = approach.outcome? {
                return Err(Error::HomingTimeout {
                    steps: (2 * backoff) as u32,
                });
            }
        }

        Ok(())
    }

    /// Set the index distance and persist it.
    pub fn set_index_distance(&self, steps: i64) -> Result<()> {
        if steps <= 0 {
            return Err(Error::InvalidArgument("index distance must be positive"));
        }
        if let Some(records) = self.store.read().as_ref() {
            store::save_record(
                &**records,
                store::SETTINGS,
                SETTINGS_KEY,
                &MotionSettings {
                    index_distance: steps,
                },
            )?;
        }
        self.config.write().index_distance = steps;
        info!(steps, "index distance set");
        Ok(())
    }

    /// Save the current position under `name`. Returns the saved position.
    pub fn save_preset(&self, name: &str) -> Result<i64> {
        let key = PresetBook::name(name)?;
        let position = self.position();

        if let Some(records) = self.store.read().as_ref() {
            store::save_record(&**records, store::PRESETS, &key, &PresetRecord { position })?;
        }
        self.presets.write().save(&key, position)?;
        info!(preset = %key, position, "preset saved");
        Ok(position)
    }

    /// Delete a preset.
    pub fn delete_preset(&self, name: &str) -> Result<()> {
        if !self.presets.read().contains(name) {
            return Err(Error::PresetNotFound(name.into()));
        }
        if let Some(records) = self.store.read().as_ref() {
            records.delete(store::PRESETS, name)?;
        }
        self.presets.write().remove(name);
        info!(preset = name, "preset deleted");
        Ok(())
    }

    /// Move to a saved preset with the absolute profile.
    pub fn move_to_preset(&self, name: &str) -> Result<i64> {
        let position = self
            .presets
            .read()
            .get(name)
            .ok_or_else(|| Error::PresetNotFound(name.into()))?;
        self.move_absolute(position, None)
    }

    /// Saved presets, ordered by name.
    pub fn presets(&self) -> Vec<(String, i64)> {
        self.presets
            .read()
            .iter()
            .map(|(name, position)| (name.to_owned(), position))
            .collect()
    }

    /// Fold configured presets into the book.
    ///
    /// Entries of `next` that are missing from `previous` or differ from it
    /// overwrite the book (last write wins). Everything else in the book,
    /// including presets saved or deleted at runtime, is left alone. Returns how many
    /// presets were written.
    pub fn merge_presets(
        &self,
        previous: &BTreeMap<PresetName, i64>,
        next: &BTreeMap<PresetName, i64>,
    ) -> usize {
        let mut book = self.presets.write();
        let mut written = 0;
        for (name, &position) in next {
            if previous.get(name) == Some(&position) {
                continue;
            }
            match book.save(name, position) {
                Ok(_) => written += 1,
                Err(e) => warn!(preset = %name, error = %e, "skipping configured preset"),
            }
        }
        if written > 0 {
            info!(presets = written, "configured presets merged");
        }
        written
    }

    /// Position of a preset, if saved.
    pub fn preset(&self, name: &str) -> Option<i64> {
        self.presets.read().get(name)
    }

    /// Enable or disable the motor. Disabling halts a move in flight.
    pub fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.enabled.store(enabled, Ordering::Release);
        if !enabled {
            self.stop_requested.request();
        }

        let result = self.driver.lock().stepper.set_enabled(enabled);
        match result {
            Ok(()) => {
                self.health.record_success();
                info!(enabled, "motor enable changed");
                Ok(())
            }
            Err(e) => Err(self.driver_failed(e.into())),
        }
    }

    /// Halt a move in flight within one step.
    pub fn stop(&self) {
        self.stop_requested.request();
        if self.state().is_moving() {
            info!("motion stop requested");
        }
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
        if self.health.is_latched() {
            info!("motion driver fault cleared");
        }
        self.health.reset();
        if self.state() == MotionState::Stopped {
            self.set_state(MotionState::Idle);
        }
    }
}

impl EmergencyStop for MotionController {
    fn emergency_stop(&self, reason: &TripReason) {
        self.stop_requested.request();
        if self.state().is_moving() {
            warn!(%reason, "motion halted by interlock");
        }
    }
}
