//! Table controller: manual legs and the auto-cycle task.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::TableConfig;
use crate::drivers::{DigitalOutput, DriverHealth, DriverResult, LimitSwitch};
use crate::error::{Error, Result};
use crate::safety::{Actuator, EmergencyStop, SafetyMonitor, TripReason};
use crate::scheduler::{spawn_task, StopSignal, TaskHandle};
use crate::sync::{sleep_unless, BusyGuard, StopFlag};

use super::debounce::Debouncer;
use super::{TableLeg, TableState};

/// Relays and end switches of the table.
pub struct TableDrivers {
    /// Relay driving toward the front switch.
    pub forward: Box<dyn DigitalOutput>,
    /// Relay driving toward the back switch.
    pub backward: Box<dyn DigitalOutput>,
    /// Front end switch.
    pub front: Box<dyn LimitSwitch>,
    /// Back end switch.
    pub back: Box<dyn LimitSwitch>,
}

impl TableDrivers {
    fn relay(&mut self, leg: TableLeg) -> &mut dyn DigitalOutput {
        match leg {
            TableLeg::Forward => &mut *self.forward,
            TableLeg::Backward => &mut *self.backward,
        }
    }

    fn limit(&mut self, leg: TableLeg) -> &mut dyn LimitSwitch {
        match leg {
            TableLeg::Forward => &mut *self.front,
            TableLeg::Backward => &mut *self.back,
        }
    }
}

/// Snapshot of the table for status polling.
#[derive(Debug, Clone, PartialEq)]
pub struct TableStatus {
    /// Table state.
    pub state: TableState,
    /// Completed forward and backward pairs.
    pub cycle_count: u64,
    /// Raw front switch, `None` if unknown.
    pub front_limit: Option<bool>,
    /// Raw back switch, `None` if unknown.
    pub back_limit: Option<bool>,
    /// Latched driver fault, if any.
    pub fault: Option<TripReason>,
}

const UNKNOWN: u8 = 2;

fn encode_switch(reading: Option<bool>) -> u8 {
    reading.map_or(UNKNOWN, u8::from)
}

fn decode_switch(raw: u8) -> Option<bool> {
    match raw {
        0 => Some(false),
        1 => Some(true),
        _ => None,
    }
}

/// How a leg ends when it does not reach its switch.
enum LegMode {
    Manual,
    Auto,
}

/// Reciprocating table controller.
pub struct TableController {
    drivers: Mutex<TableDrivers>,
    safety: Arc<SafetyMonitor>,
    config: RwLock<TableConfig>,
    state: RwLock<TableState>,
    cycles: AtomicU64,
    busy: AtomicBool,
    stop_requested: StopFlag,
    front_seen: AtomicU8,
    back_seen: AtomicU8,
    auto_task: Mutex<Option<TaskHandle>>,
    health: DriverHealth,
}

impl core::fmt::Debug for TableController {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TableController")
            .field("state", &self.state())
            .field("cycles", &self.cycle_count())
            .finish_non_exhaustive()
    }
}

impl TableController {
    /// Create a controller with both relays switched off.
    pub fn new(mut drivers: TableDrivers, config: TableConfig, safety: Arc<SafetyMonitor>) -> Self {
        for leg in [TableLeg::Forward, TableLeg::Backward] {
            if let Err(e) = drivers.relay(leg).set(false) {
                error!(%leg, error = %e, "cannot switch table relay off");
            }
        }

        let threshold = safety.config().driver_fault_threshold;
        Self {
            drivers: Mutex::new(drivers),
            safety,
            config: RwLock::new(config),
            state: RwLock::new(TableState::Idle),
            cycles: AtomicU64::new(0),
            busy: AtomicBool::new(false),
            stop_requested: StopFlag::default(),
            front_seen: AtomicU8::new(UNKNOWN),
            back_seen: AtomicU8::new(UNKNOWN),
            auto_task: Mutex::new(None),
            health: DriverHealth::new(threshold),
        }
    }

    /// Replace the configuration. A running auto-cycle picks it up on the
    /// next leg.
    pub fn configure(&self, config: TableConfig) {
        *self.config.write() = config;
    }

    /// Change how many consecutive driver errors latch a fault.
    pub fn set_fault_threshold(&self, threshold: u32) {
        self.health.set_threshold(threshold);
    }

    /// Table state.
    pub fn state(&self) -> TableState {
        self.state.read().clone()
    }

    fn set_state(&self, state: TableState) {
        *self.state.write() = state;
    }

    /// Completed forward and backward pairs since the last reset.
    #[inline]
    pub fn cycle_count(&self) -> u64 {
        self.cycles.load(Ordering::Acquire)
    }

    /// Zero the cycle counter.
    pub fn reset_cycle_count(&self) {
        self.cycles.store(0, Ordering::Release);
        info!("table cycle count reset");
    }

    /// Whether the auto-cycle task is running.
    pub fn is_auto_cycling(&self) -> bool {
        self.auto_task.lock().as_ref().map_or(false, TaskHandle::is_running)
    }

    /// Snapshot for status polling.
    ///
    /// Switches are read fresh when the table is idle; while a leg runs the
    /// readings of its last poll are reported.
    pub fn status(&self) -> TableStatus {
        if let Some(mut drivers) = self.drivers.try_lock() {
            for leg in [TableLeg::Forward, TableLeg::Backward] {
                let reading = drivers.limit(leg).is_active().ok();
                self.record_switch(leg, reading);
            }
        }

        TableStatus {
            state: self.state(),
            cycle_count: self.cycle_count(),
            front_limit: decode_switch(self.front_seen.load(Ordering::Acquire)),
            back_limit: decode_switch(self.back_seen.load(Ordering::Acquire)),
            fault: self.fault(),
        }
    }

    fn record_switch(&self, leg: TableLeg, reading: Option<bool>) {
        let seen = match leg {
            TableLeg::Forward => &self.front_seen,
            TableLeg::Backward => &self.back_seen,
        };
        seen.store(encode_switch(reading), Ordering::Release);
    }

    fn fault(&self) -> Option<TripReason> {
        self.health
            .is_latched()
            .then_some(TripReason::DriverFault(Actuator::Table))
    }

    fn preflight(&self) -> Result<()> {
        if let Some(fault) = self.fault() {
            return Err(Error::Unsafe(fault));
        }
        self.safety.check_move()
    }

    fn checked<T>(&self, result: DriverResult<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.health.record_success();
                Ok(value)
            }
            Err(e) => {
                if self.health.record_failure() {
                    error!(error = %e, "table driver fault latched");
                } else {
                    error!(error = %e, "table driver error");
                }
                Err(e.into())
            }
        }
    }

    fn read_limit(&self, drivers: &mut TableDrivers, leg: TableLeg) -> Result<bool> {
        let reading = drivers.limit(leg).is_active();
        self.record_switch(leg, reading.as_ref().ok().copied());
        self.checked(reading)
    }

    /// Drive toward the front switch until it asserts.
    ///
    /// # Errors
    ///
    /// - [`Error::Unsafe`] while the interlock is tripped
    /// - [`Error::LimitAlreadyActive`] if the front switch is already
    ///   asserted; no relay is energized
    /// - [`Error::TravelTimeout`] if the switch is not reached in time
    /// - [`Error::Busy`] while another leg or the auto-cycle runs
    pub fn move_forward(&self) -> Result<()> {
        self.manual_leg(TableLeg::Forward)
    }

    /// Drive toward the back switch until it asserts.
    pub fn move_backward(&self) -> Result<()> {
        self.manual_leg(TableLeg::Backward)
    }

    fn manual_leg(&self, leg: TableLeg) -> Result<()> {
        self.preflight()?;
        let _guard = BusyGuard::acquire(&self.busy, Actuator::Table)?;
        self.stop_requested.begin();

        let result = {
            let mut drivers = self.drivers.lock();
            self.run_leg(&mut drivers, leg, LegMode::Manual)
        };

        match &result {
            Ok(()) => {
                self.set_state(TableState::Idle);
                info!(%leg, "table reached limit");
            }
            Err(Error::LimitAlreadyActive(_)) => {}
            Err(Error::Stopped) => self.set_state(TableState::Idle),
            Err(e) => {
                warn!(%leg, error = %e, "table leg failed");
                self.set_state(TableState::Stopped(e.clone()));
            }
        }
        result
    }

    /// Run one leg: energize its relay and poll its switch until the
    /// debounced reading asserts. The relay is always released on return.
    fn run_leg(&self, drivers: &mut TableDrivers, leg: TableLeg, mode: LegMode) -> Result<()> {
        if self.read_limit(drivers, leg)? {
            warn!(%leg, "limit already active, not driving");
            return Err(Error::LimitAlreadyActive(leg));
        }

        let config = self.config.read().clone();
        let mut debouncer = Debouncer::new(config.debounce());
        let deadline = Instant::now() + config.travel_timeout();

        // Opposite relay off before ours goes on
        self.checked(drivers.relay(leg.reversed()).set(false))?;
        self.checked(drivers.relay(leg).set(true))?;
        self.set_state(match mode {
            LegMode::Manual if leg == TableLeg::Forward => TableState::MovingForward,
            LegMode::Manual => TableState::MovingBackward,
            LegMode::Auto => TableState::AutoCycling {
                leg,
                dwelling: false,
            },
        });
        debug!(%leg, "table relay energized");

        let result = self.poll_until_limit(drivers, leg, &mut debouncer, deadline, config.poll_interval());

        let released = self.checked(drivers.relay(leg).set(false));
        result.and(released)
    }

    fn poll_until_limit(
        &self,
        drivers: &mut TableDrivers,
        leg: TableLeg,
        debouncer: &mut Debouncer,
        deadline: Instant,
        poll: Duration,
    ) -> Result<()> {
        loop {
            self.safety.check_move()?;
            if self.stop_requested.is_requested() {
                return Err(Error::Stopped);
            }

            let raw = self.read_limit(drivers, leg)?;
            let now = Instant::now();
            if debouncer.update(raw, now) == Some(true) {
                return Ok(());
            }
            if now >= deadline {
                return Err(Error::TravelTimeout(leg));
            }
            thread::sleep(poll);
        }
    }

    /// Start the auto-cycle on a background task and return immediately.
    ///
    /// Legs alternate, starting forward unless the front switch is already
    /// asserted, with `dwell` (or the configured dwell) at each switch.
    pub fn start_auto_cycle(self: &Arc<Self>, dwell: Option<Duration>) -> Result<()> {
        self.preflight()?;
        BusyGuard::acquire(&self.busy, Actuator::Table)?.keep();
        self.stop_requested.begin();

        let dwell = dwell.unwrap_or_else(|| self.config.read().dwell());
        let table = Arc::clone(self);
        let spawned = spawn_task("table-auto-cycle", move |signal| {
            let _guard = BusyGuard::adopt(&table.busy);
            table.auto_cycle(dwell, &signal);
        });

        match spawned {
            Ok(task) => {
                info!(dwell_ms = dwell.as_millis() as u64, "table auto-cycle started");
                *self.auto_task.lock() = Some(task);
                Ok(())
            }
            Err(e) => {
                drop(BusyGuard::adopt(&self.busy));
                Err(e)
            }
        }
    }

    fn auto_cycle(&self, dwell: Duration, signal: &StopSignal) {
        let interrupted = || {
            self.stop_requested.is_requested()
                || signal.is_requested()
                || self.safety.is_tripped()
        };

        let mut drivers = self.drivers.lock();
        let mut leg = match self.read_limit(&mut drivers, TableLeg::Forward) {
            Ok(true) => TableLeg::Backward,
            Ok(false) => TableLeg::Forward,
            Err(e) => {
                self.set_state(TableState::Stopped(e));
                return;
            }
        };
        let mut forward_done = false;

        let end = loop {
            if signal.is_requested() {
                break Err(Error::Stopped);
            }
            if let Err(e) = self.run_leg(&mut drivers, leg, LegMode::Auto) {
                break Err(e);
            }

            match leg {
                TableLeg::Forward => forward_done = true,
                TableLeg::Backward if forward_done => {
                    let count = self.cycles.fetch_add(1, Ordering::AcqRel) + 1;
                    debug!(count, "table cycle complete");
                    forward_done = false;
                }
                TableLeg::Backward => {}
            }

            self.set_state(TableState::AutoCycling {
                leg,
                dwelling: true,
            });
            if !sleep_unless(dwell, interrupted) {
                break self.safety.check_move().and(Err(Error::Stopped));
            }
            leg = leg.reversed();
        };
        drop(drivers);

        match end {
            Err(Error::Stopped) => {
                self.set_state(TableState::Idle);
                info!(cycles = self.cycle_count(), "table auto-cycle stopped");
            }
            Err(e) => {
                warn!(error = %e, cycles = self.cycle_count(), "table auto-cycle halted");
                self.set_state(TableState::Stopped(e));
            }
            Ok(()) => self.set_state(TableState::Idle),
        }
    }

    /// Stop the auto-cycle and wait for its task to exit.
    pub fn stop_auto_cycle(&self) {
        self.stop_requested.request();
        let task = self.auto_task.lock().take();
        if let Some(mut task) = task {
            task.stop();
        }
    }

    /// Halt whatever leg is running and exit to Idle.
    pub fn stop(&self) {
        info!("table stop requested");
        self.stop_auto_cycle();
    }

    /// Hand the next command a clean stop request that a [`stop`](Self::stop)
    /// issued before it starts will still reach.
    pub(crate) fn arm_stop(&self) {
        self.stop_requested.arm();
    }

    pub(crate) fn disarm_stop(&self) {
        self.stop_requested.disarm();
    }

    /// Release a latched driver fault and leave the Stopped state.
    pub fn clear_fault(&self) {
        self.health.reset();
        let mut state = self.state.write();
        if matches!(*state, TableState::Stopped(_)) {
            *state = TableState::Idle;
        }
    }
}

impl EmergencyStop for TableController {
    fn emergency_stop(&self, reason: &TripReason) {
        self.stop_requested.request();
        if self.state().is_moving() {
            warn!(%reason, "table halted by interlock");
        }
    }
}
