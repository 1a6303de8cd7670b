//! Interlock evaluation and emergency-stop fan-out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::SafetyConfig;
use crate::drivers::{LimitSwitch, TemperatureSensor};
use crate::error::{Error, Result};
use crate::scheduler::{spawn_periodic, TaskHandle};

use super::{
    bounded_name, EmergencyStop, LimitName, LimitReading, SafetyState, TemperatureReading,
    TripReason,
};

struct SensorChannel {
    sensor: Box<dyn TemperatureSensor>,
    failures: u32,
}

struct HardLimit {
    name: LimitName,
    switch: Box<dyn LimitSwitch>,
    failures: u32,
}

/// Owner of the interlock state.
///
/// `tripped` is an atomic flag so controllers can check it on every step
/// without blocking; the reason sits behind a lock and is written before
/// the flag is raised.
pub struct SafetyMonitor {
    tripped: AtomicBool,
    reason: RwLock<Option<TripReason>>,
    config: RwLock<SafetyConfig>,
    sensors: Mutex<Vec<SensorChannel>>,
    hard_limits: Mutex<Vec<HardLimit>>,
    readings: RwLock<Vec<TemperatureReading>>,
    limit_readings: RwLock<Vec<LimitReading>>,
    hooks: RwLock<Vec<Weak<dyn EmergencyStop>>>,
}

impl core::fmt::Debug for SafetyMonitor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SafetyMonitor")
            .field("tripped", &self.is_tripped())
            .field("reason", &*self.reason.read())
            .finish_non_exhaustive()
    }
}

impl SafetyMonitor {
    /// Create a monitor with no sensors or switches.
    pub fn new(config: SafetyConfig) -> Self {
        Self {
            tripped: AtomicBool::new(false),
            reason: RwLock::new(None),
            config: RwLock::new(config),
            sensors: Mutex::new(Vec::new()),
            hard_limits: Mutex::new(Vec::new()),
            readings: RwLock::new(Vec::new()),
            limit_readings: RwLock::new(Vec::new()),
            hooks: RwLock::new(Vec::new()),
        }
    }

    /// Add a temperature sensor.
    pub fn add_sensor(&self, sensor: Box<dyn TemperatureSensor>) {
        debug!(sensor = sensor.id(), "temperature sensor registered");
        self.sensors.lock().push(SensorChannel {
            sensor,
            failures: 0,
        });
    }

    /// Add a hard limit switch. Asserting it trips the interlock.
    pub fn add_hard_limit(&self, name: &str, switch: Box<dyn LimitSwitch>) {
        debug!(limit = name, "hard limit registered");
        self.hard_limits.lock().push(HardLimit {
            name: bounded_name(name),
            switch,
            failures: 0,
        });
    }

    /// Register a hook called on every new trip.
    pub fn register_stop_hook(&self, hook: Weak<dyn EmergencyStop>) {
        let mut hooks = self.hooks.write();
        hooks.retain(|h| h.strong_count() > 0);
        hooks.push(hook);
    }

    /// Replace the configuration.
    pub fn configure(&self, config: SafetyConfig) {
        *self.config.write() = config;
    }

    /// Current configuration.
    pub fn config(&self) -> SafetyConfig {
        self.config.read().clone()
    }

    /// Whether motion and firing are blocked.
    #[inline]
    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    /// Non-blocking pre-motion check.
    #[inline]
    pub fn is_safe_to_move(&self) -> bool {
        !self.is_tripped()
    }

    /// Non-blocking pre-firing check.
    #[inline]
    pub fn is_safe_to_fire(&self) -> bool {
        !self.is_tripped()
    }

    /// Current trip reason.
    pub fn reason(&self) -> Option<TripReason> {
        if self.is_tripped() {
            self.reason.read().clone()
        } else {
            None
        }
    }

    /// Fail with [`Error::Unsafe`] while tripped.
    #[inline]
    pub fn check_move(&self) -> Result<()> {
        match self.reason() {
            Some(reason) => Err(Error::Unsafe(reason)),
            None => Ok(()),
        }
    }

    /// Fail with [`Error::Unsafe`] while tripped.
    #[inline]
    pub fn check_fire(&self) -> Result<()> {
        self.check_move()
    }

    /// Like [`check_move`](Self::check_move), but lets homing through trips
    /// it can recover from.
    pub fn check_recovery(&self) -> Result<()> {
        match self.reason() {
            Some(reason) if !reason.allows_homing() => Err(Error::Unsafe(reason)),
            _ => Ok(()),
        }
    }

    /// Trip the interlock. Returns `true` if this call tripped it.
    ///
    /// The first reason wins while tripped. With `unsafe_bypass` set,
    /// automatic trips are logged and dropped.
    pub fn trip(&self, reason: TripReason) -> bool {
        if reason.is_automatic() && self.config.read().unsafe_bypass {
            warn!(%reason, "trip suppressed by unsafe_bypass");
            return false;
        }

        let newly = {
            let mut current = self.reason.write();
            if current.is_some() {
                false
            } else {
                *current = Some(reason.clone());
                self.tripped.store(true, Ordering::Release);
                true
            }
        };

        if newly {
            warn!(%reason, code = reason.code(), "safety interlock tripped");
            self.stop_all(&reason);
        }
        newly
    }

    /// Operator emergency stop.
    pub fn emergency_stop(&self) -> bool {
        self.trip(TripReason::ManualStop)
    }

    /// Clear the trip once its condition is gone.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TripConditionActive`] if the sensor is still hot or
    /// not responding, or the limit switch is still asserted.
    pub fn clear(&self) -> Result<()> {
        let Some(reason) = self.reason() else {
            return Ok(());
        };

        if !self.config.read().unsafe_bypass {
            match &reason {
                TripReason::OverTemperature(_) | TripReason::SensorFault(_) => {
                    self.sample_temperatures();
                }
                TripReason::LimitFault(_) => {
                    self.sample_limits();
                }
                TripReason::ManualStop | TripReason::DriverFault(_) => {}
            }

            if self.condition_present(&reason) {
                warn!(%reason, "clear refused, condition still present");
                return Err(Error::TripConditionActive(reason));
            }
        }

        self.reset();
        info!(%reason, "safety interlock cleared");
        Ok(())
    }

    fn reset(&self) {
        let mut current = self.reason.write();
        self.tripped.store(false, Ordering::Release);
        *current = None;
    }

    fn stop_all(&self, reason: &TripReason) {
        // Upgrade outside the call loop so hooks may register or query freely
        let hooks: Vec<Arc<dyn EmergencyStop>> =
            self.hooks.read().iter().filter_map(Weak::upgrade).collect();

        for hook in hooks {
            hook.emergency_stop(reason);
        }
    }

    fn condition_present(&self, reason: &TripReason) -> bool {
        match reason {
            TripReason::OverTemperature(id) => self
                .readings
                .read()
                .iter()
                .find(|r| &r.sensor == id)
                .map_or(false, |r| r.temperature.map_or(true, |t| t >= r.high_limit)),
            TripReason::SensorFault(id) => self
                .readings
                .read()
                .iter()
                .find(|r| &r.sensor == id)
                .map_or(false, |r| r.temperature.is_none()),
            TripReason::LimitFault(name) => self
                .limit_readings
                .read()
                .iter()
                .find(|r| &r.name == name)
                .map_or(false, |r| r.active.unwrap_or(true)),
            TripReason::ManualStop | TripReason::DriverFault(_) => false,
        }
    }

    /// Read every sensor, refresh the cached readings and return the trips
    /// they call for.
    fn sample_temperatures(&self) -> Vec<TripReason> {
        let config = self.config.read().clone();
        let mut readings = Vec::new();
        let mut trips = Vec::new();

        let mut sensors = self.sensors.lock();
        for channel in sensors.iter_mut() {
            let id = bounded_name(channel.sensor.id());
            let high_limit = config.high_limit(&id);
            let name = config.sensor_name(&id);

            let temperature = match channel.sensor.read_celsius() {
                Ok(celsius) => {
                    channel.failures = 0;
                    if celsius >= high_limit {
                        trips.push(TripReason::OverTemperature(id.clone()));
                    }
                    Some(celsius)
                }
                Err(e) => {
                    channel.failures += 1;
                    warn!(sensor = %id, failures = channel.failures, error = %e, "temperature read failed");
                    if channel.failures >= config.driver_fault_threshold {
                        trips.push(TripReason::SensorFault(id.clone()));
                    }
                    None
                }
            };

            let warning = temperature
                .map_or(false, |t| t < high_limit && t >= high_limit * config.warning_ratio);
            if warning {
                debug!(sensor = %id, ?temperature, high_limit, "temperature in warning band");
            }

            readings.push(TemperatureReading {
                sensor: id,
                name,
                temperature,
                high_limit,
                warning,
                failures: channel.failures,
            });
        }
        drop(sensors);

        *self.readings.write() = readings;
        trips
    }

    /// Read every hard limit switch and return the trips they call for.
    fn sample_limits(&self) -> Vec<TripReason> {
        let threshold = self.config.read().driver_fault_threshold;
        let mut readings = Vec::new();
        let mut trips = Vec::new();

        let mut limits = self.hard_limits.lock();
        for limit in limits.iter_mut() {
            let active = match limit.switch.is_active() {
                Ok(active) => {
                    limit.failures = 0;
                    if active {
                        trips.push(TripReason::LimitFault(limit.name.clone()));
                    }
                    Some(active)
                }
                Err(e) => {
                    limit.failures += 1;
                    warn!(limit = %limit.name, error = %e, "limit switch read failed");
                    if limit.failures >= threshold {
                        trips.push(TripReason::LimitFault(limit.name.clone()));
                    }
                    None
                }
            };
            readings.push(LimitReading {
                name: limit.name.clone(),
                active,
            });
        }
        drop(limits);

        *self.limit_readings.write() = readings;
        trips
    }

    /// Sample temperatures and trip or auto-clear accordingly.
    pub fn evaluate_temperatures(&self) -> SafetyState {
        for reason in self.sample_temperatures() {
            self.trip(reason);
        }
        self.auto_clear(|r| {
            matches!(r, TripReason::OverTemperature(_) | TripReason::SensorFault(_))
        });
        self.state()
    }

    /// Sample hard limits and trip or auto-clear accordingly.
    pub fn evaluate_limits(&self) -> SafetyState {
        for reason in self.sample_limits() {
            self.trip(reason);
        }
        self.auto_clear(|r| matches!(r, TripReason::LimitFault(_)));
        self.state()
    }

    /// Sample everything.
    pub fn evaluate(&self) -> SafetyState {
        self.evaluate_limits();
        self.evaluate_temperatures()
    }

    fn auto_clear(&self, applies: impl Fn(&TripReason) -> bool) {
        if self.config.read().sticky_trip {
            return;
        }
        if let Some(reason) = self.reason() {
            if applies(&reason) && !self.condition_present(&reason) {
                self.reset();
                info!(%reason, "safety interlock auto-cleared");
            }
        }
    }

    /// Snapshot for status polling.
    pub fn state(&self) -> SafetyState {
        let readings = self.readings.read().clone();
        let warnings = readings
            .iter()
            .filter(|r| r.warning)
            .map(|r| r.sensor.clone())
            .collect();

        SafetyState {
            tripped: self.is_tripped(),
            reason: self.reason(),
            warnings,
            readings,
            limits: self.limit_readings.read().clone(),
            bypass: self.config.read().unsafe_bypass,
        }
    }

    /// Run limit evaluation every `limit_interval` and temperature
    /// evaluation every `temperature_interval` on a background thread.
    pub fn spawn(self: &Arc<Self>) -> Result<TaskHandle> {
        let monitor = Arc::clone(self);
        let mut last_temperature: Option<Instant> = None;

        spawn_periodic("safety-monitor", move || {
            let config = monitor.config();
            monitor.evaluate_limits();

            let due = last_temperature
                .map_or(true, |at| at.elapsed() >= config.temperature_interval());
            if due {
                monitor.evaluate_temperatures();
                last_temperature = Some(Instant::now());
            }

            config.limit_interval().max(Duration::from_millis(1))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::sim::{SimLimitSwitch, SimTemperatureSensor};
    use std::sync::atomic::AtomicU32;

    struct CountingHook(AtomicU32);

    impl EmergencyStop for CountingHook {
        fn emergency_stop(&self, _reason: &TripReason) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn monitor_with_probe(celsius: f32) -> (SafetyMonitor, SimTemperatureSensor) {
        let monitor = SafetyMonitor::new(SafetyConfig::default());
        let probe = SimTemperatureSensor::new("laser_head", celsius);
        monitor.add_sensor(Box::new(probe.clone()));
        (monitor, probe)
    }

    #[test]
    fn test_first_reason_wins() {
        let monitor = SafetyMonitor::new(SafetyConfig::default());

        assert!(monitor.trip(TripReason::ManualStop));
        assert!(!monitor.trip(TripReason::LimitFault(bounded_name("a"))));
        assert_eq!(monitor.reason(), Some(TripReason::ManualStop));
    }

    #[test]
    fn test_hooks_called_once_per_trip() {
        let monitor = SafetyMonitor::new(SafetyConfig::default());
        let hook = Arc::new(CountingHook(AtomicU32::new(0)));
        let weak: Weak<dyn EmergencyStop> = Arc::downgrade(&hook) as Weak<dyn EmergencyStop>;
        monitor.register_stop_hook(weak);

        monitor.emergency_stop();
        monitor.emergency_stop();
        assert_eq!(hook.0.load(Ordering::SeqCst), 1);

        monitor.clear().unwrap();
        monitor.emergency_stop();
        assert_eq!(hook.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_warning_band_is_advisory() {
        let (monitor, _probe) = monitor_with_probe(46.0);

        let state = monitor.evaluate_temperatures();
        assert!(!state.tripped);
        assert_eq!(state.warnings.len(), 1);
        assert_eq!(state.warnings[0].as_str(), "laser_head");
    }

    #[test]
    fn test_sensor_fault_after_threshold() {
        let (monitor, probe) = monitor_with_probe(20.0);
        probe.set_failing(true);

        monitor.evaluate_temperatures();
        monitor.evaluate_temperatures();
        assert!(!monitor.is_tripped());
        monitor.evaluate_temperatures();
        assert!(matches!(monitor.reason(), Some(TripReason::SensorFault(_))));

        assert!(matches!(monitor.clear(), Err(Error::TripConditionActive(_))));
        probe.set_failing(false);
        monitor.clear().unwrap();
    }

    #[test]
    fn test_hard_limit_trip_and_clear() {
        let monitor = SafetyMonitor::new(SafetyConfig::default());
        let switch = SimLimitSwitch::new(false);
        monitor.add_hard_limit("limit_a", Box::new(switch.clone()));

        assert!(!monitor.evaluate_limits().tripped);
        switch.set_active(true);
        let state = monitor.evaluate_limits();
        assert_eq!(state.reason, Some(TripReason::LimitFault(bounded_name("limit_a"))));

        // Homing may recover from a limit fault
        assert!(monitor.check_recovery().is_ok());
        assert!(monitor.check_move().is_err());

        assert!(monitor.clear().is_err());
        switch.set_active(false);
        assert!(monitor.clear().is_ok());
    }

    #[test]
    fn test_non_sticky_auto_clear() {
        let config = SafetyConfig {
            sticky_trip: false,
            ..SafetyConfig::default()
        };
        let monitor = SafetyMonitor::new(config);
        let probe = SimTemperatureSensor::new("laser_head", 55.0);
        monitor.add_sensor(Box::new(probe.clone()));

        assert!(monitor.evaluate_temperatures().tripped);
        probe.set_celsius(30.0);
        assert!(!monitor.evaluate_temperatures().tripped);
    }

    #[test]
    fn test_manual_stop_not_auto_cleared() {
        let config = SafetyConfig {
            sticky_trip: false,
            ..SafetyConfig::default()
        };
        let monitor = SafetyMonitor::new(config);

        monitor.emergency_stop();
        monitor.evaluate();
        assert!(monitor.is_tripped());
    }
}
