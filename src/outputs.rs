//! Fan and red-light outputs.
//!
//! Both follow the trigger when configured to: they switch on when firing
//! starts and run on for their off-delay after it stops. Not interlocked;
//! an emergency stop leaves the fan running. A latched relay fault refuses
//! switching on until [`OutputController::clear_fault`], switching off is
//! always attempted.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::config::OutputsConfig;
use crate::drivers::{DigitalOutput, DriverHealth};
use crate::error::{Error, Result};
use crate::safety::{Actuator, TripReason};
use crate::scheduler::{spawn_periodic, TaskHandle};
use crate::trigger::FireListener;

/// One auxiliary output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputChannel {
    /// Extraction fan.
    Fan,
    /// Red warning lights.
    Lights,
}

impl core::fmt::Display for OutputChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            OutputChannel::Fan => "fan",
            OutputChannel::Lights => "lights",
        })
    }
}

/// Output relays.
pub struct OutputDrivers {
    /// Fan relay.
    pub fan: Box<dyn DigitalOutput>,
    /// Red lights relay.
    pub lights: Box<dyn DigitalOutput>,
}

/// Snapshot of the outputs for status polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputStatus {
    /// Fan on.
    pub fan_on: bool,
    /// Lights on.
    pub lights_on: bool,
    /// Time until the fan switches off, while its timer runs.
    pub fan_off_in: Option<Duration>,
    /// Time until the lights switch off, while their timer runs.
    pub lights_off_in: Option<Duration>,
    /// Latched relay fault, if any.
    pub fault: Option<TripReason>,
}

struct Channel {
    output: Box<dyn DigitalOutput>,
    on: bool,
    off_at: Option<Instant>,
}

impl Channel {
    fn remaining(&self, now: Instant) -> Option<Duration> {
        self.off_at.map(|at| at.saturating_duration_since(now))
    }
}

/// Fan and red-light controller.
pub struct OutputController {
    fan: Mutex<Channel>,
    lights: Mutex<Channel>,
    config: RwLock<OutputsConfig>,
    health: DriverHealth,
}

impl core::fmt::Debug for OutputController {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OutputController")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl OutputController {
    /// Create a controller with both outputs switched off.
    pub fn new(drivers: OutputDrivers, config: OutputsConfig, fault_threshold: u32) -> Self {
        let controller = Self {
            fan: Mutex::new(Channel {
                output: drivers.fan,
                on: false,
                off_at: None,
            }),
            lights: Mutex::new(Channel {
                output: drivers.lights,
                on: false,
                off_at: None,
            }),
            config: RwLock::new(config),
            health: DriverHealth::new(fault_threshold),
        };

        for channel in [OutputChannel::Fan, OutputChannel::Lights] {
            if let Err(e) = controller.switch(channel, false) {
                error!(%channel, error = %e, "cannot switch output off");
            }
        }
        controller
    }

    /// Replace the configuration. Running timers keep their deadline.
    pub fn configure(&self, config: OutputsConfig) {
        *self.config.write() = config;
    }

    /// Change how many consecutive relay errors latch a fault.
    pub fn set_fault_threshold(&self, threshold: u32) {
        self.health.set_threshold(threshold);
    }

    fn channel(&self, channel: OutputChannel) -> &Mutex<Channel> {
        match channel {
            OutputChannel::Fan => &self.fan,
            OutputChannel::Lights => &self.lights,
        }
    }

    fn fault(&self) -> Option<TripReason> {
        self.health
            .is_latched()
            .then_some(TripReason::DriverFault(Actuator::Outputs))
    }

    fn switch(&self, channel: OutputChannel, on: bool) -> Result<()> {
        if on {
            if let Some(fault) = self.fault() {
                return Err(Error::Unsafe(fault));
            }
        }
        let mut state = self.channel(channel).lock();
        state.off_at = None;
        match state.output.set(on) {
            Ok(()) => {
                self.health.record_success();
                state.on = on;
                Ok(())
            }
            Err(e) => {
                if self.health.record_failure() {
                    error!(%channel, error = %e, "output driver fault latched");
                } else {
                    error!(%channel, error = %e, "output driver error");
                }
                Err(e.into())
            }
        }
    }

    /// Switch the fan. Cancels its off-delay timer.
    pub fn set_fan(&self, on: bool) -> Result<()> {
        self.switch(OutputChannel::Fan, on)?;
        info!(on, "fan switched");
        Ok(())
    }

    /// Switch the red lights. Cancels their off-delay timer.
    pub fn set_lights(&self, on: bool) -> Result<()> {
        self.switch(OutputChannel::Lights, on)?;
        info!(on, "lights switched");
        Ok(())
    }

    /// Whether an output is on.
    pub fn is_on(&self, channel: OutputChannel) -> bool {
        self.channel(channel).lock().on
    }

    /// Snapshot for status polling.
    pub fn status(&self) -> OutputStatus {
        let now = Instant::now();
        let fan = self.fan.lock();
        let lights = self.lights.lock();
        OutputStatus {
            fan_on: fan.on,
            lights_on: lights.on,
            fan_off_in: fan.remaining(now),
            lights_off_in: lights.remaining(now),
            fault: self.fault(),
        }
    }

    /// Release a latched relay fault.
    pub fn clear_fault(&self) {
        if self.health.is_latched() {
            info!("output driver fault cleared");
        }
        self.health.reset();
    }

    /// Switch off every output whose off-delay has expired at `now`.
    pub fn tick(&self, now: Instant) {
        for channel in [OutputChannel::Fan, OutputChannel::Lights] {
            let expired = self
                .channel(channel)
                .lock()
                .off_at
                .map_or(false, |at| now >= at);
            if expired {
                match self.switch(channel, false) {
                    Ok(()) => info!(%channel, "off-delay expired"),
                    Err(e) => error!(%channel, error = %e, "cannot switch output off"),
                }
            }
        }
    }

    /// Run [`tick`](Self::tick) every `tick_interval` on a background task.
    pub fn spawn(self: &Arc<Self>) -> Result<TaskHandle> {
        let outputs = Arc::clone(self);
        spawn_periodic("output-timers", move || {
            outputs.tick(Instant::now());
            outputs.config.read().tick_interval()
        })
    }
}

impl FireListener for OutputController {
    fn fire_started(&self) {
        if !self.config.read().follow_trigger {
            return;
        }
        for channel in [OutputChannel::Fan, OutputChannel::Lights] {
            if let Err(e) = self.switch(channel, true) {
                error!(%channel, error = %e, "cannot follow trigger");
            }
        }
        debug!("outputs on with trigger");
    }

    fn fire_stopped(&self) {
        let config = self.config.read().clone();
        if !config.follow_trigger {
            return;
        }

        let now = Instant::now();
        for (channel, delay) in [
            (OutputChannel::Fan, config.fan_off_delay()),
            (OutputChannel::Lights, config.lights_off_delay()),
        ] {
            let mut state = self.channel(channel).lock();
            if state.on {
                state.off_at = Some(now + delay);
            }
        }
        debug!("output off-delay timers started");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::sim::SimOutput;

    fn outputs(config: OutputsConfig) -> (OutputController, SimOutput, SimOutput) {
        let fan = SimOutput::new();
        let lights = SimOutput::new();
        let drivers = OutputDrivers {
            fan: Box::new(fan.clone()),
            lights: Box::new(lights.clone()),
        };
        (OutputController::new(drivers, config, 3), fan, lights)
    }

    #[test]
    fn test_follows_trigger_with_off_delays() {
        let config = OutputsConfig {
            fan_off_delay_ms: 1000,
            lights_off_delay_ms: 100,
            ..OutputsConfig::default()
        };
        let (outputs, fan, lights) = outputs(config);

        outputs.fire_started();
        assert!(fan.is_on() && lights.is_on());

        outputs.fire_stopped();
        let start = Instant::now();
        outputs.tick(start + Duration::from_millis(50));
        assert!(lights.is_on());

        outputs.tick(start + Duration::from_millis(200));
        assert!(!lights.is_on());
        assert!(fan.is_on());
        assert!(outputs.status().fan_off_in.is_some());

        outputs.tick(start + Duration::from_secs(2));
        assert!(!fan.is_on());
    }

    #[test]
    fn test_explicit_set_cancels_timer() {
        let (outputs, fan, _) = outputs(OutputsConfig::default());

        outputs.fire_started();
        outputs.fire_stopped();
        outputs.set_fan(true).unwrap();
        assert_eq!(outputs.status().fan_off_in, None);

        outputs.tick(Instant::now() + Duration::from_secs(3600));
        assert!(fan.is_on());
    }

    #[test]
    fn test_relay_errors_latch_fault() {
        let (outputs, fan, lights) = outputs(OutputsConfig::default());
        fan.set_failing(true);

        for _ in 0..3 {
            assert!(matches!(outputs.set_fan(true), Err(Error::Driver(_))));
        }
        let latched = Err(Error::Unsafe(TripReason::DriverFault(Actuator::Outputs)));
        assert_eq!(outputs.set_lights(true), latched);
        assert!(!lights.is_on());
        assert_eq!(
            outputs.status().fault,
            Some(TripReason::DriverFault(Actuator::Outputs))
        );

        // Switching off is never refused
        fan.set_failing(false);
        outputs.set_fan(false).unwrap();
        assert_eq!(outputs.set_fan(true), latched);

        outputs.clear_fault();
        outputs.set_fan(true).unwrap();
        assert!(fan.is_on());
        assert_eq!(outputs.status().fault, None);
    }

    #[test]
    fn test_follow_disabled() {
        let config = OutputsConfig {
            follow_trigger: false,
            ..OutputsConfig::default()
        };
        let (outputs, fan, _) = outputs(config);

        outputs.fire_started();
        assert!(!fan.is_on());
    }
}
