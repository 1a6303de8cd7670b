//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::thread;
use std::time::{Duration, Instant};

use laserclean_core::config::{ControlConfig, SensorConfig, SensorId};
use laserclean_core::drivers::sim::SimHandles;
use laserclean_core::Machine;

/// Sensor every test machine carries.
pub const HEAD_SENSOR: &str = "laser_head";

/// Configuration tuned so simulated runs finish in milliseconds.
pub fn fast_config() -> ControlConfig {
    let mut config = ControlConfig::default();
    config.motion.max_steps = Some(30_000);
    config.motion.index_distance = 500;
    config.motion.home_backoff_steps = 50;
    config.motion.home_max_steps = 40_000;

    config.trigger.fiber_step_delay_ms = 5;
    config.trigger.detach_delay_ms = 1;

    config.table.debounce_ms = 5;
    config.table.poll_interval_ms = 2;
    config.table.dwell_secs = 0.01;
    config.table.travel_timeout_secs = 2.0;

    config.safety.temperature_interval_ms = 10;
    config.safety.limit_interval_ms = 5;
    config.safety.sensors.insert(
        SensorId::try_from(HEAD_SENSOR).expect("short id"),
        SensorConfig {
            name: "Laser head".into(),
            high_limit: Some(50.0),
        },
    );

    config.outputs.tick_interval_ms = 5;
    config
}

/// A fully simulated machine on [`fast_config`].
pub fn machine() -> (Machine, SimHandles) {
    Machine::simulated(fast_config()).expect("valid test configuration")
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}
