//! Configuration parsing, validation, live reload and persistent records.

mod common;

use std::fs;
use std::sync::Arc;

use laserclean_core::config::{FileConfigProvider, PresetName, StaticConfigProvider};
use laserclean_core::{
    parse_config, validate_config, ConfigError, Direction, Error, FileStore, Machine, RecordStore,
};

use common::fast_config;

// =============================================================================
// Test configuration data
// =============================================================================

const FULL_CONFIG: &str = r#"
[motion]
max_steps = 30000
index_distance = 15842
home_backoff_steps = 150

[motion.jog]
speed = 500.0
acceleration = 2000.0

[motion.index]
speed = 3500.0
acceleration = 2000.0
deceleration = 4000.0

[trigger]
position_a = -30.0
position_b = 30.0
fiber_step_delay_ms = 250

[table]
dwell_secs = 1.5
debounce_ms = 40

[safety]
default_high_limit = 45.0
warning_ratio = 0.8

[safety.sensors.laser_head]
name = "Laser Head"
high_limit = 55.0

[safety.sensors.control_box]
name = "Control Box"

[outputs]
fan_off_delay_ms = 300000

[hardware]
step_pin = 17
dir_pin = 27
home_pin = 22

[presets]
"Position 1" = 1200
"Position 2" = 24000
"#;

// =============================================================================
// Parsing
// =============================================================================

#[test]
fn test_parse_full_config() {
    let config = parse_config(FULL_CONFIG).expect("valid configuration");

    assert_eq!(config.motion.max_steps, Some(30_000));
    assert!(config.motion.index.is_asymmetric());
    assert!(!config.motion.jog.is_asymmetric());
    assert_eq!(config.trigger.position_a.0, -30.0);
    assert_eq!(config.table.debounce_ms, 40);
    assert_eq!(config.safety.high_limit("laser_head"), 55.0);
    assert_eq!(config.safety.high_limit("control_box"), 45.0);
    assert_eq!(config.safety.sensor_name("control_box"), "Control Box");
    assert_eq!(config.hardware.home_pin, Some(22));
    assert_eq!(config.preset("Position 2"), Some(24_000));
    assert_eq!(config.preset_names().count(), 2);
}

#[test]
fn test_empty_config_uses_defaults() {
    let config = parse_config("").unwrap();

    assert_eq!(config.motion.index_distance, 15842);
    assert_eq!(config.motion.max_steps, None);
    assert_eq!(config.safety.default_high_limit, 50.0);
    assert!(config.safety.sticky_trip);
    assert!(!config.safety.unsafe_bypass);
    assert!(config.outputs.follow_trigger);
}

// =============================================================================
// Validation
// =============================================================================

#[test]
fn test_preset_outside_travel_rejected() {
    let result = parse_config(
        r#"
[motion]
max_steps = 1000

[presets]
far = 5000
"#,
    );

    assert!(matches!(
        result,
        Err(Error::Config(ConfigError::PresetOutOfRange { position: 5000, .. }))
    ));
}

#[test]
fn test_invalid_values_rejected() {
    let mut config = fast_config();
    config.trigger.position_b.0 = 120.0;
    assert!(matches!(
        validate_config(&config),
        Err(Error::Config(ConfigError::InvalidAngle(_)))
    ));

    let mut config = fast_config();
    config.motion.index.speed.0 = 0.0;
    assert!(matches!(
        validate_config(&config),
        Err(Error::Config(ConfigError::InvalidProfile { profile: "index", .. }))
    ));

    let mut config = fast_config();
    config.motion.index_distance = -5;
    assert!(matches!(
        validate_config(&config),
        Err(Error::Config(ConfigError::InvalidSteps { field: "index_distance", .. }))
    ));

    let mut config = fast_config();
    config.table.poll_interval_ms = 0;
    assert!(matches!(
        validate_config(&config),
        Err(Error::Config(ConfigError::InvalidInterval(_)))
    ));
}

// =============================================================================
// Live reload
// =============================================================================

#[test]
fn test_reload_applies_live_settings() {
    let (machine, _sim) = Machine::simulated(fast_config()).unwrap();

    let mut next = fast_config();
    next.motion.index_distance = 250;
    next.trigger.fiber_step_delay_ms = 7;
    let outcome = machine.reload_config(&StaticConfigProvider(next)).unwrap();

    assert!(!outcome.restart_required);
    assert_eq!(machine.motion().config().index_distance, 250);
    assert_eq!(machine.trigger().config().fiber_step_delay_ms, 7);
    assert_eq!(machine.motion().index(Direction::Forward, None).unwrap(), 250);
}

#[test]
fn test_reload_reports_hardware_change() {
    let (machine, _sim) = Machine::simulated(fast_config()).unwrap();
    let before = machine.config().hardware;

    let mut next = fast_config();
    next.hardware.step_pin = before.step_pin.wrapping_add(1);
    let outcome = machine.apply_config(next).unwrap();

    assert!(outcome.restart_required);
    assert_eq!(machine.config().hardware, before);
}

#[test]
fn test_invalid_reload_changes_nothing() {
    let (machine, _sim) = Machine::simulated(fast_config()).unwrap();

    let mut next = fast_config();
    next.motion.index_distance = 250;
    next.motion.home.acceleration.0 = -1.0;

    assert!(machine.apply_config(next).is_err());
    assert_eq!(machine.motion().config().index_distance, 500);
}

#[test]
fn test_reload_merges_configured_presets() {
    let (machine, _sim) = Machine::simulated(fast_config()).unwrap();
    machine.motion().jog(Direction::Forward, 100, None).unwrap();
    machine.motion().save_preset("park").unwrap();

    let mut next = fast_config();
    next.presets.insert(PresetName::try_from("start").unwrap(), 2_500);
    let outcome = machine.apply_config(next.clone()).unwrap();

    assert!(!outcome.restart_required);
    assert_eq!(machine.motion().preset("start"), Some(2_500));
    assert_eq!(machine.motion().preset("park"), Some(100));
    assert_eq!(machine.motion().move_to_preset("start").unwrap(), 2_500);

    // A changed value wins over the book
    next.presets.insert(PresetName::try_from("start").unwrap(), 3_000);
    machine.apply_config(next.clone()).unwrap();
    assert_eq!(machine.motion().preset("start"), Some(3_000));

    // An unchanged value leaves a runtime save alone
    machine.motion().save_preset("start").unwrap();
    machine.apply_config(next).unwrap();
    assert_eq!(machine.motion().preset("start"), Some(2_500));
}

#[test]
fn test_reload_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("machine.toml");
    fs::write(&path, "[motion]\nmax_steps = 30000\nindex_distance = 640\n").unwrap();

    let (machine, _sim) = Machine::simulated(fast_config()).unwrap();
    machine.reload_config(&FileConfigProvider::new(&path)).unwrap();
    assert_eq!(machine.motion().config().index_distance, 640);

    fs::write(&path, "[motion\nbroken").unwrap();
    assert!(matches!(
        machine.reload_config(&FileConfigProvider::new(&path)),
        Err(Error::Config(ConfigError::Parse(_)))
    ));
    assert_eq!(machine.motion().config().index_distance, 640);
}

// =============================================================================
// File store
// =============================================================================

#[test]
fn test_file_store_records() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path());

    store.put("presets", "Position 1", "position = 1200\n").unwrap();
    store.put("presets", "Position 2", "position = 2400\n").unwrap();

    assert_eq!(
        store.get("presets", "Position 1").unwrap().as_deref(),
        Some("position = 1200\n")
    );
    assert_eq!(store.keys("presets").unwrap(), vec!["Position 1", "Position 2"]);
    assert!(store.keys("sequences").unwrap().is_empty());

    assert!(store.delete("presets", "Position 1").unwrap());
    assert!(!store.delete("presets", "Position 1").unwrap());
    assert_eq!(store.get("presets", "Position 1").unwrap(), None);
}

#[test]
fn test_presets_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn RecordStore> = Arc::new(FileStore::new(dir.path()));

    {
        let (machine, _sim) = Machine::simulated(fast_config()).unwrap();
        let machine = machine.with_store(Arc::clone(&store)).unwrap();
        machine.motion().jog(Direction::Forward, 777, None).unwrap();
        machine.motion().save_preset("spot").unwrap();
    }

    let (machine, _sim) = Machine::simulated(fast_config()).unwrap();
    let machine = machine.with_store(store).unwrap();
    assert_eq!(machine.motion().preset("spot"), Some(777));
    assert_eq!(machine.motion().move_to_preset("spot").unwrap(), 777);
}
