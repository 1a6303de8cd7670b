//! # laserclean-core
//!
//! Motion and sequencing control core for a laser-cleaning machine.
//!
//! ## Features
//!
//! - **Cleaning head**: stepper jog, index, absolute moves, homing and
//!   presets with asymmetric trapezoidal profiles
//! - **Trigger**: servo Normal/Fire with a fiber-fire pattern
//! - **Table**: reciprocating carriage between debounced end switches, with
//!   a background auto-cycle
//! - **Safety interlock**: temperature and hard-limit monitoring that
//!   preempts every actuator
//! - **Sequences**: typed TOML step lists with pause, resume, abort and
//!   per-step error policies
//! - **embedded-hal 1.0**: drivers over `OutputPin`, `InputPin`,
//!   `SetDutyCycle` and `DelayNs`, plus simulated drivers for tests
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use laserclean_core::{parse_config, Machine, Sequence};
//!
//! let config = parse_config(include_str!("machine.toml"))?;
//! let (machine, _sim) = Machine::simulated(config)?;
//! machine.start_background()?;
//!
//! machine.motion().home()?;
//! machine.start_sequence(Sequence::from_toml(include_str!("pass.toml"))?)?;
//! let status = machine.runner().wait();
//! ```
//!
//! The library logs through `tracing` and never installs a subscriber.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]

pub mod config;
pub mod drivers;
pub mod error;
pub mod inputs;
pub mod machine;
pub mod motion;
pub mod outputs;
pub mod safety;
pub mod scheduler;
pub mod sequence;
pub mod store;
mod sync;
pub mod table;
pub mod trigger;

pub use config::{load_config, parse_config, validate_config, ControlConfig};
pub use error::{ConfigError, DriverError, Error, Result, StoreError};
pub use machine::{Machine, MachineDrivers, ReloadOutcome};
pub use motion::{Direction, MotionController, MotionProfile, MotionState};
pub use outputs::OutputController;
pub use safety::{Actuator, SafetyMonitor, SafetyState, TripReason};
pub use sequence::{RunStatus, Sequence, SequenceRunner, SequenceStatus, Step, StepAction};
pub use store::{FileStore, MemoryStore, RecordStore};
pub use table::{TableController, TableLeg, TableState};
pub use trigger::{TriggerController, TriggerState};

// Unit types
pub use config::units::{Degrees, StepsPerSec, StepsPerSecSquared};
