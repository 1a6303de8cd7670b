//! Cleaning head motion.
//!
//! Step timing ([`MotionProfile`], [`MotionExecutor`]), named positions
//! ([`PresetBook`]) and the [`MotionController`] that drives the stepper.

mod controller;
mod executor;
mod presets;
mod profile;

pub use controller::{MotionController, MotionState, MotionStatus};
pub use executor::MotionExecutor;
pub use presets::{PresetBook, PresetRecord};
pub use profile::{Direction, MotionPhase, MotionProfile};
