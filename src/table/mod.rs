//! Reciprocating table.
//!
//! The carriage runs between a front and a back end switch, driven by one
//! relay per direction. Manual legs run on the caller's thread; auto-cycle
//! runs on its own background task.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;

mod controller;
mod debounce;

pub use controller::{TableController, TableDrivers, TableStatus};
pub use debounce::Debouncer;

/// Direction of one table leg, named after the switch that ends it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableLeg {
    /// Toward the front switch.
    Forward,
    /// Toward the back switch.
    Backward,
}

impl TableLeg {
    /// The other leg.
    #[inline]
    pub fn reversed(self) -> Self {
        match self {
            TableLeg::Forward => TableLeg::Backward,
            TableLeg::Backward => TableLeg::Forward,
        }
    }
}

impl fmt::Display for TableLeg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TableLeg::Forward => "front",
            TableLeg::Backward => "back",
        })
    }
}

/// Table state.
#[derive(Debug, Clone, PartialEq)]
pub enum TableState {
    /// Not moving.
    Idle,
    /// Manual leg toward the front switch.
    MovingForward,
    /// Manual leg toward the back switch.
    MovingBackward,
    /// Auto-cycle running.
    AutoCycling {
        /// Current or last leg.
        leg: TableLeg,
        /// Waiting at the switch before the next leg.
        dwelling: bool,
    },
    /// Halted by a fault; cleared by the next successful command.
    Stopped(Error),
}

impl TableState {
    /// Whether a relay may be energized.
    pub fn is_moving(&self) -> bool {
        matches!(
            self,
            TableState::MovingForward | TableState::MovingBackward | TableState::AutoCycling { .. }
        )
    }
}
