//! Travel range of the cleaning head.

use crate::error::{Error, Result};

/// Travel range in steps: `[0, max_steps]`, unbounded above when no maximum
/// is configured. The head never goes below home.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TravelLimits {
    /// Maximum position in steps, if configured.
    pub max_steps: Option<i64>,
}

impl TravelLimits {
    /// Create travel limits.
    pub const fn new(max_steps: Option<i64>) -> Self {
        Self { max_steps }
    }

    /// Check if a position is within limits.
    pub fn contains(&self, steps: i64) -> bool {
        steps >= 0 && self.max_steps.map_or(true, |max| steps <= max)
    }

    /// Reject a target outside the travel range.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] naming `what`.
    pub fn check(&self, what: &'static str, steps: i64) -> Result<i64> {
        if self.contains(steps) {
            Ok(steps)
        } else {
            Err(Error::out_of_range(what, steps, 0, self.max_steps))
        }
    }
}
