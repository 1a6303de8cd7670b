//! Walks a [`MotionProfile`] one step at a time.

use super::profile::{Direction, MotionPhase, MotionProfile};

/// Cursor over a planned move.
///
/// The controller asks for the next interval, pulses the driver, then calls
/// [`advance`](Self::advance). [`position`](Self::position) is therefore
/// always the position after the pulses actually issued, which is what a
/// stopped or failed move reports.
#[derive(Debug, Clone)]
pub struct MotionExecutor {
    profile: MotionProfile,
    origin: i64,
    issued: u32,
}

impl MotionExecutor {
    /// Start walking `profile` from `origin`.
    pub fn new(profile: MotionProfile, origin: i64) -> Self {
        Self {
            profile,
            origin,
            issued: 0,
        }
    }

    /// Whether every step has been issued.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.issued >= self.profile.steps
    }

    /// Steps issued so far.
    #[inline]
    pub fn steps_done(&self) -> u32 {
        self.issued
    }

    /// Phase of the pending step.
    pub fn phase(&self) -> MotionPhase {
        self.profile.phase_at(self.issued)
    }

    /// Direction of travel.
    #[inline]
    pub fn direction(&self) -> Direction {
        self.profile.direction
    }

    /// Position after the steps issued so far.
    #[inline]
    pub fn position(&self) -> i64 {
        self.origin + self.profile.direction.sign() * i64::from(self.issued)
    }

    /// Position once the move completes.
    pub fn target(&self) -> i64 {
        self.origin + self.profile.direction.sign() * i64::from(self.profile.steps)
    }

    /// Hold time for the pending step, `None` when done.
    #[inline]
    pub fn next_interval_ns(&self) -> Option<u32> {
        (!self.is_complete()).then(|| self.profile.interval_at(self.issued))
    }

    /// Count the pending step as issued. Returns whether steps remain.
    pub fn advance(&mut self) -> bool {
        if !self.is_complete() {
            self.issued += 1;
        }
        !self.is_complete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_walks_to_target() {
        let mut executor = MotionExecutor::new(MotionProfile::symmetric(10, 1000.0, 2000.0), 100);
        assert_eq!(executor.target(), 110);

        let mut pulses = 0;
        while executor.next_interval_ns().is_some() {
            pulses += 1;
            executor.advance();
        }

        assert_eq!(pulses, 10);
        assert_eq!(executor.position(), 110);
        assert!(!executor.advance());
    }

    #[test]
    fn test_partial_backward_move() {
        let mut executor = MotionExecutor::new(MotionProfile::symmetric(-4, 1000.0, 2000.0), 10);

        executor.advance();
        executor.advance();

        assert_eq!(executor.position(), 8);
        assert_eq!(executor.steps_done(), 2);
        assert_eq!(executor.direction(), Direction::Backward);
    }

    #[test]
    fn test_empty_plan() {
        let executor = MotionExecutor::new(MotionProfile::empty(), 5);

        assert!(executor.is_complete());
        assert_eq!(executor.next_interval_ns(), None);
        assert_eq!(executor.position(), 5);
        assert_eq!(executor.phase(), MotionPhase::Complete);
    }

    #[test]
    fn test_phases_in_order() {
        let mut executor = MotionExecutor::new(MotionProfile::symmetric(1000, 1000.0, 2000.0), 0);
        let mut seen = Vec::new();

        while !executor.is_complete() {
            let phase = executor.phase();
            if seen.last() != Some(&phase) {
                seen.push(phase);
            }
            executor.advance();
        }

        assert_eq!(
            seen,
            [MotionPhase::Accelerating, MotionPhase::Cruising, MotionPhase::Decelerating]
        );
    }
}
