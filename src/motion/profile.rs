//! Speed profiles for head moves.
//!
//! A move ramps up at the acceleration rate, holds the configured speed and
//! ramps down at the deceleration rate. The two rates are independent, so a
//! heavy head can start briskly and stop gently. Moves too short to reach
//! full speed become a triangle split in proportion to the rates.

use libm::sqrtf;
use serde::{Deserialize, Serialize};

use crate::config::ProfileConfig;

const NANOS_PER_SEC: f32 = 1_000_000_000.0;

/// Direction of head travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Away from home (positive step count).
    Forward,
    /// Toward home (negative step count).
    Backward,
}

impl Direction {
    /// Direction of a signed step delta; zero counts as forward.
    #[inline]
    pub fn of(delta: i64) -> Self {
        if delta < 0 {
            Direction::Backward
        } else {
            Direction::Forward
        }
    }

    /// `+1` or `-1`.
    #[inline]
    pub fn sign(self) -> i64 {
        match self {
            Direction::Forward => 1,
            Direction::Backward => -1,
        }
    }

    /// The opposite direction.
    #[inline]
    pub fn reversed(self) -> Self {
        match self {
            Direction::Forward => Direction::Backward,
            Direction::Backward => Direction::Forward,
        }
    }
}

impl core::fmt::Display for Direction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Direction::Forward => "forward",
            Direction::Backward => "backward",
        })
    }
}

/// Where in its profile a move is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionPhase {
    /// Ramping up.
    Accelerating,
    /// At full speed.
    Cruising,
    /// Ramping down.
    Decelerating,
    /// Every step issued.
    Complete,
}

/// Step plan for one move.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionProfile {
    /// Steps in the move.
    pub steps: u32,
    /// Direction of travel.
    pub direction: Direction,
    /// Steps spent ramping up.
    pub ramp_up: u32,
    /// Steps at full speed.
    pub cruise: u32,
    /// Steps spent ramping down.
    pub ramp_down: u32,
    /// Longest interval allowed, used for the first step from rest.
    pub first_interval_ns: u32,
    /// Interval at full speed.
    pub cruise_interval_ns: u32,
    accel: f32,
    decel: f32,
}

impl MotionProfile {
    /// Plan a move of `delta` signed steps.
    ///
    /// A zero delta or any non-positive rate gives an empty plan. Deltas
    /// beyond `u32::MAX` steps are clamped to it.
    pub fn plan(delta: i64, speed: f32, accel: f32, decel: f32) -> Self {
        let steps = u32::try_from(delta.unsigned_abs()).unwrap_or(u32::MAX);
        if steps == 0 || !(speed > 0.0 && accel > 0.0 && decel > 0.0) {
            return Self::empty();
        }

        // Ramp length from v² = 2·a·d
        let up_len = speed * speed / (2.0 * accel);
        let down_len = speed * speed / (2.0 * decel);

        let (ramp_up, cruise, ramp_down) = if up_len + down_len < steps as f32 {
            let up = up_len as u32;
            let down = down_len as u32;
            (up, steps.saturating_sub(up + down), down)
        } else {
            // The faster ramp covers the shorter distance
            let up = (steps as f32 * decel / (accel + decel)) as u32;
            (up, 0, steps - up)
        };

        let first_speed = sqrtf(2.0 * accel).min(speed);

        Self {
            steps,
            direction: Direction::of(delta),
            ramp_up,
            cruise,
            ramp_down,
            first_interval_ns: (NANOS_PER_SEC / first_speed) as u32,
            cruise_interval_ns: (NANOS_PER_SEC / speed) as u32,
            accel,
            decel,
        }
    }

    /// Plan with equal ramp rates.
    pub fn symmetric(delta: i64, speed: f32, accel: f32) -> Self {
        Self::plan(delta, speed, accel, accel)
    }

    /// Plan a move of `delta` steps with a configured profile.
    pub fn from_config(delta: i64, config: &ProfileConfig) -> Self {
        Self::plan(
            delta,
            config.speed.0,
            config.acceleration.0,
            config.effective_deceleration().0,
        )
    }

    /// A plan with no steps.
    pub fn empty() -> Self {
        Self {
            steps: 0,
            direction: Direction::Forward,
            ramp_up: 0,
            cruise: 0,
            ramp_down: 0,
            first_interval_ns: u32::MAX,
            cruise_interval_ns: u32::MAX,
            accel: 0.0,
            decel: 0.0,
        }
    }

    /// Whether the plan moves at all.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.steps == 0
    }

    /// Phase of step number `step` (0-based).
    pub fn phase_at(&self, step: u32) -> MotionPhase {
        match step {
            s if s >= self.steps => MotionPhase::Complete,
            s if s < self.ramp_up => MotionPhase::Accelerating,
            s if s < self.ramp_up + self.cruise => MotionPhase::Cruising,
            _ => MotionPhase::Decelerating,
        }
    }

    fn top_speed(&self) -> f32 {
        let full = NANOS_PER_SEC / self.cruise_interval_ns as f32;
        if self.cruise > 0 {
            full
        } else {
            sqrtf(2.0 * self.accel * self.ramp_up.max(1) as f32).min(full)
        }
    }

    /// Hold time of step number `step`, in nanoseconds.
    ///
    /// On the ramps speed is `sqrt(2·a·n)` for the `n` steps from rest, so
    /// intervals shrink toward cruise and grow again toward the end.
    /// `u32::MAX` once the plan is complete.
    pub fn interval_at(&self, step: u32) -> u32 {
        let speed = match self.phase_at(step) {
            MotionPhase::Complete => return u32::MAX,
            MotionPhase::Cruising => return self.cruise_interval_ns,
            MotionPhase::Accelerating => sqrtf(2.0 * self.accel * (step + 1) as f32),
            MotionPhase::Decelerating => sqrtf(2.0 * self.decel * (self.steps - step) as f32),
        };

        let speed = speed.min(self.top_speed()).max(f32::MIN_POSITIVE);
        let floor = self.cruise_interval_ns;
        ((NANOS_PER_SEC / speed) as u32).clamp(floor, self.first_interval_ns.max(floor))
    }

    /// Approximate duration of the whole move, in seconds.
    pub fn duration_secs(&self) -> f32 {
        if self.is_empty() {
            return 0.0;
        }
        let top = self.top_speed();
        top / self.accel + self.cruise as f32 / top + top / self.decel
    }
}
