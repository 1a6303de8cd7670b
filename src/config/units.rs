//! Newtypes for angles and stepper rates.
//!
//! Keeps servo angles and stepper rates apart at compile
//! time so an acceleration can never be passed where a speed is expected.

use core::ops::{Mul, Neg};

use serde::{Deserialize, Serialize};

/// Servo angle in degrees.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Degrees(pub f32);

impl Degrees {
    /// Lowest angle a servo can be commanded to.
    pub const MIN: Self = Self(-90.0);
    /// Highest angle a servo can be commanded to.
    pub const MAX: Self = Self(90.0);

    /// Wrap an angle.
    #[inline]
    pub const fn new(value: f32) -> Self {
        Self(value)
    }

    /// Inner `f32`.
    #[inline]
    pub const fn value(self) -> f32 {
        self.0
    }

    /// Whether the angle lies within the servo range.
    #[inline]
    pub fn in_servo_range(self) -> bool {
        self.0 >= Self::MIN.0 && self.0 <= Self::MAX.0
    }
}

impl Neg for Degrees {
    type Output = Self;

    fn neg(self) -> Self::Output {
        Self(-self.0)
    }
}

/// Stepper velocity in steps per second.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepsPerSec(pub f32);

impl StepsPerSec {
    /// Wrap a rate.
    #[inline]
    pub const fn new(value: f32) -> Self {
        Self(value)
    }

    /// Inner `f32`.
    #[inline]
    pub const fn value(self) -> f32 {
        self.0
    }

    /// Interval between step pulses at this velocity.
    #[inline]
    pub fn step_interval_ns(self) -> u32 {
        if self.0 <= 0.0 {
            u32::MAX
        } else {
            (1_000_000_000.0 / self.0) as u32
        }
    }
}

impl Mul<f32> for StepsPerSec {
    type Output = Self;

    fn mul(self, rhs: f32) -> Self::Output {
        Self(self.0 * rhs)
    }
}

/// Stepper acceleration in steps per second squared.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepsPerSecSquared(pub f32);

impl StepsPerSecSquared {
    /// Wrap a rate.
    #[inline]
    pub const fn new(value: f32) -> Self {
        Self(value)
    }

    /// Inner `f32`.
    #[inline]
    pub const fn value(self) -> f32 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_servo_range() {
        assert!(Degrees(-90.0).in_servo_range());
        assert!(Degrees(90.0).in_servo_range());
        assert!(!Degrees(90.5).in_servo_range());
        assert!(!(-Degrees(91.0)).in_servo_range());
    }

    #[test]
    fn test_step_interval() {
        assert_eq!(StepsPerSec::new(1000.0).step_interval_ns(), 1_000_000);
        assert_eq!(StepsPerSec(0.0).step_interval_ns(), u32::MAX);
        assert_eq!((StepsPerSec(500.0) * 0.5).step_interval_ns(), 4_000_000);
    }
}
