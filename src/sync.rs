//! Per-actuator exclusion, stop requests and interruptible waits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::safety::Actuator;

/// Longest uninterrupted sleep inside an interruptible wait.
pub(crate) const WAIT_SLICE: Duration = Duration::from_millis(5);

/// Marks an actuator busy for as long as it lives.
///
/// A second caller gets [`Error::Busy`] instead of queuing behind the first.
#[derive(Debug)]
pub(crate) struct BusyGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> BusyGuard<'a> {
    /// Claim the actuator.
    pub(crate) fn acquire(flag: &'a AtomicBool, actuator: Actuator) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::Busy(actuator))?;
        Ok(Self { flag })
    }

    /// Take over a claim made by [`keep`](Self::keep) on another thread.
    pub(crate) fn adopt(flag: &'a AtomicBool) -> Self {
        Self { flag }
    }

    /// Leave the actuator claimed after this guard is gone. Whoever
    /// continues the operation must [`adopt`](Self::adopt) it.
    pub(crate) fn keep(self) {
        core::mem::forget(self);
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Stop request for the command an actuator is running.
///
/// A command calls [`begin`](Self::begin) when it starts, which forgets a
/// request left over from an earlier command. A caller that has
/// [`arm`](Self::arm)ed the flag hands it to the next command as is, so a
/// stop landing between the arm and the start still halts that command.
#[derive(Debug, Default)]
pub(crate) struct StopFlag {
    requested: AtomicBool,
    armed: AtomicBool,
}

impl StopFlag {
    pub(crate) fn request(&self) {
        self.requested.store(true, Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Clear the request now and keep the next [`begin`](Self::begin) from
    /// clearing it again.
    pub(crate) fn arm(&self) {
        self.requested.store(false, Ordering::Release);
        self.armed.store(true, Ordering::Release);
    }

    /// Drop an arm that no command consumed.
    pub(crate) fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }

    pub(crate) fn begin(&self) {
        if !self.armed.swap(false, Ordering::AcqRel) {
            self.requested.store(false, Ordering::Release);
        }
    }
}

/// Sleep for `duration`, checking `interrupted` every [`WAIT_SLICE`].
///
/// Returns `false` if the wait was cut short.
pub(crate) fn sleep_unless(duration: Duration, interrupted: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if interrupted() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(WAIT_SLICE));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_flag_arming() {
        let flag = StopFlag::default();

        flag.request();
        flag.begin();
        assert!(!flag.is_requested());

        flag.arm();
        flag.request();
        flag.begin();
        assert!(flag.is_requested());

        // The arm is spent
        flag.begin();
        assert!(!flag.is_requested());

        flag.arm();
        flag.disarm();
        flag.request();
        flag.begin();
        assert!(!flag.is_requested());
    }

    #[test]
    fn test_second_claim_is_busy() {
        let flag = AtomicBool::new(false);

        let guard = BusyGuard::acquire(&flag, Actuator::Table).unwrap();
        assert_eq!(
            BusyGuard::acquire(&flag, Actuator::Table).unwrap_err(),
            Error::Busy(Actuator::Table)
        );
        drop(guard);
        assert!(BusyGuard::acquire(&flag, Actuator::Table).is_ok());
    }

    #[test]
    fn test_sleep_interrupted() {
        let started = Instant::now();
        assert!(!sleep_unless(Duration::from_secs(10), || started.elapsed() > Duration::from_millis(10)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(sleep_unless(Duration::from_millis(2), || false));
    }
}
