//! Background tasks on named std threads.
//!
//! A task owns a [`StopSignal`]; dropping or stopping its [`TaskHandle`]
//! raises the signal and joins the thread.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::error::{Error, Result};

/// Cooperative shutdown flag that sleeping tasks can wait on.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    /// Create a new, unraised signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal and wake every waiter.
    pub fn request(&self) {
        *self.stopped.lock() = true;
        self.wake.notify_all();
    }

    /// Whether the signal has been raised.
    pub fn is_requested(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleep for `timeout` or until the signal is raised.
    ///
    /// Returns `true` if the signal was raised.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            // Spurious wakeups only shorten one period
            let _ = self.wake.wait_for(&mut stopped, timeout);
        }
        *stopped
    }
}

/// Handle to a running background task.
#[derive(Debug)]
pub struct TaskHandle {
    name: String,
    signal: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl TaskHandle {
    /// Task name (also the thread name).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the thread is still running.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Signal the task without waiting for it.
    pub fn request_stop(&self) {
        self.signal.request();
    }

    /// Wait for the task to finish on its own, without signalling it.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!(task = %self.name, "background task panicked");
            }
        }
    }

    /// Signal the task and wait for the thread to exit.
    pub fn stop(&mut self) {
        self.signal.request();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                // Stopping from inside the task; it exits on its own
                return;
            }
            if handle.join().is_err() {
                error!(task = %self.name, "background task panicked");
            } else {
                debug!(task = %self.name, "background task stopped");
            }
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn a task running `body` until it returns.
///
/// # Errors
///
/// Returns [`Error::Unknown`] if the OS refuses to create the thread.
pub fn spawn_task<F>(name: &str, body: F) -> Result<TaskHandle>
where
    F: FnOnce(Arc<StopSignal>) + Send + 'static,
{
    let signal = Arc::new(StopSignal::new());
    let task_signal = Arc::clone(&signal);

    let handle = thread::Builder::new()
        .name(name.into())
        .spawn(move || body(task_signal))
        .map_err(|e| Error::Unknown(format!("cannot spawn {name}: {e}")))?;

    debug!(task = name, "background task started");
    Ok(TaskHandle {
        name: name.into(),
        signal,
        handle: Some(handle),
    })
}

/// Spawn a task calling `tick` repeatedly until stopped.
///
/// `tick` returns how long to sleep before the next call, so the period can
/// follow live configuration changes.
pub fn spawn_periodic<F>(name: &str, mut tick: F) -> Result<TaskHandle>
where
    F: FnMut() -> Duration + Send + 'static,
{
    spawn_task(name, move |signal| {
        while !signal.is_requested() {
            let period = tick();
            if signal.wait_timeout(period) {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    #[test]
    fn test_periodic_runs_until_stopped() {
        let count = Arc::new(AtomicU32::new(0));
        let task_count = Arc::clone(&count);

        let mut task = spawn_periodic("test-periodic", move || {
            task_count.fetch_add(1, Ordering::SeqCst);
            Duration::from_millis(5)
        })
        .unwrap();

        thread::sleep(Duration::from_millis(60));
        task.stop();
        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 2, "ticked {seen} times");
        assert!(!task.is_running());

        thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn test_stop_interrupts_long_sleep() {
        let mut task = spawn_periodic("test-sleepy", || Duration::from_secs(60)).unwrap();

        let started = Instant::now();
        task.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_signal_wait() {
        let signal = StopSignal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(1)));
        signal.request();
        assert!(signal.wait_timeout(Duration::from_secs(60)));
    }
}
