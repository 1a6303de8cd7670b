//! Limit switch debouncing.

use std::time::{Duration, Instant};

/// Trusts a switch reading only once it has held for the whole window.
#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    stable: Option<bool>,
    candidate: Option<(bool, Instant)>,
}

impl Debouncer {
    /// Create a debouncer with no trusted reading yet.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            stable: None,
            candidate: None,
        }
    }

    /// Feed a raw reading taken at `now`. Returns the trusted state.
    pub fn update(&mut self, raw: bool, now: Instant) -> Option<bool> {
        let since = match self.candidate {
            Some((value, since)) if value == raw => since,
            _ => {
                self.candidate = Some((raw, now));
                now
            }
        };

        if now.saturating_duration_since(since) >= self.window {
            self.stable = Some(raw);
        }
        self.stable
    }

    /// Last trusted state.
    pub fn stable(&self) -> Option<bool> {
        self.stable
    }
}
