//! Operator inputs: push buttons and pedals a sequence can wait on.

use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::drivers::LimitSwitch;
use crate::error::{Error, Result};
use crate::sync::WAIT_SLICE;
use crate::table::Debouncer;

/// Named operator inputs.
pub struct InputBank {
    inputs: BTreeMap<String, Mutex<Box<dyn LimitSwitch>>>,
    debounce: Duration,
}

impl core::fmt::Debug for InputBank {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InputBank")
            .field("inputs", &self.inputs.keys().collect::<Vec<_>>())
            .field("debounce", &self.debounce)
            .finish()
    }
}

impl InputBank {
    /// Bank over `inputs`; a reading must hold for `debounce` to count.
    pub fn new(inputs: Vec<(String, Box<dyn LimitSwitch>)>, debounce: Duration) -> Self {
        Self {
            inputs: inputs
                .into_iter()
                .map(|(name, input)| (name, Mutex::new(input)))
                .collect(),
            debounce,
        }
    }

    /// Names of the fitted inputs, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.inputs.keys().map(String::as_str)
    }

    /// Raw state of one input.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for an unknown name, [`Error::Driver`] when
    /// the read fails.
    pub fn is_active(&self, name: &str) -> Result<bool> {
        let input = self
            .inputs
            .get(name)
            .ok_or(Error::InvalidArgument("unknown operator input"))?;
        let active = input.lock().is_active()?;
        Ok(active)
    }

    /// Block until `name` asserts.
    ///
    /// Returns `Ok(false)` when `interrupted` cut the wait short.
    ///
    /// # Errors
    ///
    /// [`Error::InputTimeout`] once `timeout` passes, or whatever
    /// [`is_active`](Self::is_active) reports.
    pub fn wait_for(
        &self,
        name: &str,
        timeout: Option<Duration>,
        interrupted: impl Fn() -> bool,
    ) -> Result<bool> {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(self.debounce);
        debug!(input = name, ?timeout, "waiting for operator input");

        loop {
            if interrupted() {
                return Ok(false);
            }

            let now = Instant::now();
            if debouncer.update(self.is_active(name)?, now) == Some(true) {
                info!(input = name, waited = ?start.elapsed(), "operator input received");
                return Ok(true);
            }

            if let Some(limit) = timeout {
                if now.duration_since(start) >= limit {
                    return Err(Error::InputTimeout {
                        input: name.to_owned(),
                        timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    });
                }
            }
            thread::sleep(WAIT_SLICE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::sim::SimLimitSwitch;

    fn bank(button: &SimLimitSwitch) -> InputBank {
        InputBank::new(
            vec![("button_in".into(), Box::new(button.clone()) as Box<dyn LimitSwitch>)],
            Duration::from_millis(5),
        )
    }

    #[test]
    fn test_asserted_input_returns() {
        let button = SimLimitSwitch::new(true);
        let inputs = bank(&button);

        assert_eq!(inputs.wait_for("button_in", Some(Duration::from_secs(1)), || false), Ok(true));
        assert_eq!(inputs.names().collect::<Vec<_>>(), ["button_in"]);
    }

    #[test]
    fn test_timeout_and_interrupt() {
        let button = SimLimitSwitch::new(false);
        let inputs = bank(&button);

        assert_eq!(
            inputs.wait_for("button_in", Some(Duration::from_millis(20)), || false),
            Err(Error::InputTimeout {
                input: "button_in".into(),
                timeout_ms: 20,
            })
        );
        assert_eq!(inputs.wait_for("button_in", None, || true), Ok(false));
        assert!(matches!(
            inputs.is_active("pedal"),
            Err(Error::InvalidArgument(_))
        ));
    }
}
