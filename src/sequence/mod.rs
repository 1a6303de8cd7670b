//! Scripted multi-step sequences.
//!
//! A [`Sequence`] is an ordered list of typed [`Step`]s, loadable from TOML.
//! The [`SequenceRunner`] executes one at a time through the controllers'
//! public operations.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

mod runner;
mod step;

pub use runner::{
    Actuators, RunStatus, SequenceRunner, SequenceStatus, StepOutcome, StepRecord,
};
pub use step::{ErrorPolicy, Step, StepAction, ValidationContext};

/// Named list of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    /// Sequence name, also its store key.
    pub name: String,

    /// Free-form description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Steps in execution order.
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Sequence {
    /// Create an empty sequence.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            steps: Vec::new(),
        }
    }

    /// Append a step.
    pub fn with_step(mut self, step: impl Into<Step>) -> Self {
        self.steps.push(step.into());
        self
    }

    /// Parse a sequence from TOML.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSequence`] for malformed TOML or an unknown
    /// action.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::InvalidSequence(e.message().into()))
    }

    /// Render the sequence as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| Error::InvalidSequence(e.to_string()))
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether there are no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Check every step before anything runs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSequence`] naming the first offending step.
    pub fn validate(&self, context: &ValidationContext) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidSequence("sequence name is empty".into()));
        }
        if self.steps.is_empty() {
            return Err(Error::InvalidSequence(format!("sequence '{}' has no steps", self.name)));
        }

        for (index, step) in self.steps.iter().enumerate() {
            step.action.validate(context).map_err(|reason| {
                Error::InvalidSequence(format!("step {index} ({}): {reason}", step.action.name()))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TravelLimits;
    use crate::motion::Direction;

    const CLEANING_PASS: &str = r#"
name = "pass"
description = "one cleaning pass"

[[steps]]
action = "home"

[[steps]]
action = "jog"
direction = "forward"
steps = 200
post_delay_ms = 50

[[steps]]
action = "fire_fiber"
cycles = 3
on_error = { policy = "skip" }

[[steps]]
action = "table_forward"
on_error = { policy = "retry", attempts = 2, delay_ms = 10 }
"#;

    #[test]
    fn test_parse_steps() {
        let sequence = Sequence::from_toml(CLEANING_PASS).unwrap();

        assert_eq!(sequence.len(), 4);
        assert_eq!(sequence.steps[0].action, StepAction::Home);
        assert_eq!(
            sequence.steps[1].action,
            StepAction::Jog {
                direction: Direction::Forward,
                steps: 200
            }
        );
        assert_eq!(sequence.steps[1].post_delay_ms, 50);
        assert_eq!(sequence.steps[2].on_error, ErrorPolicy::Skip);
        assert_eq!(
            sequence.steps[3].on_error,
            ErrorPolicy::Retry {
                attempts: 2,
                delay_ms: 10
            }
        );
    }

    #[test]
    fn test_unknown_action_rejected() {
        let text = "name = \"bad\"\n[[steps]]\naction = \"teleport\"\n";
        assert!(matches!(Sequence::from_toml(text), Err(Error::InvalidSequence(_))));
    }

    #[test]
    fn test_toml_survives_save() {
        let sequence = Sequence::from_toml(CLEANING_PASS).unwrap();
        let text = sequence.to_toml().unwrap();
        assert_eq!(Sequence::from_toml(&text).unwrap(), sequence);
    }

    #[test]
    fn test_validate_reports_step() {
        let context = ValidationContext {
            limits: TravelLimits::new(Some(100)),
            ..ValidationContext::default()
        };
        let sequence = Sequence::new("oob")
            .with_step(StepAction::Home)
            .with_step(StepAction::MoveAbsolute { target: 500 });

        let err = sequence.validate(&context).unwrap_err();
        assert_eq!(
            err,
            Error::InvalidSequence("step 1 (move_absolute): target 500 outside travel range".into())
        );
        assert!(Sequence::new("empty").validate(&context).is_err());
    }
}
