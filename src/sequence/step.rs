//! Typed sequence steps.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::config::TravelLimits;
use crate::motion::Direction;
use crate::safety::Actuator;

/// One operation on one controller.
///
/// In TOML the variant is the `action` key:
///
/// ```toml
/// [[steps]]
/// action = "jog"
/// direction = "forward"
/// steps = 200
/// post_delay_ms = 500
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StepAction {
    /// Relative head move.
    Jog {
        /// Direction of travel
        direction: Direction,
        /// Distance in steps
        steps: i64,
    },
    /// Head move by the index distance.
    Index {
        /// Direction of travel
        direction: Direction,
    },
    /// Head move to an absolute position.
    MoveAbsolute {
        /// Target position in steps
        target: i64,
    },
    /// Head move to a saved preset.
    MoveToPreset {
        /// Preset name
        name: String,
    },
    /// Find the home reference.
    Home,
    /// Move the trigger to Fire and hold.
    FireStart,
    /// Return the trigger to Normal.
    FireStop,
    /// Run the fiber pattern.
    FireFiber {
        /// Number of B, A cycles
        cycles: u32,
    },
    /// Table leg to the front switch.
    TableForward,
    /// Table leg to the back switch.
    TableBackward,
    /// Start the table auto-cycle in the background.
    StartAutoCycle {
        /// Dwell at each switch; the configured dwell when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dwell_ms: Option<u64>,
    },
    /// Stop the table auto-cycle.
    StopAutoCycle,
    /// Switch the fan.
    Fan {
        /// Desired state
        on: bool,
    },
    /// Switch the red lights.
    Lights {
        /// Desired state
        on: bool,
    },
    /// Pause the sequence.
    Wait {
        /// Duration in milliseconds
        duration_ms: u64,
    },
    /// Block until an operator input asserts.
    WaitInput {
        /// Input name
        input: String,
        /// Give up after this long; wait indefinitely when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
}

impl StepAction {
    /// The `action` tag of this step.
    pub fn name(&self) -> &'static str {
        match self {
            StepAction::Jog { .. } => "jog",
            StepAction::Index { .. } => "index",
            StepAction::MoveAbsolute { .. } => "move_absolute",
            StepAction::MoveToPreset { .. } => "move_to_preset",
            StepAction::Home => "home",
            StepAction::FireStart => "fire_start",
            StepAction::FireStop => "fire_stop",
            StepAction::FireFiber { .. } => "fire_fiber",
            StepAction::TableForward => "table_forward",
            StepAction::TableBackward => "table_backward",
            StepAction::StartAutoCycle { .. } => "start_auto_cycle",
            StepAction::StopAutoCycle => "stop_auto_cycle",
            StepAction::Fan { .. } => "fan",
            StepAction::Lights { .. } => "lights",
            StepAction::Wait { .. } => "wait",
            StepAction::WaitInput { .. } => "wait_input",
        }
    }

    /// Controller that owns this step, `None` for the waits.
    pub fn actuator(&self) -> Option<Actuator> {
        match self {
            StepAction::Jog { .. }
            | StepAction::Index { .. }
            | StepAction::MoveAbsolute { .. }
            | StepAction::MoveToPreset { .. }
            | StepAction::Home => Some(Actuator::Motion),
            StepAction::FireStart | StepAction::FireStop | StepAction::FireFiber { .. } => {
                Some(Actuator::Trigger)
            }
            StepAction::TableForward
            | StepAction::TableBackward
            | StepAction::StartAutoCycle { .. }
            | StepAction::StopAutoCycle => Some(Actuator::Table),
            StepAction::Fan { .. } | StepAction::Lights { .. } => Some(Actuator::Outputs),
            StepAction::Wait { .. } | StepAction::WaitInput { .. } => None,
        }
    }

    /// Check parameters that can be judged before the run starts.
    pub fn validate(&self, context: &ValidationContext) -> Result<(), String> {
        match self {
            StepAction::Jog { steps, .. } => {
                if *steps <= 0 {
                    return Err(format!("jog steps must be positive (got {steps})"));
                }
                if let Some(max) = context.limits.max_steps {
                    if *steps > max {
                        return Err(format!("jog of {steps} steps exceeds travel range {max}"));
                    }
                }
            }
            StepAction::MoveAbsolute { target } => {
                if !context.limits.contains(*target) {
                    return Err(format!("target {target} outside travel range"));
                }
            }
            StepAction::MoveToPreset { name } => {
                if !context.presets.contains(name) {
                    return Err(format!("unknown preset '{name}'"));
                }
            }
            StepAction::FireFiber { cycles: 0 } => {
                return Err("fiber cycles must be positive".into());
            }
            StepAction::WaitInput { input, timeout_ms } => {
                if !context.inputs.contains(input) {
                    return Err(format!("unknown input '{input}'"));
                }
                if *timeout_ms == Some(0) {
                    return Err("input timeout must be positive".into());
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// What the runner does when a step fails.
///
/// Written as an inline table: `on_error = { policy = "skip" }` or
/// `on_error = { policy = "retry", attempts = 2, delay_ms = 100 }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// End the run as failed.
    #[default]
    Fail,
    /// Record the failure and continue with the next step.
    Skip,
    /// Try again up to `attempts` more times, `delay_ms` apart, then fail.
    Retry {
        /// Extra attempts after the first
        attempts: u32,
        /// Pause between attempts
        delay_ms: u64,
    },
}

impl ErrorPolicy {
    fn is_fail(&self) -> bool {
        matches!(self, ErrorPolicy::Fail)
    }
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

/// A step with its post-delay and error policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Operation to run.
    #[serde(flatten)]
    pub action: StepAction,

    /// Pause after the step completes, in milliseconds.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub post_delay_ms: u64,

    /// Failure handling.
    #[serde(default, skip_serializing_if = "ErrorPolicy::is_fail")]
    pub on_error: ErrorPolicy,
}

impl Step {
    /// Step with no post-delay that fails the run on error.
    pub fn new(action: StepAction) -> Self {
        Self {
            action,
            post_delay_ms: 0,
            on_error: ErrorPolicy::Fail,
        }
    }

    /// Set the post-delay.
    pub fn with_post_delay(mut self, millis: u64) -> Self {
        self.post_delay_ms = millis;
        self
    }

    /// Set the error policy.
    pub fn with_policy(mut self, policy: ErrorPolicy) -> Self {
        self.on_error = policy;
        self
    }
}

impl From<StepAction> for Step {
    fn from(action: StepAction) -> Self {
        Step::new(action)
    }
}

/// Machine facts steps are checked against before a run.
#[derive(Debug, Clone, Default)]
pub struct ValidationContext {
    /// Head travel range.
    pub limits: TravelLimits,
    /// Names of saved presets.
    pub presets: BTreeSet<String>,
    /// Names of the operator inputs.
    pub inputs: BTreeSet<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_ranges() {
        let context = ValidationContext {
            limits: TravelLimits::new(Some(1000)),
            presets: ["Position 1".to_string()].into_iter().collect(),
            inputs: ["button_in".to_string()].into_iter().collect(),
        };

        assert!(StepAction::MoveAbsolute { target: 1000 }.validate(&context).is_ok());
        assert!(StepAction::MoveAbsolute { target: 1001 }.validate(&context).is_err());
        assert!(StepAction::MoveToPreset { name: "nope".into() }.validate(&context).is_err());
        assert!(StepAction::FireFiber { cycles: 0 }.validate(&context).is_err());
        assert!(StepAction::WaitInput {
            input: "button_in".into(),
            timeout_ms: None
        }
        .validate(&context)
        .is_ok());
        assert!(StepAction::WaitInput {
            input: "pedal".into(),
            timeout_ms: Some(100)
        }
        .validate(&context)
        .is_err());
        assert!(StepAction::Jog {
            direction: Direction::Forward,
            steps: -3
        }
        .validate(&context)
        .is_err());
    }

    #[test]
    fn test_owners() {
        assert_eq!(StepAction::Home.actuator(), Some(Actuator::Motion));
        assert_eq!(StepAction::Wait { duration_ms: 5 }.actuator(), None);
        assert_eq!(StepAction::StopAutoCycle.name(), "stop_auto_cycle");
    }
}
