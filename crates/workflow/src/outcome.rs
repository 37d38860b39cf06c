//! Step outcomes and state patches.

use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

use crate::error::StepError;

/// Append-only set of state changes produced by a step.
///
/// Entries are applied in order with add-or-replace semantics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch {
    entries: Vec<(String, Value)>,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.entries.push((key.into(), value));
        self
    }

    /// Serialize `value` and add it under `key`.
    pub fn insert<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<(), StepError> {
        self.entries.push((key.into(), serde_json::to_value(value)?));
        Ok(())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn into_entries(self) -> Vec<(String, Value)> {
        self.entries
    }
}

/// A failure reported by a step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepFailure {
    pub message: String,
    pub code: Option<String>,
}

impl StepFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl From<&StepError> for StepFailure {
    fn from(err: &StepError) -> Self {
        StepFailure::new(err.to_string()).with_code(err.code())
    }
}

/// What a step wants to happen next.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Merge the patch into state and move to the next step.
    Advance(StatePatch),

    /// Run this step again after `delay`. `args` replaces the current
    /// descriptor's args when given.
    Retry {
        delay: Duration,
        args: Option<Value>,
    },

    /// Abandon the forward path.
    Fail(StepFailure),
}

impl Outcome {
    pub fn advance() -> Self {
        Self::Advance(StatePatch::new())
    }

    pub fn advance_with(patch: StatePatch) -> Self {
        Self::Advance(patch)
    }

    pub fn retry(delay: Duration) -> Self {
        Self::Retry { delay, args: None }
    }

    pub fn retry_with(delay: Duration, args: Value) -> Self {
        Self::Retry {
            delay,
            args: Some(args),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self::Fail(StepFailure::new(message))
    }

    pub fn fail_with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self::Fail(StepFailure::new(message).with_code(code))
    }

    /// Short label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Advance(_) => "advance",
            Self::Retry { .. } => "retry",
            Self::Fail(_) => "fail",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_patch_keys_in_order() {
        let mut patch = StatePatch::new().with("instance", json!({"resourceId": "i-1"}));
        patch.insert("reachability", &json!({"reachable": true})).unwrap();

        assert_eq!(patch.keys().collect::<Vec<_>>(), vec!["instance", "reachability"]);
        assert!(!patch.is_empty());
        assert!(StatePatch::new().is_empty());
    }

    #[test]
    fn test_failure_from_step_error() {
        let failure = StepFailure::from(&StepError::Collaborator("503".into()));
        assert_eq!(failure.message, "Collaborator error: 503");
        assert_eq!(failure.code.as_deref(), Some("collaborator"));
    }

    #[test]
    fn test_outcome_kind() {
        assert_eq!(Outcome::advance().kind(), "advance");
        assert_eq!(Outcome::retry(Duration::from_secs(60)).kind(), "retry");
        assert_eq!(Outcome::fail("x").kind(), "fail");
    }
}
