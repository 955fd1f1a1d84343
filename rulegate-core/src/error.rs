//! Core error types.
//!
//! Only registration and construction return `Err`. Evaluation failures are
//! folded into result objects by the pipeline and the state machine.

use serde::{Serialize, Serializer};
use thiserror::Error;

/// Errors raised while registering rules or building machines.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("duplicate rule id: {rule_id}")]
    DuplicateRule { rule_id: String },

    #[error("invalid machine definition: {reason}")]
    InvalidDefinition { reason: String },

    #[error("machine not found: {machine}")]
    UnknownMachine { machine: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Returns an error code suitable for API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::DuplicateRule { .. } => "DUPLICATE_RULE",
            CoreError::InvalidDefinition { .. } => "BAD_REQUEST",
            CoreError::UnknownMachine { .. } => "MACHINE_NOT_FOUND",
            CoreError::Json(_) => "BAD_REQUEST",
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        CoreError::InvalidDefinition {
            reason: reason.into(),
        }
    }
}

/// Errors from the expression evaluator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("parse error at {pos}: {reason}")]
    Parse { pos: usize, reason: String },

    #[error("unknown function: {name}")]
    UnknownFunction { name: String },

    #[error("type mismatch: {reason}")]
    TypeMismatch { reason: String },

    #[error("division by zero")]
    DivisionByZero,
}

impl EvalError {
    pub(crate) fn parse(pos: usize, reason: impl Into<String>) -> Self {
        EvalError::Parse {
            pos,
            reason: reason.into(),
        }
    }

    pub(crate) fn mismatch(reason: impl Into<String>) -> Self {
        EvalError::TypeMismatch {
            reason: reason.into(),
        }
    }
}

/// Errors from executing a rule action or a state action.
#[derive(Debug, Clone, Error)]
pub enum ActionError {
    #[error("expression failed for '{field}': {source}")]
    Expression { field: String, source: EvalError },

    #[error("action not registered: {entity}.{name}")]
    NotRegistered { entity: String, name: String },

    #[error("action '{name}' failed: {reason}")]
    Failed { name: String, reason: String },

    #[error("trigger '{trigger}' failed: {source}")]
    Trigger {
        trigger: String,
        source: TriggerError,
    },
}

/// Errors reported by the trigger collaborator.
#[derive(Debug, Clone, Error)]
pub enum TriggerError {
    #[error("malformed payload: {reason}")]
    MalformedPayload { reason: String },

    #[error("dispatch failed: {reason}")]
    Dispatch { reason: String },
}

/// Error outcome of a state transition, carried inside a `TransitionResult`.
#[derive(Debug, Clone, Error)]
pub enum TransitionError {
    #[error("invalid state: {state}")]
    InvalidState { state: String },

    #[error("transition '{transition}' not found from state '{state}'")]
    TransitionNotFound { state: String, transition: String },

    #[error("role '{role}' required for transition '{transition}'")]
    Unauthorized { transition: String, role: String },

    #[error("{phase} action failed: {source}")]
    ActionFailed {
        phase: &'static str,
        source: ActionError,
    },
}

impl TransitionError {
    /// Returns the stable error code for this outcome.
    pub fn code(&self) -> &'static str {
        match self {
            TransitionError::InvalidState { .. } => "INVALID_STATE",
            TransitionError::TransitionNotFound { .. } => "TRANSITION_NOT_FOUND",
            TransitionError::Unauthorized { .. } => "UNAUTHORIZED",
            TransitionError::ActionFailed { .. } => "ACTION_FAILED",
        }
    }
}

impl Serialize for TransitionError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("TransitionError", 2)?;
        s.serialize_field("code", self.code())?;
        s.serialize_field("message", &self.to_string())?;
        s.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_error_codes() {
        let err = TransitionError::TransitionNotFound {
            state: "confirmed".into(),
            transition: "confirm".into(),
        };
        assert_eq!(err.code(), "TRANSITION_NOT_FOUND");
        assert_eq!(
            err.to_string(),
            "transition 'confirm' not found from state 'confirmed'"
        );

        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "TRANSITION_NOT_FOUND");
    }

    #[test]
    fn test_action_failed_message_includes_phase() {
        let err = TransitionError::ActionFailed {
            phase: "entry",
            source: ActionError::NotRegistered {
                entity: "order".into(),
                name: "notify".into(),
            },
        };
        assert_eq!(err.code(), "ACTION_FAILED");
        assert_eq!(
            err.to_string(),
            "entry action failed: action not registered: order.notify"
        );
    }

    #[test]
    fn test_core_error_codes() {
        let err = CoreError::DuplicateRule {
            rule_id: "r1".into(),
        };
        assert_eq!(err.error_code(), "DUPLICATE_RULE");
        assert_eq!(CoreError::invalid("x").error_code(), "BAD_REQUEST");
    }
}
