//! # rulegate-core
//!
//! Rule evaluation and entity lifecycle engine for rulegate.
//!
//! This crate provides:
//! - Declarative conditions and actions with a dependency-ordered rule pipeline
//! - A hierarchical state machine with guards, staged actions and side effects
//! - Named guard/action registries for table-driven transitions
//! - A small expression language used by conditions, guards and computed fields

pub mod action;
pub mod condition;
pub mod context;
pub mod error;
pub mod expr;
pub mod machine;
pub mod pipeline;
pub mod rule;
pub mod runtime;
pub mod trigger;

pub use action::{Action, ValidationError};
pub use condition::{Condition, CustomFunctions, Operator};
pub use context::{Operation, RuleContext, TransitionContext};
pub use error::{ActionError, CoreError, EvalError, TransitionError, TriggerError};
pub use expr::{ExprEngine, ExpressionEvaluator};
pub use machine::{
    MachineServices, StateHistoryEntry, StateMachine, StateMachineConfig, TransitionResult,
};
pub use pipeline::{EvaluateOptions, EvaluationResult, RuleEngine};
pub use rule::{Rule, RuleCategory, RuleRegistry};
pub use runtime::{ActionRegistry, EntityLifecycle, GuardRegistry, Runtime, TransitionPlan};
pub use trigger::{LoggingTriggers, TriggerContext, TriggerExecutor};
