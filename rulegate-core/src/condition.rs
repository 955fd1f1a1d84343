//! Condition trees and their evaluation.
//!
//! Conditions are declared in rule definitions:
//!
//! ```json
//! {
//!   "type": "all",
//!   "conditions": [
//!     {"type": "field", "field": "customer.age", "operator": "gte", "value": 18},
//!     {"type": "role", "roles": ["sales", "admin"]}
//!   ]
//! }
//! ```
//!
//! Evaluation never fails: expression errors, unknown custom functions and
//! unknown variants all resolve to `false`.

use crate::context::RuleContext;
use crate::expr::{self, ExpressionEvaluator};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A condition node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Boolean expression evaluated by the expression evaluator.
    Expression { expression: String },
    /// Short-circuiting AND.
    All { conditions: Vec<Condition> },
    /// Short-circuiting OR.
    Any { conditions: Vec<Condition> },
    /// Negation of a single child.
    Not { condition: Box<Condition> },
    /// Operator applied to a field of `data`.
    Field {
        field: String,
        operator: Operator,
        #[serde(default)]
        value: Value,
    },
    /// Field value is one of the allowed states.
    State { field: String, states: Vec<String> },
    /// User holds any of the allowed roles.
    Role { roles: Vec<String> },
    /// Registered custom function.
    Custom {
        name: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    /// Unrecognized `type` tag from external configuration.
    #[serde(other)]
    Unknown,
}

impl Condition {
    pub fn expression(expression: impl Into<String>) -> Self {
        Condition::Expression {
            expression: expression.into(),
        }
    }

    pub fn field(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Condition::Field {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    pub fn role(roles: &[&str]) -> Self {
        Condition::Role {
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    /// Visits every expression string in the tree.
    pub fn expressions<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Condition::Expression { expression } => out.push(expression),
            Condition::All { conditions } | Condition::Any { conditions } => {
                for c in conditions {
                    c.expressions(out);
                }
            }
            Condition::Not { condition } => condition.expressions(out),
            _ => {}
        }
    }
}

/// Field comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Matches,
    IsNull,
    IsNotNull,
    IsEmpty,
    IsNotEmpty,
}

impl Operator {
    /// Applies the operator. `actual` is `None` when the path is missing.
    pub fn apply(&self, actual: Option<&Value>, expected: &Value) -> bool {
        let actual_or_null = actual.unwrap_or(&Value::Null);
        match self {
            Operator::Eq => expr::values_equal(actual_or_null, expected),
            Operator::Neq => !expr::values_equal(actual_or_null, expected),
            Operator::Gt => numeric(actual, expected, |a, b| a > b),
            Operator::Gte => numeric(actual, expected, |a, b| a >= b),
            Operator::Lt => numeric(actual, expected, |a, b| a < b),
            Operator::Lte => numeric(actual, expected, |a, b| a <= b),
            Operator::In => match expected {
                Value::Array(items) => items
                    .iter()
                    .any(|v| expr::values_equal(actual_or_null, v)),
                _ => false,
            },
            Operator::NotIn => match expected {
                Value::Array(items) => !items
                    .iter()
                    .any(|v| expr::values_equal(actual_or_null, v)),
                _ => false,
            },
            Operator::Contains => contains(actual, expected).unwrap_or(false),
            Operator::NotContains => contains(actual, expected).map(|c| !c).unwrap_or(false),
            Operator::StartsWith => match (actual, expected) {
                (Some(Value::String(s)), Value::String(prefix)) => s.starts_with(prefix.as_str()),
                _ => false,
            },
            Operator::EndsWith => match (actual, expected) {
                (Some(Value::String(s)), Value::String(suffix)) => s.ends_with(suffix.as_str()),
                _ => false,
            },
            Operator::Matches => matches_pattern(actual, expected),
            Operator::IsNull => actual_or_null.is_null(),
            Operator::IsNotNull => !actual_or_null.is_null(),
            Operator::IsEmpty => is_empty(actual_or_null),
            Operator::IsNotEmpty => !is_empty(actual_or_null),
        }
    }
}

fn numeric(actual: Option<&Value>, expected: &Value, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (actual.and_then(expr::as_f64), expr::as_f64(expected)) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

/// `None` when the field is neither a string nor an array.
fn contains(actual: Option<&Value>, expected: &Value) -> Option<bool> {
    match actual? {
        Value::String(s) => match expected {
            Value::String(sub) => Some(s.contains(sub.as_str())),
            _ => Some(false),
        },
        Value::Array(items) => Some(items.iter().any(|v| expr::values_equal(v, expected))),
        _ => None,
    }
}

fn matches_pattern(actual: Option<&Value>, expected: &Value) -> bool {
    let (Some(Value::String(s)), Value::String(pattern)) = (actual, expected) else {
        return false;
    };

    match Regex::new(pattern) {
        Ok(re) => re.is_match(s),
        Err(e) => {
            tracing::warn!(pattern = %pattern, error = %e, "invalid regex in matches condition");
            false
        }
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// A named condition function callable from `custom` conditions.
pub trait CustomCondition: Send + Sync {
    fn call(&self, args: &[Value], ctx: &RuleContext) -> bool;
}

impl<F> CustomCondition for F
where
    F: Fn(&[Value], &RuleContext) -> bool + Send + Sync,
{
    fn call(&self, args: &[Value], ctx: &RuleContext) -> bool {
        self(args, ctx)
    }
}

/// Global registry of custom condition functions.
#[derive(Default, Clone)]
pub struct CustomFunctions {
    functions: HashMap<String, Arc<dyn CustomCondition>>,
}

impl CustomFunctions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a function, replacing any previous one with the same name.
    pub fn register(&mut self, name: impl Into<String>, f: impl CustomCondition + 'static) {
        let name = name.into();
        if self.functions.insert(name.clone(), Arc::new(f)).is_some() {
            tracing::debug!(name = %name, "replaced custom condition function");
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn CustomCondition>> {
        self.functions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

/// Evaluates condition trees against a rule context.
pub struct ConditionEvaluator<'a> {
    expressions: &'a dyn ExpressionEvaluator,
    functions: &'a CustomFunctions,
}

impl<'a> ConditionEvaluator<'a> {
    pub fn new(expressions: &'a dyn ExpressionEvaluator, functions: &'a CustomFunctions) -> Self {
        Self {
            expressions,
            functions,
        }
    }

    /// Evaluates a condition. Never fails; errors resolve to `false`.
    pub fn evaluate(&self, condition: &Condition, ctx: &RuleContext) -> bool {
        match condition {
            Condition::Expression { expression } => {
                let scope = ctx.scope().build();
                match self.expressions.evaluate_boolean(expression, &scope) {
                    Ok(b) => b,
                    Err(e) => {
                        tracing::warn!(
                            expression = %expression,
                            entity = %ctx.entity,
                            error = %e,
                            "condition expression failed"
                        );
                        false
                    }
                }
            }
            Condition::All { conditions } => conditions.iter().all(|c| self.evaluate(c, ctx)),
            Condition::Any { conditions } => conditions.iter().any(|c| self.evaluate(c, ctx)),
            Condition::Not { condition } => !self.evaluate(condition, ctx),
            Condition::Field {
                field,
                operator,
                value,
            } => operator.apply(expr::lookup_path(&ctx.data, field), value),
            Condition::State { field, states } => expr::lookup_path(&ctx.data, field)
                .and_then(Value::as_str)
                .map(|s| states.iter().any(|allowed| allowed == s))
                .unwrap_or(false),
            Condition::Role { roles } => ctx.user_roles.iter().any(|r| roles.contains(r)),
            Condition::Custom { name, args } => match self.functions.get(name) {
                Some(f) => f.call(args, ctx),
                None => {
                    tracing::warn!(name = %name, "custom condition function not registered");
                    false
                }
            },
            Condition::Unknown => {
                tracing::warn!(entity = %ctx.entity, "unknown condition type");
                false
            }
        }
    }
}
