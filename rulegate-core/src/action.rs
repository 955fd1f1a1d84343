//! Rule actions and their execution.
//!
//! Actions never mutate the context. Field changes are staged in an
//! [`Accumulator`] and applied by the caller once the pipeline completes.

use crate::context::RuleContext;
use crate::error::ActionError;
use crate::expr::{self, ExpressionEvaluator};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::OnceLock;

/// An action chosen by a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Allow,
    Deny {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    Validate {
        errors: Vec<ValidationError>,
    },
    Transform {
        transforms: Vec<FieldTransform>,
    },
    Compute {
        field: String,
        expression: String,
    },
    Trigger {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    SetField {
        field: String,
        value: Value,
    },
    RequireConfirmation {
        message: String,
    },
    Log {
        level: LogLevel,
        message: String,
    },
    /// Unrecognized `type` tag from external configuration.
    #[serde(other)]
    Unknown,
}

impl Action {
    pub fn deny(message: impl Into<String>) -> Self {
        Action::Deny {
            message: message.into(),
            code: None,
        }
    }

    /// Short tag used in logs and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Allow => "allow",
            Action::Deny { .. } => "deny",
            Action::Validate { .. } => "validate",
            Action::Transform { .. } => "transform",
            Action::Compute { .. } => "compute",
            Action::Trigger { .. } => "trigger",
            Action::SetField { .. } => "set_field",
            Action::RequireConfirmation { .. } => "require_confirmation",
            Action::Log { .. } => "log",
            Action::Unknown => "unknown",
        }
    }

    /// Expression strings referenced by this action.
    pub fn expressions(&self) -> Vec<&str> {
        match self {
            Action::Compute { expression, .. } => vec![expression.as_str()],
            Action::Transform { transforms } => transforms
                .iter()
                .filter_map(|t| t.expression.as_deref())
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// A validation failure reported to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationError {
    /// Offending field; `None` for entity-level errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
}

impl ValidationError {
    pub fn new(field: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            field: field.map(str::to_string),
            message: message.into(),
            code: None,
            rule_id: None,
        }
    }
}

/// A transform applied to one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldTransform {
    pub field: String,
    pub transform: TransformKind,
    /// Expression for `custom`; the current value is bound as `value`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    Uppercase,
    Lowercase,
    Trim,
    Sanitize,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Confirmation requested by a `require_confirmation` action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Confirmation {
    pub message: String,
    pub rule_id: String,
}

/// State accumulated across the actions of one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct Accumulator {
    pub errors: Vec<ValidationError>,
    pub transformations: Map<String, Value>,
    pub requires_confirmation: Option<Confirmation>,
}

impl Accumulator {
    /// Current value of a field: staged value first, then `data`.
    fn current<'v>(&'v self, data: &'v Value, field: &str) -> Option<&'v Value> {
        self.transformations
            .get(field)
            .or_else(|| expr::lookup_path(data, field))
    }

    /// `data` overlaid with staged top-level transformations.
    fn staged_data(&self, data: &Value) -> Value {
        let mut merged = data.clone();
        if let Value::Object(map) = &mut merged {
            for (k, v) in &self.transformations {
                map.insert(k.clone(), v.clone());
            }
        }
        merged
    }
}

/// Control signal returned by an action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionSignal {
    pub stop: bool,
    pub denied: bool,
}

impl ActionSignal {
    const CONTINUE: Self = Self {
        stop: false,
        denied: false,
    };
}

/// Executes actions against a context.
pub struct ActionExecutor<'a> {
    expressions: &'a dyn ExpressionEvaluator,
}

impl<'a> ActionExecutor<'a> {
    pub fn new(expressions: &'a dyn ExpressionEvaluator) -> Self {
        Self { expressions }
    }

    /// Executes one action on behalf of `rule_id`.
    pub fn execute(
        &self,
        action: &Action,
        rule_id: &str,
        ctx: &RuleContext,
        acc: &mut Accumulator,
    ) -> Result<ActionSignal, ActionError> {
        match action {
            Action::Allow => Ok(ActionSignal::CONTINUE),

            Action::Deny { message, code } => {
                acc.errors.push(ValidationError {
                    field: None,
                    message: message.clone(),
                    code: Some(code.clone().unwrap_or_else(|| "DENIED".to_string())),
                    rule_id: Some(rule_id.to_string()),
                });
                Ok(ActionSignal {
                    stop: true,
                    denied: true,
                })
            }

            Action::Validate { errors } => {
                acc.errors.extend(errors.iter().cloned().map(|mut e| {
                    e.rule_id.get_or_insert_with(|| rule_id.to_string());
                    e
                }));
                Ok(ActionSignal::CONTINUE)
            }

            Action::Transform { transforms } => {
                for t in transforms {
                    let Some(current) = acc.current(&ctx.data, &t.field).cloned() else {
                        tracing::debug!(field = %t.field, "transform skipped, field not present");
                        continue;
                    };
                    if let Some(value) = self.transform(t, current, ctx)? {
                        acc.transformations.insert(t.field.clone(), value);
                    }
                }
                Ok(ActionSignal::CONTINUE)
            }

            Action::Compute { field, expression } => {
                let scope = ctx
                    .scope()
                    .with("data", acc.staged_data(&ctx.data))
                    .build();
                let value = self
                    .expressions
                    .evaluate(expression, &scope)
                    .map_err(|source| ActionError::Expression {
                        field: field.clone(),
                        source,
                    })?;
                acc.transformations.insert(field.clone(), value);
                Ok(ActionSignal::CONTINUE)
            }

            Action::SetField { field, value } => {
                acc.transformations.insert(field.clone(), value.clone());
                Ok(ActionSignal::CONTINUE)
            }

            Action::Trigger { id, payload } => {
                // Dispatch belongs to the trigger collaborator, not the pipeline.
                tracing::info!(
                    rule_id = %rule_id,
                    trigger = %id,
                    entity = %ctx.entity,
                    operation = ctx.operation.as_str(),
                    has_payload = payload.is_some(),
                    "trigger requested"
                );
                Ok(ActionSignal::CONTINUE)
            }

            Action::RequireConfirmation { message } => {
                acc.requires_confirmation = Some(Confirmation {
                    message: message.clone(),
                    rule_id: rule_id.to_string(),
                });
                Ok(ActionSignal {
                    stop: true,
                    denied: false,
                })
            }

            Action::Log { level, message } => {
                log_at(*level, rule_id, &ctx.entity, message);
                Ok(ActionSignal::CONTINUE)
            }

            Action::Unknown => {
                tracing::warn!(rule_id = %rule_id, "unknown action type, skipped");
                Ok(ActionSignal::CONTINUE)
            }
        }
    }

    fn transform(
        &self,
        t: &FieldTransform,
        current: Value,
        ctx: &RuleContext,
    ) -> Result<Option<Value>, ActionError> {
        let string_op: fn(&str) -> String = match t.transform {
            TransformKind::Uppercase => str::to_uppercase,
            TransformKind::Lowercase => str::to_lowercase,
            TransformKind::Trim => |s: &str| s.trim().to_string(),
            TransformKind::Sanitize => strip_tags,
            TransformKind::Custom => {
                let expression = t.expression.as_deref().ok_or_else(|| ActionError::Failed {
                    name: format!("transform:{}", t.field),
                    reason: "custom transform requires an expression".to_string(),
                })?;
                let scope = ctx.scope().var("value", current).build();
                return self
                    .expressions
                    .evaluate(expression, &scope)
                    .map(Some)
                    .map_err(|source| ActionError::Expression {
                        field: t.field.clone(),
                        source,
                    });
            }
        };

        match current {
            Value::String(s) => Ok(Some(Value::String(string_op(&s)))),
            other => {
                tracing::debug!(
                    field = %t.field,
                    kind = expr::kind(&other),
                    "string transform skipped for non-string value"
                );
                Ok(None)
            }
        }
    }
}

fn strip_tags(s: &str) -> String {
    static TAGS: OnceLock<Regex> = OnceLock::new();
    let re = TAGS.get_or_init(|| Regex::new(r"<[^>]*>").expect("static pattern"));
    re.replace_all(s, "").into_owned()
}

/// Writes a definition-supplied message; `origin` is the rule id or transition name.
pub(crate) fn log_at(level: LogLevel, origin: &str, entity: &str, message: &str) {
    match level {
        LogLevel::Debug => tracing::debug!(origin, entity, "{}", message),
        LogLevel::Info => tracing::info!(origin, entity, "{}", message),
        LogLevel::Warn => tracing::warn!(origin, entity, "{}", message),
        LogLevel::Error => tracing::error!(origin, entity, "{}", message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Operation;
    use crate::expr::ExprEngine;
    use serde_json::json;

    fn run(action: &Action, data: Value) -> (Result<ActionSignal, ActionError>, Accumulator) {
        let engine = ExprEngine::new();
        let ctx = RuleContext::new("customer", Operation::Update, data);
        let mut acc = Accumulator::default();
        let result = ActionExecutor::new(&engine).execute(action, "r1", &ctx, &mut acc);
        (result, acc)
    }

    #[test]
    fn test_allow_continues() {
        let (signal, acc) = run(&Action::Allow, json!({}));
        assert_eq!(signal.unwrap(), ActionSignal::default());
        assert!(acc.errors.is_empty());
    }

    #[test]
    fn test_deny_stops_and_records_error() {
        let (signal, acc) = run(
            &Action::Deny {
                message: "blocked".into(),
                code: Some("BLOCKED".into()),
            },
            json!({}),
        );
        let signal = signal.unwrap();
        assert!(signal.stop && signal.denied);
        assert_eq!(acc.errors.len(), 1);
        assert_eq!(acc.errors[0].field, None);
        assert_eq!(acc.errors[0].code.as_deref(), Some("BLOCKED"));
        assert_eq!(acc.errors[0].rule_id.as_deref(), Some("r1"));
    }

    #[test]
    fn test_validate_appends_without_stopping() {
        let action = Action::Validate {
            errors: vec![ValidationError::new(Some("email"), "invalid email")],
        };
        let (signal, acc) = run(&action, json!({}));
        assert!(!signal.unwrap().stop);
        assert_eq!(acc.errors[0].field.as_deref(), Some("email"));
    }

    #[test]
    fn test_transform_stages_without_mutating() {
        let action = Action::Transform {
            transforms: vec![
                FieldTransform {
                    field: "name".into(),
                    transform: TransformKind::Trim,
                    expression: None,
                },
                FieldTransform {
                    field: "name".into(),
                    transform: TransformKind::Uppercase,
                    expression: None,
                },
                FieldTransform {
                    field: "bio".into(),
                    transform: TransformKind::Sanitize,
                    expression: None,
                },
                FieldTransform {
                    field: "age".into(),
                    transform: TransformKind::Lowercase,
                    expression: None,
                },
            ],
        };
        let (signal, acc) = run(
            &action,
            json!({"name": "  ada ", "bio": "<b>hi</b> <script>x</script>", "age": 3}),
        );
        assert!(signal.is_ok());
        assert_eq!(acc.transformations["name"], "ADA");
        assert_eq!(acc.transformations["bio"], "hi x");
        assert!(!acc.transformations.contains_key("age"));
    }

    #[test]
    fn test_custom_transform_binds_value() {
        let action = Action::Transform {
            transforms: vec![FieldTransform {
                field: "price".into(),
                transform: TransformKind::Custom,
                expression: Some("value * 100".into()),
            }],
        };
        let (_, acc) = run(&action, json!({"price": 12.5}));
        assert_eq!(acc.transformations["price"], json!(1250));
    }

    #[test]
    fn test_custom_transform_without_expression_fails() {
        let action = Action::Transform {
            transforms: vec![FieldTransform {
                field: "price".into(),
                transform: TransformKind::Custom,
                expression: None,
            }],
        };
        let (result, _) = run(&action, json!({"price": 1}));
        assert!(matches!(result, Err(ActionError::Failed { .. })));
    }

    #[test]
    fn test_compute_and_set_field() {
        let engine = ExprEngine::new();
        let ctx = RuleContext::new("line", Operation::Create, json!({"qty": 3, "price": 4}));
        let mut acc = Accumulator::default();
        let exec = ActionExecutor::new(&engine);

        exec.execute(
            &Action::Compute {
                field: "subtotal".into(),
                expression: "qty * price".into(),
            },
            "r1",
            &ctx,
            &mut acc,
        )
        .unwrap();
        exec.execute(
            &Action::Compute {
                field: "total".into(),
                expression: "subtotal + 1".into(),
            },
            "r2",
            &ctx,
            &mut acc,
        )
        .unwrap();
        exec.execute(
            &Action::SetField {
                field: "currency".into(),
                value: json!("EUR"),
            },
            "r3",
            &ctx,
            &mut acc,
        )
        .unwrap();

        assert_eq!(acc.transformations["subtotal"], json!(12));
        assert_eq!(acc.transformations["total"], json!(13));
        assert_eq!(acc.transformations["currency"], "EUR");
        assert!(ctx.data.get("subtotal").is_none());
    }

    #[test]
    fn test_compute_error() {
        let (result, acc) = run(
            &Action::Compute {
                field: "ratio".into(),
                expression: "a / 0".into(),
            },
            json!({"a": 1}),
        );
        assert!(matches!(result, Err(ActionError::Expression { .. })));
        assert!(acc.transformations.is_empty());
    }

    #[test]
    fn test_require_confirmation_stops_without_deny() {
        let (signal, acc) = run(
            &Action::RequireConfirmation {
                message: "Are you sure?".into(),
            },
            json!({}),
        );
        let signal = signal.unwrap();
        assert!(signal.stop);
        assert!(!signal.denied);
        assert_eq!(acc.requires_confirmation.unwrap().rule_id, "r1");
    }

    #[test]
    fn test_trigger_and_log_are_side_channel_only() {
        let (signal, acc) = run(
            &Action::Trigger {
                id: "welcome_email".into(),
                payload: None,
            },
            json!({}),
        );
        assert!(!signal.unwrap().stop);
        assert!(acc.transformations.is_empty());

        let (signal, _) = run(
            &Action::Log {
                level: LogLevel::Warn,
                message: "hello".into(),
            },
            json!({}),
        );
        assert!(!signal.unwrap().stop);
    }

    #[test]
    fn test_deserialize_actions() {
        let action: Action = serde_json::from_value(json!({
            "type": "deny", "message": "no"
        }))
        .unwrap();
        assert_eq!(action, Action::deny("no"));

        let action: Action = serde_json::from_value(json!({
            "type": "transform",
            "transforms": [{"field": "email", "transform": "lowercase"}]
        }))
        .unwrap();
        assert_eq!(action.kind(), "transform");

        let action: Action = serde_json::from_value(json!({"type": "teleport"})).unwrap();
        assert_eq!(action, Action::Unknown);
    }
}
