//! Evaluation contexts for the rule pipeline and the state machine.

use crate::expr::Scope;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kind of operation being performed on an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
    Read,
    Transition,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Read => "read",
            Operation::Transition => "transition",
        }
    }
}

impl std::str::FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            "read" => Ok(Operation::Read),
            "transition" => Ok(Operation::Transition),
            other => Err(format!("unknown operation '{}'", other)),
        }
    }
}

/// Data a rule evaluation runs against.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleContext {
    pub entity: String,
    pub operation: Operation,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub user_roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl RuleContext {
    pub fn new(entity: impl Into<String>, operation: Operation, data: Value) -> Self {
        Self {
            entity: entity.into(),
            operation,
            data,
            previous_data: None,
            user_id: None,
            user_roles: Vec::new(),
            metadata: Map::new(),
        }
    }

    pub fn with_previous(mut self, previous: Value) -> Self {
        self.previous_data = Some(previous);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>, roles: &[&str]) -> Self {
        self.user_id = Some(user_id.into());
        self.user_roles = roles.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Scope object for expression evaluation.
    pub fn scope(&self) -> Scope {
        Scope::new(&self.data)
            .with_opt("previousData", self.previous_data.as_ref())
            .user(self.user_id.as_deref(), &self.user_roles)
            .with("metadata", Value::Object(self.metadata.clone()))
            .with("entity", Value::String(self.entity.clone()))
            .with("operation", Value::String(self.operation.as_str().into()))
    }
}

/// Data a state transition runs against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionContext {
    pub entity: String,
    pub entity_id: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub user_roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl TransitionContext {
    pub fn new(entity: impl Into<String>, entity_id: impl Into<String>, data: Value) -> Self {
        Self {
            entity: entity.into(),
            entity_id: entity_id.into(),
            data,
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>, roles: &[&str]) -> Self {
        self.user_id = Some(user_id.into());
        self.user_roles = roles.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn with_event(mut self, event: impl Into<String>, payload: Option<Value>) -> Self {
        self.event = Some(event.into());
        self.event_payload = payload;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.user_roles.iter().any(|r| r == role)
    }

    /// Scope object for guard and action expressions.
    pub fn scope(&self, from_state: &str, to_state: &str) -> Scope {
        Scope::new(&self.data)
            .with_opt("previousData", self.previous_data.as_ref())
            .user(self.user_id.as_deref(), &self.user_roles)
            .with("metadata", Value::Object(self.metadata.clone()))
            .with("entity", Value::String(self.entity.clone()))
            .with("entityId", Value::String(self.entity_id.clone()))
            .with("event", self.event.clone().map(Value::String).unwrap_or(Value::Null))
            .with("payload", self.event_payload.clone().unwrap_or(Value::Null))
            .with("fromState", Value::String(from_state.to_string()))
            .with("toState", Value::String(to_state.to_string()))
    }

    /// Rule context used for gate evaluation.
    pub fn to_rule_context(&self) -> RuleContext {
        RuleContext {
            entity: self.entity.clone(),
            operation: Operation::Transition,
            data: self.data.clone(),
            previous_data: self.previous_data.clone(),
            user_id: self.user_id.clone(),
            user_roles: self.user_roles.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scope_contents() {
        let ctx = RuleContext::new("order", Operation::Update, json!({"total": 5}))
            .with_previous(json!({"total": 3}))
            .with_user("u-1", &["admin"])
            .with_metadata("toState", "paid");

        let scope = ctx.scope().build();
        assert_eq!(scope["data"]["total"], 5);
        assert_eq!(scope["previousData"]["total"], 3);
        assert_eq!(scope["user"]["roles"], json!(["admin"]));
        assert_eq!(scope["metadata"]["toState"], "paid");
        assert_eq!(scope["operation"], "update");
    }

    #[test]
    fn test_transition_scope() {
        let ctx = TransitionContext::new("order", "o-1", json!({"total": 9}))
            .with_user("u-1", &["client"])
            .with_event("cancel", Some(json!({"reason": "late"})));

        let scope = ctx.scope("confirmed", "cancelled").build();
        assert_eq!(scope["entityId"], "o-1");
        assert_eq!(scope["event"], "cancel");
        assert_eq!(scope["payload"]["reason"], "late");
        assert_eq!(scope["toState"], "cancelled");
        assert!(ctx.has_role("client"));

        let rule_ctx = ctx.to_rule_context();
        assert_eq!(rule_ctx.operation, Operation::Transition);
        assert_eq!(rule_ctx.data["total"], 9);
    }

    #[test]
    fn test_deserialize_camel_case() {
        let ctx: RuleContext = serde_json::from_value(json!({
            "entity": "order",
            "operation": "create",
            "data": {"a": 1},
            "userRoles": ["client"]
        }))
        .unwrap();
        assert_eq!(ctx.operation, Operation::Create);
        assert_eq!(ctx.user_roles, vec!["client".to_string()]);
        assert!(ctx.previous_data.is_none());
    }
}
