//! State machine definition types.
//!
//! Machine definitions use a JSON (or YAML) DSL:
//!
//! ```json
//! {
//!   "entity": "order",
//!   "field": "status",
//!   "trackHistory": true,
//!   "states": [
//!     {"name": "draft", "isInitial": true},
//!     {"name": "confirmed",
//!      "onEntry": [{"type": "set_field", "field": "confirmed", "value": true}]},
//!     {"name": "cancelled", "isFinal": true}
//!   ],
//!   "transitions": [
//!     {"name": "confirm", "from": "draft", "to": "confirmed", "event": "CONFIRM"},
//!     {"name": "cancel", "from": "confirmed", "to": "cancelled", "event": "CANCEL",
//!      "guards": [{"name": "is_admin", "expression": "user.roles includes 'admin'",
//!                  "errorMessage": "only admins may cancel"}]}
//!   ]
//! }
//! ```

use crate::action::LogLevel;
use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

fn default_field() -> String {
    "status".to_string()
}

/// Complete definition of one entity's lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateMachineConfig {
    /// Entity type the machine governs.
    pub entity: String,
    /// Data field holding the current state.
    #[serde(default = "default_field")]
    pub field: String,
    pub states: Vec<State>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
    /// Declared event names. When non-empty every transition event must be listed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<String>,
    #[serde(default)]
    pub track_history: bool,
}

/// A state in the machine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub is_initial: bool,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_entry: Vec<StateAction>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_exit: Vec<StateAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<StateTimeout>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub regions: Vec<Region>,
}

impl State {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn initial(mut self) -> Self {
        self.is_initial = true;
        self
    }

    pub fn terminal(mut self) -> Self {
        self.is_final = true;
        self
    }

    pub fn child_of(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn on_entry(mut self, action: StateAction) -> Self {
        self.on_entry.push(action);
        self
    }

    pub fn on_exit(mut self, action: StateAction) -> Self {
        self.on_exit.push(action);
        self
    }

    pub fn with_timeout(mut self, duration_ms: u64, transition_to: impl Into<String>) -> Self {
        self.timeout = Some(StateTimeout {
            duration: duration_ms,
            transition_to: transition_to.into(),
        });
        self
    }

    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

/// Automatic transition after a state has been held for `duration` milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateTimeout {
    pub duration: u64,
    pub transition_to: String,
}

/// Parallel sub-machine inside a compound state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Region {
    pub name: String,
    pub initial: String,
    pub states: Vec<String>,
}

/// A named transition between two states.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub name: String,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub guards: Vec<Guard>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<StateAction>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub side_effects: Vec<SideEffect>,
    /// Higher wins when several transitions match one event.
    #[serde(default)]
    pub priority: i32,
    /// Stays in `from`; `to` is ignored and exit/entry actions are skipped.
    #[serde(default)]
    pub internal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_role: Option<String>,
    /// Advisory flag for UIs; the machine does not enforce it.
    #[serde(default)]
    pub confirmation_required: bool,
}

impl Transition {
    pub fn new(name: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            from: from.into(),
            to: to.into(),
            ..Default::default()
        }
    }

    pub fn on_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    pub fn with_guard(mut self, name: &str, expression: &str, error_message: &str) -> Self {
        self.guards.push(Guard {
            name: name.to_string(),
            expression: expression.to_string(),
            error_message: error_message.to_string(),
        });
        self
    }

    pub fn with_action(mut self, action: StateAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_side_effect(mut self, effect: SideEffect) -> Self {
        self.side_effects.push(effect);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn requires_role(mut self, role: impl Into<String>) -> Self {
        self.required_role = Some(role.into());
        self
    }

    /// Target state once the transition has been taken.
    pub fn target<'a>(&'a self, current: &'a str) -> &'a str {
        if self.internal {
            current
        } else {
            &self.to
        }
    }
}

/// Boolean expression gating a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Guard {
    pub name: String,
    pub expression: String,
    pub error_message: String,
}

/// Action attached to a state's entry/exit or to a transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateAction {
    SetField {
        field: String,
        value: Value,
    },
    Compute {
        field: String,
        expression: String,
    },
    Trigger {
        trigger: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Log {
        #[serde(default = "default_log_level")]
        level: LogLevel,
        message: String,
    },
    /// Runs a named action from the action registry.
    Invoke {
        name: String,
    },
    #[serde(other)]
    Unknown,
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

impl StateAction {
    /// Label recorded in `executedActions`, e.g. `set_field:total`.
    pub fn label(&self) -> String {
        match self {
            StateAction::SetField { field, .. } => format!("set_field:{}", field),
            StateAction::Compute { field, .. } => format!("compute:{}", field),
            StateAction::Trigger { trigger, .. } => format!("trigger:{}", trigger),
            StateAction::Log { .. } => "log".to_string(),
            StateAction::Invoke { name } => format!("invoke:{}", name),
            StateAction::Unknown => "unknown".to_string(),
        }
    }
}

/// Kind of best-effort effect dispatched after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffectKind {
    Email,
    Webhook,
    AuditLog,
    Notification,
    Analytics,
    Trigger,
}

impl SideEffectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SideEffectKind::Email => "email",
            SideEffectKind::Webhook => "webhook",
            SideEffectKind::AuditLog => "audit_log",
            SideEffectKind::Notification => "notification",
            SideEffectKind::Analytics => "analytics",
            SideEffectKind::Trigger => "trigger",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SideEffect {
    #[serde(rename = "type")]
    pub kind: SideEffectKind,
    /// Trigger id handed to the executor; defaults to the kind name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    /// Must be a JSON object when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl SideEffect {
    pub fn new(kind: SideEffectKind) -> Self {
        Self {
            kind,
            trigger: None,
            payload: None,
        }
    }

    pub fn with_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.trigger = Some(trigger.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn trigger_id(&self) -> &str {
        self.trigger.as_deref().unwrap_or(self.kind.as_str())
    }
}

impl StateMachineConfig {
    pub fn new(
        entity: impl Into<String>,
        states: Vec<State>,
        transitions: Vec<Transition>,
    ) -> Self {
        Self {
            entity: entity.into(),
            field: default_field(),
            states,
            transitions,
            events: Vec::new(),
            track_history: false,
        }
    }

    pub fn with_history(mut self) -> Self {
        self.track_history = true;
        self
    }

    /// True when any state declares parallel regions.
    pub fn has_regions(&self) -> bool {
        self.states.iter().any(|s| !s.regions.is_empty())
    }

    pub fn from_json(json: &Value) -> Result<Self, CoreError> {
        Ok(serde_json::from_value(json.clone())?)
    }

    /// Checks that every reference in the definition resolves.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.entity.is_empty() {
            return Err(CoreError::invalid("machine entity must not be empty"));
        }
        if self.states.is_empty() {
            return Err(CoreError::invalid(format!(
                "machine '{}' declares no states",
                self.entity
            )));
        }

        let mut states: HashMap<&str, &State> = HashMap::new();
        for state in &self.states {
            if states.insert(state.name.as_str(), state).is_some() {
                return Err(CoreError::invalid(format!("duplicate state '{}'", state.name)));
            }
        }
        let known = |name: &str, what: &str| -> Result<(), CoreError> {
            if states.contains_key(name) {
                Ok(())
            } else {
                Err(CoreError::invalid(format!("{} '{}' not in states list", what, name)))
            }
        };

        for state in &self.states {
            if let Some(parent) = &state.parent {
                known(parent, "parent state")?;
            }
            for child in &state.children {
                known(child, "child state")?;
                if let Some(declared) = &states[child.as_str()].parent {
                    if declared != &state.name {
                        return Err(CoreError::invalid(format!(
                            "state '{}' lists child '{}' whose parent is '{}'",
                            state.name, child, declared
                        )));
                    }
                }
            }
            if let Some(timeout) = &state.timeout {
                known(&timeout.transition_to, "timeout target")?;
            }
            for region in &state.regions {
                known(&region.initial, "region initial state")?;
                if !region.states.contains(&region.initial) {
                    return Err(CoreError::invalid(format!(
                        "region '{}' initial state '{}' is not a member",
                        region.name, region.initial
                    )));
                }
                for member in &region.states {
                    known(member, "region state")?;
                }
            }
        }

        // Parent chains must terminate.
        for state in &self.states {
            let mut seen = HashSet::new();
            let mut current = Some(state.name.as_str());
            while let Some(name) = current {
                if !seen.insert(name) {
                    return Err(CoreError::invalid(format!(
                        "parent cycle through state '{}'",
                        name
                    )));
                }
                current = states.get(name).and_then(|s| s.parent.as_deref());
            }
        }

        let mut names = HashSet::new();
        for t in &self.transitions {
            if !names.insert(t.name.as_str()) {
                return Err(CoreError::invalid(format!("duplicate transition '{}'", t.name)));
            }
            known(&t.from, "transition source")?;
            if !t.internal {
                known(&t.to, "transition target")?;
            } else if !t.to.is_empty() && t.to != t.from {
                known(&t.to, "transition target")?;
            }
            if let Some(event) = &t.event {
                if !self.events.is_empty() && !self.events.contains(event) {
                    return Err(CoreError::invalid(format!(
                        "transition '{}' uses undeclared event '{}'",
                        t.name, event
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "entity": "order",
            "states": [
                {"name": "draft", "isInitial": true},
                {"name": "open", "displayName": "Open"},
                {"name": "confirmed", "parent": "open",
                 "onEntry": [{"type": "set_field", "field": "confirmed", "value": true}]},
                {"name": "cancelled", "isFinal": true}
            ],
            "transitions": [
                {"name": "confirm", "from": "draft", "to": "confirmed", "event": "CONFIRM"},
                {"name": "cancel", "from": "open", "to": "cancelled", "event": "CANCEL",
                 "sideEffects": [{"type": "audit_log"}]}
            ]
        })
    }

    #[test]
    fn test_parse_definition() {
        let config = StateMachineConfig::from_json(&sample()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.field, "status");
        assert!(!config.track_history);
        assert_eq!(config.states[1].label(), "Open");
        assert_eq!(config.states[2].parent.as_deref(), Some("open"));
        assert_eq!(
            config.states[2].on_entry[0],
            StateAction::SetField {
                field: "confirmed".into(),
                value: json!(true)
            }
        );
        assert_eq!(config.transitions[1].side_effects[0].trigger_id(), "audit_log");
    }

    #[test]
    fn test_unknown_action_type_is_tolerated() {
        let action: StateAction =
            serde_json::from_value(json!({"type": "teleport", "where": "mars"})).unwrap();
        assert_eq!(action, StateAction::Unknown);
    }

    #[test]
    fn test_invalid_target_state() {
        let mut json = sample();
        json["transitions"][0]["to"] = json!("shipped");
        let err = StateMachineConfig::from_json(&json)
            .unwrap()
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("shipped"));
    }

    #[test]
    fn test_internal_transition_may_omit_target() {
        let config = StateMachineConfig::new(
            "order",
            vec![State::new("draft").initial()],
            vec![Transition::new("touch", "draft", "").internal()],
        );
        config.validate().unwrap();
        assert_eq!(config.transitions[0].target("draft"), "draft");
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let config = StateMachineConfig::new(
            "order",
            vec![State::new("a"), State::new("a")],
            vec![],
        );
        assert!(config.validate().is_err());

        let config = StateMachineConfig::new(
            "order",
            vec![State::new("a"), State::new("b")],
            vec![Transition::new("go", "a", "b"), Transition::new("go", "b", "a")],
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parent_cycle_rejected() {
        let config = StateMachineConfig::new(
            "order",
            vec![State::new("a").child_of("b"), State::new("b").child_of("a")],
            vec![],
        );
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_undeclared_event_rejected() {
        let mut config = StateMachineConfig::new(
            "order",
            vec![State::new("a"), State::new("b")],
            vec![Transition::new("go", "a", "b").on_event("GO")],
        );
        config.events = vec!["STOP".into()];
        assert!(config.validate().is_err());

        config.events.push("GO".into());
        config.validate().unwrap();
    }

    #[test]
    fn test_region_members_validated() {
        let mut parent = State::new("fulfilment");
        parent.regions.push(Region {
            name: "payment".into(),
            initial: "unpaid".into(),
            states: vec!["unpaid".into(), "paid".into()],
        });
        let config = StateMachineConfig::new(
            "order",
            vec![parent, State::new("unpaid")],
            vec![],
        );
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("paid"));
    }
}
