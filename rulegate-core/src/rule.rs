//! Rule definitions and the rule registry.
//!
//! Rules are registered once at startup and shared read-only afterwards:
//!
//! ```json
//! {
//!   "id": "order.min_total",
//!   "entity": "order",
//!   "category": "validation",
//!   "priority": 10,
//!   "when": {"type": "field", "field": "total", "operator": "lt", "value": 1},
//!   "then": {"type": "validate", "errors": [{"field": "total", "message": "too small"}]},
//!   "dependsOn": ["order.compute_total"]
//! }
//! ```

use crate::action::Action;
use crate::condition::Condition;
use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Rule category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    Validation,
    Constraint,
    Authorization,
    Trigger,
    Computed,
    Gate,
    Default,
    Formatting,
}

impl RuleCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleCategory::Validation => "validation",
            RuleCategory::Constraint => "constraint",
            RuleCategory::Authorization => "authorization",
            RuleCategory::Trigger => "trigger",
            RuleCategory::Computed => "computed",
            RuleCategory::Gate => "gate",
            RuleCategory::Default => "default",
            RuleCategory::Formatting => "formatting",
        }
    }
}

impl std::str::FromStr for RuleCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("unknown rule category '{}'", s))
    }
}

fn default_enabled() -> bool {
    true
}

/// A declarative condition/action pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: String,
    pub entity: String,
    pub category: RuleCategory,
    /// Higher runs earlier among rules with no ordering constraint.
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub when: Condition,
    pub then: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub otherwise: Option<Action>,
    /// Rules that must run before this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Rule {
    pub fn new(
        id: impl Into<String>,
        entity: impl Into<String>,
        category: RuleCategory,
        when: Condition,
        then: Action,
    ) -> Self {
        Self {
            id: id.into(),
            entity: entity.into(),
            category,
            priority: 0,
            enabled: true,
            when,
            then,
            otherwise: None,
            depends_on: Vec::new(),
            tags: Vec::new(),
            description: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_otherwise(mut self, action: Action) -> Self {
        self.otherwise = Some(action);
        self
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        self.depends_on = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// In-memory rule registry indexed by entity, then category.
#[derive(Debug, Default)]
pub struct RuleRegistry {
    by_id: HashMap<String, Arc<Rule>>,
    /// entity -> category -> (registration sequence, rule)
    by_entity: HashMap<String, HashMap<RuleCategory, Vec<(usize, Arc<Rule>)>>>,
    next_seq: usize,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a rule. Ids are unique across all entities.
    pub fn register(&mut self, rule: Rule) -> Result<(), CoreError> {
        if self.by_id.contains_key(&rule.id) {
            return Err(CoreError::DuplicateRule { rule_id: rule.id });
        }

        let rule = Arc::new(rule);
        self.by_id.insert(rule.id.clone(), rule.clone());
        self.by_entity
            .entry(rule.entity.clone())
            .or_default()
            .entry(rule.category)
            .or_default()
            .push((self.next_seq, rule.clone()));
        self.next_seq += 1;

        tracing::debug!(
            rule_id = %rule.id,
            entity = %rule.entity,
            category = rule.category.as_str(),
            "registered rule"
        );
        Ok(())
    }

    pub fn register_all(&mut self, rules: impl IntoIterator<Item = Rule>) -> Result<(), CoreError> {
        rules.into_iter().try_for_each(|r| self.register(r))
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Rule>> {
        self.by_id.get(id)
    }

    /// Rules for an entity in registration order, optionally filtered by category.
    pub fn rules_for(&self, entity: &str, categories: Option<&[RuleCategory]>) -> Vec<Arc<Rule>> {
        let Some(by_category) = self.by_entity.get(entity) else {
            return Vec::new();
        };

        let mut selected: Vec<&(usize, Arc<Rule>)> = by_category
            .iter()
            .filter(|(cat, _)| categories.map(|c| c.contains(*cat)).unwrap_or(true))
            .flat_map(|(_, rules)| rules.iter())
            .collect();
        selected.sort_by_key(|(seq, _)| *seq);
        selected.into_iter().map(|(_, r)| r.clone()).collect()
    }

    /// Entities with at least one rule.
    pub fn entities(&self) -> Vec<&str> {
        let mut entities: Vec<&str> = self.by_entity.keys().map(String::as_str).collect();
        entities.sort_unstable();
        entities
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Iterates all rules in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Rule>> {
        self.by_id.values()
    }

    /// Removes every rule.
    pub fn clear(&mut self) {
        self.by_id.clear();
        self.by_entity.clear();
        self.next_seq = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(id: &str, entity: &str, category: RuleCategory) -> Rule {
        Rule::new(
            id,
            entity,
            category,
            Condition::All { conditions: vec![] },
            Action::Allow,
        )
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = RuleRegistry::new();
        registry
            .register_all([
                rule("a", "order", RuleCategory::Validation),
                rule("b", "order", RuleCategory::Gate),
                rule("c", "customer", RuleCategory::Validation),
                rule("d", "order", RuleCategory::Validation),
            ])
            .unwrap();

        assert_eq!(registry.len(), 4);
        assert_eq!(registry.entities(), vec!["customer", "order"]);

        let ids: Vec<String> = registry
            .rules_for("order", None)
            .iter()
            .map(|r| r.id.clone())
            .collect();
        assert_eq!(ids, vec!["a", "b", "d"]);

        let ids: Vec<String> = registry
            .rules_for("order", Some(&[RuleCategory::Validation]))
            .iter()
            .map(|r| r.id.clone())
            .collect();
        assert_eq!(ids, vec!["a", "d"]);

        assert!(registry.rules_for("invoice", None).is_empty());
    }

    #[test]
    fn test_duplicate_rule_rejected() {
        let mut registry = RuleRegistry::new();
        registry
            .register(rule("a", "order", RuleCategory::Validation))
            .unwrap();
        let err = registry
            .register(rule("a", "customer", RuleCategory::Gate))
            .unwrap_err();
        assert!(matches!(err, CoreError::DuplicateRule { .. }));
    }

    #[test]
    fn test_clear() {
        let mut registry = RuleRegistry::new();
        registry
            .register(rule("a", "order", RuleCategory::Validation))
            .unwrap();
        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.rules_for("order", None).is_empty());
        registry
            .register(rule("a", "order", RuleCategory::Validation))
            .unwrap();
    }

    #[test]
    fn test_deserialize_rule_defaults() {
        let rule: Rule = serde_json::from_value(json!({
            "id": "order.deny_delete",
            "entity": "order",
            "category": "authorization",
            "when": {"type": "role", "roles": ["admin"]},
            "then": {"type": "allow"},
            "otherwise": {"type": "deny", "message": "admins only"}
        }))
        .unwrap();

        assert!(rule.enabled);
        assert_eq!(rule.priority, 0);
        assert!(rule.depends_on.is_empty());
        assert_eq!(rule.otherwise, Some(Action::deny("admins only")));
    }

    #[test]
    fn test_category_from_str() {
        assert_eq!("gate".parse::<RuleCategory>().unwrap(), RuleCategory::Gate);
        assert!("nope".parse::<RuleCategory>().is_err());
    }
}
