//! Named guard and action registries.
//!
//! Guards and actions are registered under `(entity, name)` at startup and
//! referenced by name from transition plans or `invoke` state actions. A name
//! that was never registered resolves to a denied guard or a failed action.

use crate::context::TransitionContext;
use crate::error::ActionError;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;

type Key = (String, String);

fn key(entity: &str, name: &str) -> Key {
    (entity.to_string(), name.to_string())
}

/// Outcome of a named guard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuardOutcome {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl GuardOutcome {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Outcome of a named action.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActionOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Field updates staged by the action.
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub updates: Map<String, Value>,
}

impl ActionOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn with_update(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.updates.insert(field.to_string(), value.into());
        self
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            updates: Map::new(),
        }
    }
}

/// A synchronous transition guard.
pub trait TransitionGuard: Send + Sync {
    fn check(&self, ctx: &TransitionContext) -> GuardOutcome;
}

impl<F> TransitionGuard for F
where
    F: Fn(&TransitionContext) -> GuardOutcome + Send + Sync,
{
    fn check(&self, ctx: &TransitionContext) -> GuardOutcome {
        self(ctx)
    }
}

/// An asynchronous transition action.
#[async_trait]
pub trait TransitionAction: Send + Sync {
    async fn run(&self, ctx: &TransitionContext) -> ActionOutcome;
}

/// Adapts an async closure into a [`TransitionAction`].
pub struct FnAction<F>(pub F);

#[async_trait]
impl<F, Fut> TransitionAction for FnAction<F>
where
    F: Fn(TransitionContext) -> Fut + Send + Sync,
    Fut: Future<Output = ActionOutcome> + Send,
{
    async fn run(&self, ctx: &TransitionContext) -> ActionOutcome {
        (self.0)(ctx.clone()).await
    }
}

/// Guards keyed by `(entity, name)`.
#[derive(Default)]
pub struct GuardRegistry {
    guards: DashMap<Key, Arc<dyn TransitionGuard>>,
}

impl GuardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, entity: &str, name: &str, guard: impl TransitionGuard + 'static) {
        tracing::debug!(entity, guard = name, "registered guard");
        self.guards.insert(key(entity, name), Arc::new(guard));
    }

    pub fn contains(&self, entity: &str, name: &str) -> bool {
        self.guards.contains_key(&key(entity, name))
    }

    /// Runs a guard. Unregistered names deny.
    pub fn check(&self, entity: &str, name: &str, ctx: &TransitionContext) -> GuardOutcome {
        // Clone out of the map so no shard lock is held while the guard runs.
        let guard = self.guards.get(&key(entity, name)).map(|g| g.clone());
        match guard {
            Some(guard) => guard.check(ctx),
            None => {
                tracing::warn!(entity, guard = name, "guard not registered, denying");
                GuardOutcome::deny(format!("guard '{}' is not registered", name))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }
}

/// Actions keyed by `(entity, name)`.
#[derive(Default)]
pub struct ActionRegistry {
    actions: DashMap<Key, Arc<dyn TransitionAction>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, entity: &str, name: &str, action: impl TransitionAction + 'static) {
        tracing::debug!(entity, action = name, "registered action");
        self.actions.insert(key(entity, name), Arc::new(action));
    }

    pub fn contains(&self, entity: &str, name: &str) -> bool {
        self.actions.contains_key(&key(entity, name))
    }

    /// Runs an action and returns its staged updates.
    pub async fn invoke(
        &self,
        entity: &str,
        name: &str,
        ctx: &TransitionContext,
    ) -> Result<Map<String, Value>, ActionError> {
        let action = self.actions.get(&key(entity, name)).map(|a| a.clone());
        let Some(action) = action else {
            tracing::warn!(entity, action = name, "action not registered");
            return Err(ActionError::NotRegistered {
                entity: entity.to_string(),
                name: name.to_string(),
            });
        };

        let outcome = action.run(ctx).await;
        if outcome.success {
            Ok(outcome.updates)
        } else {
            Err(ActionError::Failed {
                name: name.to_string(),
                reason: outcome.error.unwrap_or_else(|| "action reported failure".into()),
            })
        }
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Named steps of a table-driven transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionPlan {
    pub guards: Vec<String>,
    pub exit_actions: Vec<String>,
    pub actions: Vec<String>,
    pub entry_actions: Vec<String>,
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl TransitionPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guards(mut self, guards: &[&str]) -> Self {
        self.guards = names(guards);
        self
    }

    pub fn exit(mut self, actions: &[&str]) -> Self {
        self.exit_actions = names(actions);
        self
    }

    pub fn actions(mut self, actions: &[&str]) -> Self {
        self.actions = names(actions);
        self
    }

    pub fn entry(mut self, actions: &[&str]) -> Self {
        self.entry_actions = names(actions);
        self
    }

    fn phases(&self) -> [(&'static str, &[String]); 3] {
        [
            ("exit", self.exit_actions.as_slice()),
            ("transition", self.actions.as_slice()),
            ("entry", self.entry_actions.as_slice()),
        ]
    }
}

/// Result of [`Runtime::execute_transition`].
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanOutcome {
    pub success: bool,
    /// Step that stopped execution, e.g. `guard:has_stock` or `entry:notify`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub executed: Vec<String>,
    pub updates: Map<String, Value>,
}

/// Executes transition plans against the named registries.
#[derive(Clone, Default)]
pub struct Runtime {
    guards: Arc<GuardRegistry>,
    actions: Arc<ActionRegistry>,
}

impl Runtime {
    pub fn new(guards: Arc<GuardRegistry>, actions: Arc<ActionRegistry>) -> Self {
        Self { guards, actions }
    }

    pub fn guards(&self) -> &Arc<GuardRegistry> {
        &self.guards
    }

    pub fn actions(&self) -> &Arc<ActionRegistry> {
        &self.actions
    }

    /// First failing guard of the plan, or an allow outcome.
    pub fn can_transition(
        &self,
        entity: &str,
        plan: &TransitionPlan,
        ctx: &TransitionContext,
    ) -> GuardOutcome {
        for name in &plan.guards {
            let outcome = self.guards.check(entity, name, ctx);
            if !outcome.allowed {
                return outcome;
            }
        }
        GuardOutcome::allow()
    }

    /// Runs guards, then exit, transition and entry actions, stopping at the
    /// first failing step.
    pub async fn execute_transition(
        &self,
        entity: &str,
        plan: &TransitionPlan,
        ctx: &TransitionContext,
    ) -> PlanOutcome {
        let mut outcome = PlanOutcome::default();

        for name in &plan.guards {
            let check = self.guards.check(entity, name, ctx);
            if !check.allowed {
                tracing::debug!(entity, guard = %name, "transition blocked by guard");
                outcome.failed_step = Some(format!("guard:{}", name));
                outcome.error = check.reason;
                return outcome;
            }
        }

        let mut staged = ctx.clone();
        for (phase, actions) in plan.phases() {
            for name in actions {
                match self.actions.invoke(entity, name, &staged).await {
                    Ok(updates) => {
                        merge_updates(&mut staged.data, &updates);
                        outcome.updates.extend(updates);
                        outcome.executed.push(format!("{}:{}", phase, name));
                    }
                    Err(e) => {
                        tracing::warn!(
                            entity,
                            phase,
                            action = %name,
                            error = %e,
                            "transition action failed"
                        );
                        outcome.failed_step = Some(format!("{}:{}", phase, name));
                        outcome.error = Some(e.to_string());
                        outcome.updates.clear();
                        return outcome;
                    }
                }
            }
        }

        outcome.success = true;
        outcome
    }

    /// Convenience wrapper bound to one entity.
    pub fn entity(&self, entity: impl Into<String>) -> EntityLifecycle<'_> {
        EntityLifecycle {
            runtime: self,
            entity: entity.into(),
        }
    }
}

/// Overlays staged updates onto an entity's data.
pub(crate) fn merge_updates(data: &mut Value, updates: &Map<String, Value>) {
    if updates.is_empty() {
        return;
    }
    if !data.is_object() {
        *data = Value::Object(Map::new());
    }
    if let Value::Object(map) = data {
        for (k, v) in updates {
            map.insert(k.clone(), v.clone());
        }
    }
}

/// Per-entity `can_transition` / `execute_transition` pair.
pub struct EntityLifecycle<'a> {
    runtime: &'a Runtime,
    entity: String,
}

impl EntityLifecycle<'_> {
    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn can_transition(&self, plan: &TransitionPlan, ctx: &TransitionContext) -> GuardOutcome {
        self.runtime.can_transition(&self.entity, plan, ctx)
    }

    pub async fn execute_transition(
        &self,
        plan: &TransitionPlan,
        ctx: &TransitionContext,
    ) -> PlanOutcome {
        self.runtime.execute_transition(&self.entity, plan, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx(total: i64) -> TransitionContext {
        TransitionContext::new("order", "o-1", json!({"total": total}))
            .with_user("u-1", &["client"])
    }

    fn runtime() -> Runtime {
        let guards = GuardRegistry::new();
        guards.register("order", "has_total", |ctx: &TransitionContext| {
            if ctx.data["total"].as_i64().unwrap_or(0) > 0 {
                GuardOutcome::allow()
            } else {
                GuardOutcome::deny("order is empty")
            }
        });
        guards.register("order", "is_client", |ctx: &TransitionContext| {
            if ctx.has_role("client") {
                GuardOutcome::allow()
            } else {
                GuardOutcome::deny("clients only")
            }
        });

        let actions = ActionRegistry::new();
        actions.register(
            "order",
            "reserve",
            FnAction(|_ctx: TransitionContext| async {
                ActionOutcome::ok().with_update("reserved", true)
            }),
        );
        actions.register(
            "order",
            "stamp",
            FnAction(|ctx: TransitionContext| async move {
                // sees updates staged by earlier steps
                let reserved = ctx.data["reserved"].as_bool().unwrap_or(false);
                ActionOutcome::ok().with_update("stamped", reserved)
            }),
        );
        actions.register(
            "order",
            "explode",
            FnAction(|_ctx: TransitionContext| async {
                ActionOutcome::failed("warehouse offline")
            }),
        );

        Runtime::new(Arc::new(guards), Arc::new(actions))
    }

    #[tokio::test]
    async fn test_execute_runs_phases_in_order() {
        let rt = runtime();
        let plan = TransitionPlan::new()
            .guards(&["has_total", "is_client"])
            .exit(&["reserve"])
            .entry(&["stamp"]);

        let outcome = rt.execute_transition("order", &plan, &ctx(10)).await;
        assert!(outcome.success);
        assert_eq!(outcome.executed, vec!["exit:reserve", "entry:stamp"]);
        assert_eq!(outcome.updates["reserved"], true);
        assert_eq!(outcome.updates["stamped"], true);
    }

    #[tokio::test]
    async fn test_guard_failure_short_circuits() {
        let rt = runtime();
        let plan = TransitionPlan::new().guards(&["has_total"]).actions(&["reserve"]);

        let outcome = rt.execute_transition("order", &plan, &ctx(0)).await;
        assert!(!outcome.success);
        assert_eq!(outcome.failed_step.as_deref(), Some("guard:has_total"));
        assert_eq!(outcome.error.as_deref(), Some("order is empty"));
        assert!(outcome.executed.is_empty());
    }

    #[tokio::test]
    async fn test_action_failure_stops_later_phases() {
        let rt = runtime();
        let plan = TransitionPlan::new()
            .exit(&["reserve"])
            .actions(&["explode"])
            .entry(&["stamp"]);

        let outcome = rt.execute_transition("order", &plan, &ctx(5)).await;
        assert!(!outcome.success);
        assert_eq!(outcome.failed_step.as_deref(), Some("transition:explode"));
        assert_eq!(outcome.executed, vec!["exit:reserve"]);
        assert!(outcome.updates.is_empty());
        assert!(outcome.error.unwrap().contains("warehouse offline"));
    }

    #[tokio::test]
    async fn test_unregistered_names_fail_soft() {
        let rt = runtime();

        let plan = TransitionPlan::new().guards(&["missing"]);
        let check = rt.can_transition("order", &plan, &ctx(5));
        assert!(!check.allowed);

        let outcome = rt
            .execute_transition("order", &TransitionPlan::new().actions(&["missing"]), &ctx(5))
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("not registered"));

        // Registries are entity-scoped.
        let plan = TransitionPlan::new().guards(&["has_total"]);
        let check = rt.can_transition("invoice", &plan, &ctx(5));
        assert!(!check.allowed);
    }

    #[tokio::test]
    async fn test_entity_lifecycle_wrapper() {
        let rt = runtime();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        rt.actions().register(
            "order",
            "count",
            FnAction(move |_ctx: TransitionContext| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    ActionOutcome::ok()
                }
            }),
        );

        let orders = rt.entity("order");
        let plan = TransitionPlan::new().guards(&["is_client"]).actions(&["count"]);
        assert!(orders.can_transition(&plan, &ctx(1)).allowed);

        let outcome = orders.execute_transition(&plan, &ctx(1)).await;
        assert!(outcome.success);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(orders.entity(), "order");
    }

    #[test]
    fn test_merge_updates_replaces_non_object() {
        let mut data = json!(null);
        let mut updates = Map::new();
        updates.insert("a".into(), json!(1));
        merge_updates(&mut data, &updates);
        assert_eq!(data, json!({"a": 1}));
    }
}
