//! Hierarchical state machine.
//!
//! A [`StateMachine`] is built once from a validated [`StateMachineConfig`] and
//! shared read-only; only its history log is mutated. Transitions run the
//! guards, then optional gate rules, then exit/transition/entry actions in that
//! fixed order. Field changes are staged in [`TransitionResult::updates`] and
//! only become real when the caller applies them after a successful result.

mod definition;

pub use definition::{
    Guard, Region, SideEffect, SideEffectKind, State, StateAction, StateMachineConfig, StateTimeout,
    Transition,
};

use crate::action::log_at;
use crate::context::{Operation, TransitionContext};
use crate::error::{ActionError, CoreError, TransitionError, TriggerError};
use crate::expr::{ExprEngine, ExpressionEvaluator};
use crate::pipeline::RuleEngine;
use crate::runtime::{merge_updates, ActionRegistry};
use crate::trigger::{LoggingTriggers, TriggerContext, TriggerExecutor, TriggerOptions};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

/// Collaborators a machine runs against.
#[derive(Clone)]
pub struct MachineServices {
    pub expressions: Arc<dyn ExpressionEvaluator>,
    pub triggers: Arc<dyn TriggerExecutor>,
    /// Named actions for `invoke` state actions.
    pub actions: Arc<ActionRegistry>,
    /// Gate rules checked after the machine's own guards.
    pub gates: Option<RuleEngine>,
}

impl Default for MachineServices {
    fn default() -> Self {
        Self {
            expressions: Arc::new(ExprEngine::new()),
            triggers: Arc::new(LoggingTriggers),
            actions: Arc::new(ActionRegistry::new()),
            gates: None,
        }
    }
}

impl MachineServices {
    pub fn with_expressions(mut self, expressions: Arc<dyn ExpressionEvaluator>) -> Self {
        self.expressions = expressions;
        self
    }

    pub fn with_triggers(mut self, triggers: Arc<dyn TriggerExecutor>) -> Self {
        self.triggers = triggers;
        self
    }

    pub fn with_actions(mut self, actions: Arc<ActionRegistry>) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_gates(mut self, gates: RuleEngine) -> Self {
        self.gates = Some(gates);
        self
    }
}

/// A guard (or gate rule) that rejected a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardFailure {
    pub name: String,
    pub message: String,
}

/// Outcome of one side effect.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SideEffectResult {
    pub kind: SideEffectKind,
    pub trigger: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of [`StateMachine::transition`] or [`StateMachine::send`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionResult {
    pub success: bool,
    pub from_state: String,
    pub to_state: String,
    pub transition_name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub guards_failed: Vec<GuardFailure>,
    /// Executed actions tagged `exit:`, `transition:` or `entry:`.
    pub executed_actions: Vec<String>,
    pub side_effect_results: Vec<SideEffectResult>,
    /// Field updates to apply on success, including the governed state field.
    pub updates: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TransitionError>,
}

impl TransitionResult {
    fn new(from: &str, to: &str, name: &str) -> Self {
        Self {
            success: false,
            from_state: from.to_string(),
            to_state: to.to_string(),
            transition_name: name.to_string(),
            guards_failed: Vec::new(),
            executed_actions: Vec::new(),
            side_effect_results: Vec::new(),
            updates: Map::new(),
            error: None,
        }
    }

    fn failed(from: &str, name: &str, error: TransitionError) -> Self {
        let mut result = Self::new(from, from, name);
        result.error = Some(error);
        result
    }
}

/// One committed transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub from_state: String,
    pub to_state: String,
    pub transition_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

/// Validated and indexed state machine.
pub struct StateMachine {
    config: StateMachineConfig,
    services: MachineServices,
    /// State name -> index into `config.states`.
    states: HashMap<String, usize>,
    /// From state -> transition indices in declaration order.
    from_index: HashMap<String, Vec<usize>>,
    /// (from state, event) -> transition indices.
    event_index: HashMap<(String, String), Vec<usize>>,
    history: Mutex<Vec<StateHistoryEntry>>,
    checksum: String,
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("entity", &self.config.entity)
            .field("states", &self.config.states.len())
            .field("transitions", &self.config.transitions.len())
            .field("checksum", &self.checksum)
            .finish()
    }
}

impl StateMachine {
    /// Builds a machine with default services.
    pub fn new(config: StateMachineConfig) -> Result<Self, CoreError> {
        Self::with_services(config, MachineServices::default())
    }

    pub fn with_services(
        config: StateMachineConfig,
        services: MachineServices,
    ) -> Result<Self, CoreError> {
        config.validate()?;

        let states = config
            .states
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), i))
            .collect();

        let mut from_index: HashMap<String, Vec<usize>> = HashMap::new();
        let mut event_index: HashMap<(String, String), Vec<usize>> = HashMap::new();
        for (i, t) in config.transitions.iter().enumerate() {
            from_index.entry(t.from.clone()).or_default().push(i);
            if let Some(event) = &t.event {
                event_index
                    .entry((t.from.clone(), event.clone()))
                    .or_default()
                    .push(i);
            }
        }

        if config.has_regions() {
            tracing::warn!(
                entity = %config.entity,
                field = %config.field,
                "machine declares parallel regions; transitions resolve against the single field"
            );
        }

        let json_bytes = serde_json::to_vec(&config)?;
        let checksum = format!("{:08x}", crc32c::crc32c(&json_bytes));

        tracing::debug!(
            entity = %config.entity,
            states = config.states.len(),
            transitions = config.transitions.len(),
            checksum = %checksum,
            "state machine created"
        );

        Ok(Self {
            config,
            services,
            states,
            from_index,
            event_index,
            history: Mutex::new(Vec::new()),
            checksum,
        })
    }

    pub fn config(&self) -> &StateMachineConfig {
        &self.config
    }

    pub fn entity(&self) -> &str {
        &self.config.entity
    }

    /// Hash of the definition for integrity checks.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn state(&self, name: &str) -> Option<&State> {
        self.states.get(name).map(|&i| &self.config.states[i])
    }

    pub fn has_state(&self, name: &str) -> bool {
        self.states.contains_key(name)
    }

    /// First state flagged initial, else the first declared state.
    pub fn get_initial_state(&self) -> &str {
        self.config
            .states
            .iter()
            .find(|s| s.is_initial)
            .unwrap_or(&self.config.states[0])
            .name
            .as_str()
    }

    pub fn is_final(&self, state: &str) -> bool {
        self.state(state).map(|s| s.is_final).unwrap_or(false)
    }

    /// `[state, parent, grandparent, ...]`; empty for unknown states.
    pub fn get_state_hierarchy<'a>(&'a self, state: &'a str) -> Vec<&'a str> {
        let mut chain = Vec::new();
        let mut current = self.state(state);
        while let Some(s) = current {
            chain.push(s.name.as_str());
            current = s.parent.as_deref().and_then(|p| self.state(p));
        }
        chain
    }

    /// True when `ancestor` is a strict ancestor of `state`.
    pub fn is_descendant_of(&self, state: &str, ancestor: &str) -> bool {
        self.get_state_hierarchy(state)
            .iter()
            .skip(1)
            .any(|s| *s == ancestor)
    }

    fn direct_transition(&self, from: &str, name: &str) -> Option<&Transition> {
        self.from_index
            .get(from)?
            .iter()
            .map(|&i| &self.config.transitions[i])
            .find(|t| t.name == name)
    }

    /// Resolves the transition to take from `current`.
    ///
    /// With an event, candidates come from `current` and then each ancestor
    /// (event bubbling). Without one, all direct transitions are candidates.
    /// Candidates are ordered by priority; with a context the first one whose
    /// guards pass wins, otherwise the highest-priority candidate.
    pub fn find_transition(
        &self,
        current: &str,
        event: Option<&str>,
        ctx: Option<&TransitionContext>,
    ) -> Option<&Transition> {
        let mut candidates: Vec<&Transition> = match event {
            Some(event) => self
                .get_state_hierarchy(current)
                .into_iter()
                .filter_map(|s| self.event_index.get(&(s.to_string(), event.to_string())))
                .flatten()
                .map(|&i| &self.config.transitions[i])
                .collect(),
            None => self
                .from_index
                .get(current)
                .map(|ids| ids.iter().map(|&i| &self.config.transitions[i]).collect())
                .unwrap_or_default(),
        };
        // Stable, so nearer states win ties.
        candidates.sort_by_key(|t| std::cmp::Reverse(t.priority));

        match ctx {
            Some(ctx) => candidates
                .into_iter()
                .find(|t| self.failed_guards(t, current, ctx).is_empty()),
            None => candidates.into_iter().next(),
        }
    }

    fn failed_guards(
        &self,
        t: &Transition,
        current: &str,
        ctx: &TransitionContext,
    ) -> Vec<GuardFailure> {
        if t.guards.is_empty() {
            return Vec::new();
        }
        let scope = ctx.scope(current, t.target(current)).build();
        t.guards
            .iter()
            .filter(|guard| {
                match self.services.expressions.evaluate_boolean(&guard.expression, &scope) {
                    Ok(passed) => !passed,
                    Err(e) => {
                        tracing::warn!(
                            entity = %ctx.entity,
                            transition = %t.name,
                            guard = %guard.name,
                            error = %e,
                            "guard expression failed, denying"
                        );
                        true
                    }
                }
            })
            .map(|guard| GuardFailure {
                name: guard.name.clone(),
                message: guard.error_message.clone(),
            })
            .collect()
    }

    fn failed_gates(
        &self,
        t: &Transition,
        current: &str,
        ctx: &TransitionContext,
    ) -> Vec<GuardFailure> {
        let Some(gates) = &self.services.gates else {
            return Vec::new();
        };
        let result = gates.check_gates(&ctx.to_rule_context(), current, t.target(current));
        if result.passed {
            return Vec::new();
        }
        let mut failures: Vec<GuardFailure> = result
            .errors
            .into_iter()
            .map(|e| GuardFailure {
                name: e.rule_id.unwrap_or_else(|| "gate".to_string()),
                message: e.message,
            })
            .collect();
        if failures.is_empty() {
            failures.push(GuardFailure {
                name: result.stopped_by.unwrap_or_else(|| "gate".to_string()),
                message: "transition denied by gate rules".to_string(),
            });
        }
        failures
    }

    fn authorize(&self, t: &Transition, ctx: &TransitionContext) -> Result<(), TransitionError> {
        match &t.required_role {
            Some(role) if !ctx.has_role(role) => Err(TransitionError::Unauthorized {
                transition: t.name.clone(),
                role: role.clone(),
            }),
            _ => Ok(()),
        }
    }

    /// True if the named transition exists from `current` and would pass its
    /// role check, guards and gates.
    pub fn can_transition(&self, current: &str, name: &str, ctx: &TransitionContext) -> bool {
        match self.direct_transition(current, name) {
            Some(t) => {
                self.authorize(t, ctx).is_ok()
                    && self.failed_guards(t, current, ctx).is_empty()
                    && self.failed_gates(t, current, ctx).is_empty()
            }
            None => false,
        }
    }

    /// Direct transitions from `state` that `ctx` may take, highest priority first.
    pub fn available_transitions(&self, state: &str, ctx: &TransitionContext) -> Vec<&Transition> {
        let mut available: Vec<&Transition> = self
            .from_index
            .get(state)
            .into_iter()
            .flatten()
            .map(|&i| &self.config.transitions[i])
            .filter(|t| self.can_transition(state, &t.name, ctx))
            .collect();
        available.sort_by_key(|t| std::cmp::Reverse(t.priority));
        available
    }

    pub fn timeout_for(&self, state: &str) -> Option<&StateTimeout> {
        self.state(state)?.timeout.as_ref()
    }

    /// Timeout target if `state` has been held past its timeout.
    pub fn expired_timeout(
        &self,
        state: &str,
        entered_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<&str> {
        let timeout = self.timeout_for(state)?;
        let millis = i64::try_from(timeout.duration).unwrap_or(i64::MAX);
        let duration = chrono::Duration::milliseconds(millis);
        if now.signed_duration_since(entered_at) >= duration {
            Some(timeout.transition_to.as_str())
        } else {
            None
        }
    }

    /// `(region, initial state)` pairs for a compound state.
    pub fn region_initial_states(&self, state: &str) -> Vec<(&str, &str)> {
        self.state(state)
            .map(|s| {
                s.regions
                    .iter()
                    .map(|r| (r.name.as_str(), r.initial.as_str()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Takes the named transition out of `current`.
    pub async fn transition(
        &self,
        current: &str,
        name: &str,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        if !self.has_state(current) {
            return TransitionResult::failed(
                current,
                name,
                TransitionError::InvalidState {
                    state: current.to_string(),
                },
            );
        }
        let Some(t) = self.direct_transition(current, name) else {
            return TransitionResult::failed(
                current,
                name,
                TransitionError::TransitionNotFound {
                    state: current.to_string(),
                    transition: name.to_string(),
                },
            );
        };
        self.execute(current, t, ctx).await
    }

    /// Dispatches `event` from `current`, bubbling through ancestor states.
    pub async fn send(
        &self,
        current: &str,
        event: &str,
        ctx: &TransitionContext,
        payload: Option<Value>,
    ) -> TransitionResult {
        if !self.has_state(current) {
            return TransitionResult::failed(
                current,
                event,
                TransitionError::InvalidState {
                    state: current.to_string(),
                },
            );
        }

        let mut ctx = ctx.clone();
        ctx.event = Some(event.to_string());
        if payload.is_some() {
            ctx.event_payload = payload;
        }

        // When every candidate is guarded out, the top one reports its failures.
        let resolved = self
            .find_transition(current, Some(event), Some(&ctx))
            .or_else(|| self.find_transition(current, Some(event), None));

        match resolved {
            Some(t) => self.execute(current, t, &ctx).await,
            None => TransitionResult::failed(
                current,
                event,
                TransitionError::TransitionNotFound {
                    state: current.to_string(),
                    transition: event.to_string(),
                },
            ),
        }
    }

    async fn execute(
        &self,
        current: &str,
        t: &Transition,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let to = t.target(current);
        let mut result = TransitionResult::new(current, to, &t.name);

        if let Err(e) = self.authorize(t, ctx) {
            tracing::debug!(entity = %ctx.entity, transition = %t.name, "transition unauthorized");
            result.to_state = current.to_string();
            result.error = Some(e);
            return result;
        }

        let mut failures = self.failed_guards(t, current, ctx);
        if failures.is_empty() {
            failures = self.failed_gates(t, current, ctx);
        }
        if !failures.is_empty() {
            tracing::debug!(
                entity = %ctx.entity,
                entity_id = %ctx.entity_id,
                transition = %t.name,
                failed = failures.len(),
                "transition blocked by guards"
            );
            result.to_state = current.to_string();
            result.guards_failed = failures;
            return result;
        }

        let mut staged = ctx.clone();
        let mut phases: Vec<(&'static str, &[StateAction])> = Vec::with_capacity(3);
        if !t.internal {
            if let Some(state) = self.state(current) {
                phases.push(("exit", state.on_exit.as_slice()));
            }
        }
        phases.push(("transition", t.actions.as_slice()));
        if !t.internal {
            if let Some(state) = self.state(to) {
                phases.push(("entry", state.on_entry.as_slice()));
            }
        }

        for (phase, actions) in phases {
            for action in actions {
                match self.run_action(action, t, current, &mut staged, &mut result.updates).await {
                    Ok(()) => result
                        .executed_actions
                        .push(format!("{}:{}", phase, action.label())),
                    Err(source) => {
                        tracing::error!(
                            entity = %ctx.entity,
                            entity_id = %ctx.entity_id,
                            transition = %t.name,
                            phase,
                            error = %source,
                            "transition action failed"
                        );
                        result.updates.clear();
                        result.error = Some(TransitionError::ActionFailed { phase, source });
                        return result;
                    }
                }
            }
        }

        result
            .updates
            .insert(self.config.field.clone(), Value::String(to.to_string()));
        merge_updates(&mut staged.data, &result.updates);

        for effect in &t.side_effects {
            let outcome = self.dispatch_side_effect(effect, t, current, &staged).await;
            result.side_effect_results.push(outcome);
        }

        if self.config.track_history {
            self.history.lock().push(StateHistoryEntry {
                timestamp: Utc::now(),
                from_state: current.to_string(),
                to_state: to.to_string(),
                transition_name: t.name.clone(),
                event: ctx.event.clone(),
                user_id: ctx.user_id.clone(),
                metadata: (!ctx.metadata.is_empty()).then(|| ctx.metadata.clone()),
            });
        }

        tracing::info!(
            entity = %ctx.entity,
            entity_id = %ctx.entity_id,
            transition = %t.name,
            from = current,
            to,
            "transition committed"
        );

        result.success = true;
        result
    }

    async fn run_action(
        &self,
        action: &StateAction,
        t: &Transition,
        current: &str,
        staged: &mut TransitionContext,
        updates: &mut Map<String, Value>,
    ) -> Result<(), ActionError> {
        let produced = match action {
            StateAction::SetField { field, value } => {
                let mut m = Map::new();
                m.insert(field.clone(), value.clone());
                m
            }
            StateAction::Compute { field, expression } => {
                let scope = staged.scope(current, t.target(current)).build();
                let value = self
                    .services
                    .expressions
                    .evaluate(expression, &scope)
                    .map_err(|source| ActionError::Expression {
                        field: field.clone(),
                        source,
                    })?;
                let mut m = Map::new();
                m.insert(field.clone(), value);
                m
            }
            StateAction::Trigger { trigger, payload } => {
                let trigger_ctx = self
                    .trigger_context(trigger, payload.as_ref(), t, current, staged)
                    .map_err(|source| ActionError::Trigger {
                        trigger: trigger.clone(),
                        source,
                    })?;
                self.services
                    .triggers
                    .execute_triggers(trigger_ctx)
                    .await
                    .map_err(|source| ActionError::Trigger {
                        trigger: trigger.clone(),
                        source,
                    })?;
                Map::new()
            }
            StateAction::Log { level, message } => {
                log_at(*level, &t.name, &staged.entity, message);
                Map::new()
            }
            StateAction::Invoke { name } => {
                self.services
                    .actions
                    .invoke(&staged.entity, name, staged)
                    .await?
            }
            StateAction::Unknown => {
                tracing::warn!(transition = %t.name, "unknown state action type, skipped");
                Map::new()
            }
        };

        merge_updates(&mut staged.data, &produced);
        updates.extend(produced);
        Ok(())
    }

    fn trigger_context(
        &self,
        trigger: &str,
        payload: Option<&Value>,
        t: &Transition,
        current: &str,
        ctx: &TransitionContext,
    ) -> Result<TriggerContext, TriggerError> {
        let payload = match payload {
            None | Some(Value::Object(_)) => payload.cloned(),
            Some(other) => {
                return Err(TriggerError::MalformedPayload {
                    reason: format!("expected an object, got {}", crate::expr::kind(other)),
                })
            }
        };

        let mut metadata = ctx.metadata.clone();
        metadata.insert("transition".into(), Value::String(t.name.clone()));
        metadata.insert("fromState".into(), Value::String(current.to_string()));
        metadata.insert("toState".into(), Value::String(t.target(current).to_string()));

        Ok(TriggerContext::new(
            ctx.entity.clone(),
            Operation::Transition,
            ctx.entity_id.clone(),
            ctx.data.clone(),
            TriggerOptions {
                trigger_id: Some(trigger.to_string()),
                user_id: ctx.user_id.clone(),
                previous_data: ctx.previous_data.clone(),
                payload,
                metadata,
            },
        ))
    }

    async fn dispatch_side_effect(
        &self,
        effect: &SideEffect,
        t: &Transition,
        current: &str,
        ctx: &TransitionContext,
    ) -> SideEffectResult {
        let trigger = effect.trigger_id().to_string();
        let trigger_ctx =
            self.trigger_context(&trigger, effect.payload.as_ref(), t, current, ctx);
        let dispatched = match trigger_ctx {
            Ok(mut trigger_ctx) => {
                trigger_ctx
                    .metadata
                    .insert("sideEffect".into(), Value::String(effect.kind.as_str().into()));
                self.services.triggers.execute_triggers(trigger_ctx).await
            }
            Err(e) => Err(e),
        };

        match dispatched {
            Ok(()) => SideEffectResult {
                kind: effect.kind,
                trigger,
                success: true,
                error: None,
            },
            Err(e) => {
                tracing::warn!(
                    entity = %ctx.entity,
                    entity_id = %ctx.entity_id,
                    transition = %t.name,
                    side_effect = effect.kind.as_str(),
                    error = %e,
                    "side effect failed"
                );
                SideEffectResult {
                    kind: effect.kind,
                    trigger,
                    success: false,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Committed transitions, oldest first.
    pub fn history(&self) -> Vec<StateHistoryEntry> {
        self.history.lock().clone()
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
    }

    /// Renders the machine as a Mermaid state diagram.
    pub fn to_mermaid(&self) -> String {
        let mut out = String::from("stateDiagram-v2\n");
        let _ = writeln!(out, "    [*] --> {}", self.get_initial_state());

        for state in &self.config.states {
            if state.display_name.is_some() {
                let _ = writeln!(out, "    {} : {}", state.name, state.label());
            }
        }

        for t in &self.config.transitions {
            let label = match &t.event {
                Some(event) => format!("{} ({})", t.name, event),
                None => t.name.clone(),
            };
            let _ = writeln!(out, "    {} --> {} : {}", t.from, t.target(&t.from), label);
        }

        for state in self.config.states.iter().filter(|s| s.is_final) {
            let _ = writeln!(out, "    {} --> [*]", state.name);
        }

        for state in &self.config.states {
            if let Some(parent) = &state.parent {
                let _ = writeln!(out, "    note right of {} : in {}", state.name, parent);
            }
        }
        out
    }
}
