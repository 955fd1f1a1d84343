//! Rule evaluation pipeline.
//!
//! Selects the rules for an entity, orders them by dependency with a priority
//! tie-break, then evaluates `when` and executes `then`/`otherwise` for each.

use crate::action::{Accumulator, Action, ActionExecutor, Confirmation, ValidationError};
use crate::condition::{ConditionEvaluator, CustomFunctions};
use crate::context::RuleContext;
use crate::expr::{ExprEngine, ExpressionEvaluator};
use crate::rule::{Rule, RuleCategory, RuleRegistry};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

/// Options for [`RuleEngine::evaluate_rules`].
#[derive(Debug, Clone)]
pub struct EvaluateOptions {
    /// Restrict to these categories; `None` selects every category.
    pub categories: Option<Vec<RuleCategory>>,
    /// Skip remaining rules once a rule stops the pipeline.
    pub stop_on_first_deny: bool,
}

impl Default for EvaluateOptions {
    fn default() -> Self {
        Self {
            categories: None,
            stop_on_first_deny: true,
        }
    }
}

impl EvaluateOptions {
    pub fn categories(categories: &[RuleCategory]) -> Self {
        Self {
            categories: Some(categories.to_vec()),
            ..Self::default()
        }
    }

    pub fn stop_on_first_deny(mut self, stop: bool) -> Self {
        self.stop_on_first_deny = stop;
        self
    }
}

/// Outcome of one rule.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleResult {
    pub rule_id: String,
    pub matched: bool,
    /// Kind of the action that ran, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_us: u64,
}

/// Aggregated outcome of a pipeline run.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    pub passed: bool,
    pub results: Vec<RuleResult>,
    pub errors: Vec<ValidationError>,
    pub transformations: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires_confirmation: Option<Confirmation>,
    /// Rule whose action stopped the pipeline early.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_by: Option<String>,
    pub duration_us: u64,
}

/// Dependency-respecting execution order.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOrder {
    pub rules: Vec<Arc<Rule>>,
    /// Rule ids re-entered while still being visited, one entry per detection.
    pub cycles: Vec<String>,
}

impl ExecutionOrder {
    pub fn ids(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.id.as_str()).collect()
    }
}

/// Orders candidates so every rule follows its in-set dependencies.
///
/// Candidates are sorted by priority (descending, stable) and visited depth
/// first. A rule re-entered while still on the visit stack closes a cycle; the
/// cycle is logged and broken by treating that rule as already placed.
pub fn execution_order(candidates: Vec<Arc<Rule>>) -> ExecutionOrder {
    let mut sorted = candidates;
    sorted.sort_by_key(|r| std::cmp::Reverse(r.priority));

    let index: HashMap<&str, &Arc<Rule>> = sorted.iter().map(|r| (r.id.as_str(), r)).collect();

    let mut sorter = TopoSort {
        index: &index,
        visited: HashSet::new(),
        visiting: HashSet::new(),
        order: ExecutionOrder::default(),
    };
    for rule in &sorted {
        sorter.visit(rule);
    }
    sorter.order
}

struct TopoSort<'a> {
    index: &'a HashMap<&'a str, &'a Arc<Rule>>,
    visited: HashSet<&'a str>,
    visiting: HashSet<&'a str>,
    order: ExecutionOrder,
}

impl<'a> TopoSort<'a> {
    fn visit(&mut self, rule: &'a Arc<Rule>) {
        let id = rule.id.as_str();
        if self.visited.contains(id) {
            return;
        }
        if self.visiting.contains(id) {
            tracing::warn!(rule_id = %id, "dependency cycle detected, breaking at rule");
            self.order.cycles.push(id.to_string());
            return;
        }

        self.visiting.insert(id);
        let index = self.index;
        for dep in &rule.depends_on {
            match index.get(dep.as_str()) {
                Some(dep_rule) => self.visit(*dep_rule),
                None => tracing::debug!(
                    rule_id = %id,
                    dependency = %dep,
                    "dependency not among candidates"
                ),
            }
        }
        self.visiting.remove(id);
        self.visited.insert(id);
        self.order.rules.push(rule.clone());
    }
}

/// Evaluates registered rules against contexts.
#[derive(Clone)]
pub struct RuleEngine {
    registry: Arc<RuleRegistry>,
    functions: Arc<CustomFunctions>,
    expressions: Arc<dyn ExpressionEvaluator>,
}

impl RuleEngine {
    /// Creates an engine with the default expression evaluator and no custom functions.
    pub fn new(registry: Arc<RuleRegistry>) -> Self {
        Self::with_services(
            registry,
            Arc::new(CustomFunctions::new()),
            Arc::new(ExprEngine::new()),
        )
    }

    pub fn with_services(
        registry: Arc<RuleRegistry>,
        functions: Arc<CustomFunctions>,
        expressions: Arc<dyn ExpressionEvaluator>,
    ) -> Self {
        Self {
            registry,
            functions,
            expressions,
        }
    }

    pub fn registry(&self) -> &RuleRegistry {
        &self.registry
    }

    pub fn expressions(&self) -> &Arc<dyn ExpressionEvaluator> {
        &self.expressions
    }

    /// Enabled rules for an entity in execution order.
    pub fn execution_order(
        &self,
        entity: &str,
        categories: Option<&[RuleCategory]>,
    ) -> ExecutionOrder {
        let candidates = self
            .registry
            .rules_for(entity, categories)
            .into_iter()
            .filter(|r| r.enabled)
            .collect();
        execution_order(candidates)
    }

    /// Runs the pipeline for `ctx.entity`.
    pub fn evaluate_rules(&self, ctx: &RuleContext, options: &EvaluateOptions) -> EvaluationResult {
        let started = Instant::now();
        let order = self.execution_order(&ctx.entity, options.categories.as_deref());

        let conditions = ConditionEvaluator::new(self.expressions.as_ref(), &self.functions);
        let actions = ActionExecutor::new(self.expressions.as_ref());

        let mut acc = Accumulator::default();
        let mut results = Vec::with_capacity(order.rules.len());
        let mut denied = false;
        let mut stopped_by = None;

        for rule in &order.rules {
            let rule_started = Instant::now();
            let matched = conditions.evaluate(&rule.when, ctx);
            let chosen: Option<&Action> = if matched {
                Some(&rule.then)
            } else {
                rule.otherwise.as_ref()
            };

            let mut error = None;
            let mut stop = false;
            if let Some(action) = chosen {
                match actions.execute(action, &rule.id, ctx, &mut acc) {
                    Ok(signal) => {
                        denied |= signal.denied;
                        stop = signal.stop;
                    }
                    Err(e) => {
                        tracing::error!(
                            rule_id = %rule.id,
                            entity = %ctx.entity,
                            error = %e,
                            "rule action failed"
                        );
                        error = Some(e.to_string());
                    }
                }
            }

            results.push(RuleResult {
                rule_id: rule.id.clone(),
                matched,
                action: chosen.map(Action::kind),
                error,
                duration_us: rule_started.elapsed().as_micros() as u64,
            });

            if stop && options.stop_on_first_deny {
                stopped_by = Some(rule.id.clone());
                tracing::debug!(
                    rule_id = %rule.id,
                    skipped = order.rules.len() - results.len(),
                    "pipeline stopped"
                );
                break;
            }
        }

        let passed = !denied && acc.errors.is_empty();
        tracing::debug!(
            entity = %ctx.entity,
            operation = ctx.operation.as_str(),
            rules = results.len(),
            passed,
            "rules evaluated"
        );

        EvaluationResult {
            passed,
            results,
            errors: acc.errors,
            transformations: acc.transformations,
            requires_confirmation: acc.requires_confirmation,
            stopped_by,
            duration_us: started.elapsed().as_micros() as u64,
        }
    }

    /// Runs validation rules without stopping so every error is reported.
    pub fn validate_data(&self, ctx: &RuleContext) -> EvaluationResult {
        self.evaluate_rules(
            ctx,
            &EvaluateOptions::categories(&[RuleCategory::Validation]).stop_on_first_deny(false),
        )
    }

    pub fn check_authorization(&self, ctx: &RuleContext) -> EvaluationResult {
        self.evaluate_rules(ctx, &EvaluateOptions::categories(&[RuleCategory::Authorization]))
    }

    pub fn check_constraints(&self, ctx: &RuleContext) -> EvaluationResult {
        self.evaluate_rules(ctx, &EvaluateOptions::categories(&[RuleCategory::Constraint]))
    }

    /// Runs gate rules for a state change; `fromState`/`toState` are added to metadata.
    pub fn check_gates(
        &self,
        ctx: &RuleContext,
        from_state: &str,
        to_state: &str,
    ) -> EvaluationResult {
        let ctx = ctx
            .clone()
            .with_metadata("fromState", from_state)
            .with_metadata("toState", to_state);
        self.evaluate_rules(&ctx, &EvaluateOptions::categories(&[RuleCategory::Gate]))
    }

    /// Runs computed and default rules and returns only the staged values.
    pub fn compute_fields(&self, ctx: &RuleContext) -> Map<String, Value> {
        self.evaluate_rules(
            ctx,
            &EvaluateOptions::categories(&[RuleCategory::Computed, RuleCategory::Default]),
        )
        .transformations
    }
}
