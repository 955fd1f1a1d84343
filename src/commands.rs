//! Command execution.

use crate::config::Config;
use crate::definitions::Definitions;
use crate::{Commands, ContextArgs};
use colored::Colorize;
use rulegate_core::{
    EvaluateOptions, EvaluationResult, ExprEngine, Operation, RuleCategory, RuleContext,
    TransitionContext, TransitionResult,
};
use serde_json::Value;
use std::fmt::Write as _;

type CommandResult = Result<String, Box<dyn std::error::Error>>;

/// Executes a command and returns the formatted output.
pub async fn execute(defs: &Definitions, config: &Config, cmd: Commands) -> CommandResult {
    match cmd {
        Commands::Check => check(defs),

        Commands::Order { entity, categories } => {
            let categories = parse_categories(&categories)?;
            let order = defs.engine.execution_order(&entity, categories.as_deref());
            if order.rules.is_empty() {
                return Ok(format!("No rules for entity {}", entity.cyan()).yellow().to_string());
            }

            let header = format!("Execution order for {}", entity.cyan());
            let mut output = format!("{}\n", header.bold());
            for (i, rule) in order.rules.iter().enumerate() {
                let _ = writeln!(
                    output,
                    "  {:>3}. {} [{}] priority {}",
                    i + 1,
                    rule.id.cyan(),
                    rule.category.as_str(),
                    rule.priority
                );
            }
            for id in &order.cycles {
                let _ = writeln!(output, "  {}: dependency cycle at {}", "Warning".yellow(), id);
            }
            Ok(output.trim_end().to_string())
        }

        Commands::Eval {
            entity,
            operation,
            categories,
            no_stop,
            ctx,
        } => {
            let operation: Operation = operation.parse()?;
            let rule_ctx = rule_context(&entity, operation, &ctx)?;
            let options = EvaluateOptions {
                categories: parse_categories(&categories)?,
                stop_on_first_deny: config.engine.stop_on_first_deny && !no_stop,
            };
            let result = defs.engine.evaluate_rules(&rule_ctx, &options);
            format_evaluation(&result)
        }

        Commands::Mermaid { machine } => Ok(defs.machine(&machine)?.to_mermaid()),

        Commands::Transition {
            machine,
            state,
            name,
            id,
            ctx,
        } => {
            let machine = defs.machine(&machine)?;
            let tctx = transition_context(machine.entity(), &id, &ctx)?;
            let result = machine.transition(&state, &name, &tctx).await;
            format_transition(&result)
        }

        Commands::Send {
            machine,
            state,
            event,
            payload,
            id,
            ctx,
        } => {
            let machine = defs.machine(&machine)?;
            let tctx = transition_context(machine.entity(), &id, &ctx)?;
            let payload = payload.as_deref().map(parse_json_arg).transpose()?;
            let result = machine.send(&state, &event, &tctx, payload).await;
            format_transition(&result)
        }
    }
}

/// Reports rule counts, dependency cycles, missing dependencies and
/// unparsable expressions.
fn check(defs: &Definitions) -> CommandResult {
    let registry = defs.engine.registry();
    let parser = ExprEngine::new();
    let mut problems = 0usize;
    let mut output = String::new();

    for entity in registry.entities() {
        let rules = registry.rules_for(entity, None);
        let order = defs.engine.execution_order(entity, None);
        let _ = writeln!(output, "{} {} ({} rules)", "Entity".bold(), entity.cyan(), rules.len());

        for id in &order.cycles {
            problems += 1;
            let _ = writeln!(output, "  {}: dependency cycle at {}", "Warning".yellow(), id);
        }

        for rule in &rules {
            for dep in &rule.depends_on {
                if registry.get(dep).is_none() {
                    problems += 1;
                    let _ = writeln!(
                        output,
                        "  {}: {} depends on unknown rule {}",
                        "Warning".yellow(),
                        rule.id,
                        dep
                    );
                }
            }

            let mut expressions = Vec::new();
            rule.when.expressions(&mut expressions);
            expressions.extend(rule.then.expressions());
            if let Some(otherwise) = &rule.otherwise {
                expressions.extend(otherwise.expressions());
            }
            for expr in expressions {
                if let Err(e) = parser.compile(expr) {
                    problems += 1;
                    let _ = writeln!(output, "  {}: {} `{}`: {}", "Error".red(), rule.id, expr, e);
                }
            }
        }
    }

    for machine in defs.machines() {
        let config = machine.config();
        let _ = writeln!(
            output,
            "{} {} ({} states, {} transitions, checksum {})",
            "Machine".bold(),
            config.entity.cyan(),
            config.states.len(),
            config.transitions.len(),
            machine.checksum()
        );

        for t in &config.transitions {
            for guard in &t.guards {
                if let Err(e) = parser.compile(&guard.expression) {
                    problems += 1;
                    let _ = writeln!(
                        output,
                        "  {}: {}/{} `{}`: {}",
                        "Error".red(),
                        t.name,
                        guard.name,
                        guard.expression,
                        e
                    );
                }
            }
        }

        if config.has_regions() {
            let _ = writeln!(
                output,
                "  {}: parallel regions are validated but not tracked independently",
                "Note".dimmed()
            );
        }
    }

    if problems == 0 {
        let _ = write!(output, "{}", "OK".green());
    } else {
        let _ = write!(output, "{} problem(s) found", problems.to_string().yellow());
    }
    Ok(output)
}

fn parse_categories(
    raw: &[String],
) -> Result<Option<Vec<RuleCategory>>, Box<dyn std::error::Error>> {
    if raw.is_empty() {
        return Ok(None);
    }
    let categories = raw
        .iter()
        .map(|c| c.parse::<RuleCategory>())
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(categories))
}

fn rule_context(
    entity: &str,
    operation: Operation,
    args: &ContextArgs,
) -> Result<RuleContext, Box<dyn std::error::Error>> {
    let mut ctx = RuleContext::new(entity, operation, parse_json_arg(&args.data)?);
    ctx.previous_data = args.previous.as_deref().map(parse_json_arg).transpose()?;
    ctx.user_id = args.user.clone();
    ctx.user_roles = args.roles.clone();
    Ok(ctx)
}

fn transition_context(
    entity: &str,
    id: &str,
    args: &ContextArgs,
) -> Result<TransitionContext, Box<dyn std::error::Error>> {
    let mut ctx = TransitionContext::new(entity, id, parse_json_arg(&args.data)?);
    ctx.previous_data = args.previous.as_deref().map(parse_json_arg).transpose()?;
    ctx.user_id = args.user.clone();
    ctx.user_roles = args.roles.clone();
    Ok(ctx)
}

fn format_evaluation(result: &EvaluationResult) -> CommandResult {
    let status = if result.passed {
        "PASSED".green()
    } else {
        "FAILED".red()
    };
    let mut output = format!(
        "{} ({} rules, {}us)\n",
        status.bold(),
        result.results.len(),
        result.duration_us
    );
    if let Some(confirmation) = &result.requires_confirmation {
        let _ = writeln!(
            output,
            "{}: {} ({})",
            "Confirmation required".yellow(),
            confirmation.message,
            confirmation.rule_id
        );
    }
    output.push_str(&format_json(&serde_json::to_value(result)?));
    Ok(output)
}

fn format_transition(result: &TransitionResult) -> CommandResult {
    let header = if result.success {
        format!(
            "{} {} -> {} via {}",
            "OK".green(),
            result.from_state,
            result.to_state.yellow(),
            result.transition_name.cyan()
        )
    } else if let Some(err) = &result.error {
        format!("{} [{}] {}", "Error".red(), err.code(), err)
    } else {
        format!(
            "{} {} blocked by {} guard(s)",
            "Blocked".yellow(),
            result.transition_name.cyan(),
            result.guards_failed.len()
        )
    };
    Ok(format!("{}\n{}", header, format_json(&serde_json::to_value(result)?)))
}

/// Parses a JSON argument, which may be a file reference (@file.json).
fn parse_json_arg(arg: &str) -> Result<Value, Box<dyn std::error::Error>> {
    if let Some(path) = arg.strip_prefix('@') {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    } else {
        Ok(serde_json::from_str(arg)?)
    }
}

/// Formats JSON for display.
fn format_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::Bundle;
    use serde_json::json;

    fn definitions() -> Definitions {
        let bundle: Bundle = serde_json::from_value(json!({
            "rules": [
                {"id": "order.total", "entity": "order", "category": "computed",
                 "when": {"type": "all", "conditions": []},
                 "then": {"type": "compute", "field": "total",
                          "expression": "data.qty * data.price"}},
                {"id": "order.min", "entity": "order", "category": "validation",
                 "dependsOn": ["order.total"],
                 "when": {"type": "field", "field": "qty", "operator": "lt", "value": 1},
                 "then": {"type": "validate",
                          "errors": [{"field": "qty", "message": "at least one"}]}}
            ],
            "machines": [{
                "entity": "order",
                "states": [{"name": "draft", "isInitial": true}, {"name": "confirmed"}],
                "transitions": [
                    {"name": "confirm", "from": "draft", "to": "confirmed", "event": "CONFIRM"}
                ]
            }]
        }))
        .unwrap();
        Definitions::from_bundles(vec![bundle], false).unwrap()
    }

    fn args(data: &str) -> ContextArgs {
        ContextArgs {
            data: data.to_string(),
            previous: None,
            user: Some("u-1".into()),
            roles: vec!["client".into()],
        }
    }

    #[test]
    fn test_parse_json_arg_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctx.json");
        std::fs::write(&path, r#"{"qty": 2}"#).unwrap();

        let value = parse_json_arg(&format!("@{}", path.display())).unwrap();
        assert_eq!(value, json!({"qty": 2}));
        assert!(parse_json_arg("{oops").is_err());
    }

    #[test]
    fn test_parse_categories() {
        assert!(parse_categories(&[]).unwrap().is_none());
        let cats = parse_categories(&["gate".into(), "validation".into()]).unwrap().unwrap();
        assert_eq!(cats, vec![RuleCategory::Gate, RuleCategory::Validation]);
        assert!(parse_categories(&["bogus".into()]).is_err());
    }

    #[tokio::test]
    async fn test_check_reports_ok() {
        colored::control::set_override(false);
        let output = execute(&definitions(), &Config::default(), Commands::Check)
            .await
            .unwrap();
        assert!(output.contains("Entity order (2 rules)"));
        assert!(output.ends_with("OK"));
    }

    #[tokio::test]
    async fn test_order_command() {
        colored::control::set_override(false);
        let output = execute(
            &definitions(),
            &Config::default(),
            Commands::Order {
                entity: "order".into(),
                categories: vec![],
            },
        )
        .await
        .unwrap();
        let total = output.find("order.total").unwrap();
        let min = output.find("order.min").unwrap();
        assert!(total < min);
    }

    #[tokio::test]
    async fn test_eval_command() {
        colored::control::set_override(false);
        let output = execute(
            &definitions(),
            &Config::default(),
            Commands::Eval {
                entity: "order".into(),
                operation: "update".into(),
                categories: vec![],
                no_stop: false,
                ctx: args(r#"{"qty": 0, "price": 5}"#),
            },
        )
        .await
        .unwrap();
        assert!(output.starts_with("FAILED"));
        assert!(output.contains("at least one"));
    }

    #[tokio::test]
    async fn test_send_command() {
        colored::control::set_override(false);
        let output = execute(
            &definitions(),
            &Config::default(),
            Commands::Send {
                machine: "order".into(),
                state: "draft".into(),
                event: "CONFIRM".into(),
                payload: None,
                id: "o-1".into(),
                ctx: args("{}"),
            },
        )
        .await
        .unwrap();
        assert!(output.starts_with("OK draft -> confirmed via confirm"));
    }

    #[tokio::test]
    async fn test_unknown_machine() {
        let err = execute(
            &definitions(),
            &Config::default(),
            Commands::Mermaid {
                machine: "invoice".into(),
            },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("invoice"));
    }
}
