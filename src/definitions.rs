//! Definition bundles.
//!
//! A bundle is a JSON or YAML file holding rules and machine definitions:
//!
//! ```yaml
//! rules:
//!   - id: order.min_total
//!     entity: order
//!     category: validation
//!     when: {type: field, field: total, operator: lt, value: 1}
//!     then: {type: validate, errors: [{field: total, message: too small}]}
//! machines:
//!   - entity: order
//!     states: [{name: draft, isInitial: true}, {name: confirmed}]
//!     transitions: [{name: confirm, from: draft, to: confirmed}]
//! ```

use rulegate_core::{
    CoreError, MachineServices, Rule, RuleEngine, RuleRegistry, StateMachine, StateMachineConfig,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Contents of one bundle file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Bundle {
    pub rules: Vec<Rule>,
    pub machines: Vec<StateMachineConfig>,
}

impl Bundle {
    /// Reads a bundle; `.json` files are parsed as JSON, anything else as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DefinitionError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| DefinitionError::Io(path.to_path_buf(), e))?;

        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let parsed = if is_json {
            serde_json::from_str(&content).map_err(|e| e.to_string())
        } else {
            serde_yaml::from_str(&content).map_err(|e| e.to_string())
        };
        parsed.map_err(|e| DefinitionError::Parse(path.to_path_buf(), e))
    }
}

/// Rules and machines loaded from one or more bundles.
pub struct Definitions {
    pub engine: RuleEngine,
    machines: BTreeMap<String, Arc<StateMachine>>,
}

impl Definitions {
    /// Builds the registry and machines from bundles already read.
    ///
    /// Every machine gets the rule engine as its gate checker.
    pub fn from_bundles(
        bundles: Vec<Bundle>,
        track_history: bool,
    ) -> Result<Self, DefinitionError> {
        let mut registry = RuleRegistry::new();
        let mut configs = Vec::new();
        for bundle in bundles {
            registry.register_all(bundle.rules)?;
            configs.extend(bundle.machines);
        }

        let engine = RuleEngine::new(Arc::new(registry));
        let services = MachineServices::default().with_gates(engine.clone());

        let mut machines = BTreeMap::new();
        for mut config in configs {
            config.track_history |= track_history;
            let entity = config.entity.clone();
            let machine = StateMachine::with_services(config, services.clone())?;
            if machines.insert(entity.clone(), Arc::new(machine)).is_some() {
                return Err(CoreError::InvalidDefinition {
                    reason: format!("more than one machine for entity '{}'", entity),
                }
                .into());
            }
        }

        tracing::info!(
            rules = engine.registry().len(),
            machines = machines.len(),
            "definitions loaded"
        );
        Ok(Self { engine, machines })
    }

    /// Reads and builds every bundle in `paths`.
    pub fn load(paths: &[PathBuf], track_history: bool) -> Result<Self, DefinitionError> {
        let bundles = paths
            .iter()
            .map(|path| {
                tracing::debug!(path = %path.display(), "reading bundle");
                Bundle::from_file(path)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_bundles(bundles, track_history)
    }

    pub fn machine(&self, entity: &str) -> Result<&Arc<StateMachine>, CoreError> {
        self.machines.get(entity).ok_or_else(|| CoreError::UnknownMachine {
            machine: entity.to_string(),
        })
    }

    /// Machines ordered by entity name.
    pub fn machines(&self) -> impl Iterator<Item = &Arc<StateMachine>> {
        self.machines.values()
    }
}

/// Bundle loading error.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("failed to read bundle '{}': {1}", .0.display())]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse bundle '{}': {1}", .0.display())]
    Parse(PathBuf, String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const YAML_BUNDLE: &str = r#"
rules:
  - id: order.min_total
    entity: order
    category: validation
    when: {type: field, field: total, operator: lt, value: 1}
    then: {type: validate, errors: [{field: total, message: too small}]}
machines:
  - entity: order
    states:
      - {name: draft, isInitial: true}
      - {name: confirmed}
    transitions:
      - {name: confirm, from: draft, to: confirmed, event: CONFIRM}
"#;

    fn write_bundle(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_yaml_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bundle(dir.path(), "orders.yaml", YAML_BUNDLE);

        let defs = Definitions::load(&[path], false).unwrap();
        assert_eq!(defs.engine.registry().len(), 1);
        let machine = defs.machine("order").unwrap();
        assert_eq!(machine.get_initial_state(), "draft");
        assert!(defs.machine("invoice").is_err());
    }

    #[test]
    fn test_load_json_bundle_with_history_override() {
        let dir = tempfile::tempdir().unwrap();
        let json = serde_json::json!({
            "machines": [{
                "entity": "ticket",
                "states": [{"name": "open"}, {"name": "closed", "isFinal": true}],
                "transitions": [{"name": "close", "from": "open", "to": "closed"}]
            }]
        });
        let path = write_bundle(dir.path(), "tickets.json", &json.to_string());

        let defs = Definitions::load(&[path], true).unwrap();
        assert!(defs.machine("ticket").unwrap().config().track_history);
        assert_eq!(defs.engine.registry().len(), 0);
    }

    #[test]
    fn test_duplicate_rules_across_bundles() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_bundle(dir.path(), "a.yaml", YAML_BUNDLE);
        let rules_only = YAML_BUNDLE.split("machines:").next().unwrap();
        let b = write_bundle(dir.path(), "b.yaml", rules_only);

        let err = Definitions::load(&[a, b], false).err().unwrap();
        assert!(matches!(err, DefinitionError::Core(CoreError::DuplicateRule { .. })));
    }

    #[test]
    fn test_duplicate_machine_entity() {
        let bundle: Bundle = serde_yaml::from_str(YAML_BUNDLE).unwrap();
        let mut second = bundle.clone();
        second.rules.clear();
        let err = Definitions::from_bundles(vec![bundle, second], false).err().unwrap();
        assert!(err.to_string().contains("more than one machine"));
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bundle(dir.path(), "broken.json", "{ not json");
        let err = Bundle::from_file(&path).unwrap_err();
        assert!(matches!(err, DefinitionError::Parse(..)));
        assert!(err.to_string().contains("broken.json"));
    }
}
