//! YAML flow definitions and their discovery.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, error};

use super::expr::{Predicate, PredicateError};
use crate::agent::CODER_AGENT;
use crate::config::Config;
use crate::{CoreError, Result};

/// Larger flow files are skipped.
pub const MAX_FLOW_FILE_BYTES: u64 = 100 * 1024;

fn default_agent() -> String {
    CODER_AGENT.to_string()
}

#[derive(Debug, Deserialize)]
struct FlowFile {
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    disabled: bool,
    flow: FlowBody,
}

#[derive(Debug, Deserialize)]
struct FlowBody {
    #[serde(default)]
    args: Option<Value>,
    #[serde(default)]
    session: FlowSession,
    #[serde(default)]
    steps: Vec<Step>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FlowSession {
    #[serde(default)]
    prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StepSession {
    /// Start the step's conversation fresh: the previous step's output is not
    /// prepended to the prompt. The step still gets its own
    /// `prefix-flow-step` session under the flow's root, and the upstream
    /// step's structured output still merges into the args. Without `fork`
    /// the prompt is prefixed with `Output of the previous step:`.
    #[serde(default)]
    pub fork: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StepOutput {
    pub schema: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(default = "default_agent")]
    pub agent: String,
    #[serde(default)]
    pub session: StepSession,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub output: Option<StepOutput>,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub fallback: Option<Fallback>,
}

#[derive(Debug, Deserialize)]
struct RawRule {
    #[serde(rename = "if")]
    condition: String,
    then: String,
    #[serde(default)]
    postpone: bool,
}

/// Route to `then` when `predicate` holds.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawRule")]
pub struct Rule {
    pub predicate: Predicate,
    pub then: String,
    /// Parsed for compatibility; has no effect.
    pub postpone: bool,
}

impl TryFrom<RawRule> for Rule {
    type Error = PredicateError;

    fn try_from(raw: RawRule) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            predicate: raw.condition.parse()?,
            then: raw.then,
            postpone: raw.postpone,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Fallback {
    /// Extra attempts after the first failure.
    #[serde(default)]
    pub retry: u32,
    /// Seconds between attempts.
    #[serde(default)]
    pub delay: f64,
    #[serde(default)]
    pub to: Option<String>,
}

/// A validated flow.
#[derive(Debug, Clone)]
pub struct Flow {
    pub id: String,
    pub name: String,
    pub description: String,
    pub disabled: bool,
    /// JSON schema for the run's args.
    pub args_schema: Option<Value>,
    pub session_prefix: Option<String>,
    pub steps: Vec<Step>,
    pub path: PathBuf,
}

impl Flow {
    /// Parse and validate one flow document.
    pub fn parse(id: &str, content: &str, path: &Path) -> Result<Self> {
        let invalid = |reason: String| CoreError::FlowValidation {
            flow: id.to_string(),
            reason,
        };
        if !is_kebab_case(id) {
            return Err(invalid("flow id must be kebab-case".into()));
        }
        let file: FlowFile = serde_yaml::from_str(content).map_err(|e| invalid(e.to_string()))?;
        let steps = file.flow.steps;
        if steps.is_empty() {
            return Err(invalid("flow has no steps".into()));
        }
        let mut ids = HashSet::new();
        for step in &steps {
            if step.id.trim().is_empty() {
                return Err(invalid("step without an id".into()));
            }
            if !ids.insert(step.id.as_str()) {
                return Err(invalid(format!("duplicate step id {}", step.id)));
            }
        }
        for step in &steps {
            for rule in &step.rules {
                if !ids.contains(rule.then.as_str()) {
                    return Err(invalid(format!("step {} routes to unknown step {}", step.id, rule.then)));
                }
            }
            if let Some(to) = step.fallback.as_ref().and_then(|f| f.to.as_deref()) {
                if !ids.contains(to) {
                    return Err(invalid(format!("step {} falls back to unknown step {to}", step.id)));
                }
            }
        }
        if let Some(schema) = &file.flow.args {
            jsonschema::validator_for(schema).map_err(|e| invalid(format!("invalid args schema: {e}")))?;
        }
        Ok(Self {
            id: id.to_string(),
            name: if file.name.is_empty() { id.to_string() } else { file.name },
            description: file.description,
            disabled: file.disabled,
            args_schema: file.flow.args,
            session_prefix: file.flow.session.prefix.filter(|p| !p.trim().is_empty()),
            steps,
            path: path.to_path_buf(),
        })
    }

    pub fn first_step(&self) -> &Step {
        &self.steps[0]
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Check args against the flow's schema. `prompt` is always accepted.
    pub fn validate_args(&self, args: &Map<String, Value>) -> Result<()> {
        let Some(schema) = &self.args_schema else {
            return Ok(());
        };
        let mut schema = schema.clone();
        if let Some(obj) = schema.as_object_mut() {
            let properties = obj
                .entry("properties")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Some(properties) = properties.as_object_mut() {
                properties
                    .entry("prompt")
                    .or_insert_with(|| serde_json::json!({"type": "string"}));
            }
        }
        let validator = jsonschema::validator_for(&schema)
            .map_err(|e| CoreError::InvalidArgs(format!("invalid args schema: {e}")))?;
        let value = Value::Object(args.clone());
        let errors: Vec<String> = validator.iter_errors(&value).map(|e| e.to_string()).collect();
        if !errors.is_empty() {
            return Err(CoreError::InvalidArgs(format!(
                "flow {} args: {}",
                self.id,
                errors.join("; ")
            )));
        }
        Ok(())
    }
}

pub fn is_kebab_case(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('-')
        && !id.ends_with('-')
        && !id.contains("--")
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Flows keyed by id. Roots are scanned in order and the first valid
/// definition of an id wins.
#[derive(Debug, Clone, Default)]
pub struct FlowRegistry {
    flows: BTreeMap<String, Flow>,
}

impl FlowRegistry {
    /// Project roots first, then the user's.
    pub fn discover(config: &Config) -> Self {
        let mut roots = vec![
            config.working_dir.join(".opencode").join("flows"),
            config.working_dir.join(".agents").join("flows"),
        ];
        if let Some(home) = dirs::home_dir() {
            roots.push(home.join(".config").join("opencode").join("flows"));
            roots.push(home.join(".agents").join("flows"));
        }
        Self::from_roots(&roots)
    }

    pub fn from_roots(roots: &[PathBuf]) -> Self {
        let mut registry = Self::default();
        for root in roots {
            registry.scan_root(root);
        }
        debug!(target: "opencode::flow", flows = registry.flows.len(), "Flows discovered");
        registry
    }

    fn scan_root(&mut self, root: &Path) {
        let Ok(entries) = fs::read_dir(root) else {
            return;
        };
        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file() && matches!(p.extension().and_then(|e| e.to_str()), Some("yaml" | "yml")))
            .collect();
        files.sort();

        for path in files {
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
                continue;
            };
            if self.flows.contains_key(&id) {
                continue;
            }
            let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            if size > MAX_FLOW_FILE_BYTES {
                error!(target: "opencode::flow", path = %path.display(), size, "Flow file too large, skipping");
                continue;
            }
            let content = match fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) => {
                    error!(target: "opencode::flow", path = %path.display(), "Failed to read flow: {}", e);
                    continue;
                }
            };
            match Flow::parse(&id, &content, &path) {
                Ok(flow) => {
                    self.flows.insert(id, flow);
                }
                Err(e) => error!(target: "opencode::flow", path = %path.display(), "{}", e),
            }
        }
    }

    pub fn insert(&mut self, flow: Flow) {
        self.flows.insert(flow.id.clone(), flow);
    }

    pub fn get(&self, id: &str) -> Result<&Flow> {
        self.flows
            .get(id)
            .ok_or_else(|| CoreError::FlowNotFound(id.to_string()))
    }

    pub fn list(&self) -> impl Iterator<Item = &Flow> {
        self.flows.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const REVIEW: &str = r#"
name: Review
description: Analyse then implement
flow:
  args:
    type: object
    properties:
      ready: {type: boolean}
    additionalProperties: false
  session:
    prefix: review
  steps:
    - id: analyse
      prompt: "Analyse ${args.prompt}"
      output:
        schema:
          type: object
          properties:
            ready: {type: boolean}
      rules:
        - if: ${args.ready} == true
          then: implement
          postpone: true
      fallback: {retry: 2, delay: 0.5, to: implement}
    - id: implement
      agent: task
      session: {fork: true}
      prompt: Implement it
"#;

    fn parse(id: &str, content: &str) -> Result<Flow> {
        Flow::parse(id, content, Path::new("/flows/x.yaml"))
    }

    #[test]
    fn test_parse_flow() {
        let flow = parse("review", REVIEW).unwrap();
        assert_eq!(flow.name, "Review");
        assert_eq!(flow.session_prefix.as_deref(), Some("review"));
        assert_eq!(flow.first_step().id, "analyse");
        assert_eq!(flow.first_step().agent, CODER_AGENT);
        let implement = flow.step("implement").unwrap();
        assert!(implement.session.fork);
        assert_eq!(implement.agent, "task");
        let rule = &flow.first_step().rules[0];
        assert_eq!(rule.then, "implement");
        assert!(rule.postpone);
        let fallback = flow.first_step().fallback.as_ref().unwrap();
        assert_eq!(fallback.retry, 2);
        assert_eq!(fallback.delay, 0.5);
    }

    #[test]
    fn test_validation_failures() {
        let cases = [
            ("Bad_Id", REVIEW),
            ("empty", "flow:\n  steps: []\n"),
            ("dup", "flow:\n  steps:\n    - id: a\n    - id: a\n"),
            ("unknown", "flow:\n  steps:\n    - id: a\n      rules:\n        - if: ${args.x} == 1\n          then: b\n"),
            ("fallback", "flow:\n  steps:\n    - id: a\n      fallback: {to: zz}\n"),
            ("predicate", "flow:\n  steps:\n    - id: a\n      rules:\n        - if: x > 1\n          then: a\n"),
            ("yaml", "flow: [unclosed"),
        ];
        for (id, content) in cases {
            assert!(
                matches!(parse(id, content), Err(CoreError::FlowValidation { .. })),
                "{id} should be rejected"
            );
        }
    }

    #[test]
    fn test_args_validation_allows_prompt() {
        let flow = parse("review", REVIEW).unwrap();
        let ok = json!({"ready": true, "prompt": "the parser"});
        assert!(flow.validate_args(ok.as_object().unwrap()).is_ok());
        let extra = json!({"ready": true, "other": 1});
        assert!(matches!(
            flow.validate_args(extra.as_object().unwrap()),
            Err(CoreError::InvalidArgs(_))
        ));
        let wrong_type = json!({"ready": "yes"});
        assert!(flow.validate_args(wrong_type.as_object().unwrap()).is_err());
    }

    #[test]
    fn test_kebab_case() {
        assert!(is_kebab_case("review-and-fix"));
        assert!(is_kebab_case("step2"));
        assert!(!is_kebab_case("Review"));
        assert!(!is_kebab_case("a_b"));
        assert!(!is_kebab_case("-a"));
        assert!(!is_kebab_case("a--b"));
    }

    #[test]
    fn test_discovery_first_root_wins_and_skips_invalid() {
        let project = tempfile::tempdir().unwrap();
        let global = tempfile::tempdir().unwrap();
        fs::write(project.path().join("review.yaml"), REVIEW).unwrap();
        fs::write(global.path().join("review.yaml"), "name: Global\nflow:\n  steps:\n    - id: only\n").unwrap();
        fs::write(global.path().join("broken.yml"), "flow:\n  steps: []\n").unwrap();
        fs::write(global.path().join("big.yaml"), "#".repeat(MAX_FLOW_FILE_BYTES as usize + 1)).unwrap();
        fs::write(global.path().join("notes.txt"), "ignored").unwrap();

        let registry = FlowRegistry::from_roots(&[project.path().to_path_buf(), global.path().to_path_buf()]);
        assert_eq!(registry.get("review").unwrap().name, "Review");
        assert!(matches!(registry.get("broken"), Err(CoreError::FlowNotFound(_))));
        assert!(registry.get("big").is_err());
        assert_eq!(registry.list().count(), 1);
    }
}
