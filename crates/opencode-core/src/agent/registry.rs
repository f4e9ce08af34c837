//! Agent definitions and the permission evaluator.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use opencode_types::{AgentInfo, AgentMode, PermissionAction, PermissionRule};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::prompt;
use crate::config::{AgentConfig, Config};
use crate::discovery::parse_frontmatter;
use crate::llm::default_models;
use crate::{CoreError, Result};

pub const CODER_AGENT: &str = "coder";
pub const TASK_AGENT: &str = "task";
pub const SUMMARIZER_AGENT: &str = "summarizer";
pub const DESCRIPTOR_AGENT: &str = "descriptor";

const DEFAULT_MAX_TOKENS: i64 = 8192;
const SMALL_MAX_TOKENS: i64 = 4096;

/// Frontmatter accepted in agent markdown files.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct AgentFrontmatter {
    model: Option<String>,
    max_tokens: Option<i64>,
    reasoning_effort: Option<String>,
    permission: BTreeMap<String, PermissionRule>,
    tools: BTreeMap<String, bool>,
    mode: Option<AgentMode>,
    name: Option<String>,
    description: Option<String>,
    color: Option<String>,
    hidden: Option<bool>,
    disabled: Option<bool>,
    output: Option<Value>,
}

impl From<AgentFrontmatter> for AgentConfig {
    fn from(fm: AgentFrontmatter) -> Self {
        AgentConfig {
            model: fm.model,
            max_tokens: fm.max_tokens,
            reasoning_effort: fm.reasoning_effort,
            permission: fm.permission,
            tools: fm.tools,
            mode: fm.mode,
            name: fm.name,
            prompt: None,
            description: fm.description,
            color: fm.color,
            hidden: fm.hidden,
            disabled: fm.disabled,
            output: fm.output,
        }
    }
}

/// All known agents plus the global permission rules.
#[derive(Debug, Clone)]
pub struct AgentRegistry {
    agents: BTreeMap<String, AgentInfo>,
    global_rules: BTreeMap<String, PermissionRule>,
}

impl AgentRegistry {
    /// Seeds, then config `agents.<id>`, then `~/.config/opencode/agents`,
    /// then `.opencode/agents`.
    pub fn load(config: &Config) -> Self {
        let mut roots = Vec::new();
        if let Some(home) = dirs::home_dir() {
            roots.push(home.join(".config").join("opencode").join("agents"));
        }
        roots.push(config.working_dir.join(".opencode").join("agents"));
        Self::load_with_dirs(config, &roots)
    }

    pub fn load_with_dirs(config: &Config, dirs: &[PathBuf]) -> Self {
        let (large, small) = default_models(config);
        let mut agents: BTreeMap<String, AgentInfo> = seed_agents(large, small)
            .into_iter()
            .map(|a| (a.id.clone(), a))
            .collect();

        for (id, overlay) in &config.agents {
            apply_overlay(&mut agents, id, overlay.clone(), large);
        }
        for dir in dirs {
            for (id, overlay) in read_agent_dir(dir) {
                apply_overlay(&mut agents, &id, overlay, large);
            }
        }

        debug!(target: "opencode::agent", count = agents.len(), "Agents loaded");
        Self {
            agents,
            global_rules: config.permission.effective_rules(),
        }
    }

    pub fn get(&self, id: &str) -> Result<&AgentInfo> {
        self.agents
            .get(id)
            .ok_or_else(|| CoreError::AgentNotFound(id.to_string()))
    }

    /// Like [`get`](Self::get) but disabled agents are an error.
    pub fn get_enabled(&self, id: &str) -> Result<&AgentInfo> {
        let agent = self.get(id)?;
        if agent.disabled {
            return Err(CoreError::AgentDisabled(id.to_string()));
        }
        Ok(agent)
    }

    pub fn list(&self) -> impl Iterator<Item = &AgentInfo> {
        self.agents.values()
    }

    /// Enabled, user-selectable agents.
    pub fn primary(&self) -> impl Iterator<Item = &AgentInfo> {
        self.agents
            .values()
            .filter(|a| a.is_primary() && !a.disabled)
    }

    /// Subagents the `task` tool may launch.
    pub fn subagents(&self) -> impl Iterator<Item = &AgentInfo> {
        self.agents
            .values()
            .filter(|a| !a.is_primary() && !a.disabled && !a.hidden)
    }

    /// Whether the agent's tools map leaves `tool` enabled. Exact keys win
    /// over globs; the most specific glob wins among globs.
    pub fn is_tool_enabled(&self, agent_id: &str, tool: &str) -> bool {
        let Some(agent) = self.agents.get(agent_id) else {
            return false;
        };
        tool_enabled(&agent.tools, tool)
    }

    /// Decide what happens when `agent_id` wants to run `tool` with `pattern`.
    ///
    /// Order: agent exact tool rule, agent glob tool rule, agent tool
    /// disabled (deny), global exact, global glob, global `*`, ask.
    pub fn evaluate_permission(&self, agent_id: &str, tool: &str, pattern: &str) -> PermissionAction {
        if let Some(agent) = self.agents.get(agent_id) {
            if let Some(action) = evaluate_rules(&agent.permission, tool, pattern) {
                return action;
            }
            if !tool_enabled(&agent.tools, tool) {
                return PermissionAction::Deny;
            }
        }
        evaluate_rules(&self.global_rules, tool, pattern).unwrap_or(PermissionAction::Ask)
    }
}

fn seed_agents(large: &str, small: &str) -> Vec<AgentInfo> {
    let disabled = |tools: &[&str]| -> BTreeMap<String, bool> {
        tools.iter().map(|t| (t.to_string(), false)).collect()
    };
    vec![
        AgentInfo {
            id: CODER_AGENT.into(),
            mode: AgentMode::Agent,
            name: "Coder".into(),
            description: "Primary coding agent with full tool access".into(),
            model: large.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
            prompt: prompt::CODER_PROMPT.into(),
            ..Default::default()
        },
        AgentInfo {
            id: TASK_AGENT.into(),
            mode: AgentMode::Subagent,
            name: "Task".into(),
            description: "Read-only research agent for searches and investigations".into(),
            model: large.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
            prompt: prompt::TASK_PROMPT.into(),
            tools: disabled(&["write", "edit", "patch", "task"]),
            ..Default::default()
        },
        AgentInfo {
            id: SUMMARIZER_AGENT.into(),
            mode: AgentMode::Subagent,
            name: "Summarizer".into(),
            description: "Summarizes a conversation for compaction".into(),
            model: small.into(),
            max_tokens: SMALL_MAX_TOKENS,
            prompt: prompt::SUMMARIZER_PROMPT.into(),
            tools: disabled(&["*"]),
            hidden: true,
            ..Default::default()
        },
        AgentInfo {
            id: DESCRIPTOR_AGENT.into(),
            mode: AgentMode::Subagent,
            name: "Descriptor".into(),
            description: "Writes short session titles".into(),
            model: small.into(),
            max_tokens: 80,
            prompt: prompt::DESCRIPTOR_PROMPT.into(),
            tools: disabled(&["*"]),
            hidden: true,
            ..Default::default()
        },
    ]
}

fn apply_overlay(agents: &mut BTreeMap<String, AgentInfo>, id: &str, overlay: AgentConfig, default_model: &str) {
    let agent = agents.entry(id.to_string()).or_insert_with(|| AgentInfo {
        id: id.to_string(),
        mode: AgentMode::Subagent,
        name: id.to_string(),
        model: default_model.to_string(),
        max_tokens: DEFAULT_MAX_TOKENS,
        ..Default::default()
    });
    if let Some(model) = overlay.model {
        agent.model = model;
    }
    if let Some(max_tokens) = overlay.max_tokens {
        agent.max_tokens = max_tokens;
    }
    if overlay.reasoning_effort.is_some() {
        agent.reasoning_effort = overlay.reasoning_effort;
    }
    agent.permission.extend(overlay.permission);
    agent.tools.extend(overlay.tools);
    if let Some(mode) = overlay.mode {
        agent.mode = mode;
    }
    if let Some(name) = overlay.name {
        agent.name = name;
    }
    if let Some(prompt) = overlay.prompt.filter(|p| !p.trim().is_empty()) {
        agent.prompt = prompt;
    }
    if let Some(description) = overlay.description {
        agent.description = description;
    }
    if overlay.color.is_some() {
        agent.color = overlay.color;
    }
    if let Some(hidden) = overlay.hidden {
        agent.hidden = hidden;
    }
    if let Some(disabled) = overlay.disabled {
        agent.disabled = disabled;
    }
    if overlay.output.is_some() {
        agent.output = overlay.output;
    }
}

/// `<dir>/*.md` as (file stem, overlay). The body becomes the prompt.
fn read_agent_dir(dir: &Path) -> Vec<(String, AgentConfig)> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|e| e == "md"))
        .collect();
    paths.sort();

    let mut found = Vec::new();
    for path in paths {
        let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                warn!(target: "opencode::agent", path = %path.display(), "Failed to read agent file: {}", e);
                continue;
            }
        };
        let (frontmatter, body) = parse_frontmatter::<AgentFrontmatter>(&content);
        let mut overlay = AgentConfig::from(frontmatter);
        let body = body.trim();
        if !body.is_empty() {
            overlay.prompt = Some(body.to_string());
        }
        debug!(target: "opencode::agent", agent = %id, path = %path.display(), "Loaded agent file");
        found.push((id, overlay));
    }
    found
}

/// `*` matches any run of characters; everything else matches itself.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == text;
    }
    let parts: Vec<&str> = pattern.split('*').collect();
    let Some(rest) = text.strip_prefix(parts[0]) else {
        return false;
    };
    let last = parts[parts.len() - 1];
    let mut rest = rest;
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

/// Literal characters in a glob; more means more specific.
fn specificity(pattern: &str) -> (usize, usize) {
    (pattern.chars().filter(|c| *c != '*').count(), pattern.len())
}

/// Value of the most specific glob key matching `key`.
fn best_glob<'a, V>(map: &'a BTreeMap<String, V>, key: &str, include_star: bool) -> Option<&'a V> {
    map.iter()
        .filter(|(k, _)| k.contains('*') && (include_star || k.as_str() != "*"))
        .filter(|(k, _)| glob_match(k, key))
        .max_by_key(|(k, _)| specificity(k))
        .map(|(_, v)| v)
}

fn best_match<'a, V>(map: &'a BTreeMap<String, V>, key: &str) -> Option<&'a V> {
    map.get(key).or_else(|| best_glob(map, key, true))
}

fn resolve_rule(rule: &PermissionRule, pattern: &str) -> Option<PermissionAction> {
    match rule {
        PermissionRule::Action(action) => Some(*action),
        PermissionRule::Patterns(patterns) => best_match(patterns, pattern).copied(),
    }
}

/// Exact tool key, then glob tool keys, then the bare `*` key.
fn evaluate_rules(rules: &BTreeMap<String, PermissionRule>, tool: &str, pattern: &str) -> Option<PermissionAction> {
    rules
        .get(tool)
        .and_then(|r| resolve_rule(r, pattern))
        .or_else(|| best_glob(rules, tool, false).and_then(|r| resolve_rule(r, pattern)))
        .or_else(|| rules.get("*").and_then(|r| resolve_rule(r, pattern)))
}

fn tool_enabled(tools: &BTreeMap<String, bool>, tool: &str) -> bool {
    best_match(tools, tool).copied().unwrap_or(true)
}
