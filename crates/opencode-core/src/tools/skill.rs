use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{PermissionSpec, Tool, ToolContext, ToolDeps, ToolInfo, ToolInvocation, ToolResponse, parse_input};
use crate::Result;
use crate::discovery::SkillRegistry;

#[derive(Debug, Deserialize)]
struct SkillParams {
    name: String,
}

/// Loads a skill's instructions into the conversation.
pub struct SkillTool {
    skills: Arc<SkillRegistry>,
}

impl SkillTool {
    pub fn new(deps: &ToolDeps) -> Self {
        Self {
            skills: deps.skills.clone(),
        }
    }
}

#[async_trait]
impl Tool for SkillTool {
    fn info(&self) -> ToolInfo {
        let names: Vec<&str> = self.skills.list().map(|s| s.name.as_str()).collect();
        ToolInfo {
            name: "skill".into(),
            description: format!(
                "Load the instructions of a skill. Available skills: {}",
                names.join(", ")
            ),
            parameters: json!({
                "name": {"type": "string", "description": "The skill to load", "enum": names},
            }),
            required: vec!["name".into()],
        }
    }

    fn permission(&self, _ctx: &ToolContext, input: &Value) -> Option<PermissionSpec> {
        let name = input.get("name").and_then(Value::as_str).unwrap_or_default();
        let path = self
            .skills
            .get(name)
            .map(|s| s.path.to_string_lossy().to_string())
            .unwrap_or_default();
        Some(PermissionSpec {
            action: "load".into(),
            description: format!("Load skill {name}"),
            pattern: name.to_string(),
            params: json!({"name": name}),
            path,
            read_only: true,
        })
    }

    async fn run(&self, _ctx: &ToolContext, call: &ToolInvocation) -> Result<ToolResponse> {
        let params: SkillParams = match parse_input(call) {
            Ok(p) => p,
            Err(resp) => return Ok(resp),
        };
        match self.skills.get(&params.name) {
            Some(skill) => Ok(ToolResponse::text(format!(
                "<skill name=\"{}\">\n{}\n</skill>",
                skill.name, skill.body
            ))
            .with_metadata(json!({"path": skill.path}))),
            None => Ok(ToolResponse::error(format!("unknown skill: {}", params.name))),
        }
    }
}
