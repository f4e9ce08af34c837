use std::sync::{OnceLock, Weak};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{Tool, ToolContext, ToolDeps, ToolInfo, ToolInvocation, ToolResponse, parse_input};
use crate::Result;

pub const DEFAULT_SUBAGENT: &str = "task";

/// Runs a subagent on a child session and returns its final answer.
#[async_trait]
pub trait SubagentRunner: Send + Sync {
    /// Returns the child session id and the subagent's final text.
    async fn run_subagent(
        &self,
        ctx: &ToolContext,
        tool_call_id: &str,
        agent_id: &str,
        prompt: &str,
    ) -> Result<(String, String)>;
}

#[derive(Debug, Deserialize)]
struct TaskParams {
    prompt: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    subagent_type: Option<String>,
}

pub struct TaskTool {
    runner: OnceLock<Weak<dyn SubagentRunner>>,
}

impl TaskTool {
    pub fn new(_deps: &ToolDeps) -> Self {
        Self {
            runner: OnceLock::new(),
        }
    }

    pub(crate) fn bind(&self, runner: Weak<dyn SubagentRunner>) {
        let _ = self.runner.set(runner);
    }
}

#[async_trait]
impl Tool for TaskTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "task".into(),
            description: "Launch a subagent to handle a self-contained search or research task. The subagent cannot modify files and returns a single final report.".into(),
            parameters: json!({
                "prompt": {"type": "string", "description": "The task for the subagent to perform"},
                "description": {"type": "string", "description": "A short (3-5 word) description of the task"},
                "subagent_type": {"type": "string", "description": "The subagent to use (defaults to task)"},
            }),
            required: vec!["prompt".into()],
        }
    }

    async fn run(&self, ctx: &ToolContext, call: &ToolInvocation) -> Result<ToolResponse> {
        let params: TaskParams = match parse_input(call) {
            Ok(p) => p,
            Err(resp) => return Ok(resp),
        };
        if ctx.is_task_agent {
            return Ok(ToolResponse::error("subagents cannot launch further subagents"));
        }
        let Some(runner) = self.runner.get().and_then(Weak::upgrade) else {
            return Ok(ToolResponse::error("subagents are not available"));
        };
        let agent = params.subagent_type.as_deref().unwrap_or(DEFAULT_SUBAGENT);
        let (session_id, content) = runner.run_subagent(ctx, &call.id, agent, &params.prompt).await?;
        Ok(ToolResponse::text(content).with_metadata(json!({
            "session_id": session_id,
            "agent": agent,
            "description": params.description,
        })))
    }
}
