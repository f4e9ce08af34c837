//! Tool invocation contract and the built-in tools.

mod bash;
mod diagnostics;
mod edit;
mod output;
mod patch;
mod skill;
mod struct_output;
mod task;
mod tracker;
mod view;
mod write;

pub use bash::{BANNED_COMMANDS, BashTool};
pub use diagnostics::DiagnosticsTool;
pub use edit::EditTool;
pub use output::{
    MAX_OUTPUT_BYTES, MAX_OUTPUT_LINES, MAX_RESPONSE_BYTES, OutputSpool, PREVIEW_LINES, TRUNCATION_MARKER,
    truncate_response,
};
pub use patch::PatchTool;
pub use skill::SkillTool;
pub use struct_output::{STRUCT_OUTPUT_TOOL, StructOutputTool};
pub use task::{SubagentRunner, TaskTool};
pub use tracker::FileTracker;
pub use view::ViewTool;
pub use write::WriteTool;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::config::Config;
use crate::discovery::SkillRegistry;
use crate::history::FileHistoryService;
use crate::lsp::LspService;
use crate::session::SessionService;

/// What the model sees of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    /// JSON-schema `properties` map.
    pub parameters: Value,
    pub required: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments.
    pub input: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    #[default]
    Text,
    Image,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ToolResponse {
    pub kind: ResponseKind,
    pub content: String,
    /// JSON string, empty when absent.
    pub metadata: String,
    pub is_error: bool,
}

impl ToolResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
            ..Default::default()
        }
    }

    pub fn image(base64: impl Into<String>) -> Self {
        Self {
            kind: ResponseKind::Image,
            content: base64.into(),
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, metadata: impl Serialize) -> Self {
        self.metadata = serde_json::to_string(&metadata).unwrap_or_default();
        self
    }
}

/// Ambient values every tool call runs under.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub message_id: String,
    pub agent_id: String,
    pub is_task_agent: bool,
    pub working_dir: PathBuf,
    pub cancel: CancellationToken,
}

impl ToolContext {
    /// Absolute form of a path the model passed in.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.working_dir.join(p)
        }
    }
}

/// Side effect a tool wants to perform, checked before `run`.
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionSpec {
    pub action: String,
    pub path: String,
    pub description: String,
    /// Matched against the agent's permission patterns for the tool.
    pub pattern: String,
    pub params: Value,
    /// Resolve an `ask` verdict as allow without consulting the reviewer.
    pub read_only: bool,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn info(&self) -> ToolInfo;

    /// The permission needed to run with `input`, if any.
    fn permission(&self, _ctx: &ToolContext, _input: &Value) -> Option<PermissionSpec> {
        None
    }

    async fn run(&self, ctx: &ToolContext, call: &ToolInvocation) -> Result<ToolResponse>;
}

/// Decode tool arguments or describe why they are invalid.
pub fn parse_input<T: DeserializeOwned>(call: &ToolInvocation) -> std::result::Result<T, ToolResponse> {
    let raw = if call.input.trim().is_empty() { "{}" } else { call.input.as_str() };
    serde_json::from_str(raw).map_err(|e| ToolResponse::error(format!("invalid parameters: {e}")))
}

/// Services shared by the built-in tools.
#[derive(Clone)]
pub struct ToolDeps {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionService>,
    pub history: Arc<FileHistoryService>,
    pub tracker: Arc<FileTracker>,
    pub lsp: Arc<LspService>,
    pub spool: Arc<OutputSpool>,
    pub skills: Arc<SkillRegistry>,
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
    task: Option<Arc<TaskTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in tool except the synthetic `struct_output`.
    pub fn builtin(deps: &ToolDeps) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(BashTool::new(deps)));
        registry.register(Arc::new(ViewTool::new(deps)));
        registry.register(Arc::new(WriteTool::new(deps)));
        registry.register(Arc::new(EditTool::new(deps)));
        registry.register(Arc::new(PatchTool::new(deps)));
        registry.register(Arc::new(DiagnosticsTool::new(deps)));
        if !deps.skills.is_empty() {
            registry.register(Arc::new(SkillTool::new(deps)));
        }
        let task = Arc::new(TaskTool::new(deps));
        registry.register(task.clone());
        registry.task = Some(task);
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.info().name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    pub fn list(&self) -> impl Iterator<Item = &Arc<dyn Tool>> {
        self.tools.values()
    }

    /// Connect the `task` tool to whatever runs subagents.
    pub fn bind_subagent_runner(&self, runner: std::sync::Weak<dyn SubagentRunner>) {
        if let Some(task) = &self.task {
            task.bind(runner);
        }
    }
}

/// Record a tool write in file history, keeping a baseline and any
/// out-of-band edit as separate versions.
pub(crate) async fn record_file_change(
    history: &FileHistoryService,
    session_id: &str,
    path: &str,
    old_content: &str,
    new_content: &str,
) -> Result<()> {
    match history.get_by_path(session_id, path).await {
        Ok(latest) => {
            if latest.content != old_content {
                history.create_version(session_id, path, old_content).await?;
            }
        }
        Err(crate::CoreError::FileNotFound(_)) => {
            history.create(session_id, path, old_content).await?;
        }
        Err(e) => return Err(e),
    }
    history.create_version(session_id, path, new_content).await?;
    Ok(())
}
