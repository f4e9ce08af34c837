//! Agents: definitions, the run loop and lazy construction.

mod prompt;
mod provider;
mod registry;
mod runtime;

pub use prompt::{CONTEXT_FILES, build_system_prompt, load_context_files};
pub use provider::AgentProvider;
pub use registry::{AgentRegistry, CODER_AGENT, DESCRIPTOR_AGENT, SUMMARIZER_AGENT, TASK_AGENT, glob_match};
pub use runtime::{ActiveRuns, AgentRuntime, MAX_STRUCT_OUTPUT_REPROMPTS, RunOutcome, collect_run};

use std::sync::Arc;

use opencode_types::BinaryContent;
use serde_json::Value;

use crate::config::Config;
use crate::discovery::SkillRegistry;
use crate::llm::ProviderFactory;
use crate::message::MessageService;
use crate::permission::PermissionGate;
use crate::retry::Backoff;
use crate::session::SessionService;
use crate::tools::ToolRegistry;

/// Per-run inputs beyond the prompt.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub attachments: Vec<BinaryContent>,
    /// JSON schema the run must answer through `struct_output`. Overrides
    /// the agent's own `output` schema.
    pub output_schema: Option<Value>,
}

impl RunOptions {
    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }
}

/// Everything an agent runtime needs from the app.
#[derive(Clone)]
pub struct AgentServices {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionService>,
    pub messages: Arc<MessageService>,
    pub permissions: Arc<PermissionGate>,
    pub registry: Arc<AgentRegistry>,
    pub tools: ToolRegistry,
    pub providers: Arc<dyn ProviderFactory>,
    pub skills: Arc<SkillRegistry>,
    pub backoff: Backoff,
    /// Sessions with a run in progress, shared by every agent.
    pub runs: Arc<ActiveRuns>,
}
