//! Agent definitions and the events an agent run emits.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::{Message, ToolCall, ToolResult};
use crate::permission::PermissionAction;

/// Whether an agent can be selected as a primary agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    #[default]
    Agent,
    Subagent,
}

/// A permission rule for one tool: either a flat action or a map of
/// argument patterns to actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PermissionRule {
    Action(PermissionAction),
    Patterns(BTreeMap<String, PermissionAction>),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentInfo {
    pub id: String,
    pub mode: AgentMode,
    pub name: String,
    pub description: String,
    pub model: String,
    pub max_tokens: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    pub prompt: String,
    pub permission: BTreeMap<String, PermissionRule>,
    /// Tool enablement; a tool mapped to `false` is hidden and denied.
    pub tools: BTreeMap<String, bool>,
    /// JSON schema for structured output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    pub hidden: bool,
    pub disabled: bool,
}

impl AgentInfo {
    pub fn is_primary(&self) -> bool {
        self.mode == AgentMode::Agent
    }

    pub fn tool_enabled(&self, tool: &str) -> bool {
        self.tools.get(tool).copied().unwrap_or(true)
    }
}

/// Events emitted by an agent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Started {
        session_id: String,
        message_id: String,
    },
    ContentDelta {
        session_id: String,
        message_id: String,
        delta: String,
    },
    ReasoningDelta {
        session_id: String,
        message_id: String,
        delta: String,
    },
    ToolCall {
        session_id: String,
        message_id: String,
        call: ToolCall,
    },
    ToolResult {
        session_id: String,
        message_id: String,
        result: ToolResult,
    },
    Summarized {
        session_id: String,
        summary_message_id: String,
    },
    Done {
        session_id: String,
        message: Message,
        #[serde(skip_serializing_if = "Option::is_none")]
        structured_output: Option<Value>,
    },
    Error {
        session_id: String,
        error: String,
    },
    Canceled {
        session_id: String,
    },
}

impl AgentEvent {
    pub fn session_id(&self) -> &str {
        match self {
            AgentEvent::Started { session_id, .. }
            | AgentEvent::ContentDelta { session_id, .. }
            | AgentEvent::ReasoningDelta { session_id, .. }
            | AgentEvent::ToolCall { session_id, .. }
            | AgentEvent::ToolResult { session_id, .. }
            | AgentEvent::Summarized { session_id, .. }
            | AgentEvent::Done { session_id, .. }
            | AgentEvent::Error { session_id, .. }
            | AgentEvent::Canceled { session_id } => session_id,
        }
    }

    /// Done, Error and Canceled end a run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentEvent::Done { .. } | AgentEvent::Error { .. } | AgentEvent::Canceled { .. }
        )
    }
}
