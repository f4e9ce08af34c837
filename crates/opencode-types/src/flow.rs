//! Flow execution records.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Status of one flow step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Running,
    Completed,
    Failed,
}

impl FlowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowStatus::Running => "running",
            FlowStatus::Completed => "completed",
            FlowStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(FlowStatus::Running),
            "completed" => Some(FlowStatus::Completed),
            "failed" => Some(FlowStatus::Failed),
            _ => None,
        }
    }
}

/// Per-step execution record, keyed by the step's session id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowState {
    pub session_id: String,
    pub root_session_id: String,
    pub flow_id: String,
    pub step_id: String,
    pub status: FlowStatus,
    /// Arguments carried through the flow.
    pub args: Map<String, Value>,
    /// Step output; JSON text when `is_struct_output` is set.
    pub output: String,
    pub is_struct_output: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl FlowState {
    /// Parsed structured output, if the step produced one.
    pub fn structured_output(&self) -> Option<Value> {
        if !self.is_struct_output {
            return None;
        }
        serde_json::from_str(&self.output).ok()
    }
}
