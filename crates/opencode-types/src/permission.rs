use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of evaluating a permission rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionAction {
    Allow,
    Deny,
    Ask,
}

impl PermissionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionAction::Allow => "allow",
            PermissionAction::Deny => "deny",
            PermissionAction::Ask => "ask",
        }
    }
}

/// A pending request for the user to approve a tool action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: String,
    pub session_id: String,
    pub tool_name: String,
    pub action: String,
    pub description: String,
    pub path: String,
    #[serde(default)]
    pub params: Value,
}

/// How far a grant reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantScope {
    /// Only this request.
    Once,
    /// Every later request in the session.
    Session,
    /// Later requests in the session for the same tool under the same path.
    SessionPathTool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    Granted(GrantScope),
    Denied,
}

impl PermissionDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, PermissionDecision::Granted(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PermissionEvent {
    Requested(PermissionRequest),
    Resolved {
        request: PermissionRequest,
        decision: PermissionDecision,
    },
}
