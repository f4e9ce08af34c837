//! Session types.

use serde::{Deserialize, Serialize};

/// Title given to sessions before the descriptor agent names them.
pub const DEFAULT_SESSION_TITLE: &str = "New Session";

/// A conversation, possibly nested under a parent session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// Direct creator of this session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    /// Eldest ancestor; `None` for root sessions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_session_id: Option<String>,
    pub title: String,
    pub message_count: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    /// Cumulative cost in USD.
    pub cost: f64,
    /// Assistant message that condensed earlier history.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_message_id: Option<String>,
    pub project_id: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Session {
    /// Whether this session has no parent.
    pub fn is_root(&self) -> bool {
        self.parent_session_id.is_none()
    }

    /// Id of the tree this session belongs to.
    pub fn tree_root_id(&self) -> &str {
        self.root_session_id.as_deref().unwrap_or(&self.id)
    }

    /// Prompt plus completion tokens accumulated since the last reset.
    pub fn total_tokens(&self) -> i64 {
        self.prompt_tokens + self.completion_tokens
    }
}
