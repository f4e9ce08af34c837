//! Error types for OpenCode core.

use thiserror::Error;

use crate::llm::ProviderError;
use crate::patch::PatchError;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Session {0} is busy")]
    AgentBusy(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Agent is disabled: {0}")]
    AgentDisabled(String),

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Request canceled")]
    Canceled,

    #[error("Agent run failed: {0}")]
    AgentFailed(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("LSP error: {0}")]
    Lsp(String),

    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    #[error("Flow is disabled: {0}")]
    FlowDisabled(String),

    #[error("Invalid flow {flow}: {reason}")]
    FlowValidation { flow: String, reason: String },

    #[error("Flow step {step} failed: {reason}")]
    FlowStepFailed { step: String, reason: String },

    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Patch error: {0}")]
    Patch(#[from] PatchError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("MySQL error: {0}")]
    Mysql(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl CoreError {
    /// True for errors a caller should treat as a quiet cancellation.
    pub fn is_canceled(&self) -> bool {
        matches!(
            self,
            CoreError::Canceled | CoreError::Provider(ProviderError::Canceled)
        )
    }
}
