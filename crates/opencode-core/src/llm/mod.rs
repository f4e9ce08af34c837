//! LLM provider contract.
//!
//! A provider turns a [`ProviderRequest`] into a stream of [`ProviderEvent`]s
//! ending in [`ProviderEvent::Complete`]. Retries live in the agent runtime,
//! not in the providers.

mod models;
mod openai;
#[cfg(any(test, feature = "test-support"))]
mod scripted;

pub use models::{ModelInfo, ProviderKind, default_models, model_info};
pub use openai::OpenAiCompatProvider;
#[cfg(any(test, feature = "test-support"))]
pub use scripted::{ScriptedProvider, ScriptedTurn};

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use opencode_types::{FinishReason, Message, ToolCall};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::sync::lock_unpoisoned;
use crate::tools::ToolInfo;

/// Classified provider failure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("request canceled")]
    Canceled,
}

impl ProviderError {
    /// Rate limits and transient failures are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. } | ProviderError::Transient(_)
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
}

impl TokenUsage {
    pub fn total(&self) -> i64 {
        self.input_tokens + self.output_tokens + self.cache_creation_tokens + self.cache_read_tokens
    }
}

/// Final result of one model request.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
    pub finish_reason: FinishReason,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    ContentDelta(String),
    ReasoningDelta(String),
    ToolUseStart(ToolCall),
    ToolUseDelta { id: String, delta: String },
    ToolUseStop { id: String },
    Complete(ProviderResponse),
}

#[derive(Debug, Clone)]
pub struct ProviderRequest {
    /// Requesting agent, for logging.
    pub agent: String,
    pub model: String,
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolInfo>,
    pub max_tokens: i64,
    pub reasoning_effort: Option<String>,
    /// Require the model to call this tool.
    pub force_tool: Option<String>,
}

pub type ProviderStream = BoxStream<'static, Result<ProviderEvent, ProviderError>>;

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Start a request. Cancellation ends the stream with [`ProviderError::Canceled`].
    async fn stream(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> Result<ProviderStream, ProviderError>;
}

/// Drain a stream into its final response.
pub async fn collect(mut stream: ProviderStream) -> Result<ProviderResponse, ProviderError> {
    while let Some(event) = stream.next().await {
        if let ProviderEvent::Complete(response) = event? {
            return Ok(response);
        }
    }
    Err(ProviderError::Transient(
        "stream ended without a final response".to_string(),
    ))
}

/// Resolves a model tag to the provider that serves it.
pub trait ProviderFactory: Send + Sync {
    fn provider_for(&self, model: &str) -> Result<Arc<dyn Provider>, ProviderError>;
}

/// Builds OpenAI-compatible providers from the `providers` config section.
pub struct ConfigProviderFactory {
    providers: BTreeMap<String, crate::config::ProviderConfig>,
    cache: Mutex<BTreeMap<ProviderKind, Arc<dyn Provider>>>,
}

impl ConfigProviderFactory {
    pub fn new(config: &Config) -> Self {
        Self {
            providers: config
                .providers
                .iter()
                .filter(|(_, p)| !p.disabled)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            cache: Mutex::new(BTreeMap::new()),
        }
    }
}

impl ProviderFactory for ConfigProviderFactory {
    fn provider_for(&self, model: &str) -> Result<Arc<dyn Provider>, ProviderError> {
        let kind = model_info(model).provider;
        let mut cache = lock_unpoisoned(&self.cache);
        if let Some(provider) = cache.get(&kind) {
            return Ok(provider.clone());
        }
        let config = self
            .providers
            .get(kind.as_str())
            .ok_or_else(|| ProviderError::Auth(format!("provider {} is not configured", kind.as_str())))?;
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ProviderError::Auth(format!("no API key for provider {}", kind.as_str())))?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| kind.default_base_url().to_string());
        let provider: Arc<dyn Provider> = Arc::new(OpenAiCompatProvider::new(
            kind.as_str(),
            base_url,
            api_key,
            config.headers.clone(),
        ));
        cache.insert(kind, provider.clone());
        Ok(provider)
    }
}

/// Serves every model with the same provider.
pub struct StaticProviderFactory {
    provider: Arc<dyn Provider>,
}

impl StaticProviderFactory {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }
}

impl ProviderFactory for StaticProviderFactory {
    fn provider_for(&self, _model: &str) -> Result<Arc<dyn Provider>, ProviderError> {
        Ok(self.provider.clone())
    }
}
