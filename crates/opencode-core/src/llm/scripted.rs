//! Deterministic provider for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use opencode_types::{FinishReason, ToolCall};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{Provider, ProviderError, ProviderEvent, ProviderRequest, ProviderResponse, ProviderStream, TokenUsage};
use crate::sync::lock_unpoisoned;

/// One scripted model reply.
#[derive(Debug, Clone)]
pub enum ScriptedTurn {
    Events(Vec<ProviderEvent>),
    Error(ProviderError),
}

impl ScriptedTurn {
    pub fn text(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::Events(vec![
            ProviderEvent::ContentDelta(text.clone()),
            ProviderEvent::Complete(ProviderResponse {
                content: text,
                tool_calls: Vec::new(),
                usage: TokenUsage::default(),
                finish_reason: FinishReason::EndTurn,
            }),
        ])
    }

    pub fn tool_call(id: &str, name: &str, input: Value) -> Self {
        Self::tool_calls(vec![(id, name, input)])
    }

    pub fn tool_calls(calls: Vec<(&str, &str, Value)>) -> Self {
        let mut events = Vec::new();
        let mut finished = Vec::new();
        for (id, name, input) in calls {
            let call = ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                input: input.to_string(),
                finished: true,
            };
            events.push(ProviderEvent::ToolUseStart(ToolCall {
                input: String::new(),
                finished: false,
                ..call.clone()
            }));
            events.push(ProviderEvent::ToolUseDelta {
                id: call.id.clone(),
                delta: call.input.clone(),
            });
            events.push(ProviderEvent::ToolUseStop { id: call.id.clone() });
            finished.push(call);
        }
        events.push(ProviderEvent::Complete(ProviderResponse {
            content: String::new(),
            tool_calls: finished,
            usage: TokenUsage::default(),
            finish_reason: FinishReason::ToolUse,
        }));
        Self::Events(events)
    }

    pub fn error(err: ProviderError) -> Self {
        Self::Error(err)
    }

    /// Replace the usage reported by the final event.
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        if let Self::Events(events) = &mut self {
            for event in events.iter_mut() {
                if let ProviderEvent::Complete(response) = event {
                    response.usage = usage;
                }
            }
        }
        self
    }
}

type Handler = Box<dyn Fn(&ProviderRequest) -> Option<ScriptedTurn> + Send + Sync>;

/// Replies from per-agent queues, then a handler, then a default text reply.
pub struct ScriptedProvider {
    queues: Mutex<HashMap<String, VecDeque<ScriptedTurn>>>,
    handler: Option<Handler>,
    default_reply: String,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            handler: None,
            default_reply: "Done".to_string(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ProviderRequest) -> Option<ScriptedTurn> + Send + Sync + 'static,
    {
        self.handler = Some(Box::new(handler));
        self
    }

    pub fn with_default_reply(mut self, reply: impl Into<String>) -> Self {
        self.default_reply = reply.into();
        self
    }

    /// Queue a reply for requests made by `agent`.
    pub fn push(&self, agent: &str, turn: ScriptedTurn) {
        lock_unpoisoned(&self.queues)
            .entry(agent.to_string())
            .or_default()
            .push_back(turn);
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<ProviderRequest> {
        lock_unpoisoned(&self.requests).clone()
    }

    fn next_turn(&self, request: &ProviderRequest) -> ScriptedTurn {
        let queued = lock_unpoisoned(&self.queues)
            .get_mut(&request.agent)
            .and_then(VecDeque::pop_front);
        if let Some(turn) = queued {
            return turn;
        }
        if let Some(turn) = self.handler.as_ref().and_then(|h| h(request)) {
            return turn;
        }
        ScriptedTurn::text(self.default_reply.clone())
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> Result<ProviderStream, ProviderError> {
        if cancel.is_cancelled() {
            return Err(ProviderError::Canceled);
        }
        let turn = self.next_turn(&request);
        lock_unpoisoned(&self.requests).push(request);
        match turn {
            ScriptedTurn::Events(events) => Ok(Box::pin(futures::stream::iter(
                events.into_iter().map(Ok),
            ))),
            ScriptedTurn::Error(err) => Err(err),
        }
    }
}
