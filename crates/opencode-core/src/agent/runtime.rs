//! The turn-taking loop for one agent.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::{FutureExt, StreamExt};
use opencode_types::{
    AgentEvent, AgentInfo, ContentPart, DEFAULT_SESSION_TITLE, EventKind, Event, Finish, FinishReason, Message,
    PermissionAction, PermissionRequest, Role, Session, ToolCall, ToolResult, new_id, now_unix,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::prompt::build_system_prompt;
use super::registry::{DESCRIPTOR_AGENT, SUMMARIZER_AGENT};
use super::{AgentServices, RunOptions};
use crate::llm::{ProviderError, ProviderRequest, ProviderResponse, ProviderEvent, TokenUsage, collect, model_info};
use crate::pubsub::Broker;
use crate::retry::{retry, sleep_cancelable};
use crate::sync::lock_unpoisoned;
use crate::tools::{
    MAX_RESPONSE_BYTES, ResponseKind, STRUCT_OUTPUT_TOOL, StructOutputTool, ToolContext, ToolInvocation,
    ToolRegistry, truncate_response,
};
use crate::{CoreError, Result};

/// Times a run with an output schema is re-prompted when the model ends
/// its turn without calling `struct_output`.
pub const MAX_STRUCT_OUTPUT_REPROMPTS: usize = 3;

const EVENT_BUFFER: usize = 1024;
const MAX_TITLE_LEN: usize = 100;
const STRUCT_OUTPUT_REMINDER: &str =
    "You must finish by calling the struct_output tool with arguments matching its schema.";
const SUMMARY_REQUEST: &str = "Provide a detailed but concise summary of our conversation above. \
Focus on what was done, what is in progress, which files are involved, and what should happen next.";

/// Sessions with a run in progress. At most one run per session.
#[derive(Default)]
pub struct ActiveRuns {
    runs: Mutex<HashMap<String, (String, CancellationToken)>>,
}

impl ActiveRuns {
    pub fn new() -> Self {
        Self::default()
    }

    fn begin(self: &Arc<Self>, session_id: &str, agent_id: &str, token: CancellationToken) -> Result<RunGuard> {
        let mut runs = lock_unpoisoned(&self.runs);
        if runs.contains_key(session_id) {
            return Err(CoreError::AgentBusy(session_id.to_string()));
        }
        runs.insert(session_id.to_string(), (agent_id.to_string(), token));
        Ok(RunGuard {
            runs: self.clone(),
            session_id: session_id.to_string(),
        })
    }

    pub fn is_session_busy(&self, session_id: &str) -> bool {
        lock_unpoisoned(&self.runs).contains_key(session_id)
    }

    pub fn is_busy(&self) -> bool {
        !lock_unpoisoned(&self.runs).is_empty()
    }

    fn is_agent_busy(&self, agent_id: &str) -> bool {
        lock_unpoisoned(&self.runs).values().any(|(a, _)| a == agent_id)
    }

    /// Cancel the run on `session_id`. Returns false when none is active.
    pub fn cancel(&self, session_id: &str) -> bool {
        match lock_unpoisoned(&self.runs).get(session_id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for (_, token) in lock_unpoisoned(&self.runs).values() {
            token.cancel();
        }
    }
}

/// Frees the session slot however the run ends.
struct RunGuard {
    runs: Arc<ActiveRuns>,
    session_id: String,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        lock_unpoisoned(&self.runs.runs).remove(&self.session_id);
    }
}

/// Final answer of a run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub message: Message,
    pub structured_output: Option<Value>,
}

/// Drain a run's events, forwarding each one, until it ends.
pub async fn collect_run(
    mut events: mpsc::Receiver<AgentEvent>,
    forward: Option<&mpsc::Sender<AgentEvent>>,
) -> Result<RunOutcome> {
    let mut outcome = Err(CoreError::AgentFailed("run ended without a result".into()));
    while let Some(event) = events.recv().await {
        if let Some(forward) = forward {
            let _ = forward.send(event.clone()).await;
        }
        match event {
            AgentEvent::Done {
                message,
                structured_output,
                ..
            } => {
                outcome = Ok(RunOutcome {
                    message,
                    structured_output,
                })
            }
            AgentEvent::Error { error, .. } => outcome = Err(CoreError::AgentFailed(error)),
            AgentEvent::Canceled { .. } => outcome = Err(CoreError::Canceled),
            _ => {}
        }
    }
    outcome
}

enum StreamError {
    Provider { error: ProviderError, emitted: bool },
    Store(CoreError),
}

impl From<CoreError> for StreamError {
    fn from(e: CoreError) -> Self {
        StreamError::Store(e)
    }
}

struct ToolOutcome {
    structured: Option<Value>,
    canceled: bool,
}

/// Drives model turns and tool calls for one agent.
pub struct AgentRuntime {
    info: AgentInfo,
    services: AgentServices,
    broker: Broker<AgentEvent>,
}

impl AgentRuntime {
    pub fn new(info: AgentInfo, services: AgentServices) -> Self {
        Self {
            info,
            services,
            broker: Broker::new(),
        }
    }

    pub fn info(&self) -> &AgentInfo {
        &self.info
    }

    fn is_task_agent(&self) -> bool {
        !self.info.is_primary()
    }

    fn is_internal(&self) -> bool {
        self.info.id == SUMMARIZER_AGENT || self.info.id == DESCRIPTOR_AGENT
    }

    /// True while this agent has a run in progress on any session.
    pub fn is_busy(&self) -> bool {
        self.services.runs.is_agent_busy(&self.info.id)
    }

    pub fn is_session_busy(&self, session_id: &str) -> bool {
        self.services.runs.is_session_busy(session_id)
    }

    pub fn cancel(&self, session_id: &str) -> bool {
        self.services.runs.cancel(session_id)
    }

    /// Every event of every run of this agent.
    pub fn subscribe(&self, cancel: &CancellationToken) -> mpsc::Receiver<Event<AgentEvent>> {
        self.broker.subscribe(cancel)
    }

    pub fn shutdown(&self) {
        self.broker.shutdown();
    }

    /// Start a run. Fails synchronously when the session is busy or missing,
    /// or the output schema is invalid; everything else arrives as events.
    pub async fn run(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        session_id: &str,
        prompt: &str,
        options: RunOptions,
    ) -> Result<mpsc::Receiver<AgentEvent>> {
        let session = self.services.sessions.get(session_id).await?;
        let schema = options.output_schema.clone().or_else(|| self.info.output.clone());
        let struct_tool = schema.map(StructOutputTool::new).transpose()?.map(Arc::new);
        let token = cancel.child_token();
        let guard = self.services.runs.begin(session_id, &self.info.id, token.clone())?;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let runtime = self.clone();
        let prompt = prompt.to_string();
        info!(target: "opencode::agent", agent = %self.info.id, session_id = %session_id, "Run started");
        tokio::spawn(async move {
            let _guard = guard;
            let session_id = session.id.clone();
            let result = runtime
                .run_session(&token, session, prompt, options, struct_tool, &tx)
                .await;
            if let Err(e) = result {
                error!(target: "opencode::agent", agent = %runtime.info.id, session_id = %session_id, "Run failed: {}", e);
                runtime
                    .emit(&tx, AgentEvent::Error { session_id, error: e.to_string() })
                    .await;
            }
        });
        Ok(rx)
    }

    async fn emit(&self, tx: &mpsc::Sender<AgentEvent>, event: AgentEvent) {
        self.broker.publish(EventKind::Updated, event.clone()).await;
        let _ = tx.send(event).await;
    }

    async fn run_session(
        &self,
        cancel: &CancellationToken,
        session: Session,
        prompt: String,
        options: RunOptions,
        struct_tool: Option<Arc<StructOutputTool>>,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> Result<()> {
        let session_id = session.id.clone();
        let mut parts = vec![ContentPart::text(&prompt)];
        parts.extend(options.attachments.into_iter().map(ContentPart::Binary));
        self.services
            .messages
            .create(&session_id, Role::User, parts, None)
            .await?;
        if session.message_count == 0 && session.title == DEFAULT_SESSION_TITLE && !self.is_internal() {
            self.spawn_title(session_id.clone(), prompt.clone());
        }

        let tools = self.tools_for_run(struct_tool.clone());
        let tool_infos: Vec<_> = tools.list().map(|t| t.info()).collect();
        let system = build_system_prompt(
            &self.info.prompt,
            &self.services.config.working_dir,
            Some(&self.services.skills),
            !self.is_internal(),
        );
        let mut reprompts = 0;
        let mut force_tool = None;

        loop {
            if cancel.is_cancelled() {
                return self.finish_canceled(session_id, tx).await;
            }
            self.maybe_compact(cancel, &session_id, tx).await?;

            let request = ProviderRequest {
                agent: self.info.id.clone(),
                model: self.info.model.clone(),
                system: system.clone(),
                messages: self.history(&session_id).await?,
                tools: tool_infos.clone(),
                max_tokens: self.info.max_tokens,
                reasoning_effort: self.info.reasoning_effort.clone(),
                force_tool: force_tool.clone(),
            };
            let mut message = self
                .services
                .messages
                .create(&session_id, Role::Assistant, Vec::new(), Some(self.info.model.clone()))
                .await?;
            self.emit(
                tx,
                AgentEvent::Started {
                    session_id: session_id.clone(),
                    message_id: message.id.clone(),
                },
            )
            .await;

            let response = match self.stream_with_retry(cancel, request, &mut message, tx).await {
                Ok(response) => response,
                Err(StreamError::Store(e)) => return Err(e),
                Err(StreamError::Provider {
                    error: ProviderError::Canceled,
                    ..
                }) => {
                    self.finish_message(&mut message, FinishReason::Canceled).await?;
                    info!(target: "opencode::agent", session_id = %session_id, "Run canceled");
                    self.emit(tx, AgentEvent::Canceled { session_id }).await;
                    return Ok(());
                }
                Err(StreamError::Provider { error, .. }) => {
                    self.finish_message(&mut message, FinishReason::Error).await?;
                    warn!(target: "opencode::agent", session_id = %session_id, "Provider error: {}", error);
                    self.emit(
                        tx,
                        AgentEvent::Error {
                            session_id,
                            error: error.to_string(),
                        },
                    )
                    .await;
                    return Ok(());
                }
            };
            self.record_usage(&session_id, &response.usage).await?;

            if !response.tool_calls.is_empty() {
                for call in &response.tool_calls {
                    message.add_tool_call(ToolCall {
                        finished: true,
                        ..call.clone()
                    });
                }
                message.finish_tool_calls();
                self.finish_message(&mut message, FinishReason::ToolUse).await?;

                let outcome = self.execute_tools(cancel, &session_id, &message, &tools, tx).await?;
                if outcome.canceled {
                    return self.finish_canceled(session_id, tx).await;
                }
                if let Some(value) = outcome.structured {
                    self.emit(
                        tx,
                        AgentEvent::Done {
                            session_id,
                            message,
                            structured_output: Some(value),
                        },
                    )
                    .await;
                    return Ok(());
                }
                force_tool = None;
                continue;
            }

            let reason = match response.finish_reason {
                FinishReason::ToolUse => FinishReason::EndTurn,
                other => other,
            };
            self.finish_message(&mut message, reason).await?;

            if struct_tool.is_some() {
                if reprompts < MAX_STRUCT_OUTPUT_REPROMPTS {
                    reprompts += 1;
                    debug!(target: "opencode::agent", session_id = %session_id, attempt = reprompts, "Re-prompting for structured output");
                    self.services
                        .messages
                        .create(&session_id, Role::User, vec![ContentPart::text(STRUCT_OUTPUT_REMINDER)], None)
                        .await?;
                    force_tool = Some(STRUCT_OUTPUT_TOOL.to_string());
                    continue;
                }
                self.emit(
                    tx,
                    AgentEvent::Error {
                        session_id,
                        error: format!("agent finished without calling {STRUCT_OUTPUT_TOOL}"),
                    },
                )
                .await;
                return Ok(());
            }

            info!(target: "opencode::agent", agent = %self.info.id, session_id = %session_id, reason = reason.as_str(), "Run finished");
            self.emit(
                tx,
                AgentEvent::Done {
                    session_id,
                    message,
                    structured_output: None,
                },
            )
            .await;
            return Ok(());
        }
    }

    /// Tools the model may call in this run.
    fn tools_for_run(&self, struct_tool: Option<Arc<StructOutputTool>>) -> ToolRegistry {
        let mut tools = ToolRegistry::new();
        for tool in self.services.tools.list() {
            let name = tool.info().name;
            if self.is_task_agent() && name == "task" {
                continue;
            }
            if self.services.registry.is_tool_enabled(&self.info.id, &name) {
                tools.register(tool.clone());
            }
        }
        if let Some(tool) = struct_tool {
            tools.register(tool);
        }
        tools
    }

    /// Messages sent to the model: from the summary onward when one exists.
    async fn history(&self, session_id: &str) -> Result<Vec<Message>> {
        let session = self.services.sessions.get(session_id).await?;
        let mut messages = self.services.messages.list(session_id).await?;
        if let Some(summary_id) = &session.summary_message_id {
            if let Some(pos) = messages.iter().position(|m| &m.id == summary_id) {
                messages = messages.split_off(pos);
            }
        }
        messages.retain(|m| !m.parts.is_empty());
        Ok(messages)
    }

    /// Close the transcript with an assistant turn ending in `Finish(canceled)`
    /// when cancellation lands outside a streaming turn.
    async fn finish_canceled(&self, session_id: String, tx: &mpsc::Sender<AgentEvent>) -> Result<()> {
        let finish = ContentPart::Finish(Finish {
            reason: FinishReason::Canceled,
            time: now_unix(),
        });
        self.services
            .messages
            .create(&session_id, Role::Assistant, vec![finish], Some(self.info.model.clone()))
            .await?;
        info!(target: "opencode::agent", session_id = %session_id, "Run canceled");
        self.emit(tx, AgentEvent::Canceled { session_id }).await;
        Ok(())
    }

    async fn finish_message(&self, message: &mut Message, reason: FinishReason) -> Result<()> {
        message.add_finish(reason, now_unix());
        self.services.messages.update(message).await
    }

    async fn stream_with_retry(
        &self,
        cancel: &CancellationToken,
        request: ProviderRequest,
        message: &mut Message,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> std::result::Result<ProviderResponse, StreamError> {
        let backoff = self.services.backoff;
        let mut attempt = 0;
        loop {
            match self.stream_once(cancel, request.clone(), message, tx).await {
                Ok(response) => return Ok(response),
                Err(StreamError::Provider { error, emitted })
                    if error.is_retryable() && !emitted && attempt + 1 < backoff.max_attempts =>
                {
                    let delay = backoff.delay_for(attempt, &error);
                    warn!(
                        target: "opencode::agent",
                        agent = %self.info.id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying model request: {}",
                        error
                    );
                    if !sleep_cancelable(cancel, delay).await {
                        return Err(StreamError::Provider {
                            error: ProviderError::Canceled,
                            emitted: false,
                        });
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One model request. Parts are persisted as they arrive.
    async fn stream_once(
        &self,
        cancel: &CancellationToken,
        request: ProviderRequest,
        message: &mut Message,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> std::result::Result<ProviderResponse, StreamError> {
        let provider_err = |error: ProviderError, emitted: bool| StreamError::Provider { error, emitted };
        let provider = self
            .services
            .providers
            .provider_for(&request.model)
            .map_err(|e| provider_err(e, false))?;
        let mut stream = provider
            .stream(request, cancel.clone())
            .await
            .map_err(|e| provider_err(e, false))?;
        let mut emitted = false;
        let session_id = message.session_id.clone();

        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                _ = cancel.cancelled() => return Err(provider_err(ProviderError::Canceled, emitted)),
            };
            let Some(event) = next else {
                return Err(provider_err(
                    ProviderError::Transient("stream ended without a final response".into()),
                    emitted,
                ));
            };
            match event.map_err(|e| provider_err(e, emitted))? {
                ProviderEvent::ContentDelta(delta) => {
                    emitted = true;
                    message.append_content(&delta);
                    self.services.messages.update(message).await?;
                    self.emit(
                        tx,
                        AgentEvent::ContentDelta {
                            session_id: session_id.clone(),
                            message_id: message.id.clone(),
                            delta,
                        },
                    )
                    .await;
                }
                ProviderEvent::ReasoningDelta(delta) => {
                    emitted = true;
                    message.append_reasoning(&delta);
                    self.services.messages.update(message).await?;
                    self.emit(
                        tx,
                        AgentEvent::ReasoningDelta {
                            session_id: session_id.clone(),
                            message_id: message.id.clone(),
                            delta,
                        },
                    )
                    .await;
                }
                ProviderEvent::ToolUseStart(call) => {
                    emitted = true;
                    message.add_tool_call(call);
                    self.services.messages.update(message).await?;
                }
                ProviderEvent::ToolUseDelta { id, delta } => {
                    for part in message.parts.iter_mut() {
                        if let ContentPart::ToolCall(call) = part {
                            if call.id == id {
                                call.input.push_str(&delta);
                            }
                        }
                    }
                }
                ProviderEvent::ToolUseStop { .. } => {
                    self.services.messages.update(message).await?;
                }
                ProviderEvent::Complete(response) => {
                    if message.content().is_empty() && !response.content.is_empty() {
                        message.append_content(&response.content);
                        self.emit(
                            tx,
                            AgentEvent::ContentDelta {
                                session_id: session_id.clone(),
                                message_id: message.id.clone(),
                                delta: response.content.clone(),
                            },
                        )
                        .await;
                    }
                    return Ok(response);
                }
            }
        }
    }

    async fn record_usage(&self, session_id: &str, usage: &TokenUsage) -> Result<()> {
        if usage.total() == 0 {
            return Ok(());
        }
        let cost = model_info(&self.info.model).cost(usage);
        self.services
            .sessions
            .add_usage(
                session_id,
                usage.input_tokens + usage.cache_creation_tokens + usage.cache_read_tokens,
                usage.output_tokens,
                cost,
            )
            .await?;
        Ok(())
    }

    async fn execute_tools(
        &self,
        cancel: &CancellationToken,
        session_id: &str,
        message: &Message,
        tools: &ToolRegistry,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> Result<ToolOutcome> {
        let mut results = Vec::new();
        let mut structured = None;
        let mut canceled = false;
        for call in message.tool_calls() {
            self.emit(
                tx,
                AgentEvent::ToolCall {
                    session_id: session_id.to_string(),
                    message_id: message.id.clone(),
                    call: call.clone(),
                },
            )
            .await;
            let result = if canceled || cancel.is_cancelled() {
                canceled = true;
                error_result(call, "tool call canceled")
            } else {
                self.execute_tool(cancel, session_id, &message.id, tools, call).await
            };
            if call.name == STRUCT_OUTPUT_TOOL && !result.is_error {
                structured = serde_json::from_str(&result.metadata).ok();
            }
            self.emit(
                tx,
                AgentEvent::ToolResult {
                    session_id: session_id.to_string(),
                    message_id: message.id.clone(),
                    result: result.clone(),
                },
            )
            .await;
            results.push(ContentPart::ToolResult(result));
        }
        self.services
            .messages
            .create(session_id, Role::Tool, results, None)
            .await?;
        Ok(ToolOutcome {
            structured,
            canceled: canceled || cancel.is_cancelled(),
        })
    }

    async fn execute_tool(
        &self,
        cancel: &CancellationToken,
        session_id: &str,
        message_id: &str,
        tools: &ToolRegistry,
        call: &ToolCall,
    ) -> ToolResult {
        let Some(tool) = tools.get(&call.name) else {
            return error_result(call, &format!("tool not found: {}", call.name));
        };
        let ctx = ToolContext {
            session_id: session_id.to_string(),
            message_id: message_id.to_string(),
            agent_id: self.info.id.clone(),
            is_task_agent: self.is_task_agent(),
            working_dir: self.services.config.working_dir.clone(),
            cancel: cancel.clone(),
        };
        let input: Value = serde_json::from_str(&call.input).unwrap_or(Value::Null);

        if let Some(spec) = tool.permission(&ctx, &input) {
            let verdict = self
                .services
                .registry
                .evaluate_permission(&self.info.id, &call.name, &spec.pattern);
            let allowed = match verdict {
                PermissionAction::Allow => true,
                PermissionAction::Deny => false,
                PermissionAction::Ask if spec.read_only => true,
                PermissionAction::Ask => {
                    let request = PermissionRequest {
                        id: new_id(),
                        session_id: session_id.to_string(),
                        tool_name: call.name.clone(),
                        action: spec.action,
                        description: spec.description,
                        path: spec.path,
                        params: spec.params,
                    };
                    self.services.permissions.request(cancel, request).await
                }
            };
            if !allowed {
                info!(target: "opencode::permission", tool = %call.name, session_id = %session_id, "Tool call denied");
                return error_result(call, "permission denied");
            }
        }

        let invocation = ToolInvocation {
            id: call.id.clone(),
            name: call.name.clone(),
            input: call.input.clone(),
        };
        debug!(target: "opencode::tools", tool = %call.name, call_id = %call.id, "Running tool");
        match AssertUnwindSafe(tool.run(&ctx, &invocation)).catch_unwind().await {
            Ok(Ok(response)) => {
                let content = match response.kind {
                    ResponseKind::Text => truncate_response(&response.content, MAX_RESPONSE_BYTES),
                    ResponseKind::Image => response.content,
                };
                ToolResult {
                    tool_call_id: call.id.clone(),
                    name: call.name.clone(),
                    content,
                    metadata: response.metadata,
                    is_error: response.is_error,
                }
            }
            Ok(Err(e)) => {
                warn!(target: "opencode::tools", tool = %call.name, "Tool failed: {}", e);
                error_result(call, &format!("error: {e}"))
            }
            Err(_) => {
                error!(target: "opencode::tools", tool = %call.name, "Tool panicked");
                error_result(call, &format!("tool {} panicked", call.name))
            }
        }
    }

    async fn maybe_compact(
        &self,
        cancel: &CancellationToken,
        session_id: &str,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> Result<()> {
        let config = &self.services.config;
        if !config.auto_compact || self.is_internal() {
            return Ok(());
        }
        let window = model_info(&self.info.model).context_window;
        if window <= 0 {
            return Ok(());
        }
        let session = self.services.sessions.get(session_id).await?;
        let used = session.prompt_tokens + session.completion_tokens;
        if (used as f64) < config.auto_compact_threshold * window as f64 {
            return Ok(());
        }
        info!(target: "opencode::agent", session_id = %session_id, used, window, "Auto-compacting session");
        if let Some(summary_id) = self.compact(cancel, session_id, true).await? {
            self.emit(
                tx,
                AgentEvent::Summarized {
                    session_id: session_id.to_string(),
                    summary_message_id: summary_id,
                },
            )
            .await;
        }
        Ok(())
    }

    /// Summarize the session on demand.
    pub async fn summarize(&self, cancel: &CancellationToken, session_id: &str) -> Result<Option<String>> {
        if self.services.runs.is_session_busy(session_id) {
            return Err(CoreError::AgentBusy(session_id.to_string()));
        }
        let summary = self.compact(cancel, session_id, false).await?;
        if let Some(summary_id) = &summary {
            self.broker
                .publish(
                    EventKind::Updated,
                    AgentEvent::Summarized {
                        session_id: session_id.to_string(),
                        summary_message_id: summary_id.clone(),
                    },
                )
                .await;
        }
        Ok(summary)
    }

    /// Replace the history with a summary message, resetting the token
    /// counters. With `carry_last_user` the last user turn is repeated after
    /// the summary so the run can continue.
    async fn compact(&self, cancel: &CancellationToken, session_id: &str, carry_last_user: bool) -> Result<Option<String>> {
        let summarizer = self.services.registry.get_enabled(SUMMARIZER_AGENT)?.clone();
        let mut history = self.history(session_id).await?;
        if history.is_empty() {
            return Ok(None);
        }
        let last_user = history.iter().rev().find(|m| m.role == Role::User).cloned();
        let now = now_unix();
        history.push(Message {
            id: new_id(),
            session_id: session_id.to_string(),
            role: Role::User,
            parts: vec![ContentPart::text(SUMMARY_REQUEST)],
            model: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        });
        let request = ProviderRequest {
            agent: summarizer.id.clone(),
            model: summarizer.model.clone(),
            system: build_system_prompt(&summarizer.prompt, &self.services.config.working_dir, None, false),
            messages: history,
            tools: Vec::new(),
            max_tokens: summarizer.max_tokens,
            reasoning_effort: None,
            force_tool: None,
        };
        let response = complete(&self.services, cancel, request).await?;
        let text = response.content.trim();
        if text.is_empty() {
            warn!(target: "opencode::agent", session_id = %session_id, "Summarizer returned nothing");
            return Ok(None);
        }

        let summary = self
            .services
            .messages
            .create(
                session_id,
                Role::Assistant,
                vec![
                    ContentPart::text(text),
                    ContentPart::Finish(Finish {
                        reason: FinishReason::EndTurn,
                        time: now_unix(),
                    }),
                ],
                Some(summarizer.model.clone()),
            )
            .await?;
        let sessions = &self.services.sessions;
        sessions.set_summary(session_id, &summary.id).await?;
        sessions
            .add_usage(session_id, 0, 0, model_info(&summarizer.model).cost(&response.usage))
            .await?;

        if carry_last_user {
            if let Some(user) = last_user {
                self.services
                    .messages
                    .create(session_id, Role::User, user.parts, None)
                    .await?;
            }
        }
        info!(target: "opencode::agent", session_id = %session_id, summary_id = %summary.id, "Session summarized");
        Ok(Some(summary.id))
    }

    fn spawn_title(&self, session_id: String, prompt: String) {
        let services = self.services.clone();
        tokio::spawn(async move {
            if let Err(e) = generate_title(&services, &session_id, &prompt).await {
                debug!(target: "opencode::agent", session_id = %session_id, "Title generation failed: {}", e);
            }
        });
    }
}

fn error_result(call: &ToolCall, content: &str) -> ToolResult {
    ToolResult {
        tool_call_id: call.id.clone(),
        name: call.name.clone(),
        content: content.to_string(),
        metadata: String::new(),
        is_error: true,
    }
}

/// One tool-less request with retries.
async fn complete(
    services: &AgentServices,
    cancel: &CancellationToken,
    request: ProviderRequest,
) -> Result<ProviderResponse> {
    let provider = services.providers.provider_for(&request.model)?;
    let response = retry(services.backoff, cancel, |_| {
        let provider = provider.clone();
        let request = request.clone();
        let cancel = cancel.clone();
        async move { collect(provider.stream(request, cancel).await?).await }
    })
    .await?;
    Ok(response)
}

async fn generate_title(services: &AgentServices, session_id: &str, prompt: &str) -> Result<()> {
    let descriptor = services.registry.get_enabled(DESCRIPTOR_AGENT)?.clone();
    let now = now_unix();
    let request = ProviderRequest {
        agent: descriptor.id.clone(),
        model: descriptor.model.clone(),
        system: descriptor.prompt.clone(),
        messages: vec![Message {
            id: new_id(),
            session_id: session_id.to_string(),
            role: Role::User,
            parts: vec![ContentPart::text(prompt)],
            model: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }],
        tools: Vec::new(),
        max_tokens: descriptor.max_tokens,
        reasoning_effort: None,
        force_tool: None,
    };
    let response = complete(services, &CancellationToken::new(), request).await?;
    let title = clean_title(&response.content);
    if title.is_empty() {
        return Ok(());
    }
    let session = services.sessions.get(session_id).await?;
    if session.title == DEFAULT_SESSION_TITLE {
        services.sessions.set_title(session_id, &title).await?;
    }
    services
        .sessions
        .add_usage(session_id, 0, 0, model_info(&descriptor.model).cost(&response.usage))
        .await?;
    Ok(())
}

fn clean_title(raw: &str) -> String {
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or_default();
    let line = line.trim_matches(|c| c == '"' || c == '\'' || c == '`').trim();
    line.chars().take(MAX_TITLE_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::test_support::Harness;
    use crate::agent::{CODER_AGENT, TASK_AGENT};
    use crate::llm::ScriptedTurn;
    use opencode_types::PermissionRule;
    use serde_json::json;

    #[test]
    fn test_clean_title() {
        assert_eq!(clean_title("\n\"Fix the parser\"\nextra"), "Fix the parser");
        assert_eq!(clean_title(""), "");
        assert_eq!(clean_title(&"x".repeat(300)).len(), MAX_TITLE_LEN);
    }

    #[tokio::test]
    async fn test_text_turn_finishes_with_one_finish_part() {
        let harness = Harness::new().await;
        harness.provider.push(CODER_AGENT, ScriptedTurn::text("hello there"));
        let session = harness.session("Chat").await;
        let outcome = harness.run(CODER_AGENT, &session, "hi", RunOptions::default()).await.unwrap();
        assert_eq!(outcome.message.content(), "hello there");

        let messages = harness.services.messages.list(&session).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        let finishes = messages[1]
            .parts
            .iter()
            .filter(|p| matches!(p, ContentPart::Finish(_)))
            .count();
        assert_eq!(finishes, 1);
        assert!(matches!(messages[1].parts.last(), Some(ContentPart::Finish(_))));
        assert_eq!(messages[1].finish_reason(), Some(FinishReason::EndTurn));
    }

    #[tokio::test]
    async fn test_busy_session_rejected() {
        let harness = Harness::new().await;
        let session = harness.session("Busy").await;
        let runtime = harness.runtime(CODER_AGENT);
        let _guard = harness
            .services
            .runs
            .begin(&session, "other", CancellationToken::new())
            .unwrap();
        let err = runtime
            .run(&CancellationToken::new(), &session, "hi", RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::AgentBusy(_)));
        assert!(runtime.is_session_busy(&session));
    }

    #[tokio::test]
    async fn test_tool_call_gets_result_and_loop_continues() {
        let harness = Harness::with_config(|c| {
            c.permission.rules.insert("*".into(), PermissionRule::Action(PermissionAction::Allow));
        })
        .await;
        std::fs::write(harness.dir.path().join("notes.txt"), "remember this").unwrap();
        let path = harness.dir.path().join("notes.txt").to_string_lossy().to_string();
        harness.provider.push(CODER_AGENT, ScriptedTurn::tool_call("call_1", "view", json!({"file_path": path})));
        harness.provider.push(CODER_AGENT, ScriptedTurn::text("It says remember this"));
        let session = harness.session("Tools").await;
        let outcome = harness.run(CODER_AGENT, &session, "read notes", RunOptions::default()).await.unwrap();
        assert_eq!(outcome.message.content(), "It says remember this");

        let messages = harness.services.messages.list(&session).await.unwrap();
        let calls: Vec<_> = messages.iter().flat_map(|m| m.tool_calls()).cloned().collect();
        let results: Vec<_> = messages.iter().flat_map(|m| m.tool_results()).cloned().collect();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].finished);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].tool_call_id, "call_1");
        assert!(!results[0].is_error);
        assert!(results[0].content.contains("remember this"));
    }

    #[tokio::test]
    async fn test_unknown_and_disabled_tools_are_errors() {
        let harness = Harness::new().await;
        harness.provider.push(TASK_AGENT, ScriptedTurn::tool_call("c1", "write", json!({"file_path": "x", "content": "y"})));
        harness.provider.push(TASK_AGENT, ScriptedTurn::text("ok"));
        let session = harness.session("Sub").await;
        harness.run(TASK_AGENT, &session, "try writing", RunOptions::default()).await.unwrap();
        let messages = harness.services.messages.list(&session).await.unwrap();
        let result = messages.iter().flat_map(|m| m.tool_results()).next().unwrap().clone();
        assert!(result.is_error);
        assert!(result.content.contains("tool not found"));
        assert!(!harness.dir.path().join("x").exists());
    }

    #[tokio::test]
    async fn test_structured_output_reprompts_then_succeeds() {
        let harness = Harness::new().await;
        harness.provider.push(CODER_AGENT, ScriptedTurn::text("here you go"));
        harness.provider.push(
            CODER_AGENT,
            ScriptedTurn::tool_call("s1", STRUCT_OUTPUT_TOOL, json!({"name": "Ada", "age": 36})),
        );
        let session = harness.session("Schema").await;
        let schema = json!({
            "type": "object",
            "properties": {"name": {"type": "string"}, "age": {"type": "integer"}},
            "required": ["name", "age"]
        });
        let outcome = harness
            .run(CODER_AGENT, &session, "who", RunOptions::default().with_output_schema(schema))
            .await
            .unwrap();
        assert_eq!(outcome.structured_output, Some(json!({"name": "Ada", "age": 36})));

        let requests = harness.provider.requests();
        let coder: Vec<_> = requests.iter().filter(|r| r.agent == CODER_AGENT).collect();
        assert_eq!(coder.len(), 2);
        assert!(coder[0].tools.iter().any(|t| t.name == STRUCT_OUTPUT_TOOL));
        assert_eq!(coder[1].force_tool.as_deref(), Some(STRUCT_OUTPUT_TOOL));
    }

    #[tokio::test]
    async fn test_structured_output_gives_up_after_reprompts() {
        let harness = Harness::new().await;
        let session = harness.session("Schema").await;
        let err = harness
            .run(
                CODER_AGENT,
                &session,
                "who",
                RunOptions::default().with_output_schema(json!({"type": "object"})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::AgentFailed(_)));
        let coder = harness
            .provider
            .requests()
            .into_iter()
            .filter(|r| r.agent == CODER_AGENT)
            .count();
        assert_eq!(coder, MAX_STRUCT_OUTPUT_REPROMPTS + 1);
    }

    #[tokio::test]
    async fn test_invalid_schema_fails_synchronously() {
        let harness = Harness::new().await;
        let session = harness.session("Bad schema").await;
        let runtime = harness.runtime(CODER_AGENT);
        let err = runtime
            .run(
                &CancellationToken::new(),
                &session,
                "x",
                RunOptions::default().with_output_schema(json!({"type": 5})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgs(_)));
        assert!(!runtime.is_session_busy(&session));
    }

    #[tokio::test]
    async fn test_transient_errors_retry_and_auth_is_fatal() {
        let harness = Harness::new().await;
        harness.provider.push(CODER_AGENT, ScriptedTurn::error(ProviderError::Transient("503".into())));
        harness.provider.push(CODER_AGENT, ScriptedTurn::text("recovered"));
        let session = harness.session("Retry").await;
        let outcome = harness.run(CODER_AGENT, &session, "hi", RunOptions::default()).await.unwrap();
        assert_eq!(outcome.message.content(), "recovered");

        harness.provider.push(CODER_AGENT, ScriptedTurn::error(ProviderError::Auth("bad key".into())));
        let err = harness.run(CODER_AGENT, &session, "again", RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, CoreError::AgentFailed(_)));
        let messages = harness.services.messages.list(&session).await.unwrap();
        assert_eq!(messages.last().unwrap().finish_reason(), Some(FinishReason::Error));
    }

    #[tokio::test]
    async fn test_cancel_writes_canceled_finish() {
        let harness = Harness::new().await;
        let session = harness.session("Cancel").await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let runtime = harness.runtime(CODER_AGENT);
        let events = runtime.run(&cancel, &session, "hi", RunOptions::default()).await.unwrap();
        let err = collect_run(events, None).await.unwrap_err();
        assert!(matches!(err, CoreError::Canceled));
        assert!(!runtime.is_session_busy(&session));

        let messages = harness.services.messages.list(&session).await.unwrap();
        let last = messages.last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.finish_reason(), Some(FinishReason::Canceled));
    }

    #[tokio::test]
    async fn test_cancel_during_tool_writes_canceled_finish() {
        let harness = Harness::with_config(|c| c.permission.set("bash", PermissionAction::Allow)).await;
        harness.provider.push(
            CODER_AGENT,
            ScriptedTurn::tool_call("call_sleep", "bash", json!({"command": "sleep 30"})),
        );
        let session = harness.session("Cancel tool").await;
        let cancel = CancellationToken::new();
        let runtime = harness.runtime(CODER_AGENT);
        let events = runtime.run(&cancel, &session, "wait", RunOptions::default()).await.unwrap();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            trigger.cancel();
        });
        let err = collect_run(events, None).await.unwrap_err();
        assert!(matches!(err, CoreError::Canceled));

        let messages = harness.services.messages.list(&session).await.unwrap();
        let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
        assert_eq!(messages[1].finish_reason(), Some(FinishReason::ToolUse));
        assert_eq!(messages[3].finish_reason(), Some(FinishReason::Canceled));
        assert_eq!(harness.provider.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_usage_updates_session_cost() {
        let harness = Harness::new().await;
        harness.provider.push(
            CODER_AGENT,
            ScriptedTurn::text("priced").with_usage(TokenUsage {
                input_tokens: 1000,
                output_tokens: 500,
                ..Default::default()
            }),
        );
        let session = harness.session("Usage").await;
        harness.run(CODER_AGENT, &session, "hi", RunOptions::default()).await.unwrap();
        let stored = harness.services.sessions.get(&session).await.unwrap();
        assert_eq!(stored.prompt_tokens, 1000);
        assert_eq!(stored.completion_tokens, 500);
        assert!(stored.cost > 0.0);
    }

    #[tokio::test]
    async fn test_auto_compaction_resets_tokens() {
        let harness = Harness::with_config(|c| {
            c.auto_compact = true;
            c.auto_compact_threshold = 0.5;
        })
        .await;
        let session = harness.session("Compact").await;
        harness.provider.push(
            CODER_AGENT,
            ScriptedTurn::text("big").with_usage(TokenUsage {
                input_tokens: 150_000,
                output_tokens: 10_000,
                ..Default::default()
            }),
        );
        harness.run(CODER_AGENT, &session, "first", RunOptions::default()).await.unwrap();
        harness.provider.push(SUMMARIZER_AGENT, ScriptedTurn::text("summary of work"));
        harness.provider.push(CODER_AGENT, ScriptedTurn::text("continued"));
        harness.run(CODER_AGENT, &session, "second", RunOptions::default()).await.unwrap();

        let stored = harness.services.sessions.get(&session).await.unwrap();
        let summary_id = stored.summary_message_id.clone().unwrap();
        let summary = harness.services.messages.get(&summary_id).await.unwrap();
        assert_eq!(summary.content(), "summary of work");
        assert!(stored.prompt_tokens < 150_000);

        let last_coder = harness
            .provider
            .requests()
            .into_iter()
            .filter(|r| r.agent == CODER_AGENT)
            .last()
            .unwrap();
        assert_eq!(last_coder.messages[0].id, summary_id);
        assert_eq!(last_coder.messages[1].content(), "second");
    }

    #[tokio::test]
    async fn test_title_generated_for_default_title() {
        let harness = Harness::new().await;
        harness.provider.push(DESCRIPTOR_AGENT, ScriptedTurn::text("Greeting the user"));
        let session = harness.services.sessions.create("").await.unwrap();
        harness.run(CODER_AGENT, &session.id, "hello", RunOptions::default()).await.unwrap();
        for _ in 0..50 {
            let stored = harness.services.sessions.get(&session.id).await.unwrap();
            if stored.title != DEFAULT_SESSION_TITLE {
                assert_eq!(stored.title, "Greeting the user");
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("title was not generated");
    }
}
