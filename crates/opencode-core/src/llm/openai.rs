//! Chat Completions client for OpenAI-compatible endpoints.
//!
//! Anthropic and Gemini both expose an OpenAI-compatible surface, so one
//! client serves every configured provider.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use opencode_types::{FinishReason, Message, Role, ToolCall};
use reqwest::header::HeaderValue;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Provider, ProviderError, ProviderEvent, ProviderRequest, ProviderResponse, ProviderStream, TokenUsage};
use crate::retry::is_retryable_message;
use crate::tools::ToolInfo;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

pub struct OpenAiCompatProvider {
    name: String,
    client: Client,
    base_url: String,
    api_key: String,
    headers: BTreeMap<String, String>,
}

impl OpenAiCompatProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        headers: BTreeMap<String, String>,
    ) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            name: name.into(),
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            headers,
        }
    }

    fn build_body(&self, request: &ProviderRequest) -> Value {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if !request.system.is_empty() {
            messages.push(json!({"role": "system", "content": request.system}));
        }
        for message in &request.messages {
            messages.extend(convert_message(message));
        }

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.max_tokens,
        });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(request.tools.iter().map(convert_tool).collect());
        }
        if let Some(tool) = &request.force_tool {
            body["tool_choice"] = json!({"type": "function", "function": {"name": tool}});
        }
        if let Some(effort) = &request.reasoning_effort {
            body["reasoning_effort"] = json!(effort);
        }
        body
    }

    async fn send(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&self.build_body(request));
        for (key, value) in &self.headers {
            builder = builder.header(key, value);
        }

        let response = builder.send().await.map_err(map_transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers().get("retry-after"));
            let body = response.text().await.unwrap_or_default();
            return Err(map_http_error(status, body, retry_after));
        }

        let completion: ChatCompletionResponse =
            response.json().await.map_err(|e| ProviderError::Transient(e.to_string()))?;
        Ok(into_response(completion))
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> Result<ProviderStream, ProviderError> {
        debug!(
            target: "opencode::agent",
            provider = %self.name,
            model = %request.model,
            agent = %request.agent,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Sending completion request"
        );
        let response = tokio::select! {
            r = self.send(&request) => r?,
            _ = cancel.cancelled() => return Err(ProviderError::Canceled),
        };
        Ok(Box::pin(futures::stream::iter(
            response_events(response).into_iter().map(Ok),
        )))
    }
}

/// Expand a full response into the event sequence a streaming provider emits.
fn response_events(response: ProviderResponse) -> Vec<ProviderEvent> {
    let mut events = Vec::new();
    if !response.content.is_empty() {
        events.push(ProviderEvent::ContentDelta(response.content.clone()));
    }
    for call in &response.tool_calls {
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
    }
    events.push(ProviderEvent::Complete(response));
    events
}

fn convert_message(message: &Message) -> Vec<Value> {
    match message.role {
        Role::System => vec![json!({"role": "system", "content": message.content()})],
        Role::User => {
            let mut content = vec![json!({"type": "text", "text": message.content()})];
            for binary in message.binary_content() {
                let url = format!(
                    "data:{};base64,{}",
                    binary.mime_type,
                    BASE64_STANDARD.encode(&binary.data)
                );
                content.push(json!({"type": "image_url", "image_url": {"url": url}}));
            }
            vec![json!({"role": "user", "content": content})]
        }
        Role::Assistant => {
            let mut value = json!({"role": "assistant", "content": message.content()});
            let calls: Vec<Value> = message
                .tool_calls()
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": "function",
                        "function": {"name": c.name, "arguments": c.input},
                    })
                })
                .collect();
            if !calls.is_empty() {
                value["tool_calls"] = Value::Array(calls);
            }
            vec![value]
        }
        Role::Tool => message
            .tool_results()
            .iter()
            .map(|r| json!({"role": "tool", "tool_call_id": r.tool_call_id, "content": r.content}))
            .collect(),
    }
}

fn convert_tool(tool: &ToolInfo) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": {
                "type": "object",
                "properties": tool.parameters,
                "required": tool.required,
            },
        },
    })
}

fn into_response(completion: ChatCompletionResponse) -> ProviderResponse {
    let usage = completion
        .usage
        .map(|u| TokenUsage {
            input_tokens: u.prompt_tokens - u.cached_tokens(),
            output_tokens: u.completion_tokens,
            cache_creation_tokens: 0,
            cache_read_tokens: u.cached_tokens(),
        })
        .unwrap_or_default();

    let Some(choice) = completion.choices.into_iter().next() else {
        return ProviderResponse {
            content: String::new(),
            tool_calls: Vec::new(),
            usage,
            finish_reason: FinishReason::EndTurn,
        };
    };
    let tool_calls: Vec<ToolCall> = choice
        .message
        .tool_calls
        .into_iter()
        .map(|c| ToolCall {
            id: c.id,
            name: c.function.name,
            input: c.function.arguments,
            finished: true,
        })
        .collect();
    let finish_reason = match choice.finish_reason.as_deref() {
        Some("length") => FinishReason::MaxTokens,
        Some("tool_calls") => FinishReason::ToolUse,
        _ if !tool_calls.is_empty() => FinishReason::ToolUse,
        _ => FinishReason::EndTurn,
    };
    ProviderResponse {
        content: choice.message.content.unwrap_or_default(),
        tool_calls,
        usage,
        finish_reason,
    }
}

fn map_transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        ProviderError::Transient(err.to_string())
    } else {
        ProviderError::InvalidRequest(err.to_string())
    }
}

fn map_http_error(status: StatusCode, body: String, retry_after: Option<Duration>) -> ProviderError {
    let message = serde_json::from_str::<ErrorResponse>(&body)
        .map(|wrapper| wrapper.error.message)
        .unwrap_or(body);

    match status {
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited {
            message,
            retry_after,
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Auth(message),
        StatusCode::REQUEST_TIMEOUT => ProviderError::Transient(message),
        s if s.is_server_error() => ProviderError::Transient(message),
        _ if is_retryable_message(&message) => ProviderError::Transient(message),
        _ => ProviderError::InvalidRequest(format!("{status}: {message}")),
    }
}

fn parse_retry_after(header: Option<&HeaderValue>) -> Option<Duration> {
    let value = header?.to_str().ok()?;
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ResponseToolCall>,
}

#[derive(Debug, Deserialize)]
struct ResponseToolCall {
    id: String,
    function: FunctionCall,
}

#[derive(Debug, Deserialize, Serialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
    prompt_tokens_details: Option<PromptTokensDetails>,
}

impl Usage {
    fn cached_tokens(&self) -> i64 {
        self.prompt_tokens_details
            .as_ref()
            .map(|d| d.cached_tokens)
            .unwrap_or(0)
    }
}

#[derive(Debug, Deserialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: i64,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencode_types::{ContentPart, ToolResult};

    #[test]
    fn test_http_error_classification() {
        let rate = map_http_error(
            StatusCode::TOO_MANY_REQUESTS,
            r#"{"error":{"message":"slow down"}}"#.into(),
            Some(Duration::from_secs(7)),
        );
        assert_eq!(
            rate,
            ProviderError::RateLimited {
                message: "slow down".into(),
                retry_after: Some(Duration::from_secs(7))
            }
        );
        assert!(matches!(
            map_http_error(StatusCode::UNAUTHORIZED, "nope".into(), None),
            ProviderError::Auth(_)
        ));
        assert!(matches!(
            map_http_error(StatusCode::BAD_GATEWAY, "".into(), None),
            ProviderError::Transient(_)
        ));
        assert!(matches!(
            map_http_error(StatusCode::BAD_REQUEST, "model is overloaded".into(), None),
            ProviderError::Transient(_)
        ));
        assert!(matches!(
            map_http_error(StatusCode::BAD_REQUEST, "bad schema".into(), None),
            ProviderError::InvalidRequest(_)
        ));
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        let value = HeaderValue::from_static("12");
        assert_eq!(parse_retry_after(Some(&value)), Some(Duration::from_secs(12)));
        let date = HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT");
        assert_eq!(parse_retry_after(Some(&date)), None);
    }

    #[test]
    fn test_tool_results_become_tool_messages() {
        let message = Message {
            id: "m".into(),
            session_id: "s".into(),
            role: Role::Tool,
            parts: vec![ContentPart::ToolResult(ToolResult {
                tool_call_id: "call_1".into(),
                name: "bash".into(),
                content: "ok".into(),
                metadata: String::new(),
                is_error: false,
            })],
            model: None,
            created_at: 0,
            updated_at: 0,
            finished_at: None,
        };
        let converted = convert_message(&message);
        assert_eq!(converted.len(), 1);
        assert_eq!(converted[0]["role"], "tool");
        assert_eq!(converted[0]["tool_call_id"], "call_1");
    }

    #[test]
    fn test_response_parsing() {
        let raw = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{"id": "c1", "type": "function", "function": {"name": "bash", "arguments": "{\"command\":\"ls\"}"}}]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 100, "completion_tokens": 20, "prompt_tokens_details": {"cached_tokens": 40}}
        });
        let completion: ChatCompletionResponse = serde_json::from_value(raw).unwrap();
        let response = into_response(completion);
        assert_eq!(response.finish_reason, FinishReason::ToolUse);
        assert_eq!(response.tool_calls[0].name, "bash");
        assert_eq!(response.usage.input_tokens, 60);
        assert_eq!(response.usage.cache_read_tokens, 40);

        let events = response_events(response);
        assert!(matches!(events.last(), Some(ProviderEvent::Complete(_))));
    }
}
