//! Message and content part types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            "tool" => Ok(Role::Tool),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Why an assistant message stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    EndTurn,
    MaxTokens,
    ToolUse,
    Canceled,
    Error,
    PermissionDenied,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::EndTurn => "end_turn",
            FinishReason::MaxTokens => "max_tokens",
            FinishReason::ToolUse => "tool_use",
            FinishReason::Canceled => "canceled",
            FinishReason::Error => "error",
            FinishReason::PermissionDenied => "permission_denied",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TextContent {
    pub text: String,
}

/// Hidden chain-of-thought emitted by reasoning models.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReasoningContent {
    pub thinking: String,
}

/// An attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryContent {
    pub path: String,
    pub mime_type: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Arguments as a JSON string.
    pub input: String,
    pub finished: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub name: String,
    pub content: String,
    /// Opaque JSON metadata produced by the tool.
    #[serde(default)]
    pub metadata: String,
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finish {
    pub reason: FinishReason,
    pub time: i64,
}

/// One typed element of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ContentPart {
    Text(TextContent),
    Reasoning(ReasoningContent),
    Binary(BinaryContent),
    ToolCall(ToolCall),
    ToolResult(ToolResult),
    Finish(Finish),
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text(TextContent { text: text.into() })
    }
}

/// An ordered item in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub parts: Vec<ContentPart>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
}

impl Message {
    /// Concatenated text parts.
    pub fn content(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text(t) => Some(t.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn reasoning(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Reasoning(r) => Some(r.thinking.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn binary_content(&self) -> Vec<&BinaryContent> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Binary(b) => Some(b),
                _ => None,
            })
            .collect()
    }

    pub fn tool_calls(&self) -> Vec<&ToolCall> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolCall(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn tool_results(&self) -> Vec<&ToolResult> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolResult(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn finish_part(&self) -> Option<&Finish> {
        self.parts.iter().rev().find_map(|p| match p {
            ContentPart::Finish(f) => Some(f),
            _ => None,
        })
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_part().map(|f| f.reason)
    }

    pub fn is_finished(&self) -> bool {
        self.finish_part().is_some()
    }

    /// Extend the trailing text part, or start a new one.
    ///
    /// Returns `false` once the message is finished.
    pub fn append_content(&mut self, delta: &str) -> bool {
        if self.is_finished() {
            return false;
        }
        match self.parts.last_mut() {
            Some(ContentPart::Text(t)) => t.text.push_str(delta),
            _ => self.parts.push(ContentPart::text(delta)),
        }
        true
    }

    /// Extend the trailing reasoning part, or start a new one.
    pub fn append_reasoning(&mut self, delta: &str) -> bool {
        if self.is_finished() {
            return false;
        }
        match self.parts.last_mut() {
            Some(ContentPart::Reasoning(r)) => r.thinking.push_str(delta),
            _ => self.parts.push(ContentPart::Reasoning(ReasoningContent {
                thinking: delta.to_string(),
            })),
        }
        true
    }

    /// Append a part, keeping a Finish part last and unique.
    pub fn push_part(&mut self, part: ContentPart) -> bool {
        if self.is_finished() {
            return false;
        }
        self.parts.push(part);
        true
    }

    /// Record a tool call, replacing an unfinished call with the same id.
    pub fn add_tool_call(&mut self, call: ToolCall) -> bool {
        if self.is_finished() {
            return false;
        }
        for part in self.parts.iter_mut() {
            if let ContentPart::ToolCall(existing) = part {
                if existing.id == call.id {
                    *existing = call;
                    return true;
                }
            }
        }
        self.parts.push(ContentPart::ToolCall(call));
        true
    }

    /// Mark every tool call finished.
    pub fn finish_tool_calls(&mut self) {
        for part in self.parts.iter_mut() {
            if let ContentPart::ToolCall(call) = part {
                call.finished = true;
            }
        }
    }

    /// Append the terminal Finish part. A second call is ignored.
    pub fn add_finish(&mut self, reason: FinishReason, time: i64) -> bool {
        if self.is_finished() {
            return false;
        }
        self.parts.push(ContentPart::Finish(Finish { reason, time }));
        self.finished_at = Some(time);
        true
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
