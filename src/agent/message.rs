//! Conversation model shared by the driver, the model client and callers

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One element of multi-part content. Only text parts carry meaning for us.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text { text: String },
    Other(Value),
}

impl ContentPart {
    /// Classify a raw JSON part: `{"type":"text","text":...}` or a bare
    /// object with a string `text` field is text, anything else is kept as-is.
    pub fn from_json(value: Value) -> Self {
        match value.get("text").and_then(Value::as_str) {
            Some(text) => ContentPart::Text {
                text: text.to_string(),
            },
            None => match value {
                Value::String(text) => ContentPart::Text { text },
                other => ContentPart::Other(other),
            },
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            ContentPart::Text { text } => Some(text),
            ContentPart::Other(_) => None,
        }
    }
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    /// Raw JSON argument text, as produced by the model
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
    ToolCalls {
        text: Option<String>,
        calls: Vec<ToolCallRequest>,
    },
    ToolResult {
        call_id: String,
        text: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant_tool_calls(text: Option<String>, calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::ToolCalls { text, calls },
        }
    }

    pub fn tool_result(call_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::ToolResult {
                call_id: call_id.into(),
                text: text.into(),
            },
        }
    }

    /// Tool calls carried by this message, empty for anything else.
    pub fn tool_calls(&self) -> &[ToolCallRequest] {
        match &self.content {
            MessageContent::ToolCalls { calls, .. } => calls,
            _ => &[],
        }
    }
}

/// Caller-facing history entry (`{"role": "user", "content": "..."}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
}

impl From<HistoryEntry> for ChatMessage {
    fn from(entry: HistoryEntry) -> Self {
        ChatMessage {
            role: entry.role,
            content: MessageContent::Text(entry.content),
        }
    }
}
