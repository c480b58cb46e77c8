//! Language model client
//!
//! The driver talks to the model through [`ChatModel`]: full history and
//! tool definitions in, one assistant message out. [`OpenAiChatModel`]
//! implements it against any OpenAI-compatible `/chat/completions`
//! endpoint.

use crate::agent::error::{AgentError, AgentResult};
use crate::agent::message::{ChatMessage, ContentPart, MessageContent, Role, ToolCallRequest};
use crate::agent::tool::ToolDefinition;
use crate::config::AiConfig;
use crate::password_sanitizer::sanitize_text_for_logging;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Produce the next assistant message: text, or a batch of tool calls.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> AgentResult<ChatMessage>;

    fn name(&self) -> &str;
}

/// Build the configured model client. Fails without an API key.
pub fn create_chat_model(config: &AiConfig) -> AgentResult<Arc<dyn ChatModel>> {
    let api_key = config.api_key().ok_or_else(|| {
        AgentError::ConfigurationError(
            "AI_API_KEY is not set. Add it to the environment or to [ai] api_key".to_string(),
        )
    })?;

    Ok(Arc::new(OpenAiChatModel::new(
        api_key.to_string(),
        config.base_url.clone(),
        config.model.clone(),
        config.temperature,
        config.max_tokens,
        Duration::from_secs(config.request_timeout_seconds),
    )?))
}

pub struct OpenAiChatModel {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiChatModel {
    pub fn new(
        api_key: String,
        base_url: String,
        model: String,
        temperature: f32,
        max_tokens: u32,
        timeout: Duration,
    ) -> AgentResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            temperature,
            max_tokens,
        })
    }

    fn build_request(&self, messages: &[ChatMessage], tools: &[ToolDefinition]) -> WireRequest {
        let tools: Vec<WireTool> = tools.iter().map(WireTool::from).collect();
        WireRequest {
            model: self.model.clone(),
            messages: messages.iter().map(WireMessage::from).collect(),
            tool_choice: (!tools.is_empty()).then_some("auto"),
            tools,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> AgentResult<ChatMessage> {
        let url = format!("{}/chat/completions", self.base_url);
        let request_body = self.build_request(messages, tools);

        debug!(
            "Calling chat completions with model: {}, messages: {}, tools: {}",
            self.model,
            messages.len(),
            tools.len()
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| AgentError::NetworkError(format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            let message = sanitize_text_for_logging(&error_text);
            warn!("Model endpoint returned {}: {}", status.as_u16(), message);
            return Err(AgentError::ApiError {
                status_code: status.as_u16(),
                message,
            });
        }

        let response_body: WireResponse = response
            .json()
            .await
            .map_err(|e| AgentError::ProviderError(format!("Failed to parse API response: {}", e)))?;

        let choice = response_body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::ProviderError("No choices in response".to_string()))?;

        Ok(choice.message.into_chat_message())
    }

    fn name(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: Role,
    content: Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl From<&ChatMessage> for WireMessage {
    fn from(message: &ChatMessage) -> Self {
        let mut wire = WireMessage {
            role: message.role,
            content: Value::Null,
            tool_calls: Vec::new(),
            tool_call_id: None,
        };

        match &message.content {
            MessageContent::Text(text) => wire.content = Value::String(text.clone()),
            MessageContent::Parts(parts) => {
                wire.content = Value::Array(
                    parts
                        .iter()
                        .map(|part| match part {
                            ContentPart::Text { text } => json!({"type": "text", "text": text}),
                            ContentPart::Other(value) => value.clone(),
                        })
                        .collect(),
                )
            }
            MessageContent::ToolCalls { text, calls } => {
                wire.content = text.clone().map(Value::String).unwrap_or(Value::Null);
                wire.tool_calls = calls
                    .iter()
                    .map(|call| WireToolCall {
                        id: call.id.clone(),
                        kind: "function".to_string(),
                        function: WireFunctionCall {
                            name: call.name.clone(),
                            arguments: call.arguments.clone(),
                        },
                    })
                    .collect();
            }
            MessageContent::ToolResult { call_id, text } => {
                wire.content = Value::String(text.clone());
                wire.tool_call_id = Some(call_id.clone());
            }
        }

        wire
    }
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunctionDef,
}

#[derive(Debug, Serialize)]
struct WireFunctionDef {
    name: String,
    description: String,
    parameters: Value,
}

impl From<&ToolDefinition> for WireTool {
    fn from(tool: &ToolDefinition) -> Self {
        WireTool {
            kind: "function",
            function: WireFunctionDef {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.input_schema.clone(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: WireFunctionCall,
}

#[derive(Debug, Serialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    #[serde(default)]
    content: Option<Value>,
    #[serde(default)]
    tool_calls: Option<Vec<WireResponseToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireResponseToolCall {
    #[serde(default)]
    id: Option<String>,
    function: WireResponseFunction,
}

#[derive(Debug, Deserialize)]
struct WireResponseFunction {
    name: String,
    /// Normally a JSON string; some providers send the object itself
    #[serde(default)]
    arguments: Option<Value>,
}

impl WireResponseMessage {
    fn into_chat_message(self) -> ChatMessage {
        let calls: Vec<ToolCallRequest> = self
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(index, call)| ToolCallRequest {
                id: call.id.unwrap_or_else(|| format!("call_{}", index)),
                name: call.function.name,
                arguments: match call.function.arguments {
                    Some(Value::String(raw)) => raw,
                    Some(Value::Null) | None => String::new(),
                    Some(other) => other.to_string(),
                },
            })
            .collect();

        if !calls.is_empty() {
            let text = match self.content {
                Some(Value::String(text)) if !text.trim().is_empty() => Some(text),
                _ => None,
            };
            return ChatMessage::assistant_tool_calls(text, calls);
        }

        let content = match self.content {
            Some(Value::String(text)) => MessageContent::Text(text),
            Some(Value::Array(parts)) => {
                MessageContent::Parts(parts.into_iter().map(ContentPart::from_json).collect())
            }
            Some(Value::Null) | None => MessageContent::Text(String::new()),
            Some(other) => MessageContent::Parts(vec![ContentPart::from_json(other)]),
        };

        ChatMessage {
            role: Role::Assistant,
            content,
        }
    }
}
