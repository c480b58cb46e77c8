//! Tool definitions and the registry the driver dispatches through

use crate::agent::error::ToolError;
use crate::agent::message::ToolCallRequest;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Executes one kind of tool call. Failures are values, never panics.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: Value) -> Result<String, ToolError>;
}

/// A named, schema-typed function the model may request
#[derive(Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object
    pub input_schema: Value,
    pub handler: Arc<dyn ToolHandler>,
}

impl fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("input_schema", &self.input_schema)
            .finish_non_exhaustive()
    }
}

/// Tools available to one run, in registration order
#[derive(Debug, Clone, Default)]
pub struct ToolSet {
    tools: Vec<ToolDefinition>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool, replacing any existing tool with the same name.
    pub fn with(mut self, tool: ToolDefinition) -> Self {
        self.register(tool);
        self
    }

    pub fn register(&mut self, tool: ToolDefinition) {
        self.tools.retain(|t| t.name != tool.name);
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn definitions(&self) -> &[ToolDefinition] {
        &self.tools
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }

    /// Resolve, parse arguments and run one call.
    pub async fn invoke(&self, call: &ToolCallRequest) -> Result<String, ToolError> {
        let tool = self.get(&call.name).ok_or_else(|| ToolError::UnknownTool {
            name: call.name.clone(),
            available: self.names().join(", "),
        })?;

        let arguments = parse_arguments(&call.name, &call.arguments)?;
        debug!("Invoking tool {} ({})", call.name, call.id);
        tool.handler.call(arguments).await
    }
}

/// Models sometimes send an empty string for "no arguments".
fn parse_arguments(tool: &str, raw: &str) -> Result<Value, ToolError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Value::Object(Default::default()));
    }

    match serde_json::from_str::<Value>(raw) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(_) => Err(ToolError::InvalidArguments {
            tool: tool.to_string(),
            reason: "arguments must be a JSON object".to_string(),
        }),
        Err(e) => Err(ToolError::InvalidArguments {
            tool: tool.to_string(),
            reason: e.to_string(),
        }),
    }
}
