//! The `execute_sql` tool

use crate::agent::error::ToolError;
use crate::agent::sanitizer::{SqlPolicy, sanitize};
use crate::agent::tool::{ToolDefinition, ToolHandler};
use crate::database::SqlExecutor;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{info, warn};

pub const EXECUTE_SQL_TOOL: &str = "execute_sql";

#[derive(Debug, Deserialize)]
struct ExecuteSqlArgs {
    query: String,
}

/// Sanitizes under `policy`, then runs the statement on `executor`.
pub struct ExecuteSqlTool {
    executor: Arc<dyn SqlExecutor>,
    policy: SqlPolicy,
}

impl ExecuteSqlTool {
    pub fn new(executor: Arc<dyn SqlExecutor>, policy: SqlPolicy) -> Self {
        Self { executor, policy }
    }

    pub fn policy(&self) -> &SqlPolicy {
        &self.policy
    }

    /// Wrap into a registrable definition; wording follows the access mode.
    pub fn into_definition(self) -> ToolDefinition {
        let (description, query_doc) = if self.policy.is_read_only() {
            (
                "Execute a read-only PostgreSQL SELECT query and return results.",
                "PostgreSQL SELECT query to execute (read-only).",
            )
        } else {
            (
                "Execute ONE PostgreSQL SQL statement (SELECT/INSERT/UPDATE/DELETE) and return the result.",
                "Single PostgreSQL statement to execute.",
            )
        };

        ToolDefinition {
            name: EXECUTE_SQL_TOOL.to_string(),
            description: description.to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": query_doc,
                    }
                },
                "required": ["query"],
            }),
            handler: Arc::new(self),
        }
    }
}

#[async_trait]
impl ToolHandler for ExecuteSqlTool {
    async fn call(&self, arguments: Value) -> Result<String, ToolError> {
        let args: ExecuteSqlArgs =
            serde_json::from_value(arguments).map_err(|e| ToolError::InvalidArguments {
                tool: EXECUTE_SQL_TOOL.to_string(),
                reason: e.to_string(),
            })?;

        let sanitized = match sanitize(&args.query, &self.policy) {
            Ok(sanitized) => sanitized,
            Err(e) => {
                warn!("[SQL Tool] Rejected ({}): {}", self.policy.label, e);
                return Err(e.into());
            }
        };

        info!("[SQL Tool] Executing: {}", sanitized);

        match self.executor.execute(sanitized.as_str()).await {
            Ok(output) => output
                .to_tool_text()
                .map_err(|e| ToolError::Execution(e.to_string())),
            Err(e) => {
                let message = e.driver_message();
                warn!("[SQL Tool] Error: {}", message);
                Err(ToolError::Execution(message))
            }
        }
    }
}
