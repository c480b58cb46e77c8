//! Bounded SQL tool-calling agent
//!
//! A language model gets one tool, `execute_sql`, and a system prompt that
//! carries the database schema. The [`AgentDriver`] alternates between the
//! model and the tool until the model answers or a step/time bound is hit.
//! Every statement the model proposes passes through [`sanitize`] under the
//! caller's [`SqlPolicy`] before it reaches the database.
//!
//! # Usage
//!
//! ```rust,ignore
//! use kopikita_agent::agent::{AgentDriver, AgentRunConfig, ExecuteSqlTool, SqlPolicy, ToolSet};
//!
//! let tools = ToolSet::new().with(ExecuteSqlTool::new(executor, SqlPolicy::read_only(5)).into_definition());
//! let config = AgentRunConfig { max_steps: 8, timeout: None, tools, system_prompt };
//! let outcome = AgentDriver::new(model).run(&config, history).await;
//! ```

pub mod driver;
pub mod error;
pub mod extract;
pub mod message;
pub mod model;
pub mod sanitizer;
pub mod schema;
pub mod sql_tool;
pub mod tool;

#[cfg(test)]
pub mod testing;

pub use driver::{AgentDriver, AgentOutcome, AgentRunConfig, AgentRunResult};
pub use error::{AgentError, AgentResult, SanitizeError, ToolError};
pub use extract::{extract_final_text, extract_json};
pub use message::{ChatMessage, HistoryEntry, MessageContent, Role, ToolCallRequest};
pub use model::{ChatModel, OpenAiChatModel, create_chat_model};
pub use sanitizer::{SanitizedQuery, SqlAccess, SqlPolicy, sanitize};
pub use schema::SchemaCache;
pub use sql_tool::{EXECUTE_SQL_TOOL, ExecuteSqlTool};
pub use tool::{ToolDefinition, ToolHandler, ToolSet};
