//! Error types for the SQL agent

use crate::database::DatabaseError;
use std::time::Duration;
use thiserror::Error;

/// Result type for agent operations
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors that end an agent request.
///
/// Anything the model can act on (bad SQL, bad arguments) never becomes an
/// `AgentError`: it is reported back to the model as a [`ToolError`].
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("AI provider error: {0}")]
    ProviderError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Schema introspection error: {0}")]
    SchemaError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("API error: {status_code} - {message}")]
    ApiError { status_code: u16, message: String },

    #[error("Database error: {0}")]
    DatabaseError(#[from] DatabaseError),

    #[error("Agent reached the maximum of {max_steps} steps")]
    StepLimitExceeded { max_steps: usize },

    #[error("Agent run timed out after {} seconds", .0.as_secs())]
    TimedOut(Duration),
}

impl AgentError {
    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            AgentError::ProviderError(msg) => format!("AI provider error: {}", msg),
            AgentError::ConfigurationError(msg) => {
                format!(
                    "Configuration issue: {}. Check your config file or environment variables.",
                    msg
                )
            }
            AgentError::SchemaError(msg) => {
                format!(
                    "Schema introspection failed: {}. Ensure the database is reachable.",
                    msg
                )
            }
            AgentError::NetworkError(msg) => {
                format!("Network error: {}. Check your internet connection.", msg)
            }
            AgentError::ApiError {
                status_code,
                message,
            } => format!("API error ({}): {}", status_code, message),
            AgentError::TimedOut(_) => {
                format!("{}. Try a narrower request.", self)
            }
            _ => self.to_string(),
        }
    }
}

/// Why a candidate SQL statement was refused before execution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SanitizeError {
    #[error("Multiple SQL statements are not allowed.")]
    MultipleStatements,

    #[error("SQL query must not be empty.")]
    Empty,

    #[error("Only SELECT statements are allowed.")]
    NotSelect,

    #[error("DDL commands are blocked for safety ({keyword}).")]
    DdlBlocked { keyword: String },

    #[error("DML detected ({keyword}). Only read-only queries are permitted.")]
    DmlBlocked { keyword: String },

    #[error(
        "Writing to \"{table}\" is forbidden in {policy} mode. Reuse existing rows instead."
    )]
    ForbiddenTable { table: String, policy: String },
}

/// Failure of a single tool invocation; always reported back to the model.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("{0}")]
    Rejected(#[from] SanitizeError),

    /// Driver message, passed through verbatim
    #[error("{0}")]
    Execution(String),

    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("unknown tool: '{name}'. Available: {available}")]
    UnknownTool { name: String, available: String },
}
