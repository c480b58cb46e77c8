pub mod agent;
pub mod chat;
pub mod cli;
pub mod config;
pub mod context;
pub mod database; // Executor trait and schema rendering
pub mod database_postgresql; // PostgreSQL implementation
pub mod dummy_data;
pub mod logging;
pub mod password_sanitizer;
pub mod promo_ideas;

pub use agent::{AgentDriver, AgentError, AgentOutcome, AgentResult, AgentRunConfig, SqlPolicy};
pub use config::Config;
pub use context::AgentContext;
