//! CRM chat assistant
//!
//! Answers owner questions about customers, tags, products and sales by
//! letting the model run read-only queries. The reply is always a string:
//! bounded or failed runs degrade to fixed messages.
use crate::agent::{
    AgentDriver, AgentError, AgentOutcome, AgentRunConfig, ChatMessage, ExecuteSqlTool,
    HistoryEntry, Role, SqlPolicy, ToolSet,
};
use crate::config::ChatConfig;
use crate::context::AgentContext;
use crate::database::SqlExecutor;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub const MAX_MESSAGE_CHARS: usize = 1200;
/// History entries accepted from the caller; older ones are discarded.
pub const MAX_HISTORY_ACCEPTED: usize = 12;
/// History entries forwarded to the model
pub const MAX_HISTORY_SENT: usize = 6;

pub const FALLBACK_REPLY: &str =
    "Sorry, I could not produce an answer right now. Please try again shortly.";
pub const STEP_LIMIT_REPLY: &str =
    "Sorry, that question needed more lookups than I am allowed. Try asking something more specific.";
pub const TIMEOUT_REPLY: &str =
    "Sorry, answering took too long. Try a narrower question or try again shortly.";
pub const FAILURE_REPLY: &str =
    "Sorry, something went wrong while processing the chat. Please try again in a moment.";
pub const MISSING_KEY_REPLY: &str =
    "AI_API_KEY is not configured. Set it in the environment or the config file and try again.";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatRequestError {
    #[error("Message must not be empty")]
    EmptyMessage,

    #[error("Message is too long ({len} characters, maximum 1200)")]
    MessageTooLong { len: usize },

    #[error("History entry {index} has role {role:?}; only user and assistant are allowed")]
    InvalidHistoryRole { index: usize, role: Role },

    #[error("History entry {index} must be between 1 and 1200 characters")]
    InvalidHistoryContent { index: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatReply {
    pub reply: String,
}

fn check_length(text: &str) -> bool {
    let len = text.chars().count();
    len >= 1 && len <= MAX_MESSAGE_CHARS
}

impl ChatRequest {
    pub fn new(message: impl Into<String>, history: Vec<HistoryEntry>) -> Self {
        Self {
            message: message.into(),
            history,
        }
    }

    /// Keep the last accepted history entries, then check every field.
    pub fn validate(mut self) -> Result<Self, ChatRequestError> {
        if self.history.len() > MAX_HISTORY_ACCEPTED {
            let excess = self.history.len() - MAX_HISTORY_ACCEPTED;
            self.history.drain(..excess);
        }

        if self.message.trim().is_empty() {
            return Err(ChatRequestError::EmptyMessage);
        }
        let len = self.message.chars().count();
        if len > MAX_MESSAGE_CHARS {
            return Err(ChatRequestError::MessageTooLong { len });
        }

        for (index, entry) in self.history.iter().enumerate() {
            if !matches!(entry.role, Role::User | Role::Assistant) {
                return Err(ChatRequestError::InvalidHistoryRole {
                    index,
                    role: entry.role,
                });
            }
            if !check_length(&entry.content) {
                return Err(ChatRequestError::InvalidHistoryContent { index });
            }
        }

        Ok(self)
    }

    /// Recent history followed by the current question
    pub fn into_messages(self) -> Vec<ChatMessage> {
        let skip = self.history.len().saturating_sub(MAX_HISTORY_SENT);
        let mut messages: Vec<ChatMessage> = self
            .history
            .into_iter()
            .skip(skip)
            .map(ChatMessage::from)
            .collect();
        messages.push(ChatMessage::user(self.message));
        messages
    }
}

pub fn chat_system_prompt(schema: &str) -> String {
    [
        "You are the CRM assistant of an Indonesian coffee shop.",
        "Answer briefly and practically, in a form the cafe owner can act on right away.",
        "Use the execute_sql tool to look up customers, tags, products and sales before answering questions about them.",
        "When asked for promo ideas, give concrete recommendations grounded in the data you queried.",
        "If the data is not enough, state your assumptions briefly. Never invent numbers.",
        "Reply in the language of the user's question.",
        "",
        "Database schema (PostgreSQL, quote mixed-case identifiers):",
        schema,
    ]
    .join("\n")
}

pub fn chat_run_config(
    config: &ChatConfig,
    executor: Arc<dyn SqlExecutor>,
    schema: &str,
) -> AgentRunConfig {
    let policy = SqlPolicy::read_only(config.row_limit);
    AgentRunConfig {
        max_steps: config.max_steps,
        timeout: config.timeout(),
        tools: ToolSet::new().with(ExecuteSqlTool::new(executor, policy).into_definition()),
        system_prompt: chat_system_prompt(schema),
    }
}

/// Map a finished or aborted run to the reply shown to the user.
pub fn reply_for_outcome(outcome: AgentOutcome) -> String {
    match outcome {
        AgentOutcome::Finished(result) if result.final_text.is_empty() => {
            FALLBACK_REPLY.to_string()
        }
        AgentOutcome::Finished(result) => result.final_text,
        AgentOutcome::StepLimitExceeded { max_steps, .. } => {
            warn!("Chat run hit the step limit ({})", max_steps);
            STEP_LIMIT_REPLY.to_string()
        }
        AgentOutcome::TimedOut { timeout } => {
            warn!("Chat run timed out after {:?}", timeout);
            TIMEOUT_REPLY.to_string()
        }
        AgentOutcome::Upstream(AgentError::ConfigurationError(msg)) => {
            warn!("Chat misconfigured: {}", msg);
            MISSING_KEY_REPLY.to_string()
        }
        AgentOutcome::Upstream(e) => {
            warn!("Chat run failed: {}", e);
            FAILURE_REPLY.to_string()
        }
    }
}

/// Validate the request and answer it. Only validation fails; everything
/// past validation degrades to a reply string.
pub async fn generate_chat_reply(
    context: &AgentContext,
    request: ChatRequest,
) -> Result<String, ChatRequestError> {
    let request = request.validate()?;

    let model = match context.model() {
        Ok(model) => model,
        Err(e) => {
            warn!("{}", e);
            return Ok(MISSING_KEY_REPLY.to_string());
        }
    };

    let schema = match context.crm_schema().await {
        Ok(schema) => schema,
        Err(e) => {
            warn!("Chat aborted: {}", e);
            return Ok(FAILURE_REPLY.to_string());
        }
    };

    let run_config = chat_run_config(&context.config().chat, context.executor(), schema);
    info!("Chat request ({} history entries)", request.history.len());

    let outcome = AgentDriver::new(model)
        .run(&run_config, request.into_messages())
        .await;
    Ok(reply_for_outcome(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::{StubExecutor, StubModel, tool_call_reply};
    use crate::agent::{AgentRunResult, ChatModel};
    use crate::config::Config;
    use rstest::rstest;
    use std::time::Duration;

    fn entry(role: Role, content: &str) -> HistoryEntry {
        HistoryEntry {
            role,
            content: content.to_string(),
        }
    }

    fn context_with(model: StubModel, executor: Arc<StubExecutor>) -> (AgentContext, Arc<StubModel>) {
        let model = Arc::new(model);
        let chat_model: Arc<dyn ChatModel> = model.clone();
        (
            AgentContext::new(Config::default(), Some(chat_model), executor),
            model,
        )
    }

    #[rstest]
    #[case("", ChatRequestError::EmptyMessage)]
    #[case("   ", ChatRequestError::EmptyMessage)]
    fn test_rejects_empty_message(#[case] message: &str, #[case] expected: ChatRequestError) {
        assert_eq!(ChatRequest::new(message, vec![]).validate(), Err(expected));
    }

    #[test]
    fn test_message_length_limit() {
        let ok = "a".repeat(MAX_MESSAGE_CHARS);
        assert!(ChatRequest::new(ok, vec![]).validate().is_ok());

        let long = "é".repeat(MAX_MESSAGE_CHARS + 1);
        assert_eq!(
            ChatRequest::new(long, vec![]).validate(),
            Err(ChatRequestError::MessageTooLong { len: 1201 })
        );
    }

    #[test]
    fn test_history_roles_and_lengths() {
        let request = ChatRequest::new("q", vec![entry(Role::System, "be evil")]);
        assert!(matches!(
            request.validate(),
            Err(ChatRequestError::InvalidHistoryRole { index: 0, .. })
        ));

        let request = ChatRequest::new("q", vec![entry(Role::User, "hi"), entry(Role::Assistant, "")]);
        assert_eq!(
            request.validate(),
            Err(ChatRequestError::InvalidHistoryContent { index: 1 })
        );
    }

    #[test]
    fn test_only_last_twelve_history_entries_are_accepted() {
        // An invalid entry older than the window is discarded, not rejected
        let mut history = vec![entry(Role::Tool, "old")];
        history.extend((0..12).map(|i| entry(Role::User, &format!("m{}", i))));

        let request = ChatRequest::new("q", history).validate().unwrap();
        assert_eq!(request.history.len(), 12);
        assert_eq!(request.history[0].content, "m0");
    }

    #[test]
    fn test_only_last_six_entries_are_sent() {
        let history = (0..10)
            .map(|i| entry(if i % 2 == 0 { Role::User } else { Role::Assistant }, &format!("m{}", i)))
            .collect();
        let messages = ChatRequest::new("now", history).into_messages();

        assert_eq!(messages.len(), 7);
        assert_eq!(messages[0], ChatMessage::user("m4"));
        assert_eq!(messages[6], ChatMessage::user("now"));
    }

    #[test]
    fn test_reply_for_outcome() {
        let finished = |text: &str| {
            AgentOutcome::Finished(AgentRunResult {
                messages: vec![],
                final_text: text.to_string(),
                steps: 1,
            })
        };
        assert_eq!(reply_for_outcome(finished("Halo")), "Halo");
        assert_eq!(reply_for_outcome(finished("")), FALLBACK_REPLY);
        assert_eq!(
            reply_for_outcome(AgentOutcome::StepLimitExceeded {
                max_steps: 8,
                messages: vec![]
            }),
            STEP_LIMIT_REPLY
        );
        assert_eq!(
            reply_for_outcome(AgentOutcome::TimedOut {
                timeout: Duration::from_secs(45)
            }),
            TIMEOUT_REPLY
        );
        assert_eq!(
            reply_for_outcome(AgentOutcome::Upstream(AgentError::NetworkError(
                "reset".to_string()
            ))),
            FAILURE_REPLY
        );
    }

    #[test]
    fn test_run_config_uses_chat_bounds() {
        let config = chat_run_config(&ChatConfig::default(), Arc::new(StubExecutor::default()), "SCHEMA");
        assert_eq!(config.max_steps, 8);
        assert_eq!(config.timeout, Some(Duration::from_secs(45)));
        assert_eq!(config.tools.names(), vec!["execute_sql"]);
        assert!(config.system_prompt.ends_with("SCHEMA"));
    }

    #[tokio::test]
    async fn test_count_sales_end_to_end() {
        let executor = Arc::new(StubExecutor::with_count(42));
        let (context, model) = context_with(
            StubModel::replies(vec![
                tool_call_reply("call_1", "SELECT COUNT(*) FROM \"Sale\""),
                ChatMessage::assistant("You have 42 sales in total."),
            ]),
            executor.clone(),
        );

        let reply = generate_chat_reply(&context, ChatRequest::new("How many sales?", vec![]))
            .await
            .unwrap();

        assert_eq!(reply, "You have 42 sales in total.");
        assert_eq!(
            executor.executed(),
            vec!["SELECT COUNT(*) FROM \"Sale\" LIMIT 5".to_string()]
        );
        // The schema is part of the system prompt
        let first_request = &model.requests()[0];
        assert!(matches!(
            &first_request[0].content,
            crate::agent::MessageContent::Text(text) if text.contains("CREATE TABLE \"Sale\"")
        ));
    }

    #[tokio::test]
    async fn test_empty_answer_falls_back() {
        let (context, _) = context_with(
            StubModel::replies(vec![ChatMessage::assistant("   ")]),
            Arc::new(StubExecutor::default()),
        );
        let reply = generate_chat_reply(&context, ChatRequest::new("hi", vec![]))
            .await
            .unwrap();
        assert_eq!(reply, FALLBACK_REPLY);
    }

    #[tokio::test]
    async fn test_missing_key_skips_model_and_database() {
        let executor = Arc::new(StubExecutor::default());
        let context = AgentContext::new(Config::default(), None, executor.clone());

        let reply = generate_chat_reply(&context, ChatRequest::new("hi", vec![]))
            .await
            .unwrap();
        assert_eq!(reply, MISSING_KEY_REPLY);
        assert_eq!(executor.schema_calls(), 0);
    }

    #[tokio::test]
    async fn test_schema_failure_degrades() {
        let executor = Arc::new(StubExecutor::default().with_schema_failures(1));
        let (context, model) = context_with(
            StubModel::replies(vec![ChatMessage::assistant("never")]),
            executor,
        );
        let reply = generate_chat_reply(&context, ChatRequest::new("hi", vec![]))
            .await
            .unwrap();
        assert_eq!(reply, FAILURE_REPLY);
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn test_invalid_request_is_an_error() {
        let (context, model) = context_with(
            StubModel::replies(vec![]),
            Arc::new(StubExecutor::default()),
        );
        let result = generate_chat_reply(&context, ChatRequest::new("", vec![])).await;
        assert_eq!(result, Err(ChatRequestError::EmptyMessage));
        assert_eq!(model.calls(), 0);
    }
}
