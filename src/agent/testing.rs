//! In-memory model and database doubles for tests

use crate::agent::error::{AgentError, AgentResult};
use crate::agent::message::{ChatMessage, ToolCallRequest};
use crate::agent::tool::ToolDefinition;
use crate::agent::model::ChatModel;
use crate::database::{DatabaseError, JsonRow, QueryOutput, SqlExecutor};
use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub fn sql_call(id: &str, query: &str) -> ToolCallRequest {
    ToolCallRequest {
        id: id.to_string(),
        name: "execute_sql".to_string(),
        arguments: json!({ "query": query }).to_string(),
    }
}

pub fn tool_call_reply(id: &str, query: &str) -> ChatMessage {
    ChatMessage::assistant_tool_calls(None, vec![sql_call(id, query)])
}

enum Script {
    Queue(VecDeque<AgentResult<ChatMessage>>),
    Repeat(ChatMessage),
}

/// Replays scripted replies and records every request it receives.
pub struct StubModel {
    script: Mutex<Script>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
    delay: Option<Duration>,
}

impl StubModel {
    pub fn scripted(replies: Vec<AgentResult<ChatMessage>>) -> Self {
        Self {
            script: Mutex::new(Script::Queue(replies.into())),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    pub fn replies(replies: Vec<ChatMessage>) -> Self {
        Self::scripted(replies.into_iter().map(Ok).collect())
    }

    /// Answers every request with the same message.
    pub fn always(reply: ChatMessage) -> Self {
        Self {
            script: Mutex::new(Script::Repeat(reply)),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatModel for StubModel {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        _tools: &[ToolDefinition],
    ) -> AgentResult<ChatMessage> {
        self.requests.lock().unwrap().push(messages.to_vec());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match &mut *self.script.lock().unwrap() {
            Script::Repeat(reply) => Ok(reply.clone()),
            Script::Queue(queue) => queue.pop_front().unwrap_or_else(|| {
                Err(AgentError::ProviderError("stub script exhausted".to_string()))
            }),
        }
    }

    fn name(&self) -> &str {
        "stub"
    }
}

/// Records executed statements. SELECTs return one `{"count": n}` row,
/// other statements affect one row.
pub struct StubExecutor {
    count: i64,
    failure: Option<String>,
    schema: String,
    schema_failures: AtomicUsize,
    schema_calls: AtomicUsize,
    schema_delay: Option<Duration>,
    executed: Mutex<Vec<String>>,
    described: Mutex<Vec<Option<Vec<String>>>>,
}

impl Default for StubExecutor {
    fn default() -> Self {
        Self {
            count: 0,
            failure: None,
            schema: "CREATE TABLE \"Sale\" (\n\"id\" text NOT NULL\n)".to_string(),
            schema_failures: AtomicUsize::new(0),
            schema_calls: AtomicUsize::new(0),
            schema_delay: None,
            executed: Mutex::new(Vec::new()),
            described: Mutex::new(Vec::new()),
        }
    }
}

impl StubExecutor {
    pub fn with_count(count: i64) -> Self {
        Self {
            count,
            ..Self::default()
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn with_schema(mut self, schema: &str) -> Self {
        self.schema = schema.to_string();
        self
    }

    /// The first `n` schema loads fail with a connection error.
    pub fn with_schema_failures(self, n: usize) -> Self {
        self.schema_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_schema_delay(mut self, delay: Duration) -> Self {
        self.schema_delay = Some(delay);
        self
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn schema_calls(&self) -> usize {
        self.schema_calls.load(Ordering::SeqCst)
    }

    /// Table lists passed to each `describe_schema` call
    pub fn described(&self) -> Vec<Option<Vec<String>>> {
        self.described.lock().unwrap().clone()
    }
}

#[async_trait]
impl SqlExecutor for StubExecutor {
    async fn execute(&self, sql: &str) -> Result<QueryOutput, DatabaseError> {
        self.executed.lock().unwrap().push(sql.to_string());

        if let Some(message) = &self.failure {
            return Err(DatabaseError::QueryError(message.clone()));
        }

        if sql.trim_start().to_ascii_uppercase().starts_with("SELECT") {
            let mut row = JsonRow::new();
            row.insert("count".to_string(), json!(self.count));
            Ok(QueryOutput::Rows(vec![row]))
        } else {
            Ok(QueryOutput::Command { rows_affected: 1 })
        }
    }

    async fn describe_schema(
        &self,
        tables: Option<&[String]>,
        _sample_rows: usize,
    ) -> Result<String, DatabaseError> {
        self.schema_calls.fetch_add(1, Ordering::SeqCst);
        self.described
            .lock()
            .unwrap()
            .push(tables.map(|t| t.to_vec()));

        if let Some(delay) = self.schema_delay {
            tokio::time::sleep(delay).await;
        }

        let remaining = self.schema_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.schema_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(DatabaseError::ConnectionError("connection refused".to_string()));
        }

        Ok(self.schema.clone())
    }
}
