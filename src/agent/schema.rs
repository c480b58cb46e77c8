//! Process-wide schema text cache

use crate::agent::error::{AgentError, AgentResult};
use crate::database::SqlExecutor;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Schema text for one table selection, loaded at most once.
///
/// Concurrent first callers share a single load. A failed load leaves the
/// cell empty, so the next request tries again.
#[derive(Debug)]
pub struct SchemaCache {
    tables: Option<Vec<String>>,
    sample_rows: usize,
    text: OnceCell<String>,
}

impl SchemaCache {
    /// Cache for the given allow-list.
    pub fn for_tables(tables: Vec<String>, sample_rows: usize) -> Self {
        Self {
            tables: Some(tables),
            sample_rows,
            text: OnceCell::new(),
        }
    }

    /// Cache covering every table in the `public` schema.
    pub fn all_tables(sample_rows: usize) -> Self {
        Self {
            tables: None,
            sample_rows,
            text: OnceCell::new(),
        }
    }

    pub fn tables(&self) -> Option<&[String]> {
        self.tables.as_deref()
    }

    pub fn is_loaded(&self) -> bool {
        self.text.initialized()
    }

    pub async fn get_or_load(&self, executor: &dyn SqlExecutor) -> AgentResult<&str> {
        let text = self
            .text
            .get_or_try_init(|| async {
                debug!("Loading schema for {:?}", self.tables);
                let text = executor
                    .describe_schema(self.tables.as_deref(), self.sample_rows)
                    .await
                    .map_err(|e| AgentError::SchemaError(e.to_string()))?;
                info!("Schema loaded ({} bytes)", text.len());
                Ok::<_, AgentError>(text)
            })
            .await?;
        Ok(text.as_str())
    }
}
