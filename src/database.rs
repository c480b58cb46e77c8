//! Database abstraction used by the agent tools
//!
//! The agent only needs two capabilities from the database: run one
//! statement and describe the tables it may touch. [`SqlExecutor`] captures
//! both so the loop can be driven against PostgreSQL in production and an
//! in-memory stub in tests.
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::fmt::Write as _;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// sslmode values upgraded to `verify-full` by [`normalize_database_url`]
const WEAK_SSL_MODES: &[&str] = &["prefer", "require", "verify-ca"];

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Invalid database URL: {0}")]
    InvalidUrl(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Metadata error: {0}")]
    MetadataError(String),

    #[error("Query timed out after {0} seconds")]
    Timeout(u64),

    #[error("SQLx error: {0}")]
    SqlxError(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Message suitable for handing back to the model: the server's own text
    /// for query failures, the full display otherwise.
    pub fn driver_message(&self) -> String {
        match self {
            DatabaseError::QueryError(message) => message.clone(),
            DatabaseError::SqlxError(err) => sqlx_message(err),
            other => other.to_string(),
        }
    }
}

/// Server-side error text when available, otherwise sqlx's display.
pub fn sqlx_message(err: &sqlx::Error) -> String {
    match err.as_database_error() {
        Some(db_err) => db_err.message().to_string(),
        None => err.to_string(),
    }
}

/// One JSON object per row, keyed by column name.
pub type JsonRow = Map<String, Value>;

/// What a single statement produced
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    Rows(Vec<JsonRow>),
    Command { rows_affected: u64 },
}

impl QueryOutput {
    /// Text handed to the model as the tool result.
    pub fn to_tool_text(&self) -> Result<String, serde_json::Error> {
        match self {
            QueryOutput::Rows(rows) => serde_json::to_string_pretty(rows),
            QueryOutput::Command { rows_affected } => {
                Ok(format!("Statement executed. {} rows affected.", rows_affected))
            }
        }
    }
}

/// The database as seen by the agent.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Execute exactly one, already sanitized, statement.
    async fn execute(&self, sql: &str) -> Result<QueryOutput, DatabaseError>;

    /// Describe tables of the `public` schema with a few sample rows each.
    ///
    /// `tables = None` describes every table. Listed tables that do not
    /// exist are an error.
    async fn describe_schema(
        &self,
        tables: Option<&[String]>,
        sample_rows: usize,
    ) -> Result<String, DatabaseError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

/// Structure plus sample data of one table, ready for rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub sample_rows: Vec<Vec<String>>,
}

impl TableInfo {
    /// `CREATE TABLE` block followed by a comment holding the sample rows.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "CREATE TABLE {} (", quote_ident(&self.name));
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let mut line = format!("{} {}", quote_ident(&c.name), c.data_type);
                if !c.nullable {
                    line.push_str(" NOT NULL");
                }
                line
            })
            .collect();
        let _ = writeln!(out, "{}", columns.join(", \n"));
        out.push_str(")\n\n/*\n");
        let _ = writeln!(
            out,
            "{} rows from {} table:",
            self.sample_rows.len(),
            quote_ident(&self.name)
        );
        let header: Vec<&str> = self.columns.iter().map(|c| c.name.as_str()).collect();
        let _ = writeln!(out, "{}", header.join("\t"));
        for row in &self.sample_rows {
            let _ = writeln!(out, " {}", row.join("\t"));
        }
        out.push_str("*/");
        out
    }
}

/// Join table descriptions with a blank line between them.
pub fn render_schema(tables: &[TableInfo]) -> String {
    tables
        .iter()
        .map(TableInfo::render)
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Double-quote an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Sample cell text: strings unquoted, NULL as empty, everything else JSON.
pub fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Force certificate verification for PostgreSQL URLs.
///
/// `sslmode=prefer|require|verify-ca` becomes `verify-full`. Non-PostgreSQL
/// URLs and strings that do not parse are returned unchanged.
pub fn normalize_database_url(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return raw.to_string();
    };

    if url.scheme() != "postgres" && url.scheme() != "postgresql" {
        return raw.to_string();
    }

    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let weak = pairs.iter().any(|(k, v)| {
        k == "sslmode" && WEAK_SSL_MODES.contains(&v.to_ascii_lowercase().as_str())
    });
    if !weak {
        return raw.to_string();
    }

    debug!("Upgrading sslmode to verify-full");
    url.query_pairs_mut().clear().extend_pairs(pairs.iter().map(|(k, v)| {
        if k == "sslmode" {
            (k.as_str(), "verify-full")
        } else {
            (k.as_str(), v.as_str())
        }
    }));
    url.to_string()
}
