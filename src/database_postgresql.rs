//! PostgreSQL implementation of [`SqlExecutor`]
use crate::config::DatabaseConfig;
use crate::database::{
    ColumnInfo, DatabaseError, JsonRow, QueryOutput, SqlExecutor, TableInfo, cell_text,
    quote_ident, render_schema, sqlx_message,
};
use crate::password_sanitizer::sanitize_connection_url;
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use sqlx::postgres::{
    PgConnectOptions, PgPool, PgPoolOptions, PgRow, PgValueFormat, PgValueRef,
};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info};

/// Statements that report an affected-row count instead of returning rows.
fn command_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^\s*(INSERT|UPDATE|DELETE)\b").expect("valid regex"))
}

fn returning_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bRETURNING\b").expect("valid regex"))
}

fn returns_rows(sql: &str) -> bool {
    !command_re().is_match(sql) || returning_re().is_match(sql)
}

/// PostgreSQL client backed by an sqlx connection pool
pub struct PostgresClient {
    pool: PgPool,
    query_timeout: Duration,
}

impl PostgresClient {
    pub async fn connect(url: &str, config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        info!("Connecting to {}", sanitize_connection_url(url));

        let connect_options: PgConnectOptions = url
            .parse()
            .map_err(|e: sqlx::Error| DatabaseError::InvalidUrl(e.to_string()))?;

        // Lazily connected: the first query opens the first connection.
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(0)
            .acquire_timeout(Duration::from_secs(15))
            .idle_timeout(Duration::from_secs(300))
            .connect_lazy_with(connect_options);

        Ok(Self {
            pool,
            query_timeout: Duration::from_secs(config.query_timeout_seconds),
        })
    }

    /// Run `query` under the per-query timeout, mapping driver errors with `on_error`.
    async fn bounded<T, F>(
        &self,
        query: F,
        on_error: fn(String) -> DatabaseError,
    ) -> Result<T, DatabaseError>
    where
        F: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.query_timeout, query).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(on_error(sqlx_message(&e))),
            Err(_) => Err(DatabaseError::Timeout(self.query_timeout.as_secs())),
        }
    }

    async fn fetch_rows(&self, sql: &str) -> Result<Vec<PgRow>, DatabaseError> {
        self.bounded(
            sqlx::query(sql).fetch_all(&self.pool),
            DatabaseError::QueryError,
        )
        .await
    }

    async fn list_tables(&self) -> Result<Vec<String>, DatabaseError> {
        let query = sqlx::query(
            r#"
            SELECT c.relname AS table_name
            FROM pg_class c
            INNER JOIN pg_namespace n ON c.relnamespace = n.oid
            WHERE c.relkind IN ('r', 'p', 'v', 'm')
              AND n.nspname = 'public'
            ORDER BY c.relname
            "#,
        );
        let rows = self
            .bounded(query.fetch_all(&self.pool), DatabaseError::ConnectionError)
            .await?;

        Ok(rows.iter().map(|row| row.get::<String, _>(0)).collect())
    }

    async fn table_columns(&self, table: &str) -> Result<Vec<ColumnInfo>, DatabaseError> {
        let query = sqlx::query(
            r#"
            SELECT
                a.attname AS column_name,
                format_type(a.atttypid, a.atttypmod) AS data_type,
                NOT a.attnotnull AS nullable
            FROM pg_attribute a
            INNER JOIN pg_class t ON a.attrelid = t.oid
            INNER JOIN pg_namespace n ON t.relnamespace = n.oid
            WHERE n.nspname = 'public'
              AND t.relname = $1
              AND a.attnum > 0
              AND NOT a.attisdropped
            ORDER BY a.attnum
            "#,
        )
        .bind(table);
        let rows = self
            .bounded(query.fetch_all(&self.pool), DatabaseError::MetadataError)
            .await?;

        Ok(rows
            .iter()
            .map(|row| ColumnInfo {
                name: row.get::<String, _>("column_name"),
                data_type: row.get::<String, _>("data_type"),
                nullable: row.get::<bool, _>("nullable"),
            })
            .collect())
    }

    async fn table_info(&self, table: &str, sample_rows: usize) -> Result<TableInfo, DatabaseError> {
        let columns = self.table_columns(table).await?;

        let mut samples = Vec::new();
        if sample_rows > 0 {
            let sql = format!(
                "SELECT * FROM public.{} LIMIT {}",
                quote_ident(table),
                sample_rows
            );
            for row in self.fetch_rows(&sql).await? {
                let cells = (0..row.len())
                    .map(|i| postgres_value_to_json(&row, i).map(|v| cell_text(&v)))
                    .collect::<Result<Vec<_>, _>>()?;
                samples.push(cells);
            }
        }

        Ok(TableInfo {
            name: table.to_string(),
            columns,
            sample_rows: samples,
        })
    }
}

#[async_trait]
impl SqlExecutor for PostgresClient {
    async fn execute(&self, sql: &str) -> Result<QueryOutput, DatabaseError> {
        debug!("[PostgresClient::execute] Executing statement");

        if !returns_rows(sql) {
            let result = self
                .bounded(
                    sqlx::query(sql).execute(&self.pool),
                    DatabaseError::QueryError,
                )
                .await?;
            debug!(
                "[PostgresClient::execute] {} rows affected",
                result.rows_affected()
            );
            return Ok(QueryOutput::Command {
                rows_affected: result.rows_affected(),
            });
        }

        let rows = self.fetch_rows(sql).await?;
        let mut results = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut object = JsonRow::new();
            for i in 0..row.len() {
                object.insert(row.column(i).name().to_string(), postgres_value_to_json(row, i)?);
            }
            results.push(object);
        }

        debug!("[PostgresClient::execute] Query returned {} rows", results.len());
        Ok(QueryOutput::Rows(results))
    }

    async fn describe_schema(
        &self,
        tables: Option<&[String]>,
        sample_rows: usize,
    ) -> Result<String, DatabaseError> {
        let existing = self.list_tables().await?;

        let selected: Vec<String> = match tables {
            Some(wanted) => {
                let missing: Vec<&str> = wanted
                    .iter()
                    .filter(|t| !existing.contains(t))
                    .map(String::as_str)
                    .collect();
                if !missing.is_empty() {
                    return Err(DatabaseError::MetadataError(format!(
                        "tables not found in schema public: {}",
                        missing.join(", ")
                    )));
                }
                wanted.to_vec()
            }
            None => existing,
        };

        debug!(
            "[PostgresClient::describe_schema] Describing {} tables",
            selected.len()
        );

        let mut infos = Vec::with_capacity(selected.len());
        for table in &selected {
            infos.push(self.table_info(table, sample_rows).await?);
        }
        Ok(render_schema(&infos))
    }
}

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Exact text of a binary `NUMERIC` value: header of ndigits, weight, sign
/// and dscale, followed by base-10000 digits.
fn numeric_text(bytes: &[u8]) -> Option<String> {
    let word = |i: usize| {
        bytes
            .get(i * 2..i * 2 + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
    };

    let ndigits = word(0)? as i16;
    let weight = i64::from(word(1)? as i16);
    let sign = word(2)?;
    let dscale = usize::from(word(3)?);

    match sign {
        NUMERIC_NAN => return Some("NaN".to_string()),
        NUMERIC_PINF => return Some("Infinity".to_string()),
        NUMERIC_NINF => return Some("-Infinity".to_string()),
        0 | NUMERIC_NEG => {}
        _ => return None,
    }
    if ndigits < 0 {
        return None;
    }

    let digits: Vec<u16> = (0..ndigits as usize)
        .map(|i| word(4 + i))
        .collect::<Option<_>>()?;
    let digit = |pos: i64| {
        usize::try_from(pos)
            .ok()
            .and_then(|p| digits.get(p).copied())
            .unwrap_or(0)
    };

    let mut text = String::new();
    if sign == NUMERIC_NEG {
        text.push('-');
    }
    if weight < 0 {
        text.push('0');
    } else {
        text.push_str(&digit(0).to_string());
        for pos in 1..=weight {
            text.push_str(&format!("{:04}", digit(pos)));
        }
    }

    if dscale > 0 {
        let mut fraction = String::new();
        let mut pos = weight + 1;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", digit(pos)));
            pos += 1;
        }
        fraction.truncate(dscale);
        text.push('.');
        text.push_str(&fraction);
    }

    Some(text)
}

/// `NUMERIC` as exact text. `Decimal` covers the common case; NaN, infinities
/// and values past 28 digits are read from the wire form.
fn numeric_to_json(row: &PgRow, raw: &PgValueRef<'_>, column_index: usize) -> Value {
    if let Ok(decimal) = row.try_get::<sqlx::types::Decimal, _>(column_index) {
        return Value::String(decimal.to_string());
    }
    let text = match raw.format() {
        PgValueFormat::Text => raw.as_str().ok().map(str::to_string),
        PgValueFormat::Binary => raw.as_bytes().ok().and_then(numeric_text),
    };
    Value::String(text.unwrap_or_else(|| "<NUMERIC>".to_string()))
}

/// Convert one column of a row into JSON, choosing the decoder by type name.
fn postgres_value_to_json(row: &PgRow, column_index: usize) -> Result<Value, DatabaseError> {
    let raw = row.try_get_raw(column_index)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }

    let column = row.column(column_index);
    let type_name = column.type_info().name().to_string();
    let to_err = |e: sqlx::Error| DatabaseError::QueryError(e.to_string());

    let value = match type_name.as_str() {
        "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" | "CITEXT" => {
            Value::String(row.try_get::<String, _>(column_index).map_err(to_err)?)
        }
        "INT2" => Value::from(row.try_get::<i16, _>(column_index).map_err(to_err)?),
        "INT4" => Value::from(row.try_get::<i32, _>(column_index).map_err(to_err)?),
        "INT8" => Value::from(row.try_get::<i64, _>(column_index).map_err(to_err)?),
        "FLOAT4" => Value::from(row.try_get::<f32, _>(column_index).map_err(to_err)?),
        "FLOAT8" => Value::from(row.try_get::<f64, _>(column_index).map_err(to_err)?),
        "NUMERIC" => numeric_to_json(row, &raw, column_index),
        "BOOL" => Value::Bool(row.try_get::<bool, _>(column_index).map_err(to_err)?),
        "TIMESTAMPTZ" => Value::String(
            row.try_get::<chrono::DateTime<chrono::Utc>, _>(column_index)
                .map_err(to_err)?
                .to_rfc3339(),
        ),
        "TIMESTAMP" => Value::String(
            row.try_get::<chrono::NaiveDateTime, _>(column_index)
                .map_err(to_err)?
                .to_string(),
        ),
        "DATE" => Value::String(
            row.try_get::<chrono::NaiveDate, _>(column_index)
                .map_err(to_err)?
                .to_string(),
        ),
        "TIME" => Value::String(
            row.try_get::<chrono::NaiveTime, _>(column_index)
                .map_err(to_err)?
                .to_string(),
        ),
        "JSON" | "JSONB" => row.try_get::<Value, _>(column_index).map_err(to_err)?,
        "UUID" => Value::String(
            row.try_get::<sqlx::types::Uuid, _>(column_index)
                .map_err(to_err)?
                .to_string(),
        ),
        "TEXT[]" | "VARCHAR[]" => Value::from(
            row.try_get::<Vec<String>, _>(column_index)
                .map_err(to_err)?,
        ),
        // Enums and anything else with a textual wire form
        _ => match row.try_get_unchecked::<String, _>(column_index) {
            Ok(text) => Value::String(text),
            Err(_) => Value::String(format!("<{}>", type_name)),
        },
    };

    Ok(value)
}
