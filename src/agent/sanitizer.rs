//! Validation and rewriting of model-proposed SQL
//!
//! Every statement the model hands to `execute_sql` passes through
//! [`sanitize`] first. The checks are keyword based: they block statement
//! stacking, DDL under every policy, DML under read-only policies and writes
//! to tables a policy marks as forbidden. Read-only statements get a row cap
//! appended so results stay small enough for the model context.

use crate::agent::error::SanitizeError;
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// Default row cap for read-only policies
pub const DEFAULT_ROW_LIMIT: usize = 10;

/// Whether a policy allows writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlAccess {
    ReadOnly,
    ReadWrite,
}

/// Rules applied to every statement of one agent run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlPolicy {
    pub access: SqlAccess,
    /// Appended as `LIMIT n` to read-only statements that have none
    pub row_limit: usize,
    /// Tables that may not be the target of INSERT, UPDATE or DELETE
    pub forbidden_tables: Vec<String>,
    /// Short name used in rejection messages
    pub label: String,
}

impl SqlPolicy {
    pub fn read_only(row_limit: usize) -> Self {
        Self {
            access: SqlAccess::ReadOnly,
            row_limit: row_limit.max(1),
            forbidden_tables: Vec::new(),
            label: "read-only".to_string(),
        }
    }

    pub fn read_write() -> Self {
        Self {
            access: SqlAccess::ReadWrite,
            row_limit: DEFAULT_ROW_LIMIT,
            forbidden_tables: Vec::new(),
            label: "read-write".to_string(),
        }
    }

    pub fn with_forbidden_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.forbidden_tables = tables.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn is_read_only(&self) -> bool {
        self.access == SqlAccess::ReadOnly
    }

    fn forbids(&self, table: &str) -> Option<&str> {
        self.forbidden_tables
            .iter()
            .find(|t| t.eq_ignore_ascii_case(table))
            .map(String::as_str)
    }
}

impl Default for SqlPolicy {
    fn default() -> Self {
        Self::read_only(DEFAULT_ROW_LIMIT)
    }
}

/// A statement that passed [`sanitize`] under `policy`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedQuery {
    pub sql: String,
    pub policy: SqlPolicy,
}

impl SanitizedQuery {
    pub fn as_str(&self) -> &str {
        &self.sql
    }
}

impl fmt::Display for SanitizedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)
    }
}

fn select_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^\s*select\b").expect("valid regex"))
}

fn ddl_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(ALTER|DROP|CREATE|REPLACE|TRUNCATE|GRANT|REVOKE)\b")
            .expect("valid regex")
    })
}

fn dml_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(INSERT|UPDATE|DELETE)\b").expect("valid regex"))
}

fn limit_tail_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\blimit\s+\d+(?:\s*,\s*\d+)?(?:\s+offset\s+\d+)?\s*$")
            .expect("valid regex")
    })
}

/// Write targets: `INSERT INTO t`, `UPDATE t`, `DELETE FROM t`, with an
/// optional (quoted) schema qualifier and optional quotes around the table.
fn write_target_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?i)\b(?:INSERT\s+INTO|UPDATE(?:\s+ONLY)?|DELETE\s+FROM)\s+(?:"?[A-Za-z_][A-Za-z0-9_]*"?\s*\.\s*)?"?([A-Za-z_][A-Za-z0-9_]*)"?"#,
        )
        .expect("valid regex")
    })
}

/// Byte offset of a `--` comment still open at the end of `sql`.
///
/// Quotes are tracked so `'--'` and `"a--b"` are not taken for comments.
fn trailing_comment_start(sql: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    let mut comment: Option<usize> = None;
    let mut chars = sql.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if comment.is_some() {
            if c == '\n' {
                comment = None;
            }
            continue;
        }
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c == '-' && chars.peek().is_some_and(|&(_, next)| next == '-') => {
                comment = Some(i);
            }
            None => {}
        }
    }

    comment
}

/// Validate `raw` against `policy` and return the statement to execute.
pub fn sanitize(raw: &str, policy: &SqlPolicy) -> Result<SanitizedQuery, SanitizeError> {
    let trimmed = raw.trim();

    let semicolons = trimmed.matches(';').count();
    if semicolons > 1
        || (trimmed.ends_with(';') && trimmed[..trimmed.len() - 1].contains(';'))
    {
        return Err(SanitizeError::MultipleStatements);
    }

    let mut sql = trimmed.trim_end_matches(';').trim().to_string();

    // A single separator between two statements: `SELECT 1; SELECT 2`
    if sql.contains(';') {
        return Err(SanitizeError::MultipleStatements);
    }

    if sql.is_empty() {
        return Err(SanitizeError::Empty);
    }

    if policy.is_read_only() && !select_re().is_match(&sql) {
        return Err(SanitizeError::NotSelect);
    }

    if let Some(m) = ddl_re().find(&sql) {
        return Err(SanitizeError::DdlBlocked {
            keyword: m.as_str().to_uppercase(),
        });
    }

    if policy.is_read_only() {
        if let Some(m) = dml_re().find(&sql) {
            return Err(SanitizeError::DmlBlocked {
                keyword: m.as_str().to_uppercase(),
            });
        }
    } else if !policy.forbidden_tables.is_empty() {
        for caps in write_target_re().captures_iter(&sql) {
            if let Some(table) = caps.get(1).and_then(|t| policy.forbids(t.as_str())) {
                return Err(SanitizeError::ForbiddenTable {
                    table: table.to_string(),
                    policy: policy.label.clone(),
                });
            }
        }
    }

    if policy.is_read_only() {
        match trailing_comment_start(&sql) {
            Some(start) => {
                if !limit_tail_re().is_match(sql[..start].trim_end()) {
                    sql = format!("{}\nLIMIT {}", sql, policy.row_limit);
                }
            }
            None if !limit_tail_re().is_match(&sql) => {
                sql = format!("{} LIMIT {}", sql, policy.row_limit);
            }
            None => {}
        }
    }

    Ok(SanitizedQuery {
        sql,
        policy: policy.clone(),
    })
}
