//! Guarded read-only SQL over the store.

use crate::error::{StoreError, StoreResult};
use crate::store::MetadataStore;
use rusqlite::types::ValueRef;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Hard cap on rows returned by one query, whatever the caller asks for.
pub const MAX_QUERY_ROWS: usize = 1000;

const BLOCKED_KEYWORDS: &[&str] = &[
    "insert", "update", "delete", "replace", "upsert", "create", "drop", "alter", "attach",
    "detach", "pragma", "vacuum", "reindex", "analyze", "begin", "commit", "rollback",
    "savepoint", "release", "load_extension",
];

/// Rows of a read-only query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    /// `true` when more rows were available than returned.
    pub truncated: bool,
}

fn validate(sql: &str) -> StoreResult<&str> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if trimmed.is_empty() {
        return Err(StoreError::QuerySafety("query is empty".into()));
    }
    if trimmed.contains(';') {
        return Err(StoreError::QuerySafety(
            "only a single statement is allowed".into(),
        ));
    }

    let lowered = trimmed.to_lowercase();
    let first = lowered
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .find(|w| !w.is_empty())
        .unwrap_or_default();
    if first != "select" && first != "with" {
        return Err(StoreError::QuerySafety(
            "only SELECT or WITH queries are allowed".into(),
        ));
    }
    if let Some(word) = lowered
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .find(|w| BLOCKED_KEYWORDS.contains(w))
    {
        return Err(StoreError::QuerySafety(format!(
            "keyword {word:?} is not allowed"
        )));
    }
    Ok(trimmed)
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(hex::encode(b)),
    }
}

impl MetadataStore {
    /// Runs a single read-only `SELECT`/`WITH` statement and returns at
    /// most `max_rows` rows (bounded by [`MAX_QUERY_ROWS`]).
    pub fn execute_readonly_query(&self, sql: &str, max_rows: usize) -> StoreResult<QueryResult> {
        let sql = validate(sql)?;
        let max_rows = max_rows.clamp(1, MAX_QUERY_ROWS);

        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| StoreError::QuerySafety(format!("query does not compile: {e}")))?;
        if !stmt.readonly() {
            return Err(StoreError::QuerySafety("statement is not read-only".into()));
        }
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        let mut truncated = false;
        while let Some(row) = rows.next()? {
            if out.len() == max_rows {
                truncated = true;
                break;
            }
            let values = (0..columns.len())
                .map(|i| row.get_ref(i).map(to_json))
                .collect::<Result<Vec<_>, _>>()?;
            out.push(values);
        }
        Ok(QueryResult {
            columns,
            rows: out,
            truncated,
        })
    }
}
