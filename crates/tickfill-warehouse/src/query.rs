//! Ad-hoc SQL with row and time limits.

use std::time::{Duration, Instant};

use ::duckdb::types::Value as DuckValue;
use ::duckdb::Connection;
use serde::Serialize;
use serde_json::{Number, Value};

use crate::WarehouseError;

#[derive(Debug, Clone, Copy)]
pub struct QueryGuardrails {
    pub max_rows: usize,
    pub query_timeout_ms: u64,
}

impl Default for QueryGuardrails {
    fn default() -> Self {
        Self {
            max_rows: 10_000,
            query_timeout_ms: 5_000,
        }
    }
}

impl QueryGuardrails {
    fn timeout(self) -> Duration {
        Duration::from_millis(self.query_timeout_ms.max(1))
    }

    pub(crate) fn validate(self) -> Result<(), WarehouseError> {
        if self.max_rows == 0 {
            return Err(WarehouseError::QueryRejected(String::from(
                "--max-rows must be greater than zero",
            )));
        }
        if self.query_timeout_ms == 0 {
            return Err(WarehouseError::QueryRejected(String::from(
                "--query-timeout-ms must be greater than zero",
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SqlColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub r#type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub columns: Vec<SqlColumn>,
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
    pub truncated: bool,
}

impl QueryResult {
    fn empty() -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            row_count: 0,
            truncated: false,
        }
    }
}

pub(crate) fn normalize_sql(sql: &str) -> Result<&str, WarehouseError> {
    let normalized = sql.trim().trim_end_matches(';').trim();
    if normalized.is_empty() {
        return Err(WarehouseError::QueryRejected(String::from(
            "query must not be empty",
        )));
    }
    Ok(normalized)
}

pub(crate) fn enforce_read_only(sql: &str) -> Result<(), WarehouseError> {
    if !is_select_like(sql) {
        return Err(WarehouseError::QueryRejected(String::from(
            "read-only mode accepts only SELECT/CTE queries; use --write for write statements",
        )));
    }
    if sql.split(';').filter(|part| !part.trim().is_empty()).count() > 1 {
        return Err(WarehouseError::QueryRejected(String::from(
            "multiple SQL statements are not allowed in read-only mode",
        )));
    }
    Ok(())
}

pub(crate) fn execute_with_guardrails(
    connection: &Connection,
    sql: &str,
    guardrails: QueryGuardrails,
    allow_write: bool,
) -> Result<QueryResult, WarehouseError> {
    let started = Instant::now();
    if is_select_like(sql) {
        return execute_select(connection, sql, guardrails, started);
    }
    if !allow_write {
        return Err(WarehouseError::QueryRejected(String::from(
            "only SELECT/CTE queries are allowed unless --write is provided",
        )));
    }

    connection.execute_batch(sql)?;
    ensure_within(started, guardrails.timeout())?;
    Ok(QueryResult::empty())
}

fn execute_select(
    connection: &Connection,
    sql: &str,
    guardrails: QueryGuardrails,
    started: Instant,
) -> Result<QueryResult, WarehouseError> {
    let mut statement = connection.prepare(sql)?;
    // Column metadata is only available once the statement has run.
    drop(statement.query([])?);

    let column_count = statement.column_count();
    let columns = (0..column_count)
        .map(|index| SqlColumn {
            name: statement
                .column_name(index)
                .map_or_else(|_| format!("column_{index}"), ToString::to_string),
            r#type: statement.column_type(index).to_string(),
        })
        .collect::<Vec<_>>();

    let mut cursor = statement.query([])?;
    let mut rows = Vec::new();
    let mut truncated = false;
    while let Some(row) = cursor.next()? {
        ensure_within(started, guardrails.timeout())?;
        if rows.len() >= guardrails.max_rows {
            truncated = true;
            break;
        }

        let mut values = Vec::with_capacity(column_count);
        for index in 0..column_count {
            let value: DuckValue = row.get(index)?;
            values.push(to_json_value(value));
        }
        rows.push(values);
    }
    ensure_within(started, guardrails.timeout())?;

    Ok(QueryResult {
        columns,
        row_count: rows.len(),
        rows,
        truncated,
    })
}

fn to_json_value(value: DuckValue) -> Value {
    match value {
        DuckValue::Null => Value::Null,
        DuckValue::Boolean(value) => Value::Bool(value),
        DuckValue::TinyInt(value) => Value::Number(Number::from(value)),
        DuckValue::SmallInt(value) => Value::Number(Number::from(value)),
        DuckValue::Int(value) => Value::Number(Number::from(value)),
        DuckValue::BigInt(value) => Value::Number(Number::from(value)),
        DuckValue::UTinyInt(value) => Value::Number(Number::from(value)),
        DuckValue::USmallInt(value) => Value::Number(Number::from(value)),
        DuckValue::UInt(value) => Value::Number(Number::from(value)),
        DuckValue::UBigInt(value) => Value::Number(Number::from(value)),
        DuckValue::Float(value) => number_or_null(f64::from(value)),
        DuckValue::Double(value) => number_or_null(value),
        DuckValue::Text(value) => Value::String(value),
        DuckValue::Blob(value) => Value::String(hex::encode(value)),
        other => Value::String(format!("{other:?}")),
    }
}

fn number_or_null(value: f64) -> Value {
    Number::from_f64(value).map_or(Value::Null, Value::Number)
}

fn is_select_like(sql: &str) -> bool {
    let first_keyword = sql
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    matches!(
        first_keyword.as_str(),
        "SELECT" | "WITH" | "EXPLAIN" | "SHOW" | "DESCRIBE" | "SUMMARIZE"
    )
}

fn ensure_within(started: Instant, timeout: Duration) -> Result<(), WarehouseError> {
    if started.elapsed() > timeout {
        return Err(WarehouseError::QueryTimeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_semicolons_are_stripped() {
        assert_eq!(normalize_sql("  SELECT 1;; ").expect("sql"), "SELECT 1");
        assert!(normalize_sql(" ; ").is_err());
    }

    #[test]
    fn read_only_rejects_writes_and_batches() {
        assert!(enforce_read_only("SELECT * FROM entities").is_ok());
        assert!(enforce_read_only("with x as (select 1) select * from x").is_ok());
        assert!(enforce_read_only("DELETE FROM entities").is_err());
        assert!(enforce_read_only("SELECT 1; DROP TABLE entities").is_err());
    }

    #[test]
    fn zero_guardrails_are_rejected() {
        let guardrails = QueryGuardrails {
            max_rows: 0,
            query_timeout_ms: 10,
        };
        assert!(guardrails.validate().is_err());
    }
}
