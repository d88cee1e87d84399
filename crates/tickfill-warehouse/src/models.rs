//! Row and table types exchanged with the warehouse.
//!
//! Timestamps cross this boundary as naive UTC strings in the form
//! `YYYY-MM-DD HH:MM:SS[.ffffff]`; reads always return six fractional digits.

use ::duckdb::types::{ToSqlOutput, Value as DuckValue};
use ::duckdb::ToSql;
use serde::Serialize;

use crate::WarehouseError;

/// Storage type of a record column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Boolean,
    BigInt,
    Double,
    Text,
    Timestamp,
}

impl ColumnType {
    #[must_use]
    pub const fn sql_type(self) -> &'static str {
        match self {
            Self::Boolean => "BOOLEAN",
            Self::BigInt => "BIGINT",
            Self::Double => "DOUBLE",
            Self::Text => "TEXT",
            Self::Timestamp => "TIMESTAMP",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
}

impl ColumnDef {
    #[must_use]
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// A per-schema record table. Every record table carries the key columns
/// `id`, `entity_id`, `code`, `timestamp`, `level` ahead of `columns`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
}

impl TableDef {
    #[must_use]
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), WarehouseError> {
        validate_identifier(self.name.as_str())?;
        for column in &self.columns {
            validate_identifier(column.name.as_str())?;
            if KEY_COLUMNS.contains(&column.name.as_str()) {
                return Err(WarehouseError::QueryRejected(format!(
                    "column '{}' is reserved in table '{}'",
                    column.name, self.name
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|column| column.name == name)
    }
}

pub(crate) const KEY_COLUMNS: [&str; 5] = ["id", "entity_id", "code", "timestamp", "level"];

/// A single typed value bound into or read out of a record column.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(String),
}

impl Cell {
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub(crate) fn from_duck(value: DuckValue, column_type: ColumnType) -> Self {
        match (value, column_type) {
            (DuckValue::Null, _) => Self::Null,
            (DuckValue::Text(value), ColumnType::Timestamp) => Self::Timestamp(value),
            (DuckValue::Boolean(value), _) => Self::Bool(value),
            (DuckValue::TinyInt(value), _) => Self::Int(i64::from(value)),
            (DuckValue::SmallInt(value), _) => Self::Int(i64::from(value)),
            (DuckValue::Int(value), _) => Self::Int(i64::from(value)),
            (DuckValue::BigInt(value), _) => Self::Int(value),
            (DuckValue::Float(value), _) => Self::Float(f64::from(value)),
            (DuckValue::Double(value), _) => Self::Float(value),
            (DuckValue::Text(value), _) => Self::Text(value),
            (other, _) => Self::Text(format!("{other:?}")),
        }
    }
}

impl ToSql for Cell {
    fn to_sql(&self) -> ::duckdb::Result<ToSqlOutput<'_>> {
        let value = match self {
            Self::Null => DuckValue::Null,
            Self::Bool(value) => DuckValue::Boolean(*value),
            Self::Int(value) => DuckValue::BigInt(*value),
            Self::Float(value) => DuckValue::Double(*value),
            Self::Text(value) | Self::Timestamp(value) => DuckValue::Text(value.clone()),
        };
        Ok(ToSqlOutput::Owned(value))
    }
}

/// One persisted record row of a registered table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordRow {
    pub id: String,
    pub entity_id: String,
    pub code: String,
    pub timestamp: Option<String>,
    pub level: Option<String>,
    pub cells: Vec<(String, Cell)>,
}

impl RecordRow {
    #[must_use]
    pub fn cell(&self, name: &str) -> Option<&Cell> {
        self.cells
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, cell)| cell)
    }
}

/// A tracked entity in the catalog table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityRow {
    pub id: String,
    pub entity_type: String,
    pub exchange: String,
    pub code: String,
    pub name: Option<String>,
    pub inception: Option<String>,
}

/// Catalog filter. Empty lists match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityFilter {
    pub entity_type: Option<String>,
    pub exchanges: Vec<String>,
    pub ids: Vec<String>,
    pub codes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncLogEntry {
    pub run_id: String,
    pub schema_id: String,
    pub entity_id: String,
    pub record_count: u64,
    pub first_ts: Option<String>,
    pub last_ts: Option<String>,
}

pub(crate) fn validate_identifier(name: &str) -> Result<(), WarehouseError> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .next()
            .is_some_and(|first| first.is_ascii_lowercase() || first == '_')
        && name
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_');
    if valid {
        Ok(())
    } else {
        Err(WarehouseError::InvalidIdentifier(name.to_string()))
    }
}
