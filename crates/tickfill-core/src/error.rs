use thiserror::Error;

use tickfill_warehouse::WarehouseError;

use crate::adapter::AdapterError;

/// Validation errors for domain values parsed from user or catalog input.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("entity code cannot be empty")]
    EmptyCode,
    #[error("exchange cannot be empty")]
    EmptyExchange,
    #[error("entity code contains invalid character '{ch}' at index {index}")]
    CodeInvalidChar { ch: char, index: usize },

    #[error("invalid entity type '{value}', expected one of stock, index, coin, etf")]
    InvalidEntityType { value: String },
    #[error("entity id must look like {{type}}_{{exchange}}_{{code}}: '{value}'")]
    InvalidEntityId { value: String },

    #[error("invalid level '{value}', expected one of tick, 1m, 5m, 15m, 30m, 1h, 4h, 1d, 1wk, 1mon")]
    InvalidLevel { value: String },

    #[error("unrecognized timestamp '{value}'")]
    InvalidTimestamp { value: String },

    #[error("invalid duplicate policy '{value}', expected append-suffix or drop")]
    InvalidDuplicatePolicy { value: String },
    #[error("invalid failure scope '{value}', expected retry-all or isolate-entity")]
    InvalidFailureScope { value: String },

    #[error("config field '{field}' must be greater than zero")]
    NonPositive { field: &'static str },
}

/// A raw timestamp that none of the accepted formats could read.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("cannot parse timestamp from '{value}'")]
pub struct TimestampParseError {
    pub value: String,
}

/// A raw record could not be mapped onto its schema.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MappingError {
    #[error("record '{record_id}' for schema '{schema}' is missing required field '{field}'")]
    MissingRequiredField {
        schema: String,
        field: String,
        record_id: String,
    },
}

/// Failure reported by a [`crate::Store`] or [`crate::EntityCatalog`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Warehouse(#[from] WarehouseError),

    #[error("stored value for '{field}' is unreadable: {message}")]
    Corrupt { field: String, message: String },

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Errors raised while normalizing a raw record.
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Run-level failures. Per-entity adapter and store failures are absorbed by
/// the sync loop and only show up in the report.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("unknown schema '{0}'")]
    UnknownSchema(String),

    #[error("invalid sync config: {0}")]
    InvalidConfig(#[from] ValidationError),

    #[error("entity catalog lookup failed: {0}")]
    Catalog(#[source] StoreError),

    #[error("failed to prepare store for schema '{schema}': {source}")]
    StorePrepare {
        schema: String,
        #[source]
        source: StoreError,
    },

    #[error("announcement schema '{0}' has no timestamp source")]
    MissingTimestampSource(String),

    #[error("sync run cancelled")]
    Cancelled,
}

/// Top-level error type for core operations outside a sync run.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
