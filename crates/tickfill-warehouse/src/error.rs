use thiserror::Error;

/// Errors raised by the warehouse layer.
#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error(transparent)]
    DuckDb(#[from] ::duckdb::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("query rejected: {0}")]
    QueryRejected(String),

    #[error("query timed out after {timeout_ms}ms")]
    QueryTimeout { timeout_ms: u64 },

    #[error("table '{0}' is not registered with the warehouse")]
    UnknownTable(String),

    #[error("invalid identifier '{0}': use lowercase ascii letters, digits and underscores")]
    InvalidIdentifier(String),
}
