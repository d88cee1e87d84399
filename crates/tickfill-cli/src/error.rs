use thiserror::Error;

/// CLI-level error categories mapped to exit codes.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Validation(#[from] tickfill_core::ValidationError),

    #[error("command error: {0}")]
    Command(String),

    #[error(transparent)]
    Core(#[from] tickfill_core::CoreError),

    #[error(transparent)]
    Store(#[from] tickfill_core::StoreError),

    #[error(transparent)]
    Sync(#[from] tickfill_core::SyncError),

    #[error(transparent)]
    Warehouse(#[from] tickfill_warehouse::WarehouseError),

    #[error("strict mode failed: warnings={warning_count}")]
    StrictModeViolation { warning_count: usize },

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Validation(_) | Self::Command(_) => 2,
            Self::Sync(_) => 3,
            Self::Serialization(_) => 4,
            Self::StrictModeViolation { .. } => 5,
            Self::Core(_) | Self::Store(_) | Self::Warehouse(_) | Self::Io(_) => 10,
        }
    }
}
