use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("assertion failed at op {index}: {reason}")]
    AssertionFailed { index: usize, reason: String },

    #[error("op {index} references op {reference}, which inserted nothing")]
    BackReference { index: usize, reference: usize },

    #[error("unknown column {column} for {table}")]
    UnknownColumn { table: &'static str, column: String },

    #[error("invalid operation at op {index}: {reason}")]
    InvalidOperation { index: usize, reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("core error: {0}")]
    Core(#[from] contactsave_core::CoreError),
}

impl StorageError {
    /// Precondition failures: the batch was well formed but the store
    /// state no longer matches what it expected.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::AssertionFailed { .. })
    }
}
