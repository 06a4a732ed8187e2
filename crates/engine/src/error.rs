use contactsave_core::CoreError;
use contactsave_storage::{CardError, StorageError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A version or assertion precondition no longer held.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("card write failed: {0}")]
    CardWrite(#[from] CardError),

    #[error("inconsistent state: {0}")]
    InconsistentState(String),

    #[error("gave up after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("photo not saved: {0}")]
    Photo(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("save service stopped")]
    ServiceStopped,
}

impl EngineError {
    /// Maps a failed batch to the conflict/transport split the retry loop
    /// acts on.
    pub fn from_batch(err: StorageError) -> Self {
        if err.is_conflict() {
            Self::Conflict(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}
