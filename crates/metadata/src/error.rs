//! Metadata store error types.

use thiserror::Error;

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A conditional update matched no row because the row changed underneath.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MetadataError {
    /// Whether the operation may succeed if attempted again.
    ///
    /// Pool exhaustion, I/O failures and SQLite lock contention are transient.
    /// Constraint violations and decode failures are not.
    pub fn is_transient(&self) -> bool {
        match self {
            MetadataError::Database(err) => match err {
                sqlx::Error::Io(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed => true,
                sqlx::Error::Database(db_err) => {
                    let msg = db_err.message();
                    msg.contains("database is locked")
                        || msg.contains("could not serialize")
                        || msg.contains("deadlock detected")
                }
                _ => false,
            },
            _ => false,
        }
    }
}

impl From<std::io::Error> for MetadataError {
    fn from(err: std::io::Error) -> Self {
        MetadataError::Database(sqlx::Error::Io(err))
    }
}

impl From<murmur_core::Error> for MetadataError {
    fn from(err: murmur_core::Error) -> Self {
        MetadataError::Internal(format!("invalid stored value: {err}"))
    }
}

/// Map insert failures on unique keys to `AlreadyExists` and on missing
/// parents to `NotFound`.
pub(crate) fn map_constraint(err: sqlx::Error, what: impl FnOnce() -> String) -> MetadataError {
    if let sqlx::Error::Database(ref db_err) = err {
        if db_err.is_unique_violation() {
            return MetadataError::AlreadyExists(what());
        }
        if db_err.is_foreign_key_violation() {
            return MetadataError::NotFound(format!("parent row missing for {}", what()));
        }
    }
    MetadataError::Database(err)
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;
