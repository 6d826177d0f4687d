//! Service error types.

use murmur_keys::KeyError;
use murmur_metadata::MetadataError;
use murmur_storage::StorageError;
use std::io;

/// Errors surfaced by the content store, job ledger and key sharing.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not authorized: {0}")]
    Authorization(String),

    #[error("storage error: {0}")]
    Storage(#[source] StorageError),

    /// Stored bytes or their recorded digest do not check out. Treated as
    /// corruption and never retried.
    #[error("hash verification failed: {0}")]
    HashVerification(String),

    #[error("key management error: {0}")]
    KeyManagement(#[source] KeyError),

    #[error("database error: {0}")]
    Database(#[source] MetadataError),

    /// The request is valid but the current state forbids it, e.g. retrying
    /// a job that is not failed.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl ServiceError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::Authorization(_) => "authorization_error",
            Self::Storage(_) => "storage_error",
            Self::HashVerification(_) => "hash_verification_error",
            Self::KeyManagement(_) => "key_management_error",
            Self::Database(_) => "database_error",
            Self::Conflict(_) => "conflict",
        }
    }

    /// Whether the same call may succeed later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_transient(),
            Self::KeyManagement(e) => e.is_retryable(),
            Self::Database(e) => e.is_transient(),
            Self::Validation(_)
            | Self::NotFound(_)
            | Self::Authorization(_)
            | Self::HashVerification(_)
            | Self::Conflict(_) => false,
        }
    }
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(key) => Self::NotFound(format!("blob {key}")),
            StorageError::InvalidKey(msg) | StorageError::InvalidAttributes(msg) => {
                Self::Validation(msg)
            }
            other => Self::Storage(other),
        }
    }
}

impl From<MetadataError> for ServiceError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::NotFound(what) => Self::NotFound(what),
            MetadataError::AlreadyExists(what) => Self::Conflict(format!("{what} already exists")),
            MetadataError::Conflict(msg) => Self::Conflict(msg),
            MetadataError::InvalidStateTransition { from, to } => {
                Self::Conflict(format!("cannot move from {from} to {to}"))
            }
            other => Self::Database(other),
        }
    }
}

impl From<KeyError> for ServiceError {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::NotFound(name) => Self::NotFound(format!("key {name}")),
            KeyError::Unauthorized(msg) => Self::Authorization(msg),
            // Authentication failure while opening sealed bytes.
            KeyError::Crypto(msg) => Self::HashVerification(msg),
            other => Self::KeyManagement(other),
        }
    }
}

impl From<murmur_core::Error> for ServiceError {
    fn from(err: murmur_core::Error) -> Self {
        Self::Validation(err.to_string())
    }
}

/// Pipeline stages built on `tokio::io` carry service errors inside
/// `io::Error`; this unwraps them again.
impl From<io::Error> for ServiceError {
    fn from(err: io::Error) -> Self {
        if err.get_ref().is_some_and(|inner| inner.is::<ServiceError>()) {
            if let Some(inner) = err.into_inner()
                && let Ok(service) = inner.downcast::<ServiceError>()
            {
                return *service;
            }
            return Self::Storage(StorageError::Io(io::Error::other("lost pipeline error")));
        }
        Self::Storage(StorageError::Io(err))
    }
}

impl From<ServiceError> for io::Error {
    fn from(err: ServiceError) -> Self {
        io::Error::other(err)
    }
}

/// Result type for service operations.
pub type ServiceResult<T> = std::result::Result<T, ServiceError>;
