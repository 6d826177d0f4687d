//! Key management error types.

use thiserror::Error;

/// Key lifecycle, vault and cipher errors.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("key already exists: {0}")]
    AlreadyExists(String),

    /// The vault could not be reached or answered with a server error.
    #[error("vault unavailable: {0}")]
    Unavailable(String),

    #[error("vault rejected credentials: {0}")]
    Unauthorized(String),

    /// Authentication or decryption failure. Never retried.
    #[error("cryptographic failure: {0}")]
    Crypto(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl KeyError {
    /// Whether the failure is vault-transient and worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            KeyError::Unavailable(_) => true,
            KeyError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

/// Result type for key operations.
pub type KeyResult<T> = std::result::Result<T, KeyError>;
