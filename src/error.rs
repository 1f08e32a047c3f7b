//! Error types for the MoteFlat vector index

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Unsupported column type, missing dimensionality, bad option value
    #[error("Configuration error: {0}")]
    Config(String),

    /// On-disk damage (magic mismatch, bad page tag, checksum failure).
    /// Never retried.
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Caller misuse: scanning without ORDER BY, non-MVCC snapshot, ...
    #[error("Usage error: {0}")]
    Usage(String),

    /// Internal sizing invariant violated (tuple did not fit a page that had room)
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Operation interrupted")]
    Interrupted,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl StorageError {
    /// Whether this error signals on-disk damage
    pub fn is_corruption(&self) -> bool {
        matches!(self, StorageError::Corruption(_))
    }
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
