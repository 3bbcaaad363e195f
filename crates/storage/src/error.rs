//! Error types for the storage adapter

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("entry not found: {0}")]
    NotFound(String),

    #[error("entry already exists: {0}")]
    AlreadyExists(String),

    #[error("path escapes the drive root: {0}")]
    PathEscape(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Maps an io error for `path` onto the adapter's failure model.
    pub(crate) fn from_io(err: std::io::Error, path: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(path.to_string()),
            std::io::ErrorKind::AlreadyExists => Self::AlreadyExists(path.to_string()),
            _ => Self::Io(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
