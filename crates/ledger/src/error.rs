//! Error types for the ledger

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("substrate error: {0}")]
    Substrate(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<sled::Error> for LedgerError {
    fn from(err: sled::Error) -> Self {
        Self::Substrate(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
