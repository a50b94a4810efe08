//! Error types for relief-core

use thiserror::Error;

use crate::sync::NetworkError;

/// Result type alias using relief-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in relief-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Network data source error
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// A long running operation observed its cancellation signal
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Whether this error must abort an entire sync pass.
    ///
    /// Only connectivity loss and expired credentials qualify. Every other
    /// failure is recorded against the entity that caused it.
    pub const fn is_pass_fatal(&self) -> bool {
        match self {
            Self::Network(error) => error.is_pass_fatal(),
            _ => false,
        }
    }
}
