use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] relief_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Worksite not found: {0}")]
    WorksiteNotFound(i64),
    #[error("Change {0} not found or already archived")]
    ChangeNotRetryable(i64),
}
