//! Error types for wildwatch-core

use std::collections::BTreeMap;

use thiserror::Error;

use crate::kobo::GatewayError;

/// Result type alias using wildwatch-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Per-field validation messages, keyed by question name
pub type FieldErrors = BTreeMap<String, Vec<String>>;

/// Errors that can occur in wildwatch-core operations
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

    /// Submission payload failed validation against its form
    #[error("Submission validation failed for {} field(s)", .0.len())]
    Validation(FieldErrors),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Remote form service error
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Another reconciliation run holds the form lock
    #[error("Sync already in progress for form {0}")]
    SyncInProgress(String),

    /// Run aborted between batches
    #[error("Sync cancelled for form {0}")]
    Cancelled(String),
}

impl Error {
    /// Whether retrying the same operation later may succeed.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Gateway(error) => error.is_retryable(),
            Self::SyncInProgress(_) | Self::Database(_) | Self::LibSql(_) | Self::Io(_) => true,
            _ => false,
        }
    }
}
