use std::io;

use thiserror::Error;
use wildwatch_core::config::ConfigError;
use wildwatch_core::kobo::GatewayError;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] wildwatch_core::Error),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Form uid cannot be empty")]
    EmptyFormId,
    #[error("Form {0} is not known to Kobo")]
    FormNotFound(String),
    #[error("{0}")]
    InvalidStatus(String),
    #[error("Sync for form {0} finished with status {1}")]
    SyncIncomplete(String, String),
}
