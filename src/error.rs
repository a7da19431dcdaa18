use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A group definition or request parameter failed validation.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("{entity} with id {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("storage failure: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration failure: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A persisted definition no longer decodes into a usable filter rule.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// A background task panicked or was cancelled.
    #[error("task failed: {0}")]
    Task(String),
}

/// Coarse error classification reported across the service boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidParameter,
    NotFound,
    StorageFailure,
    ConfigurationError,
    Timeout,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidParameter(_) => ErrorKind::InvalidParameter,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Storage(_) | Error::Migration(_) => ErrorKind::StorageFailure,
            Error::Configuration(_) => ErrorKind::ConfigurationError,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Task(_) => ErrorKind::Internal,
        }
    }

    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        Error::NotFound { entity, id }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::InvalidParameter => "invalid_parameter",
            ErrorKind::NotFound => "not_found",
            ErrorKind::StorageFailure => "storage_failure",
            ErrorKind::ConfigurationError => "configuration_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        };
        f.write_str(label)
    }
}
