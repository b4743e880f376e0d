//! Typed errors and their stable machine codes.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("slug not found")]
    SlugNotFound,
    #[error("schema not found")]
    SchemaNotFound,
    #[error("missing reference: {kind} '{id}'")]
    MissingReference { kind: &'static str, id: String },
    #[error("validation: {0}")]
    Validation(String),
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Blocking lifecycle script failure; the message is shown to the user as-is.
    #[error("{0}")]
    Script(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Code the surrounding request layer maps to a response status.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Config(_) => "config_error",
            AppError::NotFound(_) => "not_found",
            AppError::Validation(_) => "validation_error",
            AppError::Conflict(_) => "conflict",
            AppError::BadRequest(_) => "bad_request",
            AppError::Script(_) => "script_error",
            AppError::Timeout(_) => "timeout",
            AppError::Db(sqlx::Error::RowNotFound) => "not_found",
            AppError::Db(_) => "database_error",
            AppError::Serialization(_) => "internal_error",
        }
    }
}
