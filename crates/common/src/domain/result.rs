use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Record serialization error for key {0}: {1}")]
    SerializationError(String, String),

    #[error("Storage error: {0}")]
    StorageError(#[from] anyhow::Error),
}
