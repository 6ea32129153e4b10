//! Error types for container engines

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to connect to container engine: {0}")]
    ConnectionError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Network conflict: {0}")]
    NetworkConflict(String),

    #[error("Name conflict: {0}")]
    NameConflict(String),

    #[error("Container engine error: {0}")]
    RuntimeError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Timeout waiting for engine operation")]
    Timeout,

    #[error("Operation cancelled")]
    Cancelled,
}

impl From<bollard::errors::Error> for EngineError {
    fn from(e: bollard::errors::Error) -> Self {
        match e {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => EngineError::NotFound(message),
            bollard::errors::Error::DockerResponseServerError {
                status_code: 409,
                message,
            } => EngineError::NameConflict(message),
            other => EngineError::RuntimeError(other.to_string()),
        }
    }
}

impl EngineError {
    /// Whether this error means the referenced object no longer exists
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
