use thiserror::Error;

/// Main error type for grid operations
#[derive(Debug, Error)]
pub enum GridError {
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<bincode::Error> for GridError {
    fn from(e: bincode::Error) -> Self {
        GridError::SerializationError(e.to_string())
    }
}

/// Result type alias for grid operations
pub type Result<T> = std::result::Result<T, GridError>;
