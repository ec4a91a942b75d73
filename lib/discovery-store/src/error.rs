use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Unsupported store backend: {0}")]
    UnsupportedBackend(String),

    #[error("No store address configured")]
    NoAddress,

    #[error("Store connection closed")]
    Closed,

    #[error("Invalid store configuration: {0}")]
    InvalidConfiguration(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected store response ({status}): {message}")]
    UnexpectedResponse { status: u16, message: String },

    #[error("Malformed value for key {key}: {reason}")]
    MalformedValue { key: String, reason: String },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Whether the error means the listed prefix does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::KeyNotFound(_))
    }
}
