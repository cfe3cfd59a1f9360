use thiserror::Error;

/// Top-level error type for the Dealchat system.
///
/// Subsystem crates define their own error types and convert into this one
/// where a failure crosses a crate boundary (storage, configuration, I/O).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DealchatError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Conversation not found: {0}")]
    ConversationNotFound(uuid::Uuid),
}

impl From<toml::de::Error> for DealchatError {
    fn from(err: toml::de::Error) -> Self {
        DealchatError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for DealchatError {
    fn from(err: toml::ser::Error) -> Self {
        DealchatError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for DealchatError {
    fn from(err: serde_json::Error) -> Self {
        DealchatError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Dealchat operations.
pub type Result<T> = std::result::Result<T, DealchatError>;
