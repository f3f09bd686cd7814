//! Network Error Types

use thiserror::Error;

/// Network errors
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Protocol not registered: {0}")]
    ProtocolNotRegistered(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Invalid tree: {0}")]
    InvalidTree(String),

    #[error("Invalid roster: {0}")]
    InvalidRoster(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Network closed")]
    Closed,
}

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;

impl From<serde_json::Error> for NetworkError {
    fn from(e: serde_json::Error) -> Self {
        NetworkError::Serialization(e.to_string())
    }
}
