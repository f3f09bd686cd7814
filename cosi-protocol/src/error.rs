//! Error types for the collective signing protocol

use cosi_network::NetworkError;
use cosi_signer::SignerError;
use thiserror::Error;

/// Protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Rejected configuration, returned synchronously by setters and `start`
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid subtree: {0}")]
    InvalidSubtree(String),

    #[error("failed with every subleader")]
    SubleadersExhausted,

    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    #[error("threshold unreachable: {refusals} refusals, need {threshold} of {total}")]
    ThresholdUnreachable {
        refusals: usize,
        threshold: usize,
        total: usize,
    },

    #[error("Not enough signatures: got {got}, need {need}")]
    InsufficientSignatures { got: usize, need: usize },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("protocol already started")]
    AlreadyStarted,

    #[error("protocol finished prematurely")]
    Finished,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Signer error: {0}")]
    Signer(#[from] SignerError),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

impl From<ProtocolError> for NetworkError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Network(inner) => inner,
            other => NetworkError::ProtocolError(other.to_string()),
        }
    }
}
