//! Error types for the CoSi signer primitives

use thiserror::Error;

/// Signer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignerError {
    #[error("Invalid mask: {0}")]
    InvalidMask(String),

    #[error("Index {index} out of range for {len} participants")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    #[error("the policy is not fulfilled")]
    PolicyNotFulfilled,

    #[error("Empty input: {0}")]
    EmptyInput(String),

    #[error("Crypto error: {0}")]
    Crypto(String),
}

/// Result type for signer operations
pub type SignerResult<T> = Result<T, SignerError>;
