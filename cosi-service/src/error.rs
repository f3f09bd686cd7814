//! Service error types

use cosi_network::NetworkError;
use cosi_protocol::ProtocolError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("this conode is not in the roster")]
    NotInRoster,

    #[error("empty roster")]
    EmptyRoster,

    #[error("timed out waiting for the final signature")]
    Timeout,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl From<NetworkError> for ServiceError {
    fn from(e: NetworkError) -> Self {
        ServiceError::Protocol(ProtocolError::Network(e))
    }
}
