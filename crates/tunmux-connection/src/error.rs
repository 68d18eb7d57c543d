//! Errors reported to logical connections

use thiserror::Error;
use tunmux_proto::{ConnectionId, ProtocolError};

use crate::transport::TransportError;

/// Failure delivered to a logical connection's `failed` callback
///
/// `Clone` because a single physical loss is reported to every open logical
/// connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TunnelError {
    #[error("Connection to tunnel lost: {0}")]
    TunnelLost(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Connection id {0} is still in use")]
    IdInUse(ConnectionId),

    #[error("Endpoint closed")]
    EndpointClosed,
}

impl From<TransportError> for TunnelError {
    fn from(e: TransportError) -> Self {
        TunnelError::TunnelLost(e.to_string())
    }
}

impl From<std::io::Error> for TunnelError {
    fn from(e: std::io::Error) -> Self {
        TunnelError::Io(e.to_string())
    }
}
