//! Physical transport for tunnel connections

use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Timeout")]
    Timeout,

    #[error("Connection error: {0}")]
    ConnectionError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Byte stream able to carry a tunnel
pub trait PhysicalStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> PhysicalStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased physical stream
pub type BoxedStream = Box<dyn PhysicalStream>;

/// Opens physical connections for a local endpoint
///
/// Called lazily: once when the first logical connection is created, and again
/// after every loss of the physical connection.
#[async_trait]
pub trait PhysicalConnector: Send + Sync + Debug {
    async fn connect(&self) -> TransportResult<BoxedStream>;
}

/// Plain TCP physical connector
#[derive(Debug, Clone)]
pub struct TcpPhysicalConnector {
    addr: String,
    connect_timeout: Duration,
    nodelay: bool,
}

impl TcpPhysicalConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: Duration::from_secs(10),
            nodelay: true,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl PhysicalConnector for TcpPhysicalConnector {
    async fn connect(&self) -> TransportResult<BoxedStream> {
        debug!("Connecting to tunnel endpoint {}", self.addr);

        let stream = timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| TransportError::Timeout)??;
        stream.set_nodelay(self.nodelay)?;

        debug!("Connected to tunnel endpoint {}", self.addr);
        Ok(Box::new(stream))
    }
}
