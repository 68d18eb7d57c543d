//! Plain TCP connector

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;
use tunmux_connection::{
    ConnectionHandler, Connector, ConnectorFactory, FailedConnector, TunnelError,
};
use tunmux_proto::Address;

use crate::task::{connect_or_close, pump_stream, TaskConnector};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens a TCP stream to the CONNECT address
#[derive(Debug, Clone)]
pub struct TcpConnectorFactory {
    connect_timeout: Duration,
}

impl TcpConnectorFactory {
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

impl Default for TcpConnectorFactory {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve and connect, bounded by `connect_timeout`
pub(crate) async fn connect_tcp(
    address: &Address,
    connect_timeout: Duration,
) -> Result<TcpStream, TunnelError> {
    debug!("Connecting to target {}", address);

    let stream = timeout(
        connect_timeout,
        TcpStream::connect((address.host.as_str(), address.port)),
    )
    .await
    .map_err(|_| TunnelError::ConnectFailed(format!("Timed out connecting to {}", address)))?
    .map_err(|e| TunnelError::ConnectFailed(format!("{}: {}", address, e)))?;

    let _ = stream.set_nodelay(true);
    Ok(stream)
}

pub(crate) fn require_address(
    address: Option<Address>,
    kind: &str,
    handler: Box<dyn ConnectionHandler>,
) -> Result<(Address, Box<dyn ConnectionHandler>), Box<dyn Connector>> {
    match address {
        Some(address) => Ok((address, handler)),
        None => Err(FailedConnector::fail(
            handler,
            TunnelError::ConnectFailed(format!("{} connection needs a target address", kind)),
        )),
    }
}

impl ConnectorFactory for TcpConnectorFactory {
    fn create(
        &self,
        address: Option<Address>,
        _header: &str,
        handler: Box<dyn ConnectionHandler>,
    ) -> Box<dyn Connector> {
        let (address, mut handler) = match require_address(address, "TCP", handler) {
            Ok(found) => found,
            Err(failed) => return failed,
        };
        let connect_timeout = self.connect_timeout;

        TaskConnector::spawn(move |mut commands| async move {
            let mut queued = Vec::new();
            let connect = connect_tcp(&address, connect_timeout);
            match connect_or_close(connect, &mut commands, &mut queued).await {
                Some(Ok(stream)) => pump_stream(stream, queued, commands, handler).await,
                Some(Err(e)) => handler.failed(e),
                None => {}
            }
        })
    }
}
