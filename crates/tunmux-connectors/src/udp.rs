//! UDP connector

use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};
use tunmux_connection::{ConnectionHandler, Connector, ConnectorFactory, TunnelError};
use tunmux_proto::Address;

use crate::task::{connect_or_close, CommandReceiver, ConnectorCommand, Queued, TaskConnector};

const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Opens a UDP socket on an ephemeral port
///
/// With a CONNECT address the socket is connected to it and plain sends go
/// there; sends carrying an address go to that address. Every received
/// datagram is reported with its source address.
#[derive(Debug, Clone)]
pub struct UdpConnectorFactory {
    bind_addr: String,
}

impl UdpConnectorFactory {
    pub fn new() -> Self {
        Self {
            bind_addr: "0.0.0.0:0".to_string(),
        }
    }

    /// Bind sockets to `bind_addr` instead of the IPv4 wildcard
    pub fn with_bind_addr(mut self, bind_addr: impl Into<String>) -> Self {
        self.bind_addr = bind_addr.into();
        self
    }
}

impl Default for UdpConnectorFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectorFactory for UdpConnectorFactory {
    fn create(
        &self,
        address: Option<Address>,
        _header: &str,
        mut handler: Box<dyn ConnectionHandler>,
    ) -> Box<dyn Connector> {
        let bind_addr = self.bind_addr.clone();

        TaskConnector::spawn_datagram(move |mut commands| async move {
            let mut queued = Vec::new();
            let open = open_socket(&bind_addr, address.as_ref());
            match connect_or_close(open, &mut commands, &mut queued).await {
                Some(Ok(socket)) => {
                    pump_datagrams(socket, address.is_some(), queued, commands, handler).await
                }
                Some(Err(e)) => handler.failed(e),
                None => {}
            }
        })
    }
}

async fn open_socket(bind_addr: &str, target: Option<&Address>) -> Result<UdpSocket, TunnelError> {
    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| TunnelError::ConnectFailed(format!("Cannot bind UDP socket: {}", e)))?;

    if let Some(target) = target {
        socket
            .connect((target.host.as_str(), target.port))
            .await
            .map_err(|e| TunnelError::ConnectFailed(format!("{}: {}", target, e)))?;
    }

    debug!(
        "UDP socket bound to {:?}{}",
        socket.local_addr().ok(),
        target.map(|t| format!(", connected to {}", t)).unwrap_or_default()
    );
    Ok(socket)
}

async fn pump_datagrams(
    socket: UdpSocket,
    connected: bool,
    queued: Queued,
    mut commands: CommandReceiver,
    mut handler: Box<dyn ConnectionHandler>,
) {
    handler.connected();

    for (target, data) in queued {
        send_datagram(&socket, connected, target, data).await;
    }

    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, source)) => {
                    trace!("Datagram of {} bytes from {}", n, source);
                    handler.received(Some(Address::from(source)), Bytes::copy_from_slice(&buf[..n]));
                }
                Err(e) => {
                    handler.failed(e.into());
                    break;
                }
            },
            command = commands.recv() => match command {
                Some(ConnectorCommand::Send(target, data)) => {
                    send_datagram(&socket, connected, target, data).await
                }
                Some(ConnectorCommand::Close) | None => break,
            },
        }
    }
}

async fn send_datagram(socket: &UdpSocket, connected: bool, target: Option<Address>, data: Bytes) {
    match target {
        Some(target) => {
            if let Err(e) = socket.send_to(&data, (target.host.as_str(), target.port)).await {
                warn!("Cannot send datagram to {}: {}", target, e);
            }
        }
        None if !connected => {
            warn!("Dropping {} byte datagram without a destination", data.len());
        }
        None => {
            if let Err(e) = socket.send(&data).await {
                warn!("Cannot send datagram: {}", e);
            }
        }
    }
}
