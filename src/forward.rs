//! Local TCP listeners forwarded through the tunnel
//!
//! Each accepted connection becomes one logical connection; bytes are pumped
//! both ways until either side closes.

use anyhow::{Context, Result};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use tunmux_connection::{channel_handler, ConnectionEvent, LocalEndpoint};
use tunmux_proto::Address;

use crate::config::ForwardKind;

const READ_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct Forward {
    pub name: String,
    pub listen: String,
    pub target: Address,
    pub kind: ForwardKind,
}

/// Accept connections on `forward.listen` until the task is dropped
pub async fn run_forward(endpoint: LocalEndpoint, forward: Forward) -> Result<()> {
    let listener = TcpListener::bind(&forward.listen)
        .await
        .with_context(|| format!("Failed to bind {} for forward '{}'", forward.listen, forward.name))?;

    info!(
        "Forwarding {} -> {} ({:?}) as '{}'",
        listener.local_addr()?,
        forward.target,
        forward.kind,
        forward.name
    );

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                debug!("[{}] Accepted connection from {}", forward.name, peer_addr);
                let endpoint = endpoint.clone();
                let forward = forward.clone();
                tokio::spawn(async move {
                    forward_connection(endpoint, stream, &forward).await;
                    debug!("[{}] Connection from {} finished", forward.name, peer_addr);
                });
            }
            Err(e) => {
                error!("[{}] Failed to accept connection: {}", forward.name, e);
            }
        }
    }
}

async fn forward_connection(endpoint: LocalEndpoint, stream: TcpStream, forward: &Forward) {
    let _ = stream.set_nodelay(true);
    let (handler, mut events) = channel_handler();
    let conn = match forward.kind {
        ForwardKind::Tcp => endpoint.tcp(forward.target.clone(), handler),
        ForwardKind::Tls => endpoint.tls(forward.target.clone(), handler),
    };

    let (mut reader, mut writer) = stream.into_split();
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    loop {
        buf.reserve(READ_BUFFER_SIZE);
        tokio::select! {
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => {
                    conn.close();
                    break;
                }
                Ok(_) => conn.send(buf.split().freeze()),
                Err(e) => {
                    debug!("[{}] Client read error: {}", forward.name, e);
                    conn.close();
                    break;
                }
            },
            event = events.recv() => match event {
                Some(ConnectionEvent::Connected) => {
                    debug!("[{}] Logical connection {} open", forward.name, conn.id());
                }
                Some(ConnectionEvent::Received { data, .. }) => {
                    if let Err(e) = writer.write_all(&data).await {
                        debug!("[{}] Client write error: {}", forward.name, e);
                        conn.close();
                        break;
                    }
                }
                Some(ConnectionEvent::Closed) | None => break,
                Some(ConnectionEvent::Failed(e)) => {
                    warn!("[{}] Logical connection {} failed: {}", forward.name, conn.id(), e);
                    break;
                }
            },
        }
    }

    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;
    use tunmux_connection::TcpPhysicalConnector;
    use tunmux_connectors::HeaderRouter;
    use tunmux_server::{TunnelServer, TunnelServerConfig};

    #[tokio::test(flavor = "multi_thread")]
    async fn test_forward_end_to_end() {
        let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = Address::from(target_listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (mut stream, _) = target_listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf.to_ascii_uppercase()).await.unwrap();
        });

        let server = TunnelServer::bind(
            TunnelServerConfig {
                bind_addr: "127.0.0.1:0".parse().unwrap(),
            },
            Arc::new(HeaderRouter::with_defaults()),
        )
        .await
        .unwrap();
        let tunnel = server.local_addr().unwrap();
        tokio::spawn(server.run());

        // Reserve a free port for the forward's listener
        let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listen = reserved.local_addr().unwrap();
        drop(reserved);

        let endpoint = LocalEndpoint::new(Arc::new(TcpPhysicalConnector::new(tunnel.to_string())));
        tokio::spawn(run_forward(
            endpoint,
            Forward {
                name: "test".to_string(),
                listen: listen.to_string(),
                target,
                kind: ForwardKind::Tcp,
            },
        ));

        let mut client = None;
        for _ in 0..50 {
            match TcpStream::connect(listen).await {
                Ok(stream) => {
                    client = Some(stream);
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        let mut client = client.expect("forward listener did not come up");

        client.write_all(b"hello").await.unwrap();
        let mut reply = [0u8; 5];
        timeout(Duration::from_secs(5), client.read_exact(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&reply, b"HELLO");
    }
}
