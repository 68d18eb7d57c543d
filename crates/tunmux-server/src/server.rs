//! Tunnel server implementation
//!
//! Every accepted physical connection is one session: a remote endpoint with
//! its own connection table, driven by its own task. Sessions share the
//! connector factory.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, info_span, warn, Instrument};
use tunmux_connection::{ConnectorFactory, RemoteEndpoint};
use uuid::Uuid;

const BIND_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum TunnelServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct TunnelServerConfig {
    pub bind_addr: SocketAddr,
}

pub struct TunnelServer {
    listener: TcpListener,
    endpoint: RemoteEndpoint,
    active_sessions: Arc<AtomicUsize>,
}

impl TunnelServer {
    /// Bind the listening socket
    pub async fn bind(
        config: TunnelServerConfig,
        factory: Arc<dyn ConnectorFactory>,
    ) -> Result<Self, TunnelServerError> {
        let listener = bind_with_retry(config.bind_addr).await?;

        Ok(Self {
            listener,
            endpoint: RemoteEndpoint::new(factory),
            active_sessions: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TunnelServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Number of physical connections currently served
    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::SeqCst)
    }

    /// Accept physical connections until the task is dropped
    pub async fn run(self) -> Result<(), TunnelServerError> {
        info!("Tunnel server listening on {}", self.local_addr()?);

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => self.spawn_session(stream, peer_addr),
                Err(e) => {
                    error!("Failed to accept tunnel connection: {}", e);
                }
            }
        }
    }

    fn spawn_session(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let session_id = Uuid::new_v4();
        let _ = stream.set_nodelay(true);

        let endpoint = self.endpoint.clone();
        let active_sessions = self.active_sessions.clone();
        let span = info_span!("session", id = %session_id, peer = %peer_addr);

        tokio::spawn(
            async move {
                let active = active_sessions.fetch_add(1, Ordering::SeqCst) + 1;
                info!("Tunnel session started ({} active)", active);

                match endpoint.serve(stream).await {
                    Ok(()) => debug!("Peer closed the tunnel"),
                    Err(e) => warn!("Tunnel session ended: {}", e),
                }

                let active = active_sessions.fetch_sub(1, Ordering::SeqCst) - 1;
                info!("Tunnel session finished ({} active)", active);
            }
            .instrument(span),
        );
    }
}

async fn bind_with_retry(bind_addr: SocketAddr) -> Result<TcpListener, TunnelServerError> {
    // TIME_WAIT from a previous run can hold the port for a moment
    for attempt in 1..=BIND_ATTEMPTS {
        match TcpListener::bind(bind_addr).await {
            Ok(listener) => {
                if attempt > 1 {
                    info!(
                        "Successfully bound to {} on attempt {}/{}",
                        bind_addr, attempt, BIND_ATTEMPTS
                    );
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < BIND_ATTEMPTS => {
                warn!(
                    "Port {} is in use (attempt {}/{}), retrying in 1 second...",
                    bind_addr.port(),
                    attempt,
                    BIND_ATTEMPTS
                );
                tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
            }
            Err(e) => {
                return Err(TunnelServerError::BindError {
                    address: bind_addr.ip().to_string(),
                    port: bind_addr.port(),
                    reason: e.to_string(),
                });
            }
        }
    }

    Err(TunnelServerError::BindError {
        address: bind_addr.ip().to_string(),
        port: bind_addr.port(),
        reason: format!("Address in use after {} attempts", BIND_ATTEMPTS),
    })
}
