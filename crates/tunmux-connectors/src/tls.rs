//! TLS connector

use rustls::pki_types::ServerName;
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio_rustls::TlsConnector;
use tracing::debug;
use tunmux_connection::{ConnectionHandler, Connector, ConnectorFactory, TunnelError};
use tunmux_proto::Address;

use crate::task::{connect_or_close, pump_stream, TaskConnector};
use crate::tcp::{connect_tcp, require_address};

static CRYPTO_PROVIDER_INIT: Once = Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        // Err means another provider is already installed
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Opens a TLS session over TCP to the CONNECT address
///
/// The server certificate is checked against the webpki roots, with the
/// address host as SNI.
#[derive(Clone)]
pub struct TlsConnectorFactory {
    connector: TlsConnector,
    connect_timeout: Duration,
}

impl std::fmt::Debug for TlsConnectorFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnectorFactory")
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl TlsConnectorFactory {
    pub fn new() -> Self {
        ensure_crypto_provider();

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Self::with_config(Arc::new(config))
    }

    /// Use a custom client configuration, e.g. with private roots
    pub fn with_config(config: Arc<rustls::ClientConfig>) -> Self {
        Self {
            connector: TlsConnector::from(config),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

impl Default for TlsConnectorFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectorFactory for TlsConnectorFactory {
    fn create(
        &self,
        address: Option<Address>,
        _header: &str,
        handler: Box<dyn ConnectionHandler>,
    ) -> Box<dyn Connector> {
        let (address, mut handler) = match require_address(address, "TLS", handler) {
            Ok(found) => found,
            Err(failed) => return failed,
        };
        let connector = self.connector.clone();
        let connect_timeout = self.connect_timeout;

        TaskConnector::spawn(move |mut commands| async move {
            let server_name = match ServerName::try_from(address.host.clone()) {
                Ok(name) => name,
                Err(e) => {
                    handler.failed(TunnelError::ConnectFailed(format!(
                        "Invalid TLS server name {}: {}",
                        address.host, e
                    )));
                    return;
                }
            };

            let mut queued = Vec::new();
            let connect = async {
                let tcp = connect_tcp(&address, connect_timeout).await?;
                connector.connect(server_name, tcp).await.map_err(|e| {
                    TunnelError::ConnectFailed(format!("TLS handshake with {} failed: {}", address, e))
                })
            };

            match connect_or_close(connect, &mut commands, &mut queued).await {
                Some(Ok(stream)) => {
                    debug!("TLS session established with {}", address);
                    pump_stream(stream, queued, commands, handler).await;
                }
                Some(Err(e)) => handler.failed(e),
                None => {}
            }
        })
    }
}
