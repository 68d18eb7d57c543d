//! In-memory tunnel harness shared by the endpoint tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tunmux_connection::{
    factory_fn, Address, BoxedStream, ConnectionEvent, ConnectionHandler, Connector,
    ConnectorFactory, FailedConnector, PhysicalConnector, RemoteEndpoint, TransportError,
    TransportResult, TunnelError,
};

pub const ECHO: &str = "echo";
pub const MIRROR: &str = "mirror";

const DUPLEX_CAPACITY: usize = 64 * 1024;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Connector answering every send with `ECHO ` and the same bytes
///
/// The prefix tells a reply apart from a payload that was bounced back
/// unprocessed. Without a prefix it mirrors sends byte for byte.
pub struct EchoConnector {
    handler: Box<dyn ConnectionHandler>,
    prefix: &'static [u8],
}

impl Connector for EchoConnector {
    fn send(&mut self, address: Option<Address>, data: Bytes) {
        let mut reply = BytesMut::with_capacity(self.prefix.len() + data.len());
        reply.extend_from_slice(self.prefix);
        reply.extend_from_slice(&data);
        self.handler.received(address, reply.freeze());
    }

    fn close(&mut self) {}
}

/// Factory serving the `echo` and `mirror` tags and failing everything else
pub fn echo_factory() -> Arc<dyn ConnectorFactory> {
    Arc::new(factory_fn(|_address, header, mut handler| {
        let prefix: &'static [u8] = match header {
            ECHO => b"ECHO ",
            MIRROR => b"",
            _ => {
                return FailedConnector::fail(
                    handler,
                    TunnelError::ConnectFailed(format!("Unknown header tag: {}", header)),
                )
            }
        };
        handler.connected();
        Box::new(EchoConnector { handler, prefix }) as Box<dyn Connector>
    }))
}

/// Physical connector wiring each connection to an in-process remote endpoint
#[derive(Debug)]
pub struct MemoryConnector {
    remote: RemoteEndpoint,
    attempts: AtomicUsize,
    sessions: Mutex<Vec<JoinHandle<Result<(), TunnelError>>>>,
}

impl MemoryConnector {
    pub fn new(factory: Arc<dyn ConnectorFactory>) -> Arc<Self> {
        Arc::new(Self {
            remote: RemoteEndpoint::new(factory),
            attempts: AtomicUsize::new(0),
            sessions: Mutex::new(Vec::new()),
        })
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Kill every remote session, as if the remote host went away
    pub fn kill(&self) {
        for session in self.sessions.lock().unwrap().drain(..) {
            session.abort();
        }
    }
}

#[async_trait]
impl PhysicalConnector for MemoryConnector {
    async fn connect(&self) -> TransportResult<BoxedStream> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let (local, remote) = tokio::io::duplex(DUPLEX_CAPACITY);
        let endpoint = self.remote.clone();
        let session = tokio::spawn(async move { endpoint.serve(remote).await });
        self.sessions.lock().unwrap().push(session);

        Ok(Box::new(local))
    }
}

/// Physical connector that can never connect
#[derive(Debug)]
pub struct RefusingConnector;

#[async_trait]
impl PhysicalConnector for RefusingConnector {
    async fn connect(&self) -> TransportResult<BoxedStream> {
        Err(TransportError::ConnectionError("refused".to_string()))
    }
}

/// Physical connector handing out one pre-built stream
///
/// The test drives the other end of the stream by hand.
#[derive(Debug)]
pub struct ScriptedConnector {
    stream: Mutex<Option<DuplexStream>>,
}

impl ScriptedConnector {
    pub fn pair() -> (Arc<Self>, DuplexStream) {
        let (local, peer) = tokio::io::duplex(DUPLEX_CAPACITY);
        let connector = Arc::new(Self {
            stream: Mutex::new(Some(local)),
        });
        (connector, peer)
    }
}

#[async_trait]
impl PhysicalConnector for ScriptedConnector {
    async fn connect(&self) -> TransportResult<BoxedStream> {
        match self.stream.lock().unwrap().take() {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(TransportError::ConnectionClosed),
        }
    }
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for connection event")
        .expect("handler dropped before the expected event")
}

/// Wait until the endpoint drops the handler feeding `rx`
pub async fn handler_released(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) {
    let next = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for the handler to be dropped");
    assert!(next.is_none(), "unexpected event: {:?}", next);
}
