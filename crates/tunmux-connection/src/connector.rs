//! Real connectors instantiated by the remote endpoint

use bytes::Bytes;
use tracing::trace;
use tunmux_proto::Address;

use crate::error::TunnelError;
use crate::handler::ConnectionHandler;

/// A real outbound connection standing behind one logical connection
///
/// Calls must return promptly: the remote endpoint invokes them from the task
/// that drives the whole physical connection.
pub trait Connector: Send {
    fn send(&mut self, address: Option<Address>, data: Bytes);
    fn close(&mut self);

    /// Whether each `send` must carry one whole SEND payload
    ///
    /// Stream connectors get payloads slice by slice as they arrive from the
    /// physical connection; datagram connectors get them reassembled.
    fn is_datagram(&self) -> bool {
        false
    }
}

/// Produces connectors for CONNECT frames, keyed by header tag
///
/// The connector reports back through `handler`: `received` data and `closed`
/// / `failed` are turned into SEND and CLOSE frames for the originating id.
pub trait ConnectorFactory: Send + Sync {
    fn create(
        &self,
        address: Option<Address>,
        header: &str,
        handler: Box<dyn ConnectionHandler>,
    ) -> Box<dyn Connector>;
}

/// Connector that failed before it existed
#[derive(Debug, Default)]
pub struct FailedConnector;

impl FailedConnector {
    /// Report `error` to the handler right away and return an inert connector
    pub fn fail(mut handler: Box<dyn ConnectionHandler>, error: TunnelError) -> Box<dyn Connector> {
        handler.failed(error);
        Box::new(FailedConnector)
    }
}

impl Connector for FailedConnector {
    fn send(&mut self, _address: Option<Address>, data: Bytes) {
        trace!("Discarding {} bytes sent to a failed connector", data.len());
    }

    fn close(&mut self) {}
}

/// Factory that recognises no header tag
#[derive(Debug, Default)]
pub struct RejectAll;

impl ConnectorFactory for RejectAll {
    fn create(
        &self,
        _address: Option<Address>,
        header: &str,
        handler: Box<dyn ConnectionHandler>,
    ) -> Box<dyn Connector> {
        FailedConnector::fail(
            handler,
            TunnelError::ConnectFailed(format!("Unknown header tag: {}", header)),
        )
    }
}

/// Factory backed by a closure
pub struct FnFactory<F>(F);

/// Build a [`ConnectorFactory`] from a closure
pub fn factory_fn<F>(f: F) -> FnFactory<F>
where
    F: Fn(Option<Address>, &str, Box<dyn ConnectionHandler>) -> Box<dyn Connector> + Send + Sync,
{
    FnFactory(f)
}

impl<F> ConnectorFactory for FnFactory<F>
where
    F: Fn(Option<Address>, &str, Box<dyn ConnectionHandler>) -> Box<dyn Connector> + Send + Sync,
{
    fn create(
        &self,
        address: Option<Address>,
        header: &str,
        handler: Box<dyn ConnectionHandler>,
    ) -> Box<dyn Connector> {
        (self.0)(address, header, handler)
    }
}
