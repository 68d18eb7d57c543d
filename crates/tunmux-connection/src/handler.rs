//! Callback interface of a logical connection

use bytes::Bytes;
use tokio::sync::mpsc;
use tunmux_proto::Address;

use crate::error::TunnelError;

/// Receives the lifecycle of one logical connection
///
/// On the local side the endpoint invokes these from its own task, in wire
/// order. A logical connection sees at most one of `closed` / `failed`, and
/// nothing after it.
pub trait ConnectionHandler: Send {
    /// The connection is usable
    fn connected(&mut self) {}

    /// Data arrived, with its source address for datagram connections
    fn received(&mut self, address: Option<Address>, data: Bytes) {
        let _ = (address, data);
    }

    /// The far side closed the connection
    fn closed(&mut self) {}

    /// The connection failed
    fn failed(&mut self, error: TunnelError) {
        let _ = error;
    }
}

impl<H: ConnectionHandler + ?Sized> ConnectionHandler for Box<H> {
    fn connected(&mut self) {
        (**self).connected()
    }

    fn received(&mut self, address: Option<Address>, data: Bytes) {
        (**self).received(address, data)
    }

    fn closed(&mut self) {
        (**self).closed()
    }

    fn failed(&mut self, error: TunnelError) {
        (**self).failed(error)
    }
}

/// Handler callbacks as values
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Received {
        address: Option<Address>,
        data: Bytes,
    },
    Closed,
    Failed(TunnelError),
}

/// Handler forwarding every callback into a channel
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

/// Create a handler whose events can be awaited from async code
pub fn channel_handler() -> (ChannelHandler, mpsc::UnboundedReceiver<ConnectionEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelHandler { tx }, rx)
}

impl ConnectionHandler for ChannelHandler {
    fn connected(&mut self) {
        let _ = self.tx.send(ConnectionEvent::Connected);
    }

    fn received(&mut self, address: Option<Address>, data: Bytes) {
        let _ = self.tx.send(ConnectionEvent::Received { address, data });
    }

    fn closed(&mut self) {
        let _ = self.tx.send(ConnectionEvent::Closed);
    }

    fn failed(&mut self, error: TunnelError) {
        let _ = self.tx.send(ConnectionEvent::Failed(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_handler_forwards_in_order() {
        let (mut handler, mut rx) = channel_handler();

        handler.connected();
        handler.received(None, Bytes::from("hi"));
        handler.closed();

        assert_eq!(rx.try_recv().unwrap(), ConnectionEvent::Connected);
        assert_eq!(
            rx.try_recv().unwrap(),
            ConnectionEvent::Received {
                address: None,
                data: Bytes::from("hi")
            }
        );
        assert_eq!(rx.try_recv().unwrap(), ConnectionEvent::Closed);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_boxed_handler_delegates() {
        let (handler, mut rx) = channel_handler();
        let mut boxed: Box<dyn ConnectionHandler> = Box::new(handler);

        boxed.failed(TunnelError::EndpointClosed);
        assert_eq!(
            rx.try_recv().unwrap(),
            ConnectionEvent::Failed(TunnelError::EndpointClosed)
        );
    }
}
