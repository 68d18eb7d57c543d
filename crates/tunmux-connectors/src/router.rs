//! Header tag dispatch

use std::sync::Arc;
use tracing::warn;
use tunmux_connection::{
    ConnectionHandler, Connector, ConnectorFactory, FailedConnector, TunnelError,
};
use tunmux_proto::{tags, Address};

use crate::{TcpConnectorFactory, TlsConnectorFactory, UdpConnectorFactory, WebSocketConnectorFactory};

/// Routes CONNECT frames to factories by header tag prefix
///
/// Routes are tried in registration order and the first matching prefix wins.
/// A tag no route matches gets a connector that fails immediately.
#[derive(Clone, Default)]
pub struct HeaderRouter {
    routes: Vec<(String, Arc<dyn ConnectorFactory>)>,
}

impl std::fmt::Debug for HeaderRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.routes.iter().map(|(prefix, _)| prefix))
            .finish()
    }
}

impl HeaderRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Router for the `tcp`, `udp`, `tls` and `ws` tags
    pub fn with_defaults() -> Self {
        Self::new()
            .route(tags::TCP, TcpConnectorFactory::new())
            .route(tags::UDP, UdpConnectorFactory::new())
            .route(tags::TLS, TlsConnectorFactory::new())
            .route(tags::WEBSOCKET, WebSocketConnectorFactory::new())
    }

    pub fn route<F>(self, prefix: impl Into<String>, factory: F) -> Self
    where
        F: ConnectorFactory + 'static,
    {
        self.route_arc(prefix, Arc::new(factory))
    }

    pub fn route_arc(mut self, prefix: impl Into<String>, factory: Arc<dyn ConnectorFactory>) -> Self {
        self.routes.push((prefix.into(), factory));
        self
    }

    fn lookup(&self, header: &str) -> Option<&Arc<dyn ConnectorFactory>> {
        self.routes
            .iter()
            .find(|(prefix, _)| header.starts_with(prefix.as_str()))
            .map(|(_, factory)| factory)
    }
}

impl ConnectorFactory for HeaderRouter {
    fn create(
        &self,
        address: Option<Address>,
        header: &str,
        handler: Box<dyn ConnectionHandler>,
    ) -> Box<dyn Connector> {
        match self.lookup(header) {
            Some(factory) => factory.create(address, header, handler),
            None => {
                warn!("No connector for header tag {:?}", header);
                FailedConnector::fail(
                    handler,
                    TunnelError::ConnectFailed(format!("Unknown header tag: {}", header)),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tunmux_connection::{channel_handler, factory_fn, ConnectionEvent};

    /// Factory that answers with its own name
    fn named(name: &'static str) -> impl ConnectorFactory {
        factory_fn(move |_address, _header, mut handler| {
            handler.received(None, Bytes::from(name));
            FailedConnector::fail(handler, TunnelError::EndpointClosed)
        })
    }

    fn first_event(router: &HeaderRouter, header: &str) -> ConnectionEvent {
        let (handler, mut events) = channel_handler();
        router.create(None, header, Box::new(handler));
        events.try_recv().unwrap()
    }

    #[test]
    fn test_first_matching_prefix_wins() {
        let router = HeaderRouter::new()
            .route("ws", named("websocket"))
            .route("ws/admin", named("admin"));

        assert_eq!(
            first_event(&router, "ws/admin"),
            ConnectionEvent::Received {
                address: None,
                data: Bytes::from("websocket")
            }
        );
    }

    #[test]
    fn test_unknown_tag_fails() {
        let router = HeaderRouter::new().route("tcp", named("tcp"));

        match first_event(&router, "raw") {
            ConnectionEvent::Failed(TunnelError::ConnectFailed(reason)) => {
                assert!(reason.contains("raw"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_defaults_registered() {
        let router = HeaderRouter::with_defaults();
        assert_eq!(format!("{:?}", router), r#"["tcp", "udp", "tls", "ws"]"#);
    }
}
