//! Connectors instantiated by the remote endpoint
//!
//! Each factory turns a CONNECT frame into a real outbound connection driven by
//! its own tokio task. [`HeaderRouter`] picks the factory from the frame's
//! header tag.

pub mod router;
pub mod tcp;
pub mod tls;
pub mod udp;
pub mod websocket;

mod task;

pub use router::HeaderRouter;
pub use task::TaskConnector;
pub use tcp::TcpConnectorFactory;
pub use tls::TlsConnectorFactory;
pub use udp::UdpConnectorFactory;
pub use websocket::WebSocketConnectorFactory;
