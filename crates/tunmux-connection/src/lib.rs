//! Multiplexed tunnel endpoints
//!
//! Carries any number of logical connections over one physical transport
//! connection. The [`LocalEndpoint`] originates logical connections; the
//! [`RemoteEndpoint`] accepts them and asks a [`ConnectorFactory`] for the real
//! connector each one represents.
//!
//! Every endpoint owns its connection table, physical link and frame decoder
//! inside a single tokio task, so all table mutation, frame routing and frame
//! emission for one physical connection happen in order on one context.
//! Handler callbacks run on that context and must not block.

pub mod connector;
pub mod error;
pub mod handler;
pub mod link;
pub mod local;
mod reassembly;
pub mod remote;
pub mod table;
pub mod transport;

pub use connector::{factory_fn, Connector, ConnectorFactory, FailedConnector, FnFactory, RejectAll};
pub use error::TunnelError;
pub use handler::{channel_handler, ChannelHandler, ConnectionEvent, ConnectionHandler};
pub use link::LinkState;
pub use local::{LocalEndpoint, LogicalConnection};
pub use remote::RemoteEndpoint;
pub use table::{ConnectionIdAllocator, ConnectionTable};
pub use transport::{
    BoxedStream, PhysicalConnector, PhysicalStream, TcpPhysicalConnector, TransportError,
    TransportResult,
};
pub use tunmux_proto::{Address, ConnectionId};
