//! Tunnel server
//!
//! Listens for physical TCP connections from local endpoints and serves each
//! one with its own remote endpoint.

pub mod server;

pub use server::{TunnelServer, TunnelServerConfig, TunnelServerError};
