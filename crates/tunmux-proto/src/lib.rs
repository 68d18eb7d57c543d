//! Tunnel Multiplexing Protocol
//!
//! This crate defines the wire format used to carry many logical connections
//! over one physical transport connection: the frame codec, the resumable
//! frame decoder that copes with arbitrary chunk boundaries, target addresses
//! and the header tags understood by the remote side.

pub mod address;
pub mod decoder;
pub mod frame;
pub mod tags;

pub use address::{Address, AddressParseError};
pub use decoder::{FrameDecoder, FrameEvent, FrameSink};
pub use frame::{Command, ConnectionId, Frame, ProtocolError};

/// Size of the fixed frame prefix: command byte + connection id
pub const FRAME_PREFIX_SIZE: usize = 1 + INT_SIZE;

/// Width of every integer field on the wire
pub const INT_SIZE: usize = 4;
