//! Frame codec for the tunnel protocol
//!
//! Every frame starts with a command byte and a big-endian int32 connection id.
//! The remaining fields depend on the command:
//!
//! | Command                 | Byte | Fields after id                                   |
//! |-------------------------|------|---------------------------------------------------|
//! | SEND_WITH_ADDRESS       | 0    | hostLen, host, port, payloadLen, payload          |
//! | SEND_WITHOUT_ADDRESS    | 1    | payloadLen, payload                               |
//! | CLOSE                   | 2    |                                                   |
//! | CONNECT_WITH_ADDRESS    | 3    | hostLen, host, port, headerLen, header            |
//! | CONNECT_WITHOUT_ADDRESS | 4    | headerLen, header                                 |
//!
//! All lengths and the port are int32. Strings are UTF-8.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::address::Address;
use crate::{FRAME_PREFIX_SIZE, INT_SIZE};

/// Logical connection identifier
pub type ConnectionId = u32;

/// Wire command byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    SendWithAddress = 0,
    SendWithoutAddress = 1,
    Close = 2,
    ConnectWithAddress = 3,
    ConnectWithoutAddress = 4,
}

impl Command {
    /// Whether a host and port follow the connection id
    pub fn has_address(self) -> bool {
        matches!(self, Command::SendWithAddress | Command::ConnectWithAddress)
    }
}

impl TryFrom<u8> for Command {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Command::SendWithAddress),
            1 => Ok(Command::SendWithoutAddress),
            2 => Ok(Command::Close),
            3 => Ok(Command::ConnectWithAddress),
            4 => Ok(Command::ConnectWithoutAddress),
            _ => Err(ProtocolError::UnknownCommand(value)),
        }
    }
}

/// Protocol errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Unknown command byte: {0}")]
    UnknownCommand(u8),

    #[error("Negative {field} length: {value}")]
    NegativeLength { field: &'static str, value: i32 },

    #[error("Invalid port: {0}")]
    InvalidPort(i32),

    #[error("Invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("{field} too large: {len} bytes")]
    FieldTooLarge { field: &'static str, len: usize },

    #[error("Incomplete frame")]
    IncompleteFrame,
}

/// One protocol message on the tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Open a logical connection; the header tag selects the remote connector
    Connect {
        id: ConnectionId,
        address: Option<Address>,
        header: String,
    },
    /// Payload for a logical connection, optionally addressed (datagrams)
    Send {
        id: ConnectionId,
        address: Option<Address>,
        payload: Bytes,
    },
    /// Close a logical connection
    Close { id: ConnectionId },
}

impl Frame {
    pub fn connect(id: ConnectionId, address: Option<Address>, header: impl Into<String>) -> Self {
        Frame::Connect {
            id,
            address,
            header: header.into(),
        }
    }

    pub fn send(id: ConnectionId, address: Option<Address>, payload: Bytes) -> Self {
        Frame::Send {
            id,
            address,
            payload,
        }
    }

    pub fn close(id: ConnectionId) -> Self {
        Frame::Close { id }
    }

    pub fn id(&self) -> ConnectionId {
        match self {
            Frame::Connect { id, .. } | Frame::Send { id, .. } | Frame::Close { id } => *id,
        }
    }

    pub fn command(&self) -> Command {
        match self {
            Frame::Connect { address: Some(_), .. } => Command::ConnectWithAddress,
            Frame::Connect { address: None, .. } => Command::ConnectWithoutAddress,
            Frame::Send { address: Some(_), .. } => Command::SendWithAddress,
            Frame::Send { address: None, .. } => Command::SendWithoutAddress,
            Frame::Close { .. } => Command::Close,
        }
    }

    /// Number of bytes this frame occupies on the wire
    pub fn encoded_len(&self) -> usize {
        let address_len = |address: &Option<Address>| {
            address
                .as_ref()
                .map(|a| INT_SIZE + a.host.len() + INT_SIZE)
                .unwrap_or(0)
        };

        FRAME_PREFIX_SIZE
            + match self {
                Frame::Connect {
                    address, header, ..
                } => address_len(address) + INT_SIZE + header.len(),
                Frame::Send {
                    address, payload, ..
                } => address_len(address) + INT_SIZE + payload.len(),
                Frame::Close { .. } => 0,
            }
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Append the encoded frame to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.reserve(self.encoded_len());
        buf.put_u8(self.command() as u8);
        buf.put_u32(self.id());

        match self {
            Frame::Connect {
                address, header, ..
            } => {
                if let Some(address) = address {
                    put_address(buf, address)?;
                }
                put_field(buf, "header", header.as_bytes())?;
            }
            Frame::Send {
                address, payload, ..
            } => {
                if let Some(address) = address {
                    put_address(buf, address)?;
                }
                put_field(buf, "payload", payload)?;
            }
            Frame::Close { .. } => {}
        }

        Ok(())
    }

    /// Decode one complete frame from the front of `buf`
    ///
    /// `buf` is only advanced when a whole frame was decoded. Use
    /// [`FrameDecoder`](crate::FrameDecoder) for streams with arbitrary chunk
    /// boundaries.
    pub fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        let mut cursor = buf.clone();

        let command = Command::try_from(get_u8(&mut cursor)?)?;
        let id = get_i32(&mut cursor)? as u32;

        let address = if command.has_address() {
            let host = get_string(&mut cursor, "host")?;
            let port = checked_port(get_i32(&mut cursor)?)?;
            Some(Address::new(host, port))
        } else {
            None
        };

        let frame = match command {
            Command::ConnectWithAddress | Command::ConnectWithoutAddress => Frame::Connect {
                id,
                address,
                header: get_string(&mut cursor, "header")?,
            },
            Command::SendWithAddress | Command::SendWithoutAddress => {
                let len = checked_len("payload", get_i32(&mut cursor)?)?;
                if cursor.remaining() < len {
                    return Err(ProtocolError::IncompleteFrame);
                }
                Frame::Send {
                    id,
                    address,
                    payload: cursor.split_to(len),
                }
            }
            Command::Close => Frame::Close { id },
        };

        *buf = cursor;
        Ok(frame)
    }
}

/// Validate a declared int32 length
pub(crate) fn checked_len(field: &'static str, value: i32) -> Result<usize, ProtocolError> {
    if value < 0 {
        return Err(ProtocolError::NegativeLength { field, value });
    }
    Ok(value as usize)
}

/// Validate an int32 port
pub(crate) fn checked_port(value: i32) -> Result<u16, ProtocolError> {
    u16::try_from(value).map_err(|_| ProtocolError::InvalidPort(value))
}

fn put_address(buf: &mut BytesMut, address: &Address) -> Result<(), ProtocolError> {
    put_field(buf, "host", address.host.as_bytes())?;
    buf.put_i32(i32::from(address.port));
    Ok(())
}

fn put_field(buf: &mut BytesMut, field: &'static str, data: &[u8]) -> Result<(), ProtocolError> {
    let len = i32::try_from(data.len()).map_err(|_| ProtocolError::FieldTooLarge {
        field,
        len: data.len(),
    })?;
    buf.put_i32(len);
    buf.put_slice(data);
    Ok(())
}

fn get_u8(buf: &mut Bytes) -> Result<u8, ProtocolError> {
    if buf.remaining() < 1 {
        return Err(ProtocolError::IncompleteFrame);
    }
    Ok(buf.get_u8())
}

fn get_i32(buf: &mut Bytes) -> Result<i32, ProtocolError> {
    if buf.remaining() < INT_SIZE {
        return Err(ProtocolError::IncompleteFrame);
    }
    Ok(buf.get_i32())
}

fn get_string(buf: &mut Bytes, field: &'static str) -> Result<String, ProtocolError> {
    let len = checked_len(field, get_i32(buf)?)?;
    if buf.remaining() < len {
        return Err(ProtocolError::IncompleteFrame);
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8(field))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_kinds() -> Vec<Frame> {
        vec![
            Frame::connect(7, None, "echo"),
            Frame::connect(8, Some(Address::new("example.com", 443)), "tls"),
            Frame::send(9, None, Bytes::from("hello world")),
            Frame::send(10, Some(Address::new("10.0.0.1", 161)), Bytes::from_static(&[0, 1, 2])),
            Frame::close(11),
        ]
    }

    #[test]
    fn test_frame_encode_decode() {
        for frame in all_kinds() {
            let mut encoded = frame.encode().unwrap();
            assert_eq!(encoded.len(), frame.encoded_len());

            let decoded = Frame::decode(&mut encoded).unwrap();
            assert_eq!(decoded, frame);
            assert!(encoded.is_empty());
        }
    }

    #[test]
    fn test_wire_layout_send_with_address() {
        let frame = Frame::send(0x01020304, Some(Address::new("ab", 80)), Bytes::from("xyz"));
        let encoded = frame.encode().unwrap();

        let expected: Vec<u8> = vec![
            0, // command
            1, 2, 3, 4, // id
            0, 0, 0, 2, b'a', b'b', // host
            0, 0, 0, 80, // port
            0, 0, 0, 3, b'x', b'y', b'z', // payload
        ];
        assert_eq!(&encoded[..], &expected[..]);
    }

    #[test]
    fn test_wire_layout_connect_and_close() {
        let encoded = Frame::connect(5, None, "tcp").encode().unwrap();
        assert_eq!(&encoded[..], &[4, 0, 0, 0, 5, 0, 0, 0, 3, b't', b'c', b'p']);

        let encoded = Frame::close(5).encode().unwrap();
        assert_eq!(&encoded[..], &[2, 0, 0, 0, 5]);
    }

    #[test]
    fn test_high_ids_keep_bit_pattern() {
        let mut encoded = Frame::close(u32::MAX).encode().unwrap();
        assert_eq!(&encoded[1..], &[0xff, 0xff, 0xff, 0xff]);
        assert_eq!(Frame::decode(&mut encoded).unwrap().id(), u32::MAX);
    }

    #[test]
    fn test_decode_incomplete_leaves_buffer() {
        let encoded = Frame::send(1, None, Bytes::from("payload")).encode().unwrap();
        let mut partial = encoded.slice(..encoded.len() - 1);
        let before = partial.clone();

        assert_eq!(Frame::decode(&mut partial), Err(ProtocolError::IncompleteFrame));
        assert_eq!(partial, before);
    }

    #[test]
    fn test_decode_unknown_command() {
        let mut buf = Bytes::from_static(&[9, 0, 0, 0, 1]);
        assert_eq!(Frame::decode(&mut buf), Err(ProtocolError::UnknownCommand(9)));
    }

    #[test]
    fn test_decode_negative_length() {
        let mut buf = BytesMut::new();
        buf.put_u8(Command::SendWithoutAddress as u8);
        buf.put_u32(1);
        buf.put_i32(-5);

        assert_eq!(
            Frame::decode(&mut buf.freeze()),
            Err(ProtocolError::NegativeLength {
                field: "payload",
                value: -5
            })
        );
    }

    #[test]
    fn test_decode_invalid_port() {
        let mut buf = BytesMut::new();
        buf.put_u8(Command::ConnectWithAddress as u8);
        buf.put_u32(1);
        buf.put_i32(1);
        buf.put_u8(b'h');
        buf.put_i32(70000);

        assert_eq!(
            Frame::decode(&mut buf.freeze()),
            Err(ProtocolError::InvalidPort(70000))
        );
    }

    #[test]
    fn test_decode_consecutive_frames() {
        let mut buf = BytesMut::new();
        for frame in all_kinds() {
            frame.encode_into(&mut buf).unwrap();
        }
        let mut buf = buf.freeze();

        for frame in all_kinds() {
            assert_eq!(Frame::decode(&mut buf).unwrap(), frame);
        }
        assert!(buf.is_empty());
    }
}
