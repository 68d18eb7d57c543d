//! Resumable frame decoder
//!
//! The physical transport hands over byte chunks of arbitrary size; any field
//! (command byte, id, a length prefix, the port, or the middle of a payload)
//! may be split across chunks. [`FrameDecoder`] keeps exactly the progress made
//! so far and resumes from it on the next chunk:
//!
//! - fixed-width integers are accumulated in a 4-byte buffer;
//! - host and header strings are accumulated until complete;
//! - payloads are never buffered: every available slice is handed to the sink
//!   immediately, tagged with the number of payload bytes still to come.
//!
//! Decoding runs until the chunk is exhausted; bytes following a complete frame
//! are decoded in the same call.

use bytes::{Buf, Bytes, BytesMut};
use std::mem;
use tracing::trace;

use crate::address::Address;
use crate::frame::{checked_len, checked_port, Command, ConnectionId, ProtocolError};
use crate::INT_SIZE;

/// Decoded unit handed to a [`FrameSink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// A complete CONNECT frame
    Connect {
        id: ConnectionId,
        address: Option<Address>,
        header: String,
    },
    /// A slice of a SEND frame's payload; `remaining == 0` marks the last slice
    Data {
        id: ConnectionId,
        address: Option<Address>,
        payload: Bytes,
        remaining: usize,
    },
    /// A complete CLOSE frame
    Close { id: ConnectionId },
}

impl FrameEvent {
    pub fn id(&self) -> ConnectionId {
        match self {
            FrameEvent::Connect { id, .. }
            | FrameEvent::Data { id, .. }
            | FrameEvent::Close { id } => *id,
        }
    }
}

/// Receiver of decoded frame events
///
/// Implemented by each endpoint role to route frames to logical connections.
pub trait FrameSink {
    fn on_frame_event(&mut self, event: FrameEvent);
}

impl FrameSink for Vec<FrameEvent> {
    fn on_frame_event(&mut self, event: FrameEvent) {
        self.push(event);
    }
}

/// Position inside the current frame
#[derive(Debug)]
enum Phase {
    Command,
    Id {
        command: Command,
    },
    HostLen {
        command: Command,
        id: ConnectionId,
    },
    Host {
        command: Command,
        id: ConnectionId,
        len: usize,
    },
    Port {
        command: Command,
        id: ConnectionId,
        host: String,
    },
    HeaderLen {
        id: ConnectionId,
        address: Option<Address>,
    },
    Header {
        id: ConnectionId,
        address: Option<Address>,
        len: usize,
    },
    PayloadLen {
        id: ConnectionId,
        address: Option<Address>,
    },
    Payload {
        id: ConnectionId,
        address: Option<Address>,
        remaining: usize,
    },
}

enum Progress {
    Next(Phase),
    Starved(Phase),
}

/// Incremental decoder for one physical connection
///
/// After an error the decoder state is unspecified; discard it together with
/// the physical connection.
#[derive(Debug)]
pub struct FrameDecoder {
    phase: Phase,
    int_buf: [u8; INT_SIZE],
    int_filled: usize,
    text: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            phase: Phase::Command,
            int_buf: [0; INT_SIZE],
            int_filled: 0,
            text: BytesMut::new(),
        }
    }

    /// Whether the decoder sits exactly between two frames
    pub fn is_idle(&self) -> bool {
        matches!(self.phase, Phase::Command)
    }

    /// Consume one chunk, dispatching every event it completes
    pub fn decode<S>(&mut self, mut chunk: Bytes, sink: &mut S) -> Result<(), ProtocolError>
    where
        S: FrameSink + ?Sized,
    {
        trace!("Decoding chunk of {} bytes", chunk.len());

        loop {
            let phase = mem::replace(&mut self.phase, Phase::Command);
            match self.advance(phase, &mut chunk, sink)? {
                Progress::Next(next) => self.phase = next,
                Progress::Starved(current) => {
                    self.phase = current;
                    return Ok(());
                }
            }
        }
    }

    fn advance<S>(
        &mut self,
        phase: Phase,
        chunk: &mut Bytes,
        sink: &mut S,
    ) -> Result<Progress, ProtocolError>
    where
        S: FrameSink + ?Sized,
    {
        let next = match phase {
            Phase::Command => {
                if !chunk.has_remaining() {
                    return Ok(Progress::Starved(Phase::Command));
                }
                Phase::Id {
                    command: Command::try_from(chunk.get_u8())?,
                }
            }

            Phase::Id { command } => {
                let Some(raw) = self.read_i32(chunk) else {
                    return Ok(Progress::Starved(Phase::Id { command }));
                };
                let id = raw as ConnectionId;
                match command {
                    Command::Close => {
                        sink.on_frame_event(FrameEvent::Close { id });
                        Phase::Command
                    }
                    Command::SendWithAddress | Command::ConnectWithAddress => {
                        Phase::HostLen { command, id }
                    }
                    Command::ConnectWithoutAddress => Phase::HeaderLen { id, address: None },
                    Command::SendWithoutAddress => Phase::PayloadLen { id, address: None },
                }
            }

            Phase::HostLen { command, id } => {
                let Some(raw) = self.read_i32(chunk) else {
                    return Ok(Progress::Starved(Phase::HostLen { command, id }));
                };
                Phase::Host {
                    command,
                    id,
                    len: checked_len("host", raw)?,
                }
            }

            Phase::Host { command, id, len } => match self.read_text(chunk, len) {
                None => return Ok(Progress::Starved(Phase::Host { command, id, len })),
                Some(raw) => Phase::Port {
                    command,
                    id,
                    host: into_string("host", raw)?,
                },
            },

            Phase::Port { command, id, host } => {
                let Some(raw) = self.read_i32(chunk) else {
                    return Ok(Progress::Starved(Phase::Port { command, id, host }));
                };
                let address = Some(Address::new(host, checked_port(raw)?));
                if command == Command::ConnectWithAddress {
                    Phase::HeaderLen { id, address }
                } else {
                    Phase::PayloadLen { id, address }
                }
            }

            Phase::HeaderLen { id, address } => {
                let Some(raw) = self.read_i32(chunk) else {
                    return Ok(Progress::Starved(Phase::HeaderLen { id, address }));
                };
                Phase::Header {
                    id,
                    address,
                    len: checked_len("header", raw)?,
                }
            }

            Phase::Header { id, address, len } => match self.read_text(chunk, len) {
                None => return Ok(Progress::Starved(Phase::Header { id, address, len })),
                Some(raw) => {
                    sink.on_frame_event(FrameEvent::Connect {
                        id,
                        address,
                        header: into_string("header", raw)?,
                    });
                    Phase::Command
                }
            },

            Phase::PayloadLen { id, address } => {
                let Some(raw) = self.read_i32(chunk) else {
                    return Ok(Progress::Starved(Phase::PayloadLen { id, address }));
                };
                Phase::Payload {
                    id,
                    address,
                    remaining: checked_len("payload", raw)?,
                }
            }

            Phase::Payload {
                id,
                address,
                remaining,
            } => {
                if remaining > 0 && !chunk.has_remaining() {
                    return Ok(Progress::Starved(Phase::Payload {
                        id,
                        address,
                        remaining,
                    }));
                }

                let take = remaining.min(chunk.remaining());
                let payload = chunk.split_to(take);
                let remaining = remaining - take;

                sink.on_frame_event(FrameEvent::Data {
                    id,
                    address: address.clone(),
                    payload,
                    remaining,
                });

                if remaining == 0 {
                    Phase::Command
                } else {
                    Phase::Payload {
                        id,
                        address,
                        remaining,
                    }
                }
            }
        };

        Ok(Progress::Next(next))
    }

    /// Accumulate a big-endian int32, returning it once all four bytes are in
    fn read_i32(&mut self, chunk: &mut Bytes) -> Option<i32> {
        if self.int_filled == 0 && chunk.remaining() >= INT_SIZE {
            return Some(chunk.get_i32());
        }

        while self.int_filled < INT_SIZE {
            if !chunk.has_remaining() {
                return None;
            }
            self.int_buf[self.int_filled] = chunk.get_u8();
            self.int_filled += 1;
        }

        self.int_filled = 0;
        Some(i32::from_be_bytes(self.int_buf))
    }

    /// Accumulate `len` bytes of a string field
    fn read_text(&mut self, chunk: &mut Bytes, len: usize) -> Option<BytesMut> {
        let wanted = len - self.text.len();
        let take = wanted.min(chunk.remaining());
        self.text.extend_from_slice(&chunk.split_to(take));

        if self.text.len() < len {
            return None;
        }
        Some(self.text.split())
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn into_string(field: &'static str, raw: BytesMut) -> Result<String, ProtocolError> {
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8(field))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use bytes::BufMut;

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame::connect(0, None, "echo"),
            Frame::connect(1, Some(Address::new("db.internal", 5432)), "tcp"),
            Frame::send(1, None, Bytes::from("SELECT 1;")),
            Frame::send(2, Some(Address::new("10.1.2.3", 161)), Bytes::from_static(&[0x30, 0x26, 0x02])),
            Frame::send(1, None, Bytes::new()),
            Frame::close(1),
            Frame::close(0),
        ]
    }

    fn encode_all(frames: &[Frame]) -> Bytes {
        let mut buf = BytesMut::new();
        for frame in frames {
            frame.encode_into(&mut buf).unwrap();
        }
        buf.freeze()
    }

    /// Rebuild whole frames from events, joining payload slices
    fn reassemble(events: Vec<FrameEvent>) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut partial: Option<(ConnectionId, Option<Address>, BytesMut)> = None;

        for event in events {
            match event {
                FrameEvent::Connect {
                    id,
                    address,
                    header,
                } => {
                    assert!(partial.is_none(), "CONNECT inside a payload");
                    frames.push(Frame::connect(id, address, header));
                }
                FrameEvent::Close { id } => {
                    assert!(partial.is_none(), "CLOSE inside a payload");
                    frames.push(Frame::close(id));
                }
                FrameEvent::Data {
                    id,
                    address,
                    payload,
                    remaining,
                } => {
                    let (_, _, buf) =
                        partial.get_or_insert_with(|| (id, address.clone(), BytesMut::new()));
                    buf.extend_from_slice(&payload);
                    if remaining == 0 {
                        let (id, address, buf) = partial.take().unwrap();
                        frames.push(Frame::send(id, address, buf.freeze()));
                    }
                }
            }
        }

        assert!(partial.is_none(), "unterminated payload");
        frames
    }

    fn decode_in_chunks(stream: &Bytes, boundaries: &[usize]) -> Vec<FrameEvent> {
        let mut decoder = FrameDecoder::new();
        let mut events = Vec::new();
        let mut start = 0;

        for &end in boundaries.iter().chain(std::iter::once(&stream.len())) {
            decoder
                .decode(stream.slice(start..end), &mut events)
                .unwrap();
            start = end;
        }

        assert!(decoder.is_idle());
        events
    }

    #[test]
    fn test_whole_buffer() {
        let frames = sample_frames();
        let stream = encode_all(&frames);

        let events = decode_in_chunks(&stream, &[]);
        assert_eq!(events.len(), frames.len());
        assert_eq!(reassemble(events), frames);
    }

    #[test]
    fn test_every_fixed_chunk_size() {
        let frames = sample_frames();
        let stream = encode_all(&frames);

        for size in 1..=stream.len() {
            let boundaries: Vec<usize> = (size..stream.len()).step_by(size).collect();
            let events = decode_in_chunks(&stream, &boundaries);
            assert_eq!(reassemble(events), frames, "chunk size {}", size);
        }
    }

    #[test]
    fn test_every_pair_of_boundaries() {
        let frames = sample_frames();
        let stream = encode_all(&frames);

        for first in 0..=stream.len() {
            for second in first..=stream.len() {
                let events = decode_in_chunks(&stream, &[first, second]);
                assert_eq!(reassemble(events), frames, "split at {} and {}", first, second);
            }
        }
    }

    #[test]
    fn test_empty_chunks_are_harmless() {
        let frames = sample_frames();
        let stream = encode_all(&frames);

        let mut decoder = FrameDecoder::new();
        let mut events = Vec::new();
        for i in 0..stream.len() {
            decoder.decode(Bytes::new(), &mut events).unwrap();
            decoder.decode(stream.slice(i..i + 1), &mut events).unwrap();
        }
        assert_eq!(reassemble(events), frames);
    }

    #[test]
    fn test_payload_delivered_progressively() {
        let stream = Frame::send(3, None, Bytes::from("0123456789"))
            .encode()
            .unwrap();
        // prefix (5) + length (4) then payload split 4 / 6
        let events = decode_in_chunks(&stream, &[9 + 4]);

        assert_eq!(
            events,
            vec![
                FrameEvent::Data {
                    id: 3,
                    address: None,
                    payload: Bytes::from("0123"),
                    remaining: 6,
                },
                FrameEvent::Data {
                    id: 3,
                    address: None,
                    payload: Bytes::from("456789"),
                    remaining: 0,
                },
            ]
        );
    }

    #[test]
    fn test_addressed_slices_carry_address() {
        let address = Address::new("192.168.0.1", 53);
        let stream = Frame::send(4, Some(address.clone()), Bytes::from("abcdef"))
            .encode()
            .unwrap();
        let events = decode_in_chunks(&stream, &[stream.len() - 3]);

        assert_eq!(events.len(), 2);
        for event in events {
            match event {
                FrameEvent::Data { address: a, .. } => assert_eq!(a, Some(address.clone())),
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[test]
    fn test_sends_then_close_in_one_chunk() {
        let frames = vec![
            Frame::send(5, None, Bytes::from("one")),
            Frame::send(5, None, Bytes::from("two")),
            Frame::send(5, None, Bytes::from("three")),
            Frame::close(5),
        ];
        let mut events = Vec::new();
        FrameDecoder::new()
            .decode(encode_all(&frames), &mut events)
            .unwrap();

        let payloads: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                FrameEvent::Data { payload, .. } => Some(payload.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(payloads, vec!["one", "two", "three"]);
        assert_eq!(events.last(), Some(&FrameEvent::Close { id: 5 }));
        assert_eq!(events.len(), 4);
    }

    #[test]
    fn test_unknown_command_after_valid_frame() {
        let mut buf = BytesMut::new();
        Frame::close(1).encode_into(&mut buf).unwrap();
        buf.put_u8(42);

        let mut events = Vec::new();
        let result = FrameDecoder::new().decode(buf.freeze(), &mut events);

        assert_eq!(result, Err(ProtocolError::UnknownCommand(42)));
        assert_eq!(events, vec![FrameEvent::Close { id: 1 }]);
    }

    #[test]
    fn test_negative_length_split_across_chunks() {
        let mut buf = BytesMut::new();
        buf.put_u8(Command::ConnectWithoutAddress as u8);
        buf.put_u32(9);
        buf.put_i32(-1);
        let stream = buf.freeze();

        let mut decoder = FrameDecoder::new();
        let mut events = Vec::new();
        decoder.decode(stream.slice(..7), &mut events).unwrap();

        assert_eq!(
            decoder.decode(stream.slice(7..), &mut events),
            Err(ProtocolError::NegativeLength {
                field: "header",
                value: -1
            })
        );
        assert!(events.is_empty());
    }

    #[test]
    fn test_invalid_utf8_header() {
        let mut buf = BytesMut::new();
        buf.put_u8(Command::ConnectWithoutAddress as u8);
        buf.put_u32(1);
        buf.put_i32(2);
        buf.put_slice(&[0xff, 0xfe]);

        let mut events = Vec::new();
        assert_eq!(
            FrameDecoder::new().decode(buf.freeze(), &mut events),
            Err(ProtocolError::InvalidUtf8("header"))
        );
    }

    #[test]
    fn test_large_payload_is_not_buffered() {
        let payload = Bytes::from(vec![7u8; 64 * 1024]);
        let stream = Frame::send(1, None, payload.clone()).encode().unwrap();

        let boundaries: Vec<usize> = (1000..stream.len()).step_by(1000).collect();
        let events = decode_in_chunks(&stream, &boundaries);

        assert!(events.len() > 60);
        assert!(events.iter().all(|e| match e {
            FrameEvent::Data { payload, .. } => payload.len() <= 1000,
            _ => false,
        }));
        assert_eq!(reassemble(events), vec![Frame::send(1, None, payload)]);
    }
}
