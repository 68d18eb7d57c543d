//! Datagram reassembly from progressive payload slices

use bytes::{Bytes, BytesMut};

/// Collects the slices of one SEND payload until the last one arrives
///
/// A payload that arrives whole is passed through without copying.
#[derive(Debug, Default)]
pub(crate) struct DatagramBuffer {
    partial: BytesMut,
}

impl DatagramBuffer {
    /// Add a slice; returns the complete payload once `remaining` is 0
    pub fn push(&mut self, slice: Bytes, remaining: usize) -> Option<Bytes> {
        if remaining == 0 && self.partial.is_empty() {
            return Some(slice);
        }

        self.partial.extend_from_slice(&slice);
        if remaining == 0 {
            Some(self.partial.split().freeze())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whole_payload_passes_through() {
        let mut buffer = DatagramBuffer::default();
        let payload = Bytes::from("whole");

        let out = buffer.push(payload.clone(), 0).unwrap();
        assert_eq!(out.as_ptr(), payload.as_ptr());
    }

    #[test]
    fn test_slices_are_joined() {
        let mut buffer = DatagramBuffer::default();

        assert_eq!(buffer.push(Bytes::from("ab"), 4), None);
        assert_eq!(buffer.push(Bytes::from("cd"), 2), None);
        assert_eq!(buffer.push(Bytes::from("ef"), 0), Some(Bytes::from("abcdef")));

        // the next payload starts fresh
        assert_eq!(buffer.push(Bytes::from("g"), 0), Some(Bytes::from("g")));
    }

    #[test]
    fn test_empty_payload() {
        let mut buffer = DatagramBuffer::default();
        assert_eq!(buffer.push(Bytes::new(), 0), Some(Bytes::new()));
    }
}
