//! gRPC message framing.
//!
//! Each message travels length-prefixed:
//! - 1 byte: compressed flag (0 = uncompressed, 1 = compressed)
//! - 4 bytes: message length (big-endian u32)
//! - N bytes: message payload
//!
//! The framing layer is consumed by transports; protobuf (or any other)
//! encoding of the payload belongs to the application.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;

/// Size of the message header (flag byte plus length word).
pub const HEADER_SIZE: usize = 5;

/// Default maximum message size (4 MiB, the gRPC default).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Encode one message into wire format with the given compressed flag.
pub fn encode_message(data: &[u8], compressed: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + data.len());
    buf.put_u8(if compressed { 1 } else { 0 });
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
    buf.freeze()
}

/// Decode one message from `buf`, enforcing `max_size`.
///
/// Returns `Ok(Some((payload, compressed)))` for a complete message,
/// `Ok(None)` when more data is needed, `Err` on oversized messages.
pub fn decode_message(buf: &mut BytesMut, max_size: usize) -> io::Result<Option<(Bytes, bool)>> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    let compressed = buf[0] != 0;
    let length = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;

    if length > max_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message of {} bytes exceeds limit of {}", length, max_size),
        ));
    }

    if buf.len() < HEADER_SIZE + length {
        return Ok(None);
    }

    buf.advance(HEADER_SIZE);
    let payload = buf.split_to(length).freeze();
    Ok(Some((payload, compressed)))
}

/// Incremental decoder for a stream of framed messages.
#[derive(Debug)]
pub struct MessageDecoder {
    buffer: BytesMut,
    max_size: usize,
}

impl Default for MessageDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self::with_max_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_size,
        }
    }

    /// Feed raw stream data into the decoder.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next complete message.
    pub fn decode(&mut self) -> io::Result<Option<(Bytes, bool)>> {
        decode_message(&mut self.buffer, self.max_size)
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let encoded = encode_message(b"hello", false);
        assert_eq!(encoded.len(), HEADER_SIZE + 5);
        assert_eq!(encoded[0], 0);
        assert_eq!(&encoded[1..5], &[0, 0, 0, 5]);
        assert_eq!(&encoded[5..], b"hello");
    }

    #[test]
    fn test_encode_compressed_flag() {
        assert_eq!(encode_message(b"x", true)[0], 1);
    }

    #[test]
    fn test_decode_round_trip() {
        let mut buf = BytesMut::from(&encode_message(b"payload", false)[..]);
        let (payload, compressed) = decode_message(&mut buf, DEFAULT_MAX_MESSAGE_SIZE)
            .unwrap()
            .unwrap();
        assert!(!compressed);
        assert_eq!(&payload[..], b"payload");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = encode_message(b"hello world", false);

        let mut partial_header = BytesMut::from(&encoded[..3]);
        assert!(decode_message(&mut partial_header, DEFAULT_MAX_MESSAGE_SIZE).unwrap().is_none());

        let mut partial_body = BytesMut::from(&encoded[..8]);
        assert!(decode_message(&mut partial_body, DEFAULT_MAX_MESSAGE_SIZE).unwrap().is_none());
    }

    #[test]
    fn test_decode_multiple() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_message(b"first", false));
        buf.extend_from_slice(&encode_message(b"second", false));

        let (one, _) = decode_message(&mut buf, DEFAULT_MAX_MESSAGE_SIZE).unwrap().unwrap();
        let (two, _) = decode_message(&mut buf, DEFAULT_MAX_MESSAGE_SIZE).unwrap().unwrap();
        assert_eq!(&one[..], b"first");
        assert_eq!(&two[..], b"second");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_message() {
        let mut buf = BytesMut::new();
        buf.put_u8(0);
        buf.put_u32(1024);
        assert!(decode_message(&mut buf, 100).is_err());
    }

    #[test]
    fn test_incremental_decoder() {
        let mut decoder = MessageDecoder::new();
        let encoded = encode_message(b"streamed", false);

        decoder.feed(&encoded[..4]);
        assert!(decoder.decode().unwrap().is_none());

        decoder.feed(&encoded[4..]);
        let (payload, _) = decoder.decode().unwrap().unwrap();
        assert_eq!(&payload[..], b"streamed");
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn test_empty_message() {
        let mut buf = BytesMut::from(&encode_message(b"", false)[..]);
        let (payload, _) = decode_message(&mut buf, DEFAULT_MAX_MESSAGE_SIZE).unwrap().unwrap();
        assert!(payload.is_empty());
    }
}
