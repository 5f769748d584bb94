//! Length-prefixed frame codec.
//!
//! Handles the framing layer only; payloads are opaque bytes that the
//! connection and server layers bincode-decode into message envelopes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rangestream_core::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame size (16MB). Bounds a single append or fetch batch.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length-prefixed frame codec.
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Error> {
        // Need at least the length prefix
        if src.len() < 4 {
            return Ok(None);
        }

        // Peek the length without consuming
        let length = (&src[..4]).get_u32() as usize;

        if length > self.max_frame_size {
            return Err(Error::Protocol(format!(
                "frame size {} exceeds maximum {}",
                length, self.max_frame_size
            )));
        }

        let total = 4 + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(4);
        Ok(Some(src.split_to(length)))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Error> {
        if item.len() > self.max_frame_size {
            return Err(Error::Protocol(format!(
                "frame size {} exceeds maximum {}",
                item.len(),
                self.max_frame_size
            )));
        }

        dst.reserve(4 + item.len());
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        codec
            .encode(Bytes::from_static(b"hello frame"), &mut buf)
            .unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&decoded[..], b"hello frame");
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_yields_none() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Bytes::from_static(b"0123456789"), &mut buf)
            .unwrap();

        // Feed the bytes one short of a full frame
        let full = buf.split();
        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        // Completing the frame decodes it
        partial.extend_from_slice(&full[full.len() - 1..]);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(&decoded[..], b"0123456789");
    }

    #[test]
    fn multiple_frames_in_one_buffer() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"one"), &mut buf).unwrap();
        codec.encode(Bytes::from_static(b"two"), &mut buf).unwrap();

        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"one");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"two");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut codec = FrameCodec::with_max_frame_size(8);
        let mut buf = BytesMut::new();
        assert!(codec
            .encode(Bytes::from_static(b"way too large"), &mut buf)
            .is_err());

        // Decoding an oversized length prefix is also rejected
        let mut buf = BytesMut::new();
        buf.put_u32(1024);
        buf.extend_from_slice(&[0u8; 16]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn empty_frame_roundtrips() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::new(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(decoded.is_empty());
    }
}
