//! Frame codec for the physical stream.
//!
//! Frame layout: `[name len: u8][name][payload len: u8 (0..=127)][payload]`.
//! Works over any AsyncRead/AsyncWrite (sockets, pipes, in-memory duplex).

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Largest payload a single frame may carry.
pub const MAX_FRAME_PAYLOAD: usize = 127;

/// Largest channel name, bounded by its one-byte length prefix.
pub const MAX_CHANNEL_NAME: usize = u8::MAX as usize;

/// One unit of multiplexed data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel: String,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(channel: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(&name_len) = src.first() else {
            return Ok(None);
        };
        let name_len = name_len as usize;

        let header_len = 1 + name_len + 1;
        if src.len() < header_len {
            src.reserve(header_len - src.len());
            return Ok(None);
        }

        let payload_len = src[header_len - 1] as usize;
        if payload_len > MAX_FRAME_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame payload length {payload_len} exceeds {MAX_FRAME_PAYLOAD}"),
            ));
        }

        let frame_len = header_len + payload_len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(1);
        let name = src.split_to(name_len);
        let channel = String::from_utf8(name.to_vec())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        src.advance(1);
        let payload = src.split_to(payload_len).freeze();

        Ok(Some(Frame { channel, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let name = frame.channel.as_bytes();
        if name.len() > MAX_CHANNEL_NAME {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("channel name is {} bytes, max {MAX_CHANNEL_NAME}", name.len()),
            ));
        }
        if frame.payload.len() > MAX_FRAME_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "frame payload is {} bytes, max {MAX_FRAME_PAYLOAD}",
                    frame.payload.len()
                ),
            ));
        }

        dst.reserve(2 + name.len() + frame.payload.len());
        dst.put_u8(name.len() as u8);
        dst.put_slice(name);
        dst.put_u8(frame.payload.len() as u8);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_header_layout() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Frame::new("out", &b"hi"[..]), &mut buf).unwrap();
        assert_eq!(&buf[..], &[3, b'o', b'u', b't', 2, b'h', b'i']);
    }

    #[test]
    fn decodes_across_fragmented_input() {
        let mut codec = FrameCodec::new();
        let mut encoded = BytesMut::new();
        codec
            .encode(Frame::new("$command", vec![9u8; 127]), &mut encoded)
            .unwrap();

        let mut src = BytesMut::new();
        let mut decoded = None;
        for byte in encoded.iter() {
            assert!(decoded.is_none(), "frame decoded before all bytes arrived");
            src.put_u8(*byte);
            decoded = codec.decode(&mut src).unwrap();
        }

        let frame = decoded.expect("complete frame");
        assert_eq!(frame.channel, "$command");
        assert_eq!(frame.payload.len(), 127);
        assert!(src.is_empty());
    }

    #[test]
    fn zero_length_payload_is_a_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Frame::new("in", Bytes::new()), &mut buf).unwrap();
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.channel, "in");
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn rejects_oversized_payload_on_both_sides() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let err = codec
            .encode(Frame::new("out", vec![0u8; 128]), &mut buf)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let mut src = BytesMut::from(&[1, b'x', 200][..]);
        let err = codec.decode(&mut src).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn longest_channel_name_round_trips() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let name = "n".repeat(MAX_CHANNEL_NAME);
        codec
            .encode(Frame::new(name.clone(), &b"edge"[..]), &mut buf)
            .unwrap();
        assert_eq!(buf[0], 255);
        assert_eq!(buf.len(), 1 + 255 + 1 + 4);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.channel, name);
        assert_eq!(&frame.payload[..], b"edge");
        assert!(buf.is_empty());
    }

    #[test]
    fn rejects_overlong_channel_name() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let name = "n".repeat(256);
        let err = codec.encode(Frame::new(name, Bytes::new()), &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
