//! WebSocket frame codec (RFC 6455 §5).
//!
//! Client-side: outbound frames are always masked with a fresh key,
//! inbound frames must arrive unmasked.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec;

use crate::error::Error;

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xa => Some(Self::Pong),
            _ => None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xa,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    pub fn is_data(self) -> bool {
        matches!(self, Self::Text | Self::Binary)
    }
}

/// A single WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    /// Compression bit, owned by the negotiated deflate extension.
    pub(crate) rsv1: bool,
    pub opcode: OpCode,
    pub payload: Bytes,
}

impl Frame {
    pub fn text(payload: impl Into<Bytes>, fin: bool) -> Self {
        Self {
            fin,
            rsv1: false,
            opcode: OpCode::Text,
            payload: payload.into(),
        }
    }

    pub fn binary(payload: impl Into<Bytes>, fin: bool) -> Self {
        Self {
            fin,
            rsv1: false,
            opcode: OpCode::Binary,
            payload: payload.into(),
        }
    }

    pub fn continuation(payload: impl Into<Bytes>, fin: bool) -> Self {
        Self {
            fin,
            rsv1: false,
            opcode: OpCode::Continuation,
            payload: payload.into(),
        }
    }

    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            rsv1: false,
            opcode: OpCode::Ping,
            payload: payload.into(),
        }
    }

    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            rsv1: false,
            opcode: OpCode::Pong,
            payload: payload.into(),
        }
    }

    /// Build a CLOSE frame. The outbound sink rejects these; the session's
    /// `close` drives the closing handshake instead.
    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code);
        payload.put_slice(reason.as_bytes());
        Self {
            fin: true,
            rsv1: false,
            opcode: OpCode::Close,
            payload: payload.freeze(),
        }
    }

    /// Parse a CLOSE frame payload into code and reason.
    pub fn close_parts(&self) -> Option<(u16, String)> {
        if self.payload.len() < 2 {
            return None;
        }
        let code = u16::from_be_bytes([self.payload[0], self.payload[1]]);
        let reason = String::from_utf8_lossy(&self.payload[2..]).into_owned();
        Some((code, reason))
    }
}

/// Frame codec parameterized for the client role.
#[derive(Debug)]
pub(crate) struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub(crate) fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl codec::Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        if src.len() < 2 {
            return Ok(None);
        }
        let first = src[0];
        let second = src[1];

        let fin = first & 0x80 != 0;
        let rsv1 = first & 0x40 != 0;
        if first & 0x30 != 0 {
            return Err(Error::new_ws_protocol().with_message("reserved frame bits set"));
        }
        let Some(opcode) = OpCode::from_u8(first & 0x0f) else {
            return Err(Error::new_ws_protocol().with_message("unknown frame opcode"));
        };
        if second & 0x80 != 0 {
            return Err(Error::new_ws_protocol().with_message("server sent a masked frame"));
        }

        let mut header_len = 2;
        let payload_len = match second & 0x7f {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                header_len = 4;
                u16::from_be_bytes([src[2], src[3]]) as usize
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                header_len = 10;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&src[2..10]);
                let len = u64::from_be_bytes(raw);
                usize::try_from(len).map_err(|_| {
                    Error::new_ws_protocol().with_message("frame length out of range")
                })?
            }
            len => len as usize,
        };

        if opcode.is_control() {
            if payload_len > 125 {
                return Err(
                    Error::new_ws_protocol().with_message("control frame payload exceeds 125")
                );
            }
            if !fin {
                return Err(Error::new_ws_protocol().with_message("fragmented control frame"));
            }
        }
        if payload_len > self.max_frame_size {
            return Err(Error::new_ws_protocol().with_message("frame exceeds maximum size"));
        }

        if src.len() < header_len + payload_len {
            src.reserve(header_len + payload_len - src.len());
            return Ok(None);
        }
        src.advance(header_len);
        let payload = src.split_to(payload_len).freeze();

        Ok(Some(Frame {
            fin,
            rsv1,
            opcode,
            payload,
        }))
    }
}

impl codec::Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Error> {
        let len = frame.payload.len();
        dst.reserve(len + 14);

        let mut first = frame.opcode.as_u8();
        if frame.fin {
            first |= 0x80;
        }
        if frame.rsv1 {
            first |= 0x40;
        }
        dst.put_u8(first);

        // client frames carry the mask bit and a fresh key
        if len < 126 {
            dst.put_u8(0x80 | len as u8);
        } else if len <= u16::MAX as usize {
            dst.put_u8(0x80 | 126);
            dst.put_u16(len as u16);
        } else {
            dst.put_u8(0x80 | 127);
            dst.put_u64(len as u64);
        }

        let key: [u8; 4] = rand::random();
        dst.put_slice(&key);
        let start = dst.len();
        dst.put_slice(&frame.payload);
        for (i, byte) in dst[start..].iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }
        Ok(())
    }
}

/// Unmask helper shared with tests that emulate the server side.
#[cfg(test)]
pub(crate) fn apply_mask(key: [u8; 4], payload: &mut [u8]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::codec::{Decoder, Encoder};

    #[test]
    fn decodes_unmasked_server_frames() {
        // the classic "Hello" example frames
        let mut src = BytesMut::from(
            &[
                0x89, 0x02, 0x01, 0x02, // ping [1,2]
                0x81, 0x05, b'H', b'e', b'l', b'l', b'o', // text "Hello"
            ][..],
        );
        let mut codec = FrameCodec::new(1 << 20);
        let ping = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(ping.opcode, OpCode::Ping);
        assert_eq!(&ping.payload[..], &[1, 2]);

        let text = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(text.opcode, OpCode::Text);
        assert!(text.fin);
        assert_eq!(&text.payload[..], b"Hello");
        assert!(codec.decode(&mut src).unwrap().is_none());
    }

    #[test]
    fn encoded_frames_are_masked() {
        let mut codec = FrameCodec::new(1 << 20);
        let mut dst = BytesMut::new();
        codec
            .encode(Frame::text(&b"chat"[..], true), &mut dst)
            .unwrap();

        assert_eq!(dst[0], 0x81);
        assert_eq!(dst[1], 0x80 | 4, "mask bit plus length");
        let key = [dst[2], dst[3], dst[4], dst[5]];
        let mut payload = dst[6..].to_vec();
        apply_mask(key, &mut payload);
        assert_eq!(payload, b"chat");
    }

    #[test]
    fn masked_inbound_rejected() {
        let mut codec = FrameCodec::new(1 << 20);
        let mut src = BytesMut::from(&[0x81, 0x84, 1, 2, 3, 4, 0, 0, 0, 0][..]);
        let err = codec.decode(&mut src).unwrap_err();
        assert!(err.is_ws_protocol());
    }

    #[test]
    fn oversized_control_frame_rejected() {
        let mut codec = FrameCodec::new(1 << 20);
        let mut src = BytesMut::from(&[0x88, 126, 0x00, 0x80][..]);
        src.extend_from_slice(&[0u8; 128]);
        assert!(codec.decode(&mut src).is_err());
    }

    #[test]
    fn extended_16bit_length() {
        let mut codec = FrameCodec::new(1 << 20);
        let mut src = BytesMut::from(&[0x82, 126, 0x01, 0x00][..]);
        src.extend_from_slice(&[7u8; 256]);
        let frame = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Binary);
        assert_eq!(frame.payload.len(), 256);
    }

    #[test]
    fn close_frame_truncation_parts() {
        let frame = Frame::close(1000, "bye");
        let (code, reason) = frame.close_parts().unwrap();
        assert_eq!(code, 1000);
        assert_eq!(reason, "bye");
    }
}
