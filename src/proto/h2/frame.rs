//! HTTP/2 frame codec.
//!
//! Frames are parsed out of the connection read buffer one at a time and
//! encoded straight into write buffers. Padding and the deprecated
//! priority fields are consumed and discarded.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::config::ClientConfig;
use crate::error::{Error, Result};

pub(crate) const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub(crate) const FRAME_HEADER_LEN: usize = 9;

pub(crate) const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;
pub(crate) const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
pub(crate) const MAX_WINDOW_SIZE: u32 = (1 << 31) - 1;

// frame types, RFC 9113 §6
const DATA: u8 = 0x0;
const HEADERS: u8 = 0x1;
const PRIORITY: u8 = 0x2;
const RST_STREAM: u8 = 0x3;
const SETTINGS: u8 = 0x4;
const PUSH_PROMISE: u8 = 0x5;
const PING: u8 = 0x6;
const GOAWAY: u8 = 0x7;
const WINDOW_UPDATE: u8 = 0x8;
const CONTINUATION: u8 = 0x9;

// flags
const FLAG_END_STREAM: u8 = 0x1;
const FLAG_ACK: u8 = 0x1;
const FLAG_END_HEADERS: u8 = 0x4;
const FLAG_PADDED: u8 = 0x8;
const FLAG_PRIORITY: u8 = 0x20;

/// Error codes, RFC 9113 §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ErrorCode(pub(crate) u32);

impl ErrorCode {
    pub(crate) const NO_ERROR: Self = Self(0x0);
    pub(crate) const PROTOCOL_ERROR: Self = Self(0x1);
    pub(crate) const INTERNAL_ERROR: Self = Self(0x2);
    pub(crate) const FLOW_CONTROL_ERROR: Self = Self(0x3);
    pub(crate) const FRAME_SIZE_ERROR: Self = Self(0x6);
    pub(crate) const REFUSED_STREAM: Self = Self(0x7);
    pub(crate) const CANCEL: Self = Self(0x8);
    pub(crate) const COMPRESSION_ERROR: Self = Self(0x9);
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match *self {
            Self::NO_ERROR => "NO_ERROR",
            Self::PROTOCOL_ERROR => "PROTOCOL_ERROR",
            Self::INTERNAL_ERROR => "INTERNAL_ERROR",
            Self::FLOW_CONTROL_ERROR => "FLOW_CONTROL_ERROR",
            Self::FRAME_SIZE_ERROR => "FRAME_SIZE_ERROR",
            Self::REFUSED_STREAM => "REFUSED_STREAM",
            Self::CANCEL => "CANCEL",
            Self::COMPRESSION_ERROR => "COMPRESSION_ERROR",
            Self(code) => return write!(f, "UNKNOWN({code:#x})"),
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub(crate) enum Frame {
    Data {
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
    },
    Headers {
        stream_id: u32,
        fragment: Bytes,
        end_stream: bool,
        end_headers: bool,
    },
    Continuation {
        stream_id: u32,
        fragment: Bytes,
        end_headers: bool,
    },
    Priority {
        stream_id: u32,
    },
    Reset {
        stream_id: u32,
        error_code: ErrorCode,
    },
    Settings {
        settings: Settings,
        ack: bool,
    },
    PushPromise {
        stream_id: u32,
    },
    Ping {
        payload: [u8; 8],
        ack: bool,
    },
    GoAway {
        last_stream_id: u32,
        error_code: ErrorCode,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    /// A frame type this client does not interpret; ignored.
    Unknown {
        kind: u8,
    },
}

/// Parse one frame out of `buf`; `None` when more bytes are needed.
pub(crate) fn parse(buf: &mut BytesMut, max_frame_size: u32) -> Result<Option<Frame>> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }
    let length = u32::from_be_bytes([0, buf[0], buf[1], buf[2]]) as usize;
    let kind = buf[3];
    let flags = buf[4];
    let stream_id = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & 0x7fff_ffff;

    if length > max_frame_size as usize {
        return Err(h2_error(ErrorCode::FRAME_SIZE_ERROR, "oversized frame"));
    }
    if buf.len() < FRAME_HEADER_LEN + length {
        return Ok(None);
    }
    buf.advance(FRAME_HEADER_LEN);
    let mut payload = buf.split_to(length).freeze();

    let frame = match kind {
        DATA => {
            if stream_id == 0 {
                return Err(h2_error(ErrorCode::PROTOCOL_ERROR, "DATA on stream 0"));
            }
            let data = strip_padding(&mut payload, flags)?;
            Frame::Data {
                stream_id,
                data,
                end_stream: flags & FLAG_END_STREAM != 0,
            }
        }
        HEADERS => {
            if stream_id == 0 {
                return Err(h2_error(ErrorCode::PROTOCOL_ERROR, "HEADERS on stream 0"));
            }
            let mut fragment = strip_padding(&mut payload, flags)?;
            if flags & FLAG_PRIORITY != 0 {
                if fragment.len() < 5 {
                    return Err(h2_error(
                        ErrorCode::FRAME_SIZE_ERROR,
                        "HEADERS priority fields truncated",
                    ));
                }
                fragment.advance(5);
            }
            Frame::Headers {
                stream_id,
                fragment,
                end_stream: flags & FLAG_END_STREAM != 0,
                end_headers: flags & FLAG_END_HEADERS != 0,
            }
        }
        CONTINUATION => Frame::Continuation {
            stream_id,
            fragment: payload,
            end_headers: flags & FLAG_END_HEADERS != 0,
        },
        PRIORITY => Frame::Priority { stream_id },
        RST_STREAM => {
            if payload.len() != 4 {
                return Err(h2_error(ErrorCode::FRAME_SIZE_ERROR, "bad RST_STREAM length"));
            }
            Frame::Reset {
                stream_id,
                error_code: ErrorCode(payload.get_u32()),
            }
        }
        SETTINGS => {
            if stream_id != 0 {
                return Err(h2_error(ErrorCode::PROTOCOL_ERROR, "SETTINGS on a stream"));
            }
            let ack = flags & FLAG_ACK != 0;
            if ack {
                if !payload.is_empty() {
                    return Err(h2_error(
                        ErrorCode::FRAME_SIZE_ERROR,
                        "SETTINGS ack carries payload",
                    ));
                }
                Frame::Settings {
                    settings: Settings::default(),
                    ack: true,
                }
            } else {
                Frame::Settings {
                    settings: Settings::parse_payload(&payload)?,
                    ack: false,
                }
            }
        }
        PUSH_PROMISE => Frame::PushPromise { stream_id },
        PING => {
            if payload.len() != 8 {
                return Err(h2_error(ErrorCode::FRAME_SIZE_ERROR, "bad PING length"));
            }
            let mut data = [0u8; 8];
            data.copy_from_slice(&payload);
            Frame::Ping {
                payload: data,
                ack: flags & FLAG_ACK != 0,
            }
        }
        GOAWAY => {
            if payload.len() < 8 {
                return Err(h2_error(ErrorCode::FRAME_SIZE_ERROR, "bad GOAWAY length"));
            }
            let last_stream_id = payload.get_u32() & 0x7fff_ffff;
            let error_code = ErrorCode(payload.get_u32());
            Frame::GoAway {
                last_stream_id,
                error_code,
            }
        }
        WINDOW_UPDATE => {
            if payload.len() != 4 {
                return Err(h2_error(
                    ErrorCode::FRAME_SIZE_ERROR,
                    "bad WINDOW_UPDATE length",
                ));
            }
            let increment = payload.get_u32() & 0x7fff_ffff;
            Frame::WindowUpdate {
                stream_id,
                increment,
            }
        }
        kind => {
            trace!(kind, "ignoring unknown frame type");
            Frame::Unknown { kind }
        }
    };
    Ok(Some(frame))
}

fn strip_padding(payload: &mut Bytes, flags: u8) -> Result<Bytes> {
    if flags & FLAG_PADDED == 0 {
        return Ok(payload.clone());
    }
    if payload.is_empty() {
        return Err(h2_error(ErrorCode::PROTOCOL_ERROR, "padded frame too short"));
    }
    let pad_len = payload[0] as usize;
    payload.advance(1);
    if pad_len > payload.len() {
        return Err(h2_error(
            ErrorCode::PROTOCOL_ERROR,
            "padding exceeds payload",
        ));
    }
    Ok(payload.slice(..payload.len() - pad_len))
}

fn put_frame_header(buf: &mut BytesMut, length: usize, kind: u8, flags: u8, stream_id: u32) {
    debug_assert!(length < 1 << 24);
    buf.reserve(FRAME_HEADER_LEN + length);
    buf.put_uint(length as u64, 3);
    buf.put_u8(kind);
    buf.put_u8(flags);
    buf.put_u32(stream_id & 0x7fff_ffff);
}

pub(crate) fn encode_data(buf: &mut BytesMut, stream_id: u32, data: &[u8], end_stream: bool) {
    let flags = if end_stream { FLAG_END_STREAM } else { 0 };
    put_frame_header(buf, data.len(), DATA, flags, stream_id);
    buf.put_slice(data);
}

/// Encode a header block as HEADERS plus CONTINUATION frames as needed.
pub(crate) fn encode_headers(
    buf: &mut BytesMut,
    stream_id: u32,
    fragment: &[u8],
    end_stream: bool,
    max_frame_size: u32,
) {
    let max = max_frame_size as usize;
    let first_len = fragment.len().min(max);
    let (first, mut rest) = fragment.split_at(first_len);
    let mut flags = if end_stream { FLAG_END_STREAM } else { 0 };
    if rest.is_empty() {
        flags |= FLAG_END_HEADERS;
    }
    put_frame_header(buf, first.len(), HEADERS, flags, stream_id);
    buf.put_slice(first);

    while !rest.is_empty() {
        let len = rest.len().min(max);
        let (part, remainder) = rest.split_at(len);
        rest = remainder;
        let flags = if rest.is_empty() { FLAG_END_HEADERS } else { 0 };
        put_frame_header(buf, part.len(), CONTINUATION, flags, stream_id);
        buf.put_slice(part);
    }
}

pub(crate) fn encode_reset(buf: &mut BytesMut, stream_id: u32, error_code: ErrorCode) {
    put_frame_header(buf, 4, RST_STREAM, 0, stream_id);
    buf.put_u32(error_code.0);
}

pub(crate) fn encode_ping(buf: &mut BytesMut, payload: [u8; 8], ack: bool) {
    put_frame_header(buf, 8, PING, if ack { FLAG_ACK } else { 0 }, 0);
    buf.put_slice(&payload);
}

pub(crate) fn encode_goaway(buf: &mut BytesMut, last_stream_id: u32, error_code: ErrorCode) {
    put_frame_header(buf, 8, GOAWAY, 0, 0);
    buf.put_u32(last_stream_id & 0x7fff_ffff);
    buf.put_u32(error_code.0);
}

pub(crate) fn encode_window_update(buf: &mut BytesMut, stream_id: u32, increment: u32) {
    put_frame_header(buf, 4, WINDOW_UPDATE, 0, stream_id);
    buf.put_u32(increment & 0x7fff_ffff);
}

pub(crate) fn encode_settings_ack(buf: &mut BytesMut) {
    put_frame_header(buf, 0, SETTINGS, FLAG_ACK, 0);
}

// setting identifiers, RFC 9113 §6.5.2
const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x1;
const SETTINGS_ENABLE_PUSH: u16 = 0x2;
const SETTINGS_MAX_CONCURRENT_STREAMS: u16 = 0x3;
const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;
const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;
const SETTINGS_MAX_HEADER_LIST_SIZE: u16 = 0x6;

/// A SETTINGS parameter set; unset fields keep the peer's previous value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Settings {
    pub(crate) header_table_size: Option<u32>,
    pub(crate) enable_push: Option<u32>,
    pub(crate) max_concurrent_streams: Option<u32>,
    pub(crate) initial_window_size: Option<u32>,
    pub(crate) max_frame_size: Option<u32>,
    pub(crate) max_header_list_size: Option<u32>,
}

impl Settings {
    /// The settings this client advertises, straight from configuration.
    pub(crate) fn from_config(config: &ClientConfig) -> Self {
        Self {
            header_table_size: Some(config.http2_header_table_size),
            enable_push: Some(0),
            max_concurrent_streams: Some(config.http2_max_concurrent_streams),
            initial_window_size: Some(config.http2_initial_window_size),
            max_frame_size: Some(config.http2_max_frame_size),
            max_header_list_size: config.http2_max_header_list_size,
        }
    }

    fn for_each<F: FnMut(u16, u32)>(&self, mut f: F) {
        if let Some(value) = self.header_table_size {
            f(SETTINGS_HEADER_TABLE_SIZE, value);
        }
        if let Some(value) = self.enable_push {
            f(SETTINGS_ENABLE_PUSH, value);
        }
        if let Some(value) = self.max_concurrent_streams {
            f(SETTINGS_MAX_CONCURRENT_STREAMS, value);
        }
        if let Some(value) = self.initial_window_size {
            f(SETTINGS_INITIAL_WINDOW_SIZE, value);
        }
        if let Some(value) = self.max_frame_size {
            f(SETTINGS_MAX_FRAME_SIZE, value);
        }
        if let Some(value) = self.max_header_list_size {
            f(SETTINGS_MAX_HEADER_LIST_SIZE, value);
        }
    }

    /// The raw setting list, as carried by the `HTTP2-Settings` header.
    pub(crate) fn payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(36);
        self.for_each(|id, value| {
            out.extend_from_slice(&id.to_be_bytes());
            out.extend_from_slice(&value.to_be_bytes());
        });
        out
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        let payload = self.payload();
        put_frame_header(buf, payload.len(), SETTINGS, 0, 0);
        buf.put_slice(&payload);
    }

    pub(crate) fn parse_payload(payload: &[u8]) -> Result<Self> {
        if payload.len() % 6 != 0 {
            return Err(h2_error(
                ErrorCode::FRAME_SIZE_ERROR,
                "bad SETTINGS payload length",
            ));
        }
        let mut settings = Self::default();
        for raw in payload.chunks(6) {
            let id = u16::from_be_bytes([raw[0], raw[1]]);
            let value = u32::from_be_bytes([raw[2], raw[3], raw[4], raw[5]]);
            match id {
                SETTINGS_HEADER_TABLE_SIZE => settings.header_table_size = Some(value),
                SETTINGS_ENABLE_PUSH => match value {
                    0 | 1 => settings.enable_push = Some(value),
                    _ => {
                        return Err(h2_error(
                            ErrorCode::PROTOCOL_ERROR,
                            "bad ENABLE_PUSH value",
                        ));
                    }
                },
                SETTINGS_MAX_CONCURRENT_STREAMS => {
                    settings.max_concurrent_streams = Some(value)
                }
                SETTINGS_INITIAL_WINDOW_SIZE => {
                    if value > MAX_WINDOW_SIZE {
                        return Err(h2_error(
                            ErrorCode::FLOW_CONTROL_ERROR,
                            "initial window size too large",
                        ));
                    }
                    settings.initial_window_size = Some(value);
                }
                SETTINGS_MAX_FRAME_SIZE => {
                    if !(DEFAULT_MAX_FRAME_SIZE..=(1 << 24) - 1).contains(&value) {
                        return Err(h2_error(
                            ErrorCode::PROTOCOL_ERROR,
                            "bad MAX_FRAME_SIZE value",
                        ));
                    }
                    settings.max_frame_size = Some(value);
                }
                SETTINGS_MAX_HEADER_LIST_SIZE => settings.max_header_list_size = Some(value),
                _ => trace!(id, value, "ignoring unknown setting"),
            }
        }
        Ok(settings)
    }
}

pub(crate) fn h2_error(code: ErrorCode, message: &'static str) -> Error {
    Error::new_http().with_message(format!("h2 {code}: {message}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_roundtrip() {
        let config = ClientConfig::default();
        let settings = Settings::from_config(&config);
        let mut buf = BytesMut::new();
        settings.encode(&mut buf);

        let parsed = parse(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap().unwrap();
        match parsed {
            Frame::Settings {
                settings: parsed,
                ack: false,
            } => {
                assert_eq!(parsed.enable_push, Some(0));
                assert_eq!(
                    parsed.initial_window_size,
                    Some(config.http2_initial_window_size)
                );
                assert_eq!(
                    parsed.max_concurrent_streams,
                    Some(config.http2_max_concurrent_streams)
                );
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_needs_more() {
        let mut buf = BytesMut::new();
        encode_ping(&mut buf, [7; 8], false);
        let mut partial = BytesMut::from(&buf[..10]);
        assert!(parse(&mut partial, DEFAULT_MAX_FRAME_SIZE).unwrap().is_none());
    }

    #[test]
    fn data_frame_roundtrip_with_end_stream() {
        let mut buf = BytesMut::new();
        encode_data(&mut buf, 3, b"hello", true);
        match parse(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap().unwrap() {
            Frame::Data {
                stream_id,
                data,
                end_stream,
            } => {
                assert_eq!(stream_id, 3);
                assert_eq!(&data[..], b"hello");
                assert!(end_stream);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn padded_data_is_stripped() {
        let mut buf = BytesMut::new();
        // hand-rolled padded DATA: pad length 3, payload "hi", padding zeros
        buf.put_uint(6, 3);
        buf.put_u8(DATA);
        buf.put_u8(FLAG_PADDED);
        buf.put_u32(1);
        buf.put_u8(3);
        buf.put_slice(b"hi");
        buf.put_slice(&[0, 0, 0]);
        match parse(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap().unwrap() {
            Frame::Data { data, .. } => assert_eq!(&data[..], b"hi"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn header_block_splits_into_continuations() {
        let mut buf = BytesMut::new();
        let fragment = vec![0xaa; 40];
        encode_headers(&mut buf, 5, &fragment, false, 16);

        match parse(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap().unwrap() {
            Frame::Headers {
                end_headers: false,
                fragment,
                ..
            } => assert_eq!(fragment.len(), 16),
            other => panic!("unexpected frame: {other:?}"),
        }
        match parse(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap().unwrap() {
            Frame::Continuation {
                end_headers: false,
                fragment,
                ..
            } => assert_eq!(fragment.len(), 16),
            other => panic!("unexpected frame: {other:?}"),
        }
        match parse(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap().unwrap() {
            Frame::Continuation {
                end_headers: true,
                fragment,
                ..
            } => assert_eq!(fragment.len(), 8),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut buf = BytesMut::new();
        put_frame_header(&mut buf, 1 << 20, DATA, 0, 1);
        buf.put_slice(&vec![0; 1 << 20]);
        assert!(parse(&mut buf, DEFAULT_MAX_FRAME_SIZE).is_err());
    }
}
