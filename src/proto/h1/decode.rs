//! Incremental HTTP/1.x response parsing.
//!
//! The connection keeps a single read buffer; the decoder consumes from it
//! and reports when it needs more bytes. Chunked bodies surface their
//! trailer section as a header map.

use bytes::{Buf, Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Version};
use tracing::trace;

use crate::error::{Error, Result};

const MAX_HEADERS: usize = 100;
const MAX_HEAD_SIZE: usize = 64 << 10;
const MAX_CHUNK_LINE: usize = 256;

/// A parsed response head plus what it implies for the rest of the message.
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub(crate) status: StatusCode,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    /// `Connection: close` observed (or implied by HTTP/1.0).
    pub(crate) close: bool,
}

/// How the response payload is delimited on the wire.
#[derive(Debug)]
pub(crate) enum BodyKind {
    Empty,
    Length(u64),
    Chunked,
    /// No framing: the payload runs until the server closes.
    CloseDelimited,
}

/// Try to parse a response head out of `buf`, consuming it on success.
pub(crate) fn parse_head(buf: &mut BytesMut) -> Result<Option<ResponseHead>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);

    let status = match response.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            let version = match response.version {
                Some(0) => Version::HTTP_10,
                _ => Version::HTTP_11,
            };
            let code = response.code.ok_or_else(Error::new_http)?;
            let status = StatusCode::from_u16(code)
                .map_err(|err| Error::new_http().with(err))?;

            let mut map = HeaderMap::with_capacity(response.headers.len());
            for header in response.headers.iter() {
                let name = HeaderName::from_bytes(header.name.as_bytes())
                    .map_err(|err| Error::new_http().with(err))?;
                let value = HeaderValue::from_bytes(header.value)
                    .map_err(|err| Error::new_http().with(err))?;
                map.append(name, value);
            }

            let close = connection_close(&map, version);
            buf.advance(len);
            trace!(status = %status, ?version, "parsed response head");
            ResponseHead {
                status,
                version,
                headers: map,
                close,
            }
        }
        Ok(httparse::Status::Partial) => {
            if buf.len() > MAX_HEAD_SIZE {
                return Err(Error::new_http().with_message("response head too large"));
            }
            return Ok(None);
        }
        Err(err) => return Err(Error::new_http().with(err)),
    };

    Ok(Some(status))
}

fn connection_close(headers: &HeaderMap, version: Version) -> bool {
    let mut keep_alive = version != Version::HTTP_10;
    for value in headers.get_all(http::header::CONNECTION) {
        if let Ok(value) = value.to_str() {
            for token in value.split(',') {
                match token.trim() {
                    token if token.eq_ignore_ascii_case("close") => keep_alive = false,
                    token if token.eq_ignore_ascii_case("keep-alive") => keep_alive = true,
                    _ => {}
                }
            }
        }
    }
    !keep_alive
}

/// Decide how the payload of `head` is delimited, for a request issued
/// with `method`.
pub(crate) fn body_kind(method: &Method, head: &ResponseHead) -> Result<BodyKind> {
    if method == Method::HEAD
        || head.status == StatusCode::NO_CONTENT
        || head.status == StatusCode::NOT_MODIFIED
        || head.status.is_informational()
    {
        return Ok(BodyKind::Empty);
    }

    let chunked = head
        .headers
        .get_all(http::header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("chunked"));
    if chunked {
        return Ok(BodyKind::Chunked);
    }

    match head.headers.get(http::header::CONTENT_LENGTH) {
        Some(value) => {
            let length: u64 = value
                .to_str()
                .ok()
                .and_then(|value| value.trim().parse().ok())
                .ok_or_else(|| Error::new_http().with_message("invalid content-length"))?;
            if length == 0 {
                Ok(BodyKind::Empty)
            } else {
                Ok(BodyKind::Length(length))
            }
        }
        None => Ok(BodyKind::CloseDelimited),
    }
}

/// What a decoding step produced.
#[derive(Debug)]
pub(crate) enum Decoded {
    Data(Bytes),
    /// The buffer ran dry mid-message.
    NeedMore,
    Finished(Option<HeaderMap>),
}

#[derive(Debug)]
pub(crate) enum ChunkPhase {
    Size,
    Data { remaining: u64 },
    DataEnd,
    Trailer,
}

/// Incremental payload decoder, one per in-flight response.
#[derive(Debug)]
pub(crate) enum BodyDecoder {
    Empty,
    Length { remaining: u64 },
    Chunked { phase: ChunkPhase },
    CloseDelimited,
}

impl BodyDecoder {
    pub(crate) fn new(kind: BodyKind) -> Self {
        match kind {
            BodyKind::Empty => Self::Empty,
            BodyKind::Length(length) => Self::Length { remaining: length },
            BodyKind::Chunked => Self::Chunked {
                phase: ChunkPhase::Size,
            },
            BodyKind::CloseDelimited => Self::CloseDelimited,
        }
    }

    /// True when the decoder only finishes on connection close.
    pub(crate) fn is_close_delimited(&self) -> bool {
        matches!(self, Self::CloseDelimited)
    }

    /// Consume buffered bytes. Call again after a read when `NeedMore`.
    pub(crate) fn decode(&mut self, buf: &mut BytesMut) -> Result<Decoded> {
        match self {
            Self::Empty => Ok(Decoded::Finished(None)),
            Self::Length { remaining } => {
                if *remaining == 0 {
                    return Ok(Decoded::Finished(None));
                }
                if buf.is_empty() {
                    return Ok(Decoded::NeedMore);
                }
                let take = (*remaining).min(buf.len() as u64) as usize;
                *remaining -= take as u64;
                let data = buf.split_to(take).freeze();
                Ok(Decoded::Data(data))
            }
            Self::Chunked { phase } => loop {
                match phase {
                    ChunkPhase::Size => {
                        let Some(line_end) = find_crlf(buf) else {
                            if buf.len() > MAX_CHUNK_LINE {
                                return Err(Error::new_http()
                                    .with_message("chunk size line too long"));
                            }
                            return Ok(Decoded::NeedMore);
                        };
                        let line = buf.split_to(line_end + 2);
                        let line = &line[..line_end];
                        // chunk extensions after ';' are ignored
                        let digits = line
                            .split(|byte| *byte == b';')
                            .next()
                            .unwrap_or_default();
                        let digits = std::str::from_utf8(digits)
                            .map_err(|err| Error::new_http().with(err))?;
                        let size = u64::from_str_radix(digits.trim(), 16)
                            .map_err(|err| {
                                Error::new_http().with(err).with_message("invalid chunk size")
                            })?;
                        if size == 0 {
                            *phase = ChunkPhase::Trailer;
                        } else {
                            *phase = ChunkPhase::Data { remaining: size };
                        }
                    }
                    ChunkPhase::Data { remaining } => {
                        if buf.is_empty() {
                            return Ok(Decoded::NeedMore);
                        }
                        let take = (*remaining).min(buf.len() as u64) as usize;
                        *remaining -= take as u64;
                        if *remaining == 0 {
                            *phase = ChunkPhase::DataEnd;
                        }
                        return Ok(Decoded::Data(buf.split_to(take).freeze()));
                    }
                    ChunkPhase::DataEnd => {
                        if buf.len() < 2 {
                            return Ok(Decoded::NeedMore);
                        }
                        if &buf[..2] != b"\r\n" {
                            return Err(
                                Error::new_http().with_message("missing chunk terminator")
                            );
                        }
                        buf.advance(2);
                        *phase = ChunkPhase::Size;
                    }
                    ChunkPhase::Trailer => {
                        if buf.len() >= 2 && &buf[..2] == b"\r\n" {
                            buf.advance(2);
                            return Ok(Decoded::Finished(None));
                        }
                        let Some(end) = find_double_crlf(buf) else {
                            if buf.len() > MAX_HEAD_SIZE {
                                return Err(Error::new_http()
                                    .with_message("trailer section too large"));
                            }
                            return Ok(Decoded::NeedMore);
                        };
                        let block = buf.split_to(end + 4);
                        let trailers = parse_trailers(&block)?;
                        return Ok(Decoded::Finished(Some(trailers)));
                    }
                }
            },
            Self::CloseDelimited => {
                if buf.is_empty() {
                    Ok(Decoded::NeedMore)
                } else {
                    let data = buf.split().freeze();
                    Ok(Decoded::Data(data))
                }
            }
        }
    }

    /// The peer closed the stream; a close-delimited payload ends cleanly,
    /// anything else is truncated.
    pub(crate) fn finish_on_eof(&mut self) -> Result<Option<HeaderMap>> {
        match self {
            Self::CloseDelimited | Self::Empty => Ok(None),
            Self::Length { remaining: 0 } => Ok(None),
            _ => Err(Error::new_http().with_message("connection closed before message completed")),
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|window| window == b"\r\n")
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

fn parse_trailers(block: &[u8]) -> Result<HeaderMap> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut map = HeaderMap::new();
    match httparse::parse_headers(block, &mut headers) {
        Ok(httparse::Status::Complete((_, parsed))) => {
            for header in parsed {
                let name = HeaderName::from_bytes(header.name.as_bytes())
                    .map_err(|err| Error::new_http().with(err))?;
                let value = HeaderValue::from_bytes(header.value)
                    .map_err(|err| Error::new_http().with(err))?;
                map.append(name, value);
            }
            Ok(map)
        }
        Ok(httparse::Status::Partial) => {
            Err(Error::new_http().with_message("truncated trailer section"))
        }
        Err(err) => Err(Error::new_http().with(err)),
    }
}
