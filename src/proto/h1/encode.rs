//! HTTP/1.x request serialization.

use bytes::{BufMut, BytesMut};
use http::header::HeaderMap;
use http::{Method, Version};

/// Serialize a request head into `buf`.
///
/// The header map is written in iteration order; the connection composes
/// it so that `Host` leads and protocol-mandated headers are present.
pub(crate) fn encode_head(
    buf: &mut BytesMut,
    method: &Method,
    target: &str,
    version: Version,
    headers: &HeaderMap,
) {
    buf.reserve(target.len() + 64);
    buf.put_slice(method.as_str().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(target.as_bytes());
    buf.put_slice(match version {
        Version::HTTP_10 => b" HTTP/1.0\r\n",
        _ => b" HTTP/1.1\r\n",
    });

    for (name, value) in headers.iter() {
        buf.reserve(name.as_str().len() + value.len() + 4);
        buf.put_slice(name.as_str().as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");
}

/// Serialize one chunk of a chunked transfer.
pub(crate) fn encode_chunk(buf: &mut BytesMut, data: &[u8]) {
    debug_assert!(!data.is_empty(), "zero chunk terminates the message");
    let size = format!("{:x}", data.len());
    buf.reserve(size.len() + data.len() + 4);
    buf.put_slice(size.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(data);
    buf.put_slice(b"\r\n");
}

/// Terminate a chunked transfer.
pub(crate) fn encode_last_chunk(buf: &mut BytesMut) {
    buf.put_slice(b"0\r\n\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{HOST, USER_AGENT};

    #[test]
    fn encodes_request_line_and_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, "h:8080".parse().unwrap());
        headers.insert(USER_AGENT, "remora/test".parse().unwrap());

        let mut buf = BytesMut::new();
        encode_head(&mut buf, &Method::GET, "/hello", Version::HTTP_11, &headers);
        assert_eq!(
            &buf[..],
            b"GET /hello HTTP/1.1\r\nHost: h:8080\r\nUser-Agent: remora/test\r\n\r\n"
                as &[u8]
        );
    }

    #[test]
    fn encodes_http10_request_line() {
        let mut buf = BytesMut::new();
        encode_head(
            &mut buf,
            &Method::GET,
            "/",
            Version::HTTP_10,
            &HeaderMap::new(),
        );
        assert!(buf.starts_with(b"GET / HTTP/1.0\r\n"));
    }

    #[test]
    fn encodes_chunks() {
        let mut buf = BytesMut::new();
        encode_chunk(&mut buf, b"Wiki");
        encode_chunk(&mut buf, b"pedia");
        encode_last_chunk(&mut buf);
        assert_eq!(&buf[..], b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n" as &[u8]);
    }
}
