//! RFC 6455 opening handshake, client side.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::BytesMut;
use http::header::{self, HeaderMap, HeaderValue};
use http::{Method, StatusCode, Version};
use sha1::{Digest, Sha1};
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

use super::extension::{self, NegotiatedCompression};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::proto::h1::{decode, encode};
use crate::transport::BoxChannel;

const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub(crate) struct HandshakeOutcome {
    pub(crate) subprotocol: Option<String>,
    pub(crate) compression: NegotiatedCompression,
    /// Frame bytes that arrived glued to the handshake response.
    pub(crate) leftover: BytesMut,
}

fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    BASE64.encode(nonce)
}

fn expected_accept(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WS_GUID);
    BASE64.encode(sha1.finalize())
}

/// Run the opening handshake over a freshly opened channel.
pub(crate) async fn handshake(
    io: &mut BoxChannel,
    config: &ClientConfig,
    authority: &str,
    target: &str,
    subprotocols: &[String],
    extra_headers: &HeaderMap,
) -> Result<HandshakeOutcome> {
    let key = generate_key();

    let mut headers = HeaderMap::new();
    headers.insert(
        header::HOST,
        HeaderValue::from_str(authority).map_err(|err| Error::new_ws_handshake().with(err))?,
    );
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(
        header::SEC_WEBSOCKET_KEY,
        HeaderValue::from_str(&key).map_err(|err| Error::new_ws_handshake().with(err))?,
    );
    headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
    if !subprotocols.is_empty() {
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_str(&subprotocols.join(", "))
                .map_err(|err| Error::new_ws_handshake().with(err))?,
        );
    }
    let offers = extension::offers(config);
    if !offers.is_empty() {
        headers.insert(
            header::SEC_WEBSOCKET_EXTENSIONS,
            HeaderValue::from_str(&offers.join(", "))
                .map_err(|err| Error::new_ws_handshake().with(err))?,
        );
    }
    headers.insert(
        header::USER_AGENT,
        HeaderValue::from_str(&config.user_agent)
            .map_err(|err| Error::new_ws_handshake().with(err))?,
    );
    for (name, value) in extra_headers.iter() {
        headers.append(name.clone(), value.clone());
    }

    let mut buf = BytesMut::with_capacity(256);
    encode::encode_head(&mut buf, &Method::GET, target, Version::HTTP_11, &headers);
    trace!(target, "send websocket handshake");
    io.write_all(&buf)
        .await
        .map_err(|err| Error::new_ws_handshake().with(err))?;
    io.flush()
        .await
        .map_err(|err| Error::new_ws_handshake().with(err))?;

    // read the response head; everything past it is frame data
    let mut read_buf = BytesMut::with_capacity(4 << 10);
    let head = loop {
        if let Some(head) = decode::parse_head(&mut read_buf)? {
            break head;
        }
        let n = io
            .read_buf(&mut read_buf)
            .await
            .map_err(|err| Error::new_ws_handshake().with(err))?;
        if n == 0 {
            return Err(
                Error::new_ws_handshake().with_message("connection closed during handshake")
            );
        }
    };

    if head.status != StatusCode::SWITCHING_PROTOCOLS {
        return Err(Error::new_ws_handshake()
            .with_message(format!("handshake rejected with status {}", head.status)));
    }
    let upgraded = head
        .headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"));
    if !upgraded {
        return Err(Error::new_ws_handshake().with_message("server did not upgrade to websocket"));
    }
    let accept = head
        .headers
        .get(header::SEC_WEBSOCKET_ACCEPT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if accept != expected_accept(&key) {
        return Err(Error::new_ws_handshake().with_message("sec-websocket-accept mismatch"));
    }

    let subprotocol = head
        .headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    if let Some(ref selected) = subprotocol {
        if !subprotocols.iter().any(|offered| offered == selected) {
            return Err(Error::new_ws_handshake()
                .with_message(format!("server selected unoffered subprotocol {selected:?}")));
        }
    }

    let compression = extension::negotiate(
        config,
        head.headers
            .get(header::SEC_WEBSOCKET_EXTENSIONS)
            .and_then(|value| value.to_str().ok()),
    )?;

    debug!(?subprotocol, ?compression, "websocket handshake complete");
    Ok(HandshakeOutcome {
        subprotocol,
        compression,
        leftover: read_buf,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_token_matches_rfc_example() {
        // RFC 6455 §1.3 worked example
        assert_eq!(
            expected_accept("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn generated_keys_are_unique_base64_nonces() {
        let a = generate_key();
        let b = generate_key();
        assert_ne!(a, b);
        assert_eq!(BASE64.decode(&a).unwrap().len(), 16);
    }
}
