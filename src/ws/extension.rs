//! WebSocket compression extensions: `permessage-deflate` and
//! `deflate-frame`, over raw DEFLATE streams with the shared BFINAL tail
//! trimmed off the wire as both extension drafts require.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};
use smallvec::SmallVec;

use crate::config::ClientConfig;
use crate::error::{Error, Result};

const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// What the server agreed to during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NegotiatedCompression {
    None,
    /// permessage-deflate: rsv1 on the first frame of a message.
    PerMessage {
        client_no_context_takeover: bool,
        server_no_context_takeover: bool,
    },
    /// deflate-frame: rsv1 per frame.
    PerFrame { no_context_takeover: bool },
}

impl NegotiatedCompression {
    pub(crate) fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    pub(crate) fn per_message(&self) -> bool {
        matches!(self, Self::PerMessage { .. })
    }
}

/// The extension offers derived from configuration, in preference order.
pub(crate) fn offers(config: &ClientConfig) -> SmallVec<[String; 2]> {
    let mut offers = SmallVec::new();
    if config.ws_message_compression {
        let mut offer = String::from("permessage-deflate");
        if config.ws_message_compression_no_client_context_takeover {
            offer.push_str("; client_no_context_takeover");
        }
        if config.ws_message_compression_no_server_context_takeover {
            offer.push_str("; server_no_context_takeover");
        }
        offers.push(offer);
    }
    if config.ws_frame_compression {
        let mut offer = String::from("deflate-frame");
        if config.ws_frame_compression_no_context_takeover {
            offer.push_str("; no_context_takeover");
        }
        offers.push(offer);
    }
    offers
}

/// Parse the server's `Sec-WebSocket-Extensions` answer.
pub(crate) fn negotiate(config: &ClientConfig, answer: Option<&str>) -> Result<NegotiatedCompression> {
    let Some(answer) = answer else {
        return Ok(NegotiatedCompression::None);
    };
    let mut parts = answer.split(';').map(str::trim);
    let name = parts.next().unwrap_or_default();
    match name {
        "permessage-deflate" => {
            if !config.ws_message_compression {
                return Err(Error::new_ws_handshake()
                    .with_message("server selected an extension that was not offered"));
            }
            let mut client_nct = config.ws_message_compression_no_client_context_takeover;
            let mut server_nct = config.ws_message_compression_no_server_context_takeover;
            for param in parts {
                match param.split('=').next().unwrap_or_default().trim() {
                    "client_no_context_takeover" => client_nct = true,
                    "server_no_context_takeover" => server_nct = true,
                    "client_max_window_bits" | "server_max_window_bits" => {}
                    other => {
                        return Err(Error::new_ws_handshake()
                            .with_message(format!("unknown extension parameter: {other}")));
                    }
                }
            }
            Ok(NegotiatedCompression::PerMessage {
                client_no_context_takeover: client_nct,
                server_no_context_takeover: server_nct,
            })
        }
        "deflate-frame" | "x-webkit-deflate-frame" => {
            if !config.ws_frame_compression {
                return Err(Error::new_ws_handshake()
                    .with_message("server selected an extension that was not offered"));
            }
            let mut nct = config.ws_frame_compression_no_context_takeover;
            for param in parts {
                if param == "no_context_takeover" {
                    nct = true;
                }
            }
            Ok(NegotiatedCompression::PerFrame {
                no_context_takeover: nct,
            })
        }
        "" => Ok(NegotiatedCompression::None),
        other => Err(
            Error::new_ws_handshake().with_message(format!("unknown extension selected: {other}"))
        ),
    }
}

/// Shared DEFLATE state for one direction of a connection.
pub(crate) struct DeflateContext {
    compress: Compress,
    decompress: Decompress,
    reset_compress: bool,
    reset_decompress: bool,
}

impl DeflateContext {
    pub(crate) fn new(negotiated: NegotiatedCompression) -> Option<Self> {
        let (reset_compress, reset_decompress) = match negotiated {
            NegotiatedCompression::None => return None,
            NegotiatedCompression::PerMessage {
                client_no_context_takeover,
                server_no_context_takeover,
            } => (client_no_context_takeover, server_no_context_takeover),
            NegotiatedCompression::PerFrame {
                no_context_takeover,
            } => (no_context_takeover, no_context_takeover),
        };
        Some(Self {
            compress: Compress::new(Compression::default(), false),
            decompress: Decompress::new(false),
            reset_compress,
            reset_decompress,
        })
    }

    /// Deflate one message (or frame) payload.
    pub(crate) fn compress(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() / 2 + 64);
        let mut consumed = 0usize;
        loop {
            out.reserve(256);
            let in_before = self.compress.total_in();
            self.compress
                .compress_vec(&data[consumed..], &mut out, FlushCompress::Sync)
                .map_err(|err| Error::new_ws_protocol().with(err))?;
            consumed += (self.compress.total_in() - in_before) as usize;
            if consumed >= data.len() && out.len() < out.capacity() {
                break;
            }
        }
        if out.ends_with(&DEFLATE_TAIL) {
            out.truncate(out.len() - DEFLATE_TAIL.len());
        }
        if self.reset_compress {
            self.compress.reset();
        }
        Ok(out)
    }

    /// Inflate one payload fragment, bounded by `limit`. The shared tail
    /// is restored only on the final fragment of a message.
    pub(crate) fn decompress(&mut self, data: &[u8], limit: usize, fin: bool) -> Result<Vec<u8>> {
        let mut input = Vec::with_capacity(data.len() + DEFLATE_TAIL.len());
        input.extend_from_slice(data);
        if fin {
            input.extend_from_slice(&DEFLATE_TAIL);
        }

        let mut out = Vec::with_capacity(data.len() * 2 + 64);
        let mut consumed = 0usize;
        loop {
            out.reserve(1024);
            let in_before = self.decompress.total_in();
            self.decompress
                .decompress_vec(&input[consumed..], &mut out, FlushDecompress::Sync)
                .map_err(|err| Error::new_ws_protocol().with(err))?;
            consumed += (self.decompress.total_in() - in_before) as usize;
            if out.len() > limit {
                return Err(
                    Error::new_ws_protocol().with_message("decompressed payload exceeds limit")
                );
            }
            if consumed >= input.len() && out.len() < out.capacity() {
                break;
            }
        }
        if fin && self.reset_decompress {
            self.decompress.reset(false);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pmd_config() -> ClientConfig {
        ClientConfig::new().with_ws_message_compression(true, false, false)
    }

    #[test]
    fn offers_follow_configuration() {
        let config = ClientConfig::new()
            .with_ws_message_compression(true, true, false)
            .with_ws_frame_compression(true, false);
        let offers = offers(&config);
        assert_eq!(
            offers.as_slice(),
            [
                "permessage-deflate; client_no_context_takeover".to_owned(),
                "deflate-frame".to_owned(),
            ]
        );
    }

    #[test]
    fn negotiation_rejects_unoffered_extension() {
        let config = ClientConfig::new();
        assert!(negotiate(&config, Some("permessage-deflate")).is_err());
        assert!(matches!(
            negotiate(&config, None).unwrap(),
            NegotiatedCompression::None
        ));
    }

    #[test]
    fn deflate_roundtrip_with_context_takeover() {
        let negotiated = negotiate(&pmd_config(), Some("permessage-deflate")).unwrap();
        let mut ctx = DeflateContext::new(negotiated).unwrap();

        for _ in 0..3 {
            let message = b"the same message repeats and should compress well";
            let compressed = ctx.compress(message).unwrap();
            let decompressed = ctx.decompress(&compressed, 1 << 20, true).unwrap();
            assert_eq!(decompressed, message);
        }
    }

    #[test]
    fn decompression_limit_enforced() {
        let negotiated = negotiate(&pmd_config(), Some("permessage-deflate")).unwrap();
        let mut ctx = DeflateContext::new(negotiated).unwrap();
        let compressed = ctx.compress(&vec![0u8; 4096]).unwrap();
        assert!(ctx.decompress(&compressed, 128, true).is_err());
    }
}
