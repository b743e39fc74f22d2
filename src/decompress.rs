//! Response payload decompression keyed by `Content-Encoding`.

use async_compression::tokio::bufread::{BrotliDecoder, GzipDecoder, ZlibDecoder, ZstdDecoder};
use futures_util::{StreamExt, TryStreamExt};
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::trace;

use crate::error::Error;
use crate::exchange::body::BodyStream;

/// Encodings a decoder is installed for. Anything else passes through
/// untouched.
pub(crate) const ACCEPTED_ENCODINGS: &str = "gzip, deflate, br, zstd";

/// Wrap `stream` in a decoder for `encoding`, when one is known.
pub(crate) fn decode(encoding: &str, stream: BodyStream) -> BodyStream {
    let encoding = encoding.trim().to_ascii_lowercase();
    let reader = StreamReader::new(stream.map_err(std::io::Error::other));
    let decoded: BodyStream = match encoding.as_str() {
        "gzip" | "x-gzip" => restream(ReaderStream::new(GzipDecoder::new(reader))),
        "deflate" => restream(ReaderStream::new(ZlibDecoder::new(reader))),
        "br" => restream(ReaderStream::new(BrotliDecoder::new(reader))),
        "zstd" => restream(ReaderStream::new(ZstdDecoder::new(reader))),
        "identity" | "" => restream(ReaderStream::new(reader)),
        other => {
            trace!(encoding = %other, "no decoder for content-encoding, pass through");
            restream(ReaderStream::new(reader))
        }
    };
    decoded
}

fn restream<R>(stream: ReaderStream<R>) -> BodyStream
where
    R: tokio::io::AsyncRead + Send + 'static,
{
    Box::pin(stream.map(|chunk| {
        chunk.map_err(|err| match err.downcast::<Error>() {
            Ok(inner) => inner,
            Err(err) => Error::new_io(err),
        })
    }))
}
