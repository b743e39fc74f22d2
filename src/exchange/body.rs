//! Request payloads.
//!
//! A request body is one of a small set of variants, set exclusively: the
//! last `raw`/`string`/`resource`/`url_encoded`/`multipart` call before the
//! request is sent wins. Once the connection starts writing, the body is
//! immutable. A chain of stream transformers can be layered on top and is
//! applied in declaration order when the connection subscribes.

use std::path::PathBuf;
use std::pin::Pin;

use bytes::Bytes;
use futures_core::Stream;
use futures_util::StreamExt;
use http::HeaderValue;
use rand::Rng;
use rand::distr::Alphanumeric;
use tokio_util::io::ReaderStream;

use crate::error::{Error, Result};

/// Stream of outbound payload chunks.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send + 'static>>;

/// A payload stream transformer, applied before the connection subscribes.
pub type BodyTransform = Box<dyn FnOnce(BodyStream) -> BodyStream + Send + 'static>;

/// Declared length of an outbound payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyLength {
    None,
    Known(u64),
    /// Length unknown up front: chunked on HTTP/1.1, open DATA on HTTP/2.
    Unknown,
}

enum BodyKind {
    Empty,
    Bytes(Bytes),
    Raw(BodyStream),
    Resource(PathBuf),
    UrlEncoded(Vec<(String, String)>),
    Multipart(Vec<Part>),
}

impl std::fmt::Debug for BodyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Self::Raw(_) => f.write_str("Raw"),
            Self::Resource(path) => f.debug_tuple("Resource").field(path).finish(),
            Self::UrlEncoded(params) => f.debug_tuple("UrlEncoded").field(&params.len()).finish(),
            Self::Multipart(parts) => f.debug_tuple("Multipart").field(&parts.len()).finish(),
        }
    }
}

/// One part of a multipart form payload.
pub struct Part {
    name: String,
    filename: Option<String>,
    content_type: Option<String>,
    data: Bytes,
}

impl Part {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            filename: None,
            content_type: None,
            data: data.into(),
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// The payload of an outbound request.
pub struct RequestBody {
    kind: BodyKind,
    transformers: Vec<BodyTransform>,
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestBody")
            .field("kind", &self.kind)
            .field("transformers", &self.transformers.len())
            .finish()
    }
}

impl Default for RequestBody {
    fn default() -> Self {
        Self::empty()
    }
}

impl RequestBody {
    pub fn empty() -> Self {
        Self {
            kind: BodyKind::Empty,
            transformers: Vec::new(),
        }
    }

    pub(crate) fn bytes(data: Bytes) -> Self {
        Self {
            kind: BodyKind::Bytes(data),
            transformers: Vec::new(),
        }
    }

    pub(crate) fn raw(stream: BodyStream) -> Self {
        Self {
            kind: BodyKind::Raw(stream),
            transformers: Vec::new(),
        }
    }

    pub(crate) fn resource(path: PathBuf) -> Self {
        Self {
            kind: BodyKind::Resource(path),
            transformers: Vec::new(),
        }
    }

    pub(crate) fn url_encoded(params: Vec<(String, String)>) -> Self {
        Self {
            kind: BodyKind::UrlEncoded(params),
            transformers: Vec::new(),
        }
    }

    pub(crate) fn multipart(parts: Vec<Part>) -> Self {
        Self {
            kind: BodyKind::Multipart(parts),
            transformers: Vec::new(),
        }
    }

    pub(crate) fn push_transformer(&mut self, transform: BodyTransform) {
        self.transformers.push(transform);
    }

    pub(crate) fn is_empty_kind(&self) -> bool {
        matches!(self.kind, BodyKind::Empty)
    }

    /// Resolve the body into the pieces the protocol encoder needs.
    ///
    /// Runs on the connection task, at most once per exchange. Resource
    /// metadata is discovered here; transformers are applied last, and any
    /// transformer makes the final length unknowable.
    pub(crate) async fn materialize(self) -> Result<OutgoingBody> {
        let transformed = !self.transformers.is_empty();
        let mut outgoing = match self.kind {
            BodyKind::Empty => OutgoingBody {
                stream: None,
                length: BodyLength::None,
                content_type: None,
                boundary: None,
            },
            BodyKind::Bytes(data) => {
                let length = BodyLength::Known(data.len() as u64);
                OutgoingBody {
                    stream: Some(one_chunk(data)),
                    length,
                    content_type: None,
                    boundary: None,
                }
            }
            BodyKind::Raw(stream) => OutgoingBody {
                stream: Some(stream),
                length: BodyLength::Unknown,
                content_type: None,
                boundary: None,
            },
            BodyKind::Resource(path) => {
                let media = mime_guess::from_path(&path).first_raw();
                let metadata = tokio::fs::metadata(&path).await.ok();
                let file = tokio::fs::File::open(&path).await.map_err(|err| {
                    Error::new_http()
                        .with(err)
                        .with_message("failed to open resource body")
                })?;
                let stream: BodyStream = Box::pin(
                    ReaderStream::new(file).map(|chunk| chunk.map_err(Error::new_io)),
                );
                OutgoingBody {
                    stream: Some(stream),
                    length: match metadata {
                        Some(meta) => BodyLength::Known(meta.len()),
                        None => BodyLength::Unknown,
                    },
                    content_type: media
                        .map(HeaderValue::from_static),
                    boundary: None,
                }
            }
            BodyKind::UrlEncoded(params) => {
                let mut encoded = String::new();
                for (i, (key, value)) in params.iter().enumerate() {
                    if i > 0 {
                        encoded.push('&');
                    }
                    encoded.push_str(&percent_encode(key));
                    encoded.push('=');
                    encoded.push_str(&percent_encode(value));
                }
                let data = Bytes::from(encoded);
                let length = BodyLength::Known(data.len() as u64);
                OutgoingBody {
                    stream: Some(one_chunk(data)),
                    length,
                    content_type: Some(HeaderValue::from_static(
                        "application/x-www-form-urlencoded; charset=UTF-8",
                    )),
                    boundary: None,
                }
            }
            BodyKind::Multipart(parts) => {
                let boundary = generate_boundary();
                let data = encode_multipart(&parts, &boundary);
                let length = BodyLength::Known(data.len() as u64);
                let content_type = HeaderValue::try_from(format!(
                    "multipart/form-data; boundary={boundary}"
                ))
                .map_err(|err| Error::new_http().with(err))?;
                OutgoingBody {
                    stream: Some(one_chunk(data)),
                    length,
                    content_type: Some(content_type),
                    boundary: Some(boundary),
                }
            }
        };

        if transformed {
            let mut stream = outgoing.stream.take().unwrap_or_else(empty_stream);
            for transform in self.transformers {
                stream = transform(stream);
            }
            outgoing.stream = Some(stream);
            // a transformer may change the payload size arbitrarily
            outgoing.length = BodyLength::Unknown;
        }

        Ok(outgoing)
    }
}

/// A request body resolved for the wire.
pub(crate) struct OutgoingBody {
    pub(crate) stream: Option<BodyStream>,
    pub(crate) length: BodyLength,
    /// Default content type derived from the body variant; only applied
    /// when the caller did not set one.
    pub(crate) content_type: Option<HeaderValue>,
    /// Boundary baked into a multipart payload, kept so a caller-supplied
    /// multipart content type that lacks one can be completed.
    boundary: Option<String>,
}

impl OutgoingBody {
    /// The content type to put on the wire, given what the caller already
    /// set. `None` means the caller's header stands as-is.
    ///
    /// A caller-supplied `multipart/*` value without a `boundary`
    /// parameter gets the generated boundary appended; anything else the
    /// caller set is left untouched.
    pub(crate) fn content_type_for(&self, existing: Option<&HeaderValue>) -> Option<HeaderValue> {
        let Some(existing) = existing else {
            return self.content_type.clone();
        };
        let boundary = self.boundary.as_deref()?;
        let text = existing.to_str().ok()?;
        let mut params = text.split(';');
        let media = params.next().unwrap_or_default().trim();
        if !media.to_ascii_lowercase().starts_with("multipart/") {
            return None;
        }
        let has_boundary = params.any(|param| {
            param
                .split('=')
                .next()
                .unwrap_or_default()
                .trim()
                .eq_ignore_ascii_case("boundary")
        });
        if has_boundary {
            return None;
        }
        HeaderValue::try_from(format!("{text}; boundary={boundary}")).ok()
    }
}

fn one_chunk(data: Bytes) -> BodyStream {
    Box::pin(futures_util::stream::iter(if data.is_empty() {
        Vec::new()
    } else {
        vec![Ok(data)]
    }))
}

fn empty_stream() -> BodyStream {
    Box::pin(futures_util::stream::empty())
}

fn generate_boundary() -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..24).map(|_| rng.sample(Alphanumeric) as char).collect();
    format!("------------------------{suffix}")
}

fn encode_multipart(parts: &[Part], boundary: &str) -> Bytes {
    let mut out = Vec::new();
    for part in parts {
        out.extend_from_slice(b"--");
        out.extend_from_slice(boundary.as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(b"Content-Disposition: form-data; name=\"");
        out.extend_from_slice(part.name.as_bytes());
        out.push(b'"');
        if let Some(ref filename) = part.filename {
            out.extend_from_slice(b"; filename=\"");
            out.extend_from_slice(filename.as_bytes());
            out.push(b'"');
        }
        out.extend_from_slice(b"\r\n");
        if let Some(ref content_type) = part.content_type {
            out.extend_from_slice(b"Content-Type: ");
            out.extend_from_slice(content_type.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&part.data);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"--");
    out.extend_from_slice(boundary.as_bytes());
    out.extend_from_slice(b"--\r\n");
    Bytes::from(out)
}

/// Minimal application/x-www-form-urlencoded percent encoding.
pub(crate) fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push('+'),
            _ => {
                out.push('%');
                out.push_str(&format!("{byte:02X}"));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn url_encoded_body_defaults() {
        let body = RequestBody::url_encoded(vec![
            ("name".into(), "jo e".into()),
            ("q".into(), "a&b".into()),
        ]);
        let outgoing = body.materialize().await.unwrap();
        assert_eq!(
            outgoing.content_type.as_ref().unwrap(),
            "application/x-www-form-urlencoded; charset=UTF-8"
        );
        let mut stream = outgoing.stream.unwrap();
        let chunk = stream.next().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"name=jo+e&q=a%26b");
        assert_eq!(outgoing.length, BodyLength::Known(17));
    }

    #[tokio::test]
    async fn multipart_body_boundary_in_content_type() {
        let body = RequestBody::multipart(vec![
            Part::new("field", "value"),
            Part::new("file", "data").with_filename("x.bin"),
        ]);
        let outgoing = body.materialize().await.unwrap();
        let content_type = outgoing.content_type.unwrap();
        let content_type = content_type.to_str().unwrap();
        let boundary = content_type
            .strip_prefix("multipart/form-data; boundary=")
            .unwrap()
            .to_owned();
        let mut stream = outgoing.stream.unwrap();
        let chunk = stream.next().await.unwrap().unwrap();
        let text = std::str::from_utf8(&chunk).unwrap();
        assert!(text.starts_with(&format!("--{boundary}\r\n")));
        assert!(text.ends_with(&format!("--{boundary}--\r\n")));
        assert!(text.contains("Content-Disposition: form-data; name=\"file\"; filename=\"x.bin\""));
    }

    #[tokio::test]
    async fn multipart_boundary_completes_caller_content_type() {
        let body = RequestBody::multipart(vec![Part::new("field", "value")]);
        let outgoing = body.materialize().await.unwrap();

        // no caller header: the full default applies
        let default = outgoing.content_type_for(None).unwrap();
        let default = default.to_str().unwrap().to_owned();
        let boundary = default
            .strip_prefix("multipart/form-data; boundary=")
            .unwrap()
            .to_owned();

        // caller-set multipart without a boundary gets it appended
        let bare = HeaderValue::from_static("multipart/form-data");
        let completed = outgoing.content_type_for(Some(&bare)).unwrap();
        assert_eq!(
            completed.to_str().unwrap(),
            format!("multipart/form-data; boundary={boundary}")
        );

        // a caller-supplied boundary stands
        let explicit = HeaderValue::from_static("multipart/form-data; boundary=abc");
        assert!(outgoing.content_type_for(Some(&explicit)).is_none());

        // non-multipart caller values are never touched
        let other = HeaderValue::from_static("application/json");
        assert!(outgoing.content_type_for(Some(&other)).is_none());
    }

    #[tokio::test]
    async fn non_multipart_bodies_never_graft_a_boundary() {
        let body = RequestBody::bytes(Bytes::from_static(b"x"));
        let outgoing = body.materialize().await.unwrap();
        assert!(outgoing.content_type_for(None).is_none());
        let bare = HeaderValue::from_static("multipart/form-data");
        assert!(outgoing.content_type_for(Some(&bare)).is_none());
    }

    #[tokio::test]
    async fn transformer_applies_in_declaration_order() {
        let mut body = RequestBody::bytes(Bytes::from_static(b"a"));
        body.push_transformer(Box::new(|stream| {
            Box::pin(stream.map(|chunk| {
                chunk.map(|bytes| {
                    let mut v = bytes.to_vec();
                    v.push(b'1');
                    Bytes::from(v)
                })
            }))
        }));
        body.push_transformer(Box::new(|stream| {
            Box::pin(stream.map(|chunk| {
                chunk.map(|bytes| {
                    let mut v = bytes.to_vec();
                    v.push(b'2');
                    Bytes::from(v)
                })
            }))
        }));
        let outgoing = body.materialize().await.unwrap();
        assert_eq!(outgoing.length, BodyLength::Unknown);
        let mut stream = outgoing.stream.unwrap();
        let chunk = stream.next().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"a12");
    }
}
