//! Inbound response: head, streaming payload and trailers.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use futures_util::StreamExt;
use http::header::HeaderMap;
use http::{StatusCode, Version};
use tokio::sync::mpsc;

use super::body::{BodyStream, BodyTransform};
use crate::error::{Error, Result};

/// Capacity of the per-body chunk channel. One chunk in flight couples the
/// connection's read loop to consumer demand.
const BODY_CHANNEL_CAPACITY: usize = 1;

pub(crate) enum BodyEvent {
    Data(Bytes),
    Trailers(HeaderMap),
}

/// Producer half of a response payload, owned by the connection task.
#[derive(Clone)]
pub(crate) struct BodySink {
    tx: mpsc::Sender<Result<BodyEvent>>,
}

/// The consumer vanished: it dropped the response body without reading it
/// to the end. The connection reacts by resetting the exchange.
#[derive(Debug)]
pub(crate) struct SinkClosed;

impl BodySink {
    pub(crate) async fn data(&self, chunk: Bytes) -> std::result::Result<(), SinkClosed> {
        self.tx
            .send(Ok(BodyEvent::Data(chunk)))
            .await
            .map_err(|_| SinkClosed)
    }

    pub(crate) async fn trailers(&self, trailers: HeaderMap) -> std::result::Result<(), SinkClosed> {
        self.tx
            .send(Ok(BodyEvent::Trailers(trailers)))
            .await
            .map_err(|_| SinkClosed)
    }

    /// Fail the payload; the error surfaces from the consumer's stream.
    /// Best effort: a full or closed channel means the consumer either
    /// stopped reading or is about to observe the closed connection.
    pub(crate) fn try_error(&self, error: Error) {
        let _ = self.tx.try_send(Err(error));
    }

    /// Resolves once the consumer is gone.
    pub(crate) async fn closed(&self) {
        self.tx.closed().await
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

enum BodyState {
    /// Not yet polled; transformers may still be layered on.
    Channel(mpsc::Receiver<Result<BodyEvent>>),
    /// First poll happened, transformers are applied.
    Streaming(BodyStream),
    Done,
}

/// Streaming response payload.
///
/// The payload can be consumed at most once. Dropping it before the end
/// cancels the underlying exchange. Trailers become visible once the
/// stream has completed.
pub struct ResponseBody {
    state: BodyState,
    trailers: Arc<Mutex<Option<HeaderMap>>>,
    transformers: Vec<BodyTransform>,
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            BodyState::Channel(_) => "pending",
            BodyState::Streaming(_) => "streaming",
            BodyState::Done => "done",
        };
        f.debug_struct("ResponseBody")
            .field("state", &state)
            .field("transformers", &self.transformers.len())
            .finish()
    }
}

pin_project_lite::pin_project! {
    struct RawBody {
        rx: mpsc::Receiver<Result<BodyEvent>>,
        trailers: Arc<Mutex<Option<HeaderMap>>>,
    }
}

impl Stream for RawBody {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        loop {
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(Ok(BodyEvent::Data(chunk)))) => {
                    return Poll::Ready(Some(Ok(chunk)));
                }
                Poll::Ready(Some(Ok(BodyEvent::Trailers(trailers)))) => {
                    *this.trailers.lock().unwrap() = Some(trailers);
                    // the sender drops right after trailers; loop to observe EOF
                }
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Some(Err(err))),
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl ResponseBody {
    fn channel() -> (Self, BodySink) {
        let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        (
            Self {
                state: BodyState::Channel(rx),
                trailers: Arc::new(Mutex::new(None)),
                transformers: Vec::new(),
            },
            BodySink { tx },
        )
    }

    /// Layer a payload transformer, applied at first poll in declaration
    /// order. Fails once the payload is being consumed.
    pub fn transform(&mut self, transform: BodyTransform) -> Result<&mut Self> {
        match self.state {
            BodyState::Channel(_) => {
                self.transformers.push(transform);
                Ok(self)
            }
            _ => Err(Error::new_http().with_message("response body already subscribed")),
        }
    }

    pub(crate) fn push_front_transformer(&mut self, transform: BodyTransform) {
        self.transformers.insert(0, transform);
    }

    /// Trailing headers; `None` until the payload stream completed.
    pub fn trailers(&self) -> Option<HeaderMap> {
        self.trailers.lock().unwrap().clone()
    }

    /// Collect the whole payload.
    pub async fn aggregate(&mut self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl Stream for ResponseBody {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match self.state {
                BodyState::Channel(_) => {
                    let BodyState::Channel(rx) =
                        std::mem::replace(&mut self.state, BodyState::Done)
                    else {
                        unreachable!()
                    };
                    let mut stream: BodyStream = Box::pin(RawBody {
                        rx,
                        trailers: self.trailers.clone(),
                    });
                    for transform in self.transformers.drain(..) {
                        stream = transform(stream);
                    }
                    self.state = BodyState::Streaming(stream);
                }
                BodyState::Streaming(ref mut stream) => {
                    return match std::task::ready!(stream.as_mut().poll_next(cx)) {
                        Some(item) => Poll::Ready(Some(item)),
                        None => {
                            self.state = BodyState::Done;
                            Poll::Ready(None)
                        }
                    };
                }
                BodyState::Done => return Poll::Ready(None),
            }
        }
    }
}

/// An inbound response: status, headers and the streaming payload.
pub struct Response {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: ResponseBody,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .finish()
    }
}

impl Response {
    pub(crate) fn new(
        status: StatusCode,
        version: Version,
        headers: HeaderMap,
    ) -> (Self, BodySink) {
        let (body, sink) = ResponseBody::channel();
        (
            Self {
                status,
                version,
                headers,
                body,
            },
            sink,
        )
    }

    /// A response that never touched the wire, e.g. synthesized by an
    /// interceptor.
    pub(crate) fn synthetic(
        status: StatusCode,
        headers: HeaderMap,
        payload: Bytes,
    ) -> Self {
        let (response, sink) = Self::new(status, Version::HTTP_11, headers);
        if !payload.is_empty() {
            // capacity is 1: the single chunk always fits, EOF follows on drop
            let _ = sink.tx.try_send(Ok(BodyEvent::Data(payload)));
        }
        response
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }

    /// Cookies set by the endpoint, raw `Set-Cookie` values.
    pub fn set_cookies(&self) -> impl Iterator<Item = &http::HeaderValue> {
        self.headers.get_all(http::header::SET_COOKIE).iter()
    }

    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut ResponseBody {
        &mut self.body
    }

    pub fn into_body(self) -> ResponseBody {
        self.body
    }

    /// Trailing headers; `None` until the payload completed.
    pub fn trailers(&self) -> Option<HeaderMap> {
        self.body.trailers()
    }

    /// Collect the whole payload.
    pub async fn into_bytes(mut self) -> Result<Bytes> {
        self.body.aggregate().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn body_streams_and_surfaces_trailers() {
        let (mut response, sink) =
            Response::new(StatusCode::OK, Version::HTTP_2, HeaderMap::new());
        let producer = tokio::spawn(async move {
            sink.data(Bytes::from_static(b"hel")).await.unwrap();
            sink.data(Bytes::from_static(b"lo")).await.unwrap();
            let mut trailers = HeaderMap::new();
            trailers.insert("x-check", "ok".parse().unwrap());
            sink.trailers(trailers).await.unwrap();
        });

        assert!(response.trailers().is_none());
        let data = response.body_mut().aggregate().await.unwrap();
        assert_eq!(&data[..], b"hello");
        assert_eq!(response.trailers().unwrap().get("x-check").unwrap(), "ok");
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn transform_applies_before_consumption() {
        let (mut response, sink) =
            Response::new(StatusCode::OK, Version::HTTP_11, HeaderMap::new());
        response
            .body_mut()
            .transform(Box::new(|stream| {
                Box::pin(stream.map(|chunk| {
                    chunk.map(|bytes| {
                        Bytes::from(bytes.iter().map(u8::to_ascii_uppercase).collect::<Vec<_>>())
                    })
                }))
            }))
            .unwrap();
        tokio::spawn(async move {
            sink.data(Bytes::from_static(b"quiet")).await.unwrap();
        });
        let data = response.into_bytes().await.unwrap();
        assert_eq!(&data[..], b"QUIET");
    }

    #[tokio::test]
    async fn dropping_body_closes_sink() {
        let (response, sink) = Response::new(StatusCode::OK, Version::HTTP_11, HeaderMap::new());
        drop(response);
        sink.closed().await;
        assert!(sink.is_closed());
    }

    #[tokio::test]
    async fn synthetic_response_delivers_payload() {
        let response =
            Response::synthetic(StatusCode::IM_A_TEAPOT, HeaderMap::new(), Bytes::from_static(b"teapot"));
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        let data = response.into_bytes().await.unwrap();
        assert_eq!(&data[..], b"teapot");
    }
}
