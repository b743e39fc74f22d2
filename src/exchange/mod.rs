//! Exchange lifecycle.
//!
//! An [`Exchange`] is one logical request/response pair, independent of the
//! protocol that ends up carrying it. The caller builds it through the
//! endpoint, optionally mutates the request, then awaits [`Exchange::send`].
//! On the connection side the exchange lives as an [`Inflight`]: request
//! timeout arming, single-shot response emission, disposal with a
//! first-cause-wins error, and idempotent reset.

use std::time::Duration;

use http::header::HeaderMap;
use http::{Extensions, Method, StatusCode, Version};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::trace;

use crate::endpoint::EndpointInner;
use crate::error::{Error, Result};
use crate::pool::ReleaseGuard;

pub mod body;
pub mod request;
pub mod response;

pub use body::{BodyStream, BodyTransform, Part, RequestBody};
pub use request::{PathBuilder, Request};
pub use response::{Response, ResponseBody};

use response::BodySink;

/// A request/response pair bound to an endpoint, not yet dispatched.
pub struct Exchange {
    pub(crate) endpoint: std::sync::Arc<EndpointInner>,
    pub(crate) request: Request,
}

impl Exchange {
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    /// Caller context carried through interceptors and the connection.
    pub fn context_mut(&mut self) -> &mut Extensions {
        self.request.context_mut()
    }

    /// Dispatch the exchange and await the response head.
    ///
    /// The payload keeps streaming through the returned [`Response`];
    /// dropping the response body early resets the underlying stream.
    pub async fn send(self) -> Result<Response> {
        self.endpoint.clone().dispatch(self.request).await
    }
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("request", &self.request)
            .finish()
    }
}

/// What travels from the endpoint to a connection: the finalized request
/// plus the channels the connection reports into.
pub(crate) struct ExchangeTask {
    pub(crate) request: Request,
    pub(crate) response_tx: oneshot::Sender<Result<Response>>,
    pub(crate) guard: Option<ReleaseGuard>,
    pub(crate) request_timeout: Duration,
    pub(crate) decompression_enabled: bool,
}

impl ExchangeTask {
    pub(crate) fn new(
        request: Request,
        request_timeout: Duration,
        decompression_enabled: bool,
    ) -> (Self, oneshot::Receiver<Result<Response>>) {
        let (response_tx, response_rx) = oneshot::channel();
        (
            Self {
                request,
                response_tx,
                guard: None,
                request_timeout,
                decompression_enabled,
            },
            response_rx,
        )
    }

    pub(crate) fn into_inflight(self) -> (Inflight, Request) {
        (
            Inflight {
                response_tx: Some(self.response_tx),
                guard: self.guard,
                deadline: None,
                timeout: self.request_timeout,
                decompression_enabled: self.decompression_enabled,
                cause: None,
                reset: false,
                method: Method::GET,
            },
            self.request,
        )
    }
}

/// Connection-side state of a single exchange.
pub(crate) struct Inflight {
    response_tx: Option<oneshot::Sender<Result<Response>>>,
    guard: Option<ReleaseGuard>,
    deadline: Option<Instant>,
    timeout: Duration,
    decompression_enabled: bool,
    /// First recorded disposal cause; later causes are dropped.
    cause: Option<Error>,
    reset: bool,
    method: Method,
}

impl Inflight {
    /// Arm the request timeout; called when the connection accepts the
    /// exchange and starts serializing its head.
    pub(crate) fn init(&mut self, method: Method) {
        self.method = method;
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.timeout);
        }
    }

    /// The armed deadline, cleared once the response head was emitted.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True while the caller still awaits response headers.
    pub(crate) fn awaits_response(&self) -> bool {
        self.response_tx.is_some()
    }

    /// True when the caller dropped the exchange future before headers.
    pub(crate) fn is_abandoned(&self) -> bool {
        match self.response_tx {
            Some(ref tx) => tx.is_closed(),
            None => false,
        }
    }

    /// Resolves when the caller drops the exchange future before headers;
    /// pending forever once the response was emitted.
    pub(crate) async fn closed_by_caller(&mut self) {
        match self.response_tx {
            Some(ref mut tx) => tx.closed().await,
            None => std::future::pending().await,
        }
    }

    /// Poll variant of [`Self::closed_by_caller`].
    pub(crate) fn poll_abandoned(&mut self, cx: &mut std::task::Context<'_>) -> std::task::Poll<()> {
        match self.response_tx {
            Some(ref mut tx) => tx.poll_closed(cx),
            None => std::task::Poll::Pending,
        }
    }

    pub(crate) fn request_method(&self) -> &Method {
        &self.method
    }

    /// Emit the response head to the caller. Cancels the request timeout.
    ///
    /// Returns the payload sink, or `None` when the caller is gone (the
    /// connection then treats the exchange as canceled).
    pub(crate) fn emit_response(
        &mut self,
        status: StatusCode,
        version: Version,
        headers: HeaderMap,
    ) -> Option<BodySink> {
        self.deadline = None;
        let tx = self.response_tx.take()?;

        let content_encoding = headers
            .get(http::header::CONTENT_ENCODING)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);

        let (mut response, sink) = Response::new(status, version, headers);
        if self.decompression_enabled {
            if let Some(encoding) = content_encoding {
                response.body_mut().push_front_transformer(Box::new(
                    move |stream| crate::decompress::decode(&encoding, stream),
                ));
            }
        }

        match tx.send(Ok(response)) {
            Ok(()) => Some(sink),
            Err(_) => {
                trace!("response emitted to a gone caller");
                None
            }
        }
    }

    /// Record the disposal cause; the first one wins.
    pub(crate) fn record_cause(&mut self, cause: Error) {
        if self.cause.is_none() {
            self.cause = Some(cause);
        }
    }

    /// Mark the exchange reset. Returns false when it already was, making
    /// reset idempotent for the protocol layer.
    pub(crate) fn mark_reset(&mut self) -> bool {
        !std::mem::replace(&mut self.reset, true)
    }

    /// Terminal transition: cancel the timeout, fail the caller when no
    /// response was emitted yet, release the pool allocation.
    pub(crate) fn dispose(&mut self, cause: Option<Error>) {
        if let Some(cause) = cause {
            self.record_cause(cause);
        }
        self.deadline = None;
        if let Some(tx) = self.response_tx.take() {
            let cause = self
                .cause
                .take()
                .unwrap_or_else(|| Error::new_http().with_message("exchange disposed"));
            let _ = tx.send(Err(cause));
        }
        self.guard = None;
    }

    /// Normal completion: the response payload was fully delivered.
    pub(crate) fn complete(&mut self) {
        self.deadline = None;
        self.guard = None;
    }
}

impl Drop for Inflight {
    fn drop(&mut self) {
        // dropping an undisposed exchange counts as disposal
        if self.awaits_response() {
            self.dispose(None);
        }
    }
}
