//! The HTTP/1.x connection task.
//!
//! One task owns the transport. Requests are serialized one at a time;
//! up to `http1_max_concurrent_requests` exchanges may be in flight, and
//! responses are matched to them strictly in FIFO order. A plaintext
//! connection configured for both h2 and http/1.1 offers the h2c upgrade
//! on its first exchange and hands the transport over to the HTTP/2 task
//! when the server switches protocols.

use std::collections::VecDeque;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL;
use bytes::BytesMut;
use futures_util::StreamExt;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{StatusCode, Version};
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::{decode, encode};
use crate::config::{ClientConfig, HttpVersion};
use crate::conn::{ConnCommand, ConnEvents, ConnHandle, ConnKind};
use crate::error::{Error, Result};
use crate::exchange::body::BodyLength;
use crate::exchange::response::BodySink;
use crate::exchange::{ExchangeTask, Inflight};
use crate::pool::UNBOUNDED_CAPACITY;
use crate::proto::h2;
use crate::transport::BoxChannel;

pub(crate) struct Http1Connection;

impl Http1Connection {
    /// Spawn the connection task, returning its handle.
    pub(crate) fn spawn(
        io: BoxChannel,
        config: Arc<ClientConfig>,
        authority: Arc<str>,
        h2c_upgrade: bool,
        events: ConnEvents,
    ) -> ConnHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Conn::new(io, config, authority, h2c_upgrade, events);
        tokio::spawn(conn.run(rx));
        ConnHandle::new(tx, ConnKind::Http1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpgradeState {
    Disabled,
    /// The first exchange will carry the upgrade offer.
    Offer,
    /// The offer went out; no pipelining until the server answers.
    AwaitingResponse,
    /// The server declined; this is a plain h1 connection now.
    Done,
}

enum Phase {
    AwaitingHead,
    Body {
        decoder: decode::BodyDecoder,
        sink: BodySink,
        close_after: bool,
    },
}

struct H1Exchange {
    inflight: Inflight,
    phase: Phase,
}

/// Why the read loop stopped.
enum Flow {
    Continue,
    /// The connection is done for; the pipeline was already failed.
    Closed,
    /// 101 Switching Protocols accepted our h2c offer.
    Upgraded,
}

enum Teardown {
    /// Clean end of life (drained, server close, cancellation).
    Finished,
    /// Fatal error; fail the whole pipeline with it.
    Failed(Error),
    /// Hand the transport to the HTTP/2 task.
    Upgrade { exchange: Inflight },
}

struct Conn {
    io: BoxChannel,
    read_buf: BytesMut,
    config: Arc<ClientConfig>,
    authority: Arc<str>,
    events: ConnEvents,
    pipeline: VecDeque<H1Exchange>,
    accepting: bool,
    close_after_drain: bool,
    upgrade: UpgradeState,
    version: Version,
    max_concurrent: usize,
}

impl Conn {
    fn new(
        io: BoxChannel,
        config: Arc<ClientConfig>,
        authority: Arc<str>,
        h2c_upgrade: bool,
        events: ConnEvents,
    ) -> Self {
        let version = if config.supports(HttpVersion::Http11) {
            Version::HTTP_11
        } else if config.supports(HttpVersion::Http10) {
            Version::HTTP_10
        } else {
            Version::HTTP_11
        };
        let max_concurrent = config
            .http1_max_concurrent_requests
            .unwrap_or(UNBOUNDED_CAPACITY);
        Self {
            io,
            read_buf: BytesMut::with_capacity(8 << 10),
            config,
            authority,
            events,
            pipeline: VecDeque::new(),
            accepting: true,
            close_after_drain: false,
            upgrade: if h2c_upgrade {
                UpgradeState::Offer
            } else {
                UpgradeState::Disabled
            },
            version,
            max_concurrent,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<ConnCommand>) {
        match self.drive(&mut cmd_rx).await {
            Teardown::Finished => {
                self.fail_pipeline(None);
                self.events.closed();
            }
            Teardown::Failed(error) => {
                self.fail_pipeline(Some(error));
                self.events.closed();
            }
            Teardown::Upgrade { exchange } => {
                debug!("h2c upgrade accepted, switching protocols");
                let Self {
                    io,
                    read_buf,
                    config,
                    authority,
                    events,
                    ..
                } = self;
                h2::run_upgraded(io, read_buf, config, authority, events, exchange, cmd_rx).await;
            }
        }
    }

    async fn drive(&mut self, cmd_rx: &mut mpsc::UnboundedReceiver<ConnCommand>) -> Teardown {
        loop {
            if self.pipeline.is_empty() && (!self.accepting || self.close_after_drain) {
                return Teardown::Finished;
            }

            let deadline = self
                .pipeline
                .iter()
                .filter_map(|exchange| exchange.inflight.deadline())
                .min();
            let can_accept = self.accepting
                && !self.close_after_drain
                && self.pipeline.len() < self.max_concurrent
                && !(self.upgrade == UpgradeState::AwaitingResponse);
            let reading = !self.pipeline.is_empty();

            tokio::select! {
                biased;
                command = cmd_rx.recv() => match command {
                    Some(ConnCommand::Exchange(task)) => {
                        // the pool never over-allocates; an exchange that
                        // still arrives while closing is failed right away
                        if !can_accept {
                            let (mut inflight, _request) = task.into_inflight();
                            inflight.dispose(Some(
                                Error::new_http().with_message("connection is closing"),
                            ));
                            continue;
                        }
                        match self.start_exchange(task).await {
                            Ok(()) => {}
                            Err(error) => return Teardown::Failed(error),
                        }
                    }
                    Some(ConnCommand::ShutdownGracefully) => {
                        trace!("draining connection");
                        self.accepting = false;
                    }
                    Some(ConnCommand::Close) | None => return Teardown::Finished,
                },
                read = self.io.read_buf(&mut self.read_buf), if reading => {
                    match read {
                        Ok(0) => match self.handle_eof().await {
                            Flow::Continue | Flow::Closed => return Teardown::Finished,
                            Flow::Upgraded => unreachable!("eof does not upgrade"),
                        },
                        Ok(_) => match self.process_read().await {
                            Ok(Flow::Continue) => {}
                            Ok(Flow::Closed) => return Teardown::Finished,
                            Ok(Flow::Upgraded) => {
                                let front = self
                                    .pipeline
                                    .pop_front()
                                    .expect("upgrade resolves the head exchange");
                                return Teardown::Upgrade {
                                    exchange: front.inflight,
                                };
                            }
                            Err(error) => {
                                // read-side protocol error: the head-of-line
                                // exchange takes the cause, the rest see a
                                // closed connection
                                if let Some(mut front) = self.pipeline.pop_front() {
                                    Self::fail_exchange(&mut front, error);
                                }
                                return Teardown::Finished;
                            }
                        },
                        Err(error) => {
                            if let Some(mut front) = self.pipeline.pop_front() {
                                Self::fail_exchange(&mut front, Error::new_io(error));
                            }
                            return Teardown::Finished;
                        }
                    }
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    warn!("request timed out awaiting response headers");
                    let now = Instant::now();
                    // expired exchanges fail with the timeout, the rest ride
                    // the connection down
                    for exchange in self.pipeline.iter_mut() {
                        if exchange.inflight.deadline().is_some_and(|at| at <= now) {
                            exchange.inflight.record_cause(Error::new_timeout());
                        }
                    }
                    return Teardown::Finished;
                },
                _ = Self::head_canceled(&mut self.pipeline) => {
                    // caller abandoned the head-of-line exchange: on h1 the
                    // only way out is closing the connection
                    trace!("head-of-line exchange canceled by caller");
                    if let Some(mut front) = self.pipeline.pop_front() {
                        Self::fail_exchange(&mut front, Error::new_cancelled());
                    }
                    return Teardown::Finished;
                },
            }
        }
    }

    /// Resolves when the caller of the head-of-line exchange goes away.
    async fn head_canceled(pipeline: &mut VecDeque<H1Exchange>) {
        match pipeline.front_mut() {
            Some(exchange) => match exchange.phase {
                Phase::AwaitingHead => exchange.inflight.closed_by_caller().await,
                Phase::Body { ref sink, .. } => sink.closed().await,
            },
            None => std::future::pending().await,
        }
    }

    async fn start_exchange(&mut self, task: ExchangeTask) -> Result<()> {
        let (mut inflight, mut request) = task.into_inflight();
        if inflight.is_abandoned() {
            inflight.dispose(Some(Error::new_cancelled()));
            return Ok(());
        }

        let offering_upgrade = self.upgrade == UpgradeState::Offer;

        inflight.init(request.method().clone());
        request.mark_sent();

        let method = request.method().clone();
        let target = request.path().request_target();
        let body = request.take_body();
        let outgoing = match body.materialize().await {
            Ok(outgoing) => outgoing,
            Err(error) => {
                // the request never touched the wire; only this exchange fails
                inflight.dispose(Some(error));
                return Ok(());
            }
        };

        // compose the outbound header block
        let mut headers = HeaderMap::new();
        if !request.headers().contains_key(header::HOST) && self.version != Version::HTTP_10 {
            headers.insert(
                header::HOST,
                HeaderValue::from_str(&self.authority)
                    .map_err(|err| Error::new_http().with(err))?,
            );
        }
        for (name, value) in request.headers().iter() {
            headers.append(name.clone(), value.clone());
        }
        if !headers.contains_key(header::USER_AGENT) {
            headers.insert(
                header::USER_AGENT,
                HeaderValue::from_str(&self.config.user_agent)
                    .map_err(|err| Error::new_http().with(err))?,
            );
        }
        if self.config.decompression_enabled && !headers.contains_key(header::ACCEPT_ENCODING) {
            headers.insert(
                header::ACCEPT_ENCODING,
                HeaderValue::from_static(crate::decompress::ACCEPTED_ENCODINGS),
            );
        }
        // body-derived content type: the default when the caller set none,
        // or a caller-supplied multipart value completed with the boundary
        if let Some(content_type) = outgoing.content_type_for(headers.get(header::CONTENT_TYPE)) {
            headers.insert(header::CONTENT_TYPE, content_type);
        }
        let chunked = match outgoing.length {
            BodyLength::None => false,
            BodyLength::Known(length) => {
                if !headers.contains_key(header::CONTENT_LENGTH) {
                    let mut buffer = itoa::Buffer::new();
                    headers.insert(
                        header::CONTENT_LENGTH,
                        HeaderValue::from_str(buffer.format(length))
                            .map_err(|err| Error::new_http().with(err))?,
                    );
                }
                false
            }
            BodyLength::Unknown => {
                if self.version == Version::HTTP_10 {
                    // never written: the upgrade offer stays available
                    inflight.dispose(Some(Error::new_http().with_message(
                        "HTTP/1.0 request requires a known body length",
                    )));
                    return Ok(());
                }
                headers.insert(
                    header::TRANSFER_ENCODING,
                    HeaderValue::from_static("chunked"),
                );
                true
            }
        };
        if offering_upgrade {
            headers.insert(
                header::CONNECTION,
                HeaderValue::from_static("upgrade, http2-settings"),
            );
            headers.insert(header::UPGRADE, HeaderValue::from_static("h2c"));
            let settings = h2::frame::Settings::from_config(&self.config);
            headers.insert(
                HeaderName::from_static("http2-settings"),
                HeaderValue::from_str(&BASE64_URL.encode(settings.payload()))
                    .map_err(|err| Error::new_http().with(err))?,
            );
            self.upgrade = UpgradeState::AwaitingResponse;
        }

        let mut write_buf = BytesMut::with_capacity(256);
        encode::encode_head(&mut write_buf, &method, &target, self.version, &headers);
        trace!(method = %method, target = %target, "write request head");
        if let Err(error) = self.io.write_all(&write_buf).await {
            inflight.dispose(Some(Error::new_io(error)));
            return Err(Error::new_http().with_message("request head write failed"));
        }

        // stream the payload; a failure mid-body leaves the protocol state
        // unrecoverable, so it rides the connection down
        if let Some(mut stream) = outgoing.stream {
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(error) => {
                        inflight.dispose(Some(error));
                        return Err(Error::new_http()
                            .with_message("request body stream failed mid-write"));
                    }
                };
                if chunk.is_empty() {
                    continue;
                }
                let result = if chunked {
                    let mut framed = BytesMut::with_capacity(chunk.len() + 16);
                    encode::encode_chunk(&mut framed, &chunk);
                    self.io.write_all(&framed).await
                } else {
                    self.io.write_all(&chunk).await
                };
                if let Err(error) = result {
                    inflight.dispose(Some(Error::new_io(error)));
                    return Err(Error::new_http().with_message("request body write failed"));
                }
            }
            if chunked {
                let mut last = BytesMut::with_capacity(5);
                encode::encode_last_chunk(&mut last);
                if let Err(error) = self.io.write_all(&last).await {
                    inflight.dispose(Some(Error::new_io(error)));
                    return Err(Error::new_http().with_message("request body write failed"));
                }
            }
        }
        if let Err(error) = self.io.flush().await {
            inflight.dispose(Some(Error::new_io(error)));
            return Err(Error::new_http().with_message("request flush failed"));
        }

        self.pipeline.push_back(H1Exchange {
            inflight,
            phase: Phase::AwaitingHead,
        });
        Ok(())
    }

    async fn process_read(&mut self) -> Result<Flow> {
        loop {
            let Some(front) = self.pipeline.front_mut() else {
                if self.read_buf.is_empty() {
                    return Ok(Flow::Continue);
                }
                return Err(Error::new_http()
                    .with_message("received bytes with no outstanding exchange"));
            };

            match front.phase {
                Phase::AwaitingHead => {
                    let Some(head) = decode::parse_head(&mut self.read_buf)? else {
                        return Ok(Flow::Continue);
                    };

                    if self.upgrade == UpgradeState::AwaitingResponse {
                        if head.status == StatusCode::SWITCHING_PROTOCOLS {
                            let upgraded_to_h2c = head
                                .headers
                                .get(header::UPGRADE)
                                .and_then(|value| value.to_str().ok())
                                .is_some_and(|value| value.eq_ignore_ascii_case("h2c"));
                            if !upgraded_to_h2c {
                                return Err(Error::new_upgrade().with_message(
                                    "101 response switched to an unexpected protocol",
                                ));
                            }
                            return Ok(Flow::Upgraded);
                        }
                        // anything else: continue as http/1.1, open up pipelining
                        debug!(status = %head.status, "h2c upgrade declined");
                        self.upgrade = UpgradeState::Done;
                        self.events.capacity_changed(self.max_concurrent);
                    }

                    if head.status.is_informational()
                        && head.status != StatusCode::SWITCHING_PROTOCOLS
                    {
                        trace!(status = %head.status, "skipping interim response");
                        continue;
                    }
                    if head.status == StatusCode::SWITCHING_PROTOCOLS {
                        return Err(Error::new_http()
                            .with_message("unsolicited 101 switching protocols"));
                    }

                    let kind = decode::body_kind(front.inflight.request_method(), &head)?;
                    let close = head.close;
                    match front.inflight.emit_response(head.status, head.version, head.headers)
                    {
                        Some(sink) => {
                            front.phase = Phase::Body {
                                decoder: decode::BodyDecoder::new(kind),
                                sink,
                                close_after: close,
                            };
                            if close {
                                self.close_after_drain = true;
                            }
                        }
                        None => {
                            // caller gone before headers: cancellation on h1
                            // closes the connection
                            let mut front = self.pipeline.pop_front().expect("head exists");
                            Self::fail_exchange(&mut front, Error::new_cancelled());
                            self.fail_pipeline(None);
                            return Ok(Flow::Closed);
                        }
                    }
                }
                Phase::Body {
                    ref mut decoder,
                    ref sink,
                    close_after,
                } => match decoder.decode(&mut self.read_buf)? {
                    decode::Decoded::Data(chunk) => {
                        if sink.data(chunk).await.is_err() {
                            // consumer dropped the body: reset by closing
                            let mut front = self.pipeline.pop_front().expect("head exists");
                            Self::fail_exchange(&mut front, Error::new_cancelled());
                            self.fail_pipeline(None);
                            return Ok(Flow::Closed);
                        }
                    }
                    decode::Decoded::NeedMore => return Ok(Flow::Continue),
                    decode::Decoded::Finished(trailers) => {
                        if let Some(trailers) = trailers {
                            let _ = sink.trailers(trailers).await;
                        }
                        let mut front = self.pipeline.pop_front().expect("head exists");
                        front.inflight.complete();
                        trace!("exchange completed");
                        if close_after {
                            self.fail_pipeline(None);
                            return Ok(Flow::Closed);
                        }
                    }
                },
            }
        }
    }

    async fn handle_eof(&mut self) -> Flow {
        if let Some(front) = self.pipeline.front_mut() {
            let finished = match front.phase {
                Phase::Body {
                    ref mut decoder, ..
                } => decoder.finish_on_eof(),
                Phase::AwaitingHead => {
                    Err(Error::new_http()
                        .with_message("connection closed before message completed"))
                }
            };
            let mut front = self.pipeline.pop_front().expect("head exists");
            match finished {
                Ok(trailers) => {
                    if let Phase::Body { ref sink, .. } = front.phase {
                        if let Some(trailers) = trailers {
                            let _ = sink.trailers(trailers).await;
                        }
                    }
                    front.inflight.complete();
                }
                Err(error) => Self::fail_exchange(&mut front, error),
            }
        }
        self.fail_pipeline(None);
        Flow::Closed
    }

    /// Fail a single exchange, routing the error through the response
    /// oneshot or the body sink depending on how far it got.
    fn fail_exchange(exchange: &mut H1Exchange, error: Error) {
        match exchange.phase {
            Phase::AwaitingHead => exchange.inflight.dispose(Some(error)),
            Phase::Body { ref sink, .. } => {
                sink.try_error(error);
                exchange.inflight.complete();
            }
        }
    }

    /// Fail everything still queued. The head takes `cause` when given;
    /// the rest observe a generic closed-connection error.
    fn fail_pipeline(&mut self, cause: Option<Error>) {
        let mut cause = cause;
        while let Some(mut exchange) = self.pipeline.pop_front() {
            let error = cause
                .take()
                .unwrap_or_else(|| Error::new_http().with_message("connection closed"));
            Self::fail_exchange(&mut exchange, error);
        }
    }
}
