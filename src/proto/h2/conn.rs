//! The HTTP/2 connection task.
//!
//! One task owns the transport and every stream on it. Exchanges map to
//! client-initiated streams with monotonically increasing odd ids; request
//! payloads are interleaved under connection- and stream-level flow
//! control; SETTINGS updates feed the effective concurrency back into the
//! pool through [`ConnEvents::capacity_changed`].

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use fnv::FnvHashMap;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{StatusCode, Version};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::flow::FlowControl;
use super::frame::{self, ErrorCode, Frame, Settings};
use super::hpack;
use crate::config::ClientConfig;
use crate::conn::{ConnCommand, ConnEvents, ConnHandle, ConnKind};
use crate::error::{Error, Result};
use crate::exchange::body::{BodyLength, BodyStream};
use crate::exchange::response::BodySink;
use crate::exchange::{ExchangeTask, Inflight};
use crate::transport::BoxChannel;

pub(crate) struct Http2Connection;

impl Http2Connection {
    /// Spawn the connection task, returning its handle.
    pub(crate) fn spawn(
        io: BoxChannel,
        config: Arc<ClientConfig>,
        authority: Arc<str>,
        scheme: &'static str,
        events: ConnEvents,
    ) -> ConnHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Conn::new(io, BytesMut::new(), config, authority, scheme, events);
        tokio::spawn(async move {
            conn.run(rx, None).await;
        });
        ConnHandle::new(tx, ConnKind::Http2)
    }
}

/// Continue an h2c-upgraded connection: the transport just finished the
/// HTTP/1.1 exchange that carried the upgrade, and `exchange` is that
/// request, reassigned to stream 1.
pub(crate) async fn run_upgraded(
    io: BoxChannel,
    read_buf: BytesMut,
    config: Arc<ClientConfig>,
    authority: Arc<str>,
    events: ConnEvents,
    exchange: Inflight,
    cmd_rx: mpsc::UnboundedReceiver<ConnCommand>,
) {
    let conn = Conn::new(io, read_buf, config, authority, "http", events);
    conn.run(cmd_rx, Some(exchange)).await;
}

struct PeerSettings {
    initial_window_size: u32,
    max_frame_size: u32,
    max_concurrent_streams: Option<u32>,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            initial_window_size: frame::DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: frame::DEFAULT_MAX_FRAME_SIZE,
            max_concurrent_streams: None,
        }
    }
}

enum RecvPhase {
    AwaitingHeaders,
    Body { sink: BodySink },
}

struct OutBody {
    stream: BodyStream,
    buffered: Option<Bytes>,
    finished: bool,
}

struct StreamSlot {
    inflight: Inflight,
    recv: RecvPhase,
    send_flow: FlowControl,
    body: Option<OutBody>,
    cancel: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
}

impl StreamSlot {
    fn poll_canceled(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        match self.recv {
            RecvPhase::AwaitingHeaders => self.inflight.poll_abandoned(cx),
            RecvPhase::Body { .. } => match self.cancel {
                Some(ref mut fut) => fut.as_mut().poll(cx),
                None => Poll::Pending,
            },
        }
    }
}

/// What the stream poller wants the connection to do next.
enum StreamEvent {
    Canceled(u32),
    WriteBody(u32),
    EndBody(u32),
    BodyFailed(u32, Error),
}

struct PartialHeaders {
    stream_id: u32,
    end_stream: bool,
    fragment: BytesMut,
}

enum Flow {
    Continue,
    Closed(Option<Error>),
}

struct Conn {
    io: BoxChannel,
    read_buf: BytesMut,
    config: Arc<ClientConfig>,
    authority: Arc<str>,
    scheme: &'static str,
    events: ConnEvents,
    encoder: hpack::Encoder,
    decoder: hpack::Decoder,
    streams: FnvHashMap<u32, StreamSlot>,
    next_stream_id: u32,
    send_flow: FlowControl,
    peer: PeerSettings,
    partial_headers: Option<PartialHeaders>,
    accepting: bool,
    draining: bool,
}

impl Conn {
    fn new(
        io: BoxChannel,
        read_buf: BytesMut,
        config: Arc<ClientConfig>,
        authority: Arc<str>,
        scheme: &'static str,
        events: ConnEvents,
    ) -> Self {
        let decoder = hpack::Decoder::new(config.http2_header_table_size);
        Self {
            io,
            read_buf,
            config,
            authority,
            scheme,
            events,
            encoder: hpack::Encoder::new(),
            decoder,
            streams: FnvHashMap::default(),
            next_stream_id: 1,
            send_flow: FlowControl::new(frame::DEFAULT_INITIAL_WINDOW_SIZE),
            peer: PeerSettings::default(),
            partial_headers: None,
            accepting: true,
            draining: false,
        }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<ConnCommand>,
        upgraded: Option<Inflight>,
    ) {
        // connection preface and our SETTINGS open every h2 connection,
        // prior-knowledge and upgraded alike
        let mut buf = BytesMut::with_capacity(64);
        buf.extend_from_slice(frame::PREFACE);
        Settings::from_config(&self.config).encode(&mut buf);
        if let Err(error) = self.io.write_all(&buf).await {
            self.fail_all(Error::new_io(error));
            self.events.closed();
            return;
        }
        let _ = self.io.flush().await;

        if let Some(mut inflight) = upgraded {
            // the upgraded request went out over h1 in full: stream 1,
            // half closed on our side
            if inflight.is_abandoned() {
                let _ = self.write_reset(1, ErrorCode::CANCEL).await;
                inflight.dispose(Some(Error::new_cancelled()));
            } else {
                self.streams.insert(
                    1,
                    StreamSlot {
                        inflight,
                        recv: RecvPhase::AwaitingHeaders,
                        send_flow: FlowControl::new(self.peer.initial_window_size),
                        body: None,
                        cancel: None,
                    },
                );
            }
            self.next_stream_id = 3;
            // the h2c slot was capped at one exchange; lift it
            self.events
                .capacity_changed(self.config.http2_max_concurrent_streams as usize);
        }

        let error = self.drive(&mut cmd_rx).await;
        self.fail_all(
            error.unwrap_or_else(|| Error::new_http().with_message("connection closed")),
        );
        self.events.closed();
    }

    async fn drive(&mut self, cmd_rx: &mut mpsc::UnboundedReceiver<ConnCommand>) -> Option<Error> {
        loop {
            if self.draining && self.streams.is_empty() {
                return None;
            }

            let deadline = self
                .streams
                .values()
                .filter_map(|slot| slot.inflight.deadline())
                .min();

            tokio::select! {
                biased;
                command = cmd_rx.recv() => match command {
                    Some(ConnCommand::Exchange(task)) => {
                        if let Err(error) = self.start_stream(task).await {
                            return Some(error);
                        }
                    }
                    Some(ConnCommand::ShutdownGracefully) => {
                        trace!("draining h2 connection");
                        self.draining = true;
                        self.accepting = false;
                    }
                    Some(ConnCommand::Close) | None => return None,
                },
                read = self.io.read_buf(&mut self.read_buf) => match read {
                    Ok(0) => {
                        return Some(
                            Error::new_http()
                                .with_message("connection closed before message completed"),
                        );
                    }
                    Ok(_) => match self.process_frames().await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Closed(error)) => return error,
                        Err(error) => return Some(error),
                    },
                    Err(error) => return Some(Error::new_io(error)),
                },
                event = Self::poll_streams(&mut self.streams, &self.send_flow) => {
                    if let Err(error) = self.handle_stream_event(event).await {
                        return Some(error);
                    }
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Err(error) = self.expire_streams().await {
                        return Some(error);
                    }
                },
            }
        }
    }

    /// Single poller over all streams: caller cancellations and writable
    /// request payloads. Registered wakers come from the body streams and
    /// the response channels; window unblocking rides the read arm.
    fn poll_streams<'a>(
        streams: &'a mut FnvHashMap<u32, StreamSlot>,
        conn_flow: &'a FlowControl,
    ) -> impl Future<Output = StreamEvent> + 'a {
        std::future::poll_fn(move |cx| {
            for (&id, slot) in streams.iter_mut() {
                if slot.poll_canceled(cx).is_ready() {
                    return Poll::Ready(StreamEvent::Canceled(id));
                }

                let Some(body) = slot.body.as_mut() else {
                    continue;
                };
                loop {
                    if body.buffered.is_some() {
                        let writable = conn_flow
                            .available()
                            .min(slot.send_flow.available());
                        if writable == 0 {
                            break;
                        }
                        return Poll::Ready(StreamEvent::WriteBody(id));
                    }
                    if body.finished {
                        break;
                    }
                    match body.stream.as_mut().poll_next(cx) {
                        Poll::Ready(Some(Ok(chunk))) => {
                            if chunk.is_empty() {
                                continue;
                            }
                            body.buffered = Some(chunk);
                        }
                        Poll::Ready(Some(Err(error))) => {
                            return Poll::Ready(StreamEvent::BodyFailed(id, error));
                        }
                        Poll::Ready(None) => {
                            body.finished = true;
                            return Poll::Ready(StreamEvent::EndBody(id));
                        }
                        Poll::Pending => break,
                    }
                }
            }
            Poll::Pending
        })
    }

    async fn handle_stream_event(&mut self, event: StreamEvent) -> Result<()> {
        match event {
            StreamEvent::Canceled(id) => {
                trace!(stream.id = id, "exchange canceled by caller");
                self.write_reset(id, ErrorCode::CANCEL).await?;
                if let Some(mut slot) = self.streams.remove(&id) {
                    slot.inflight.mark_reset();
                    slot.inflight.dispose(Some(Error::new_cancelled()));
                }
            }
            StreamEvent::WriteBody(id) => {
                let Some(slot) = self.streams.get_mut(&id) else {
                    return Ok(());
                };
                let Some(body) = slot.body.as_mut() else {
                    return Ok(());
                };
                let Some(chunk) = body.buffered.take() else {
                    return Ok(());
                };
                let writable = self
                    .send_flow
                    .available()
                    .min(slot.send_flow.available())
                    .min(self.peer.max_frame_size as usize);
                let take = chunk.len().min(writable);
                if take == 0 {
                    body.buffered = Some(chunk);
                    return Ok(());
                }
                let now = chunk.slice(..take);
                if take < chunk.len() {
                    body.buffered = Some(chunk.slice(take..));
                }

                let mut buf = BytesMut::with_capacity(take + frame::FRAME_HEADER_LEN);
                frame::encode_data(&mut buf, id, &now, false);
                slot.send_flow.consume(take);
                self.send_flow.consume(take);
                self.write(&buf).await?;
            }
            StreamEvent::EndBody(id) => {
                let Some(slot) = self.streams.get_mut(&id) else {
                    return Ok(());
                };
                slot.body = None;
                let mut buf = BytesMut::with_capacity(frame::FRAME_HEADER_LEN);
                frame::encode_data(&mut buf, id, b"", true);
                self.write(&buf).await?;
                trace!(stream.id = id, "request payload complete");
            }
            StreamEvent::BodyFailed(id, error) => {
                warn!(stream.id = id, error = %error, "request payload stream failed");
                self.write_reset(id, ErrorCode::INTERNAL_ERROR).await?;
                if let Some(mut slot) = self.streams.remove(&id) {
                    slot.inflight.dispose(Some(error));
                }
            }
        }
        Ok(())
    }

    async fn expire_streams(&mut self) -> Result<()> {
        let now = Instant::now();
        let expired: Vec<u32> = self
            .streams
            .iter()
            .filter(|(_, slot)| slot.inflight.deadline().is_some_and(|at| at <= now))
            .map(|(&id, _)| id)
            .collect();
        for id in expired {
            warn!(stream.id = id, "request timed out awaiting response headers");
            self.write_reset(id, ErrorCode::CANCEL).await?;
            if let Some(mut slot) = self.streams.remove(&id) {
                slot.inflight.mark_reset();
                slot.inflight.dispose(Some(Error::new_timeout()));
            }
        }
        Ok(())
    }

    async fn start_stream(&mut self, task: ExchangeTask) -> Result<()> {
        let (mut inflight, mut request) = task.into_inflight();
        if !self.accepting {
            inflight.dispose(Some(Error::new_http().with_message("connection is closing")));
            return Ok(());
        }
        if inflight.is_abandoned() {
            inflight.dispose(Some(Error::new_cancelled()));
            return Ok(());
        }

        inflight.init(request.method().clone());
        request.mark_sent();

        let method = request.method().clone();
        let target = request.path().request_target();
        let body = request.take_body();
        let outgoing = match body.materialize().await {
            Ok(outgoing) => outgoing,
            Err(error) => {
                inflight.dispose(Some(error));
                return Ok(());
            }
        };

        let stream_id = self.next_stream_id;
        self.next_stream_id += 2;

        // header list: pseudo-headers lead, connection-specific fields drop
        let mut fields: Vec<(Bytes, Bytes)> = Vec::with_capacity(request.headers().len() + 8);
        fields.push((
            Bytes::from_static(b":method"),
            Bytes::copy_from_slice(method.as_str().as_bytes()),
        ));
        fields.push((
            Bytes::from_static(b":scheme"),
            Bytes::from_static(self.scheme.as_bytes()),
        ));
        fields.push((
            Bytes::from_static(b":authority"),
            Bytes::copy_from_slice(self.authority.as_bytes()),
        ));
        fields.push((
            Bytes::from_static(b":path"),
            Bytes::copy_from_slice(target.as_bytes()),
        ));
        // body-derived content type: the default when the caller set none,
        // or a caller-supplied multipart value completed with the boundary
        let content_type =
            outgoing.content_type_for(request.headers().get("content-type"));

        let mut saw_user_agent = false;
        let mut saw_accept_encoding = false;
        let mut saw_content_length = false;
        for (name, value) in request.headers().iter() {
            // connection-specific fields do not survive onto h2
            if matches!(
                name.as_str(),
                "connection" | "host" | "transfer-encoding" | "upgrade" | "keep-alive"
                    | "proxy-connection"
            ) {
                continue;
            }
            // replaced below when the body supplies or completes it
            if name.as_str() == "content-type" && content_type.is_some() {
                continue;
            }
            saw_user_agent |= name.as_str() == "user-agent";
            saw_accept_encoding |= name.as_str() == "accept-encoding";
            saw_content_length |= name.as_str() == "content-length";
            fields.push((
                Bytes::copy_from_slice(name.as_str().as_bytes()),
                Bytes::copy_from_slice(value.as_bytes()),
            ));
        }
        if !saw_user_agent {
            fields.push((
                Bytes::from_static(b"user-agent"),
                Bytes::copy_from_slice(self.config.user_agent.as_bytes()),
            ));
        }
        if self.config.decompression_enabled && !saw_accept_encoding {
            fields.push((
                Bytes::from_static(b"accept-encoding"),
                Bytes::from_static(crate::decompress::ACCEPTED_ENCODINGS.as_bytes()),
            ));
        }
        if let Some(ref content_type) = content_type {
            fields.push((
                Bytes::from_static(b"content-type"),
                Bytes::copy_from_slice(content_type.as_bytes()),
            ));
        }
        if let (BodyLength::Known(length), false) = (outgoing.length, saw_content_length) {
            fields.push((
                Bytes::from_static(b"content-length"),
                Bytes::from(length.to_string()),
            ));
        }

        let mut block = BytesMut::with_capacity(128);
        self.encoder.encode(
            fields.iter().map(|(name, value)| (&name[..], &value[..])),
            &mut block,
        );

        let end_stream = outgoing.stream.is_none();
        let mut buf = BytesMut::with_capacity(block.len() + 2 * frame::FRAME_HEADER_LEN);
        frame::encode_headers(
            &mut buf,
            stream_id,
            &block,
            end_stream,
            self.peer.max_frame_size,
        );
        trace!(stream.id = stream_id, method = %method, target = %target, "open stream");
        self.write(&buf).await?;

        self.streams.insert(
            stream_id,
            StreamSlot {
                inflight,
                recv: RecvPhase::AwaitingHeaders,
                send_flow: FlowControl::new(self.peer.initial_window_size),
                body: outgoing.stream.map(|stream| OutBody {
                    stream,
                    buffered: None,
                    finished: false,
                }),
                cancel: None,
            },
        );
        Ok(())
    }

    async fn process_frames(&mut self) -> Result<Flow> {
        loop {
            let Some(frame) = frame::parse(&mut self.read_buf, self.config.http2_max_frame_size)?
            else {
                return Ok(Flow::Continue);
            };

            // a started header block admits only its own continuations
            if let Some(ref partial) = self.partial_headers {
                match frame {
                    Frame::Continuation { stream_id, .. } if stream_id == partial.stream_id => {}
                    _ => {
                        return Err(frame::h2_error(
                            ErrorCode::PROTOCOL_ERROR,
                            "interleaved frames inside a header block",
                        ));
                    }
                }
            }

            match frame {
                Frame::Headers {
                    stream_id,
                    fragment,
                    end_stream,
                    end_headers,
                } => {
                    if end_headers {
                        self.handle_header_block(stream_id, &fragment, end_stream)
                            .await?;
                    } else {
                        self.partial_headers = Some(PartialHeaders {
                            stream_id,
                            end_stream,
                            fragment: BytesMut::from(&fragment[..]),
                        });
                    }
                }
                Frame::Continuation {
                    stream_id,
                    fragment,
                    end_headers,
                } => {
                    let Some(mut partial) = self.partial_headers.take() else {
                        return Err(frame::h2_error(
                            ErrorCode::PROTOCOL_ERROR,
                            "CONTINUATION without a header block",
                        ));
                    };
                    partial.fragment.extend_from_slice(&fragment);
                    if end_headers {
                        let fragment = partial.fragment.freeze();
                        self.handle_header_block(stream_id, &fragment, partial.end_stream)
                            .await?;
                    } else {
                        self.partial_headers = Some(partial);
                    }
                }
                Frame::Data {
                    stream_id,
                    data,
                    end_stream,
                } => {
                    self.handle_data(stream_id, data, end_stream).await?;
                }
                Frame::Reset {
                    stream_id,
                    error_code,
                } => {
                    debug!(stream.id = stream_id, code = %error_code, "stream reset by peer");
                    if let Some(mut slot) = self.streams.remove(&stream_id) {
                        let error = Error::new_http()
                            .with_message(format!("stream reset by peer: {error_code}"));
                        match slot.recv {
                            RecvPhase::Body { ref sink } => {
                                sink.try_error(error);
                                slot.inflight.complete();
                            }
                            RecvPhase::AwaitingHeaders => slot.inflight.dispose(Some(error)),
                        }
                    }
                }
                Frame::Settings { settings, ack } => {
                    if !ack {
                        self.apply_settings(settings)?;
                        let mut buf = BytesMut::with_capacity(frame::FRAME_HEADER_LEN);
                        frame::encode_settings_ack(&mut buf);
                        self.write(&buf).await?;
                    }
                }
                Frame::Ping { payload, ack } => {
                    if !ack {
                        let mut buf = BytesMut::with_capacity(frame::FRAME_HEADER_LEN + 8);
                        frame::encode_ping(&mut buf, payload, true);
                        self.write(&buf).await?;
                    }
                }
                Frame::WindowUpdate {
                    stream_id,
                    increment,
                } => {
                    if increment == 0 {
                        return Err(frame::h2_error(
                            ErrorCode::PROTOCOL_ERROR,
                            "zero window increment",
                        ));
                    }
                    if stream_id == 0 {
                        self.send_flow.expand(increment)?;
                    } else if let Some(slot) = self.streams.get_mut(&stream_id) {
                        slot.send_flow.expand(increment)?;
                    }
                }
                Frame::GoAway {
                    last_stream_id,
                    error_code,
                } => {
                    debug!(last_stream_id, code = %error_code, "GOAWAY received");
                    self.accepting = false;
                    self.draining = true;
                    if error_code != ErrorCode::NO_ERROR {
                        return Ok(Flow::Closed(Some(Error::new_http().with_message(
                            format!("connection torn down by peer: {error_code}"),
                        ))));
                    }
                    // streams the server never processed fail, the rest run out
                    let refused: Vec<u32> = self
                        .streams
                        .keys()
                        .copied()
                        .filter(|id| *id > last_stream_id)
                        .collect();
                    for id in refused {
                        if let Some(mut slot) = self.streams.remove(&id) {
                            slot.inflight.dispose(Some(
                                Error::new_http()
                                    .with_message("stream refused: connection going away"),
                            ));
                        }
                    }
                }
                Frame::PushPromise { .. } => {
                    return Err(frame::h2_error(
                        ErrorCode::PROTOCOL_ERROR,
                        "push is disabled",
                    ));
                }
                Frame::Priority { .. } | Frame::Unknown { .. } => {}
            }
        }
    }

    async fn handle_header_block(
        &mut self,
        stream_id: u32,
        fragment: &[u8],
        end_stream: bool,
    ) -> Result<()> {
        // always decode: the block mutates shared hpack state even when the
        // stream is already gone
        let fields = self.decoder.decode(fragment)?;

        let awaiting_headers = match self.streams.get(&stream_id) {
            Some(slot) => matches!(slot.recv, RecvPhase::AwaitingHeaders),
            None => {
                trace!(stream.id = stream_id, "headers for unknown stream ignored");
                return Ok(());
            }
        };

        if awaiting_headers {
            let mut status = None;
            let mut headers = HeaderMap::with_capacity(fields.len());
            for (name, value) in fields {
                if name.starts_with(b":") {
                    if &name[..] == b":status" {
                        status = std::str::from_utf8(&value)
                            .ok()
                            .and_then(|value| value.parse::<u16>().ok());
                    }
                    continue;
                }
                let name =
                    HeaderName::from_bytes(&name).map_err(|err| Error::new_http().with(err))?;
                let value =
                    HeaderValue::from_bytes(&value).map_err(|err| Error::new_http().with(err))?;
                headers.append(name, value);
            }
            let status = status
                .and_then(|code| StatusCode::from_u16(code).ok())
                .ok_or_else(|| {
                    frame::h2_error(ErrorCode::PROTOCOL_ERROR, "response without :status")
                })?;

            if status.is_informational() {
                trace!(stream.id = stream_id, status = %status, "skipping interim response");
                return Ok(());
            }

            let Some(slot) = self.streams.get_mut(&stream_id) else {
                return Ok(());
            };
            let emitted = slot.inflight.emit_response(status, Version::HTTP_2, headers);
            match emitted {
                Some(sink) if end_stream => {
                    // bodiless response: the sink drops right away
                    drop(sink);
                    if let Some(mut slot) = self.streams.remove(&stream_id) {
                        slot.inflight.complete();
                    }
                }
                Some(sink) => {
                    slot.cancel = Some(Box::pin({
                        let sink = sink.clone();
                        async move { sink.closed().await }
                    }));
                    slot.recv = RecvPhase::Body { sink };
                }
                None => {
                    if let Some(mut slot) = self.streams.remove(&stream_id) {
                        slot.inflight.mark_reset();
                        slot.inflight.dispose(Some(Error::new_cancelled()));
                    }
                    self.write_reset(stream_id, ErrorCode::CANCEL).await?;
                }
            }
        } else {
            // trailers
            if !end_stream {
                return Err(frame::h2_error(
                    ErrorCode::PROTOCOL_ERROR,
                    "trailers without END_STREAM",
                ));
            }
            let mut trailers = HeaderMap::with_capacity(fields.len());
            for (name, value) in fields {
                if name.starts_with(b":") {
                    return Err(frame::h2_error(
                        ErrorCode::PROTOCOL_ERROR,
                        "pseudo-header in trailers",
                    ));
                }
                let name =
                    HeaderName::from_bytes(&name).map_err(|err| Error::new_http().with(err))?;
                let value =
                    HeaderValue::from_bytes(&value).map_err(|err| Error::new_http().with(err))?;
                trailers.append(name, value);
            }
            if let Some(mut slot) = self.streams.remove(&stream_id) {
                if let RecvPhase::Body { ref sink } = slot.recv {
                    let _ = sink.trailers(trailers).await;
                }
                slot.inflight.complete();
                trace!(stream.id = stream_id, "exchange completed with trailers");
            }
        }
        Ok(())
    }

    async fn handle_data(&mut self, stream_id: u32, data: Bytes, end_stream: bool) -> Result<()> {
        let len = data.len();

        let mut remove = false;
        let mut canceled = false;
        if let Some(slot) = self.streams.get_mut(&stream_id) {
            match slot.recv {
                RecvPhase::Body { ref sink } => {
                    if !data.is_empty() && sink.data(data).await.is_err() {
                        canceled = true;
                    } else if end_stream {
                        remove = true;
                    }
                }
                RecvPhase::AwaitingHeaders => {
                    return Err(frame::h2_error(
                        ErrorCode::PROTOCOL_ERROR,
                        "DATA before response headers",
                    ));
                }
            }
        }

        if canceled {
            self.write_reset(stream_id, ErrorCode::CANCEL).await?;
            if let Some(mut slot) = self.streams.remove(&stream_id) {
                slot.inflight.mark_reset();
                slot.inflight.dispose(Some(Error::new_cancelled()));
            }
        } else if remove {
            if let Some(mut slot) = self.streams.remove(&stream_id) {
                slot.inflight.complete();
                trace!(stream.id = stream_id, "exchange completed");
            }
        }

        // replenish the connection window always, the stream window only
        // while the stream is still open
        if len > 0 {
            let mut buf = BytesMut::with_capacity(2 * (frame::FRAME_HEADER_LEN + 4));
            frame::encode_window_update(&mut buf, 0, len as u32);
            if !end_stream && !canceled && self.streams.contains_key(&stream_id) {
                frame::encode_window_update(&mut buf, stream_id, len as u32);
            }
            self.write(&buf).await?;
        }
        Ok(())
    }

    fn apply_settings(&mut self, settings: Settings) -> Result<()> {
        if let Some(size) = settings.initial_window_size {
            let delta = size as i64 - self.peer.initial_window_size as i64;
            for slot in self.streams.values_mut() {
                slot.send_flow.adjust(delta);
            }
            self.peer.initial_window_size = size;
        }
        if let Some(size) = settings.max_frame_size {
            self.peer.max_frame_size = size;
        }
        if let Some(max) = settings.max_concurrent_streams {
            self.peer.max_concurrent_streams = Some(max);
            // zero is a valid grant: the peer accepts no new streams
            let effective = (self.config.http2_max_concurrent_streams.min(max)) as usize;
            debug!(max_concurrent = effective, "peer SETTINGS applied");
            self.events.capacity_changed(effective);
        }
        Ok(())
    }

    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.io.write_all(buf).await.map_err(Error::new_io)?;
        self.io.flush().await.map_err(Error::new_io)
    }

    async fn write_reset(&mut self, stream_id: u32, code: ErrorCode) -> Result<()> {
        let mut buf = BytesMut::with_capacity(frame::FRAME_HEADER_LEN + 4);
        frame::encode_reset(&mut buf, stream_id, code);
        self.write(&buf).await
    }

    fn fail_all(&mut self, error: Error) {
        for (_, mut slot) in self.streams.drain() {
            match slot.recv {
                RecvPhase::Body { ref sink } => {
                    sink.try_error(error.clone());
                    slot.inflight.complete();
                }
                RecvPhase::AwaitingHeaders => {
                    slot.inflight.dispose(Some(error.clone()));
                }
            }
        }
    }
}
