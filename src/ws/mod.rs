//! WebSocket exchanges.
//!
//! A [`WebSocketRequest`] opens a dedicated channel, runs the RFC 6455
//! opening handshake on top of HTTP/1.1 and hands back a [`WebSocket`]
//! session. The session task owns the transport: inbound frames flow
//! through a bounded channel, outbound frames are written one at a time,
//! pings are answered at the protocol layer, and the close handshake is
//! driven with the configured inbound-close-frame timeout.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::{Framed, FramedParts};
use tracing::{debug, trace, warn};

use crate::config::ClientConfig;
use crate::endpoint::EndpointInner;
use crate::error::{Error, Result};
use crate::transport::{BoxChannel, NegotiatedProtocol};

pub(crate) mod extension;
pub(crate) mod frame;
pub(crate) mod handshake;

use extension::{DeflateContext, NegotiatedCompression};
pub use frame::{Frame, OpCode};

/// Close code sent when the caller abandons the session without closing.
const CLOSE_GOING_AWAY: u16 = 1001;
/// Close code sent on a peer protocol violation.
const CLOSE_PROTOCOL_ERROR: u16 = 1002;
/// Normal closure.
const CLOSE_NORMAL: u16 = 1000;

/// A complete WebSocket message: consecutive frames of one kind up to and
/// including the final frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<(u16, String)>),
}

enum Outbound {
    Frame(Frame),
    Message(Message),
    Close { code: u16, reason: String },
}

/// A WebSocket exchange under construction.
pub struct WebSocketRequest {
    pub(crate) endpoint: Arc<EndpointInner>,
    pub(crate) target: String,
    pub(crate) subprotocols: Vec<String>,
    pub(crate) headers: HeaderMap,
}

impl WebSocketRequest {
    /// Offer a subprotocol; the server picks at most one.
    pub fn subprotocol(mut self, name: impl Into<String>) -> Self {
        self.subprotocols.push(name.into());
        self
    }

    pub fn header<N, V>(mut self, name: N, value: V) -> Result<Self>
    where
        N: TryInto<HeaderName, Error: Into<crate::error::BoxError>>,
        V: TryInto<HeaderValue, Error: Into<crate::error::BoxError>>,
    {
        let name = name.try_into().map_err(|err| Error::new_http().with(err))?;
        let value = value.try_into().map_err(|err| Error::new_http().with(err))?;
        self.headers.append(name, value);
        Ok(self)
    }

    /// Open the channel, run the handshake and spawn the session.
    pub async fn connect(self) -> Result<WebSocket> {
        let endpoint = self.endpoint.clone();
        let channel = endpoint.open_channel().await?;
        if channel.negotiated == NegotiatedProtocol::H2 {
            return Err(Error::new_ws_handshake()
                .with_message("websocket requires an http/1.1 channel"));
        }
        let local_addr = channel.local_addr;
        let peer_addr = channel.peer_addr;
        let mut io = channel.io;

        let outcome = handshake::handshake(
            &mut io,
            endpoint.config(),
            endpoint.authority_str(),
            &self.target,
            &self.subprotocols,
            &self.headers,
        )
        .await?;

        Ok(WebSocket::spawn(
            io,
            endpoint.config(),
            outcome,
            local_addr,
            peer_addr,
        ))
    }
}

/// An established WebSocket session.
///
/// Inbound traffic is consumed either frame by frame ([`Self::recv_frame`])
/// or message by message ([`Self::recv_message`]). Dropping the session
/// without [`Self::close`] sends a going-away CLOSE (1001) to the peer.
pub struct WebSocket {
    subprotocol: Option<String>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    inbound: mpsc::Receiver<Result<Frame>>,
    outbound: mpsc::Sender<Outbound>,
    partial: Option<(OpCode, BytesMut)>,
    max_message_size: usize,
}

impl std::fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocket")
            .field("subprotocol", &self.subprotocol)
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

impl WebSocket {
    fn spawn(
        io: BoxChannel,
        config: &ClientConfig,
        outcome: handshake::HandshakeOutcome,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let (outbound_tx, outbound_rx) = mpsc::channel(1);

        let mut parts = FramedParts::new::<Frame>(io, frame::FrameCodec::new(config.ws_max_frame_size));
        parts.read_buf = outcome.leftover;
        let framed = Framed::from_parts(parts);

        let session = Session {
            framed,
            inbound: inbound_tx,
            compression: outcome.compression,
            deflate: DeflateContext::new(outcome.compression),
            max_frame_size: config.ws_max_frame_size,
            max_message_size: config.ws_max_message_size,
            close_timeout: config.ws_inbound_close_frame_timeout,
            close_on_outbound_complete: config.ws_close_on_outbound_complete,
            close_sent: false,
            close_received: false,
            close_deadline: None,
            outbound_done: false,
            recv_compressed: false,
            recv_in_message: false,
        };
        tokio::spawn(session.run(outbound_rx));

        Self {
            subprotocol: outcome.subprotocol,
            local_addr,
            peer_addr,
            inbound: inbound_rx,
            outbound: outbound_tx,
            partial: None,
            max_message_size: config.ws_max_message_size,
        }
    }

    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Next inbound frame, in arrival order. `None` once the session ended.
    pub async fn recv_frame(&mut self) -> Option<Result<Frame>> {
        self.inbound.recv().await
    }

    /// Next inbound message: consecutive non-final frames of one kind are
    /// concatenated until their final frame.
    pub async fn recv_message(&mut self) -> Option<Result<Message>> {
        loop {
            let frame = match self.recv_frame().await? {
                Ok(frame) => frame,
                Err(error) => return Some(Err(error)),
            };
            match frame.opcode {
                OpCode::Ping => return Some(Ok(Message::Ping(frame.payload))),
                OpCode::Pong => return Some(Ok(Message::Pong(frame.payload))),
                OpCode::Close => return Some(Ok(Message::Close(frame.close_parts()))),
                OpCode::Text | OpCode::Binary => {
                    if frame.fin {
                        return Some(finish_message(frame.opcode, frame.payload.into()));
                    }
                    self.partial = Some((frame.opcode, BytesMut::from(&frame.payload[..])));
                }
                OpCode::Continuation => {
                    let Some((opcode, ref mut buf)) = self.partial else {
                        // the session task already failed the connection;
                        // surface the violation here as well
                        return Some(Err(Error::new_ws_protocol()
                            .with_message("continuation frame without a message")));
                    };
                    buf.extend_from_slice(&frame.payload);
                    if buf.len() > self.max_message_size {
                        return Some(Err(Error::new_ws_protocol()
                            .with_message("aggregated message exceeds maximum size")));
                    }
                    if frame.fin {
                        let (_, buf) = self.partial.take().unwrap_or((opcode, BytesMut::new()));
                        return Some(finish_message(opcode, buf.freeze().into()));
                    }
                }
            }
        }
    }

    /// Send one frame. CLOSE frames are rejected: use [`Self::close`].
    pub async fn send_frame(&self, frame: Frame) -> Result<()> {
        if frame.opcode == OpCode::Close {
            return Err(
                Error::new_ws_protocol().with_message("close frames are sent through close()")
            );
        }
        self.outbound
            .send(Outbound::Frame(frame))
            .await
            .map_err(|_| Error::new_http().with_message("websocket session closed"))
    }

    /// Send one message, fragmenting as needed.
    pub async fn send(&self, message: Message) -> Result<()> {
        if matches!(message, Message::Close(_)) {
            return Err(
                Error::new_ws_protocol().with_message("close messages are sent through close()")
            );
        }
        self.outbound
            .send(Outbound::Message(message))
            .await
            .map_err(|_| Error::new_http().with_message("websocket session closed"))
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Message::Text(text.into())).await
    }

    pub async fn send_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send(Message::Binary(data.into())).await
    }

    /// Start the closing handshake. The reason is truncated to 120
    /// characters so the close payload stays within 125 bytes.
    pub async fn close(&self, code: u16, reason: &str) -> Result<()> {
        let reason = truncate_reason(reason);
        self.outbound
            .send(Outbound::Close { code, reason })
            .await
            .map_err(|_| Error::new_http().with_message("websocket session closed"))
    }
}

fn truncate_reason(reason: &str) -> String {
    if reason.len() <= 120 {
        return reason.to_owned();
    }
    let mut cut = 120;
    while !reason.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &reason[..cut])
}

fn finish_message(opcode: OpCode, payload: Bytes) -> Result<Message> {
    match opcode {
        OpCode::Text => match String::from_utf8(payload.to_vec()) {
            Ok(text) => Ok(Message::Text(text)),
            Err(err) => Err(Error::new_ws_protocol()
                .with(err)
                .with_message("text message is not valid utf-8")),
        },
        _ => Ok(Message::Binary(payload)),
    }
}

struct Session {
    framed: Framed<BoxChannel, frame::FrameCodec>,
    inbound: mpsc::Sender<Result<Frame>>,
    compression: NegotiatedCompression,
    deflate: Option<DeflateContext>,
    max_frame_size: usize,
    max_message_size: usize,
    close_timeout: std::time::Duration,
    close_on_outbound_complete: bool,
    close_sent: bool,
    close_received: bool,
    close_deadline: Option<Instant>,
    outbound_done: bool,
    /// rsv1 seen on the first frame of the in-progress inbound message.
    recv_compressed: bool,
    recv_in_message: bool,
}

impl Session {
    async fn run(mut self, mut outbound_rx: mpsc::Receiver<Outbound>) {
        loop {
            if self.close_sent && self.close_received {
                break;
            }

            tokio::select! {
                outbound = outbound_rx.recv(), if !self.outbound_done && !self.close_sent => {
                    match outbound {
                        Some(Outbound::Frame(frame)) => {
                            if self.write_frame(frame).await.is_err() {
                                break;
                            }
                        }
                        Some(Outbound::Message(message)) => {
                            if self.write_message(message).await.is_err() {
                                break;
                            }
                        }
                        Some(Outbound::Close { code, reason }) => {
                            if self.send_close(code, &reason).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            self.outbound_done = true;
                            let code = if self.close_on_outbound_complete {
                                CLOSE_NORMAL
                            } else {
                                CLOSE_GOING_AWAY
                            };
                            trace!(code, "outbound side finished, closing");
                            if self.send_close(code, "").await.is_err() {
                                break;
                            }
                        }
                    }
                },
                inbound = self.framed.next() => match inbound {
                    Some(Ok(frame)) => {
                        if !self.handle_inbound(frame).await {
                            break;
                        }
                    }
                    Some(Err(error)) => {
                        warn!(error = %error, "inbound frame violated the protocol");
                        let _ = self
                            .framed
                            .send(Frame::close(CLOSE_PROTOCOL_ERROR, "protocol error"))
                            .await;
                        let _ = self.inbound.send(Err(error)).await;
                        break;
                    }
                    None => {
                        if !self.close_received && !self.close_sent {
                            let _ = self
                                .inbound
                                .send(Err(Error::new_http()
                                    .with_message("connection closed without close frame")))
                                .await;
                        }
                        break;
                    }
                },
                _ = tokio::time::sleep_until(self.close_deadline.unwrap_or_else(Instant::now)),
                    if self.close_deadline.is_some() =>
                {
                    debug!("no close frame from peer in time, dropping transport");
                    break;
                },
            }
        }

        let mut io = self.framed.into_inner();
        let _ = tokio::io::AsyncWriteExt::shutdown(&mut io).await;
    }

    async fn send_close(&mut self, code: u16, reason: &str) -> Result<()> {
        self.close_sent = true;
        self.close_deadline = Some(Instant::now() + self.close_timeout);
        self.framed.send(Frame::close(code, reason)).await
    }

    async fn write_frame(&mut self, mut frame: Frame) -> Result<()> {
        if !self.compression.is_none()
            && frame.opcode.is_data()
            && !self.compression.per_message()
        {
            // deflate-frame compresses every data frame on its own
            if let Some(ref mut deflate) = self.deflate {
                frame.payload = Bytes::from(deflate.compress(&frame.payload)?);
                frame.rsv1 = true;
            }
        }
        self.framed.send(frame).await
    }

    async fn write_message(&mut self, message: Message) -> Result<()> {
        let (opcode, mut payload) = match message {
            Message::Text(text) => (OpCode::Text, Bytes::from(text)),
            Message::Binary(data) => (OpCode::Binary, data),
            Message::Ping(data) => return self.framed.send(Frame::ping(data)).await,
            Message::Pong(data) => return self.framed.send(Frame::pong(data)).await,
            Message::Close(_) => return Ok(()),
        };

        let mut compressed = false;
        if self.compression.per_message() {
            if let Some(ref mut deflate) = self.deflate {
                payload = Bytes::from(deflate.compress(&payload)?);
                compressed = true;
            }
        }

        // fragment to the configured frame size
        let mut first = true;
        loop {
            let take = payload.len().min(self.max_frame_size);
            let chunk = payload.split_to(take);
            let fin = payload.is_empty();
            let frame = Frame {
                fin,
                rsv1: compressed && first,
                opcode: if first { opcode } else { OpCode::Continuation },
                payload: chunk,
            };
            self.framed.send(frame).await?;
            if fin {
                return Ok(());
            }
            first = false;
        }
    }

    /// Returns false when the session should end.
    async fn handle_inbound(&mut self, mut frame: Frame) -> bool {
        match frame.opcode {
            OpCode::Ping => {
                trace!("answering ping");
                if self
                    .framed
                    .send(Frame::pong(frame.payload.clone()))
                    .await
                    .is_err()
                {
                    return false;
                }
                return self.deliver(frame).await;
            }
            OpCode::Pong => return self.deliver(frame).await,
            OpCode::Close => {
                self.close_received = true;
                let delivered = self.deliver(frame.clone()).await;
                if !self.close_sent {
                    let (code, _) = frame.close_parts().unwrap_or((CLOSE_NORMAL, String::new()));
                    let _ = self.framed.send(Frame::close(code, "")).await;
                    self.close_sent = true;
                }
                let _ = delivered;
                return false;
            }
            OpCode::Text | OpCode::Binary => {
                if self.recv_in_message {
                    return self.protocol_violation("data frame inside a fragmented message").await;
                }
                self.recv_compressed = frame.rsv1;
                if !frame.fin {
                    self.recv_in_message = true;
                }
            }
            OpCode::Continuation => {
                if !self.recv_in_message {
                    return self
                        .protocol_violation("continuation frame without a message")
                        .await;
                }
                if frame.fin {
                    self.recv_in_message = false;
                }
            }
        }

        // inflate data fragments when the message is compressed
        if self.recv_compressed && !frame.opcode.is_control() {
            let per_message = self.compression.per_message();
            if let Some(ref mut deflate) = self.deflate {
                let fin = if per_message { frame.fin } else { true };
                match deflate.decompress(&frame.payload, self.max_message_size, fin) {
                    Ok(inflated) => {
                        frame.payload = Bytes::from(inflated);
                        frame.rsv1 = false;
                    }
                    Err(error) => {
                        let _ = self.inbound.send(Err(error)).await;
                        return false;
                    }
                }
            }
            if frame.fin {
                self.recv_compressed = false;
            }
        }

        self.deliver(frame).await
    }

    async fn protocol_violation(&mut self, message: &'static str) -> bool {
        warn!(message, "websocket protocol violation");
        let _ = self
            .framed
            .send(Frame::close(CLOSE_PROTOCOL_ERROR, "protocol error"))
            .await;
        self.close_sent = true;
        let _ = self
            .inbound
            .send(Err(Error::new_ws_protocol().with_message(message)))
            .await;
        false
    }

    /// Hand a frame to the consumer; false when the consumer is gone.
    async fn deliver(&mut self, frame: Frame) -> bool {
        if self.inbound.send(Ok(frame)).await.is_err() {
            // caller dropped the session mid-stream
            if !self.close_sent {
                let _ = self
                    .framed
                    .send(Frame::close(CLOSE_GOING_AWAY, ""))
                    .await;
                self.close_sent = true;
            }
            return false;
        }
        true
    }
}
