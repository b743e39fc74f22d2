//! Shared plumbing for the integration suites: scripted servers speaking
//! just enough HTTP/1.1, HTTP/2 and WebSocket over in-memory channels.
#![allow(dead_code)]

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ===== http/1.1 =====

/// Read one request head (through the blank line) and return it as text.
/// Returns an empty string on a clean EOF before any byte arrived.
pub async fn read_h1_head(io: &mut DuplexStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = io.read(&mut byte).await.expect("read request head");
        if n == 0 {
            assert!(head.is_empty(), "peer closed mid request head");
            return String::new();
        }
        head.push(byte[0]);
        if head.ends_with(b"\r\n\r\n") {
            break;
        }
        assert!(head.len() < 64 << 10, "request head too large");
    }
    String::from_utf8(head).expect("request head is utf-8")
}

/// Extract a header value (case-insensitive) out of a raw head.
pub fn header_value(head: &str, name: &str) -> Option<String> {
    head.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.eq_ignore_ascii_case(name)
            .then(|| value.trim().to_owned())
    })
}

// ===== http/2 =====

pub const H2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub const H2_DATA: u8 = 0x0;
pub const H2_HEADERS: u8 = 0x1;
pub const H2_RST_STREAM: u8 = 0x3;
pub const H2_SETTINGS: u8 = 0x4;
pub const H2_PING: u8 = 0x6;
pub const H2_GOAWAY: u8 = 0x7;
pub const H2_WINDOW_UPDATE: u8 = 0x8;

pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_ACK: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;

#[derive(Debug)]
pub struct RawFrame {
    pub kind: u8,
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Vec<u8>,
}

pub async fn read_frame(io: &mut DuplexStream) -> RawFrame {
    let mut head = [0u8; 9];
    io.read_exact(&mut head).await.expect("read frame header");
    let length = u32::from_be_bytes([0, head[0], head[1], head[2]]) as usize;
    let mut payload = vec![0u8; length];
    io.read_exact(&mut payload).await.expect("read frame payload");
    RawFrame {
        kind: head[3],
        flags: head[4],
        stream_id: u32::from_be_bytes([head[5], head[6], head[7], head[8]]) & 0x7fff_ffff,
        payload,
    }
}

pub async fn write_frame(
    io: &mut DuplexStream,
    kind: u8,
    flags: u8,
    stream_id: u32,
    payload: &[u8],
) {
    let mut frame = Vec::with_capacity(9 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes()[1..]);
    frame.push(kind);
    frame.push(flags);
    frame.extend_from_slice(&stream_id.to_be_bytes());
    frame.extend_from_slice(payload);
    io.write_all(&frame).await.expect("write frame");
}

/// Server side of the h2 opening: consume the preface, swap SETTINGS.
pub async fn h2_server_handshake(io: &mut DuplexStream) {
    let mut preface = [0u8; 24];
    io.read_exact(&mut preface).await.expect("read preface");
    assert_eq!(&preface[..], H2_PREFACE, "client connection preface");
    write_frame(io, H2_SETTINGS, 0, 0, &[]).await;
}

/// Read frames until a HEADERS frame arrives, acknowledging SETTINGS and
/// ignoring control noise on the way.
pub async fn h2_read_request(io: &mut DuplexStream) -> RawFrame {
    loop {
        let frame = read_frame(io).await;
        match frame.kind {
            H2_SETTINGS if frame.flags & FLAG_ACK == 0 => {
                write_frame(io, H2_SETTINGS, FLAG_ACK, 0, &[]).await;
            }
            H2_SETTINGS | H2_WINDOW_UPDATE | H2_PING => {}
            H2_HEADERS | H2_DATA | H2_RST_STREAM => return frame,
            kind => panic!("unexpected frame type {kind:#x}"),
        }
    }
}

/// `:status: 200` as a one-byte header block (static table index 8).
pub const HPACK_STATUS_200: &[u8] = &[0x88];

/// A literal trailer field without indexing: `name: value`.
pub fn hpack_literal(name: &str, value: &str) -> Vec<u8> {
    let mut block = vec![0x00];
    block.push(name.len() as u8);
    block.extend_from_slice(name.as_bytes());
    block.push(value.len() as u8);
    block.extend_from_slice(value.as_bytes());
    block
}

// ===== websocket =====

pub fn ws_accept(key: &str) -> String {
    use base64::Engine as _;
    use sha1::Digest as _;
    let mut sha1 = sha1::Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11");
    base64::engine::general_purpose::STANDARD.encode(sha1.finalize())
}

#[derive(Debug)]
pub struct WsFrame {
    pub fin: bool,
    pub opcode: u8,
    pub payload: Vec<u8>,
}

/// Read one client frame, unmasking it.
pub async fn ws_read_frame(io: &mut DuplexStream) -> WsFrame {
    let mut head = [0u8; 2];
    io.read_exact(&mut head).await.expect("read ws frame head");
    let fin = head[0] & 0x80 != 0;
    let opcode = head[0] & 0x0f;
    let masked = head[1] & 0x80 != 0;
    assert!(masked, "client frames must be masked");
    let len = match head[1] & 0x7f {
        126 => {
            let mut ext = [0u8; 2];
            io.read_exact(&mut ext).await.expect("read extended length");
            u16::from_be_bytes(ext) as usize
        }
        127 => {
            let mut ext = [0u8; 8];
            io.read_exact(&mut ext).await.expect("read extended length");
            u64::from_be_bytes(ext) as usize
        }
        len => len as usize,
    };
    let mut key = [0u8; 4];
    io.read_exact(&mut key).await.expect("read mask key");
    let mut payload = vec![0u8; len];
    io.read_exact(&mut payload).await.expect("read ws payload");
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
    WsFrame {
        fin,
        opcode,
        payload,
    }
}

/// Write one unmasked server frame.
pub async fn ws_write_frame(io: &mut DuplexStream, opcode: u8, fin: bool, payload: &[u8]) {
    let mut frame = Vec::with_capacity(payload.len() + 10);
    frame.push(if fin { 0x80 } else { 0x00 } | opcode);
    if payload.len() < 126 {
        frame.push(payload.len() as u8);
    } else if payload.len() <= u16::MAX as usize {
        frame.push(126);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        frame.push(127);
        frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    }
    frame.extend_from_slice(payload);
    io.write_all(&frame).await.expect("write ws frame");
}
