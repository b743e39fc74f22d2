//! Proxy tunneling: HTTP CONNECT, SOCKS4 and SOCKS5.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use byteorder::{BigEndian, ByteOrder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

use crate::config::{ProxyConfig, ProxyKind};
use crate::error::{Error, Result};
use crate::transport::Authority;

const SOCKS5_VERSION: u8 = 0x05;
const SOCKS5_METHOD_NONE: u8 = 0x00;
const SOCKS5_METHOD_USER_PASS: u8 = 0x02;
const SOCKS5_CMD_CONNECT: u8 = 0x01;
const SOCKS5_ATYP_IPV4: u8 = 0x01;
const SOCKS5_ATYP_DOMAIN: u8 = 0x03;
const SOCKS5_ATYP_IPV6: u8 = 0x04;

/// Establish a tunnel to `target` over the already-connected proxy stream.
pub(super) async fn tunnel(
    stream: TcpStream,
    target: &Authority,
    proxy: &ProxyConfig,
) -> Result<TcpStream> {
    match proxy.kind {
        ProxyKind::Http => http_connect(stream, target, proxy).await,
        ProxyKind::Socks4 => socks4_connect(stream, target, proxy).await,
        ProxyKind::Socks5 => socks5_connect(stream, target, proxy).await,
    }
}

async fn http_connect(
    mut stream: TcpStream,
    target: &Authority,
    proxy: &ProxyConfig,
) -> Result<TcpStream> {
    let mut request = format!(
        "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nProxy-Connection: keep-alive\r\n"
    );
    if let (Some(user), Some(pass)) = (proxy.username.as_deref(), proxy.password.as_deref()) {
        let credentials = BASE64.encode(format!("{user}:{pass}"));
        request.push_str(&format!("Proxy-Authorization: Basic {credentials}\r\n"));
    }
    request.push_str("\r\n");

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(Error::new_connect)?;

    // Read until the end of the response head. The proxy must not send
    // tunnel payload before we do, so everything up to CRLFCRLF is its
    // response head.
    let mut buf = Vec::with_capacity(512);
    loop {
        let mut byte = [0u8; 1];
        let n = stream.read(&mut byte).await.map_err(Error::new_connect)?;
        if n == 0 {
            return Err(Error::new_connect("proxy closed during CONNECT"));
        }
        buf.push(byte[0]);
        if buf.len() > 8192 {
            return Err(Error::new_connect("proxy CONNECT response too large"));
        }
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
    }

    let mut headers = [httparse::EMPTY_HEADER; 16];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(&buf) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) | Err(_) => {
            return Err(Error::new_connect("invalid proxy CONNECT response"));
        }
    }
    match response.code {
        Some(code) if (200..300).contains(&code) => {
            trace!(%target, "http proxy tunnel established");
            Ok(stream)
        }
        code => Err(Error::new_connect(format!(
            "proxy CONNECT refused: status {code:?}"
        ))),
    }
}

async fn socks4_connect(
    mut stream: TcpStream,
    target: &Authority,
    proxy: &ProxyConfig,
) -> Result<TcpStream> {
    let mut request = vec![0x04, 0x01];
    let mut port = [0u8; 2];
    BigEndian::write_u16(&mut port, target.port());
    request.extend_from_slice(&port);

    let domain = match target.host().parse::<std::net::Ipv4Addr>() {
        Ok(ip) => {
            request.extend_from_slice(&ip.octets());
            None
        }
        // SOCKS4a: invalid destination ip 0.0.0.x signals that the domain
        // follows the user id.
        Err(_) => {
            request.extend_from_slice(&[0, 0, 0, 1]);
            Some(target.host())
        }
    };

    if let Some(user) = proxy.username.as_deref() {
        request.extend_from_slice(user.as_bytes());
    }
    request.push(0x00);
    if let Some(domain) = domain {
        request.extend_from_slice(domain.as_bytes());
        request.push(0x00);
    }

    stream
        .write_all(&request)
        .await
        .map_err(Error::new_connect)?;

    let mut reply = [0u8; 8];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(Error::new_connect)?;
    if reply[1] != 0x5a {
        return Err(Error::new_connect(format!(
            "socks4 connect refused: code {:#04x}",
            reply[1]
        )));
    }
    trace!(%target, "socks4 tunnel established");
    Ok(stream)
}

async fn socks5_connect(
    mut stream: TcpStream,
    target: &Authority,
    proxy: &ProxyConfig,
) -> Result<TcpStream> {
    let with_auth = proxy.username.is_some() && proxy.password.is_some();

    // method negotiation
    let greeting: &[u8] = if with_auth {
        &[
            SOCKS5_VERSION,
            2,
            SOCKS5_METHOD_NONE,
            SOCKS5_METHOD_USER_PASS,
        ]
    } else {
        &[SOCKS5_VERSION, 1, SOCKS5_METHOD_NONE]
    };
    stream.write_all(greeting).await.map_err(Error::new_connect)?;

    let mut choice = [0u8; 2];
    stream
        .read_exact(&mut choice)
        .await
        .map_err(Error::new_connect)?;
    if choice[0] != SOCKS5_VERSION {
        return Err(Error::new_connect("socks5 proxy spoke wrong version"));
    }
    match choice[1] {
        SOCKS5_METHOD_NONE => {}
        SOCKS5_METHOD_USER_PASS if with_auth => {
            let user = proxy.username.as_deref().unwrap_or_default();
            let pass = proxy.password.as_deref().unwrap_or_default();
            let mut auth = vec![0x01, user.len() as u8];
            auth.extend_from_slice(user.as_bytes());
            auth.push(pass.len() as u8);
            auth.extend_from_slice(pass.as_bytes());
            stream.write_all(&auth).await.map_err(Error::new_connect)?;

            let mut status = [0u8; 2];
            stream
                .read_exact(&mut status)
                .await
                .map_err(Error::new_connect)?;
            if status[1] != 0x00 {
                return Err(Error::new_connect("socks5 authentication rejected"));
            }
        }
        method => {
            return Err(Error::new_connect(format!(
                "socks5 proxy requires unsupported method {method:#04x}"
            )));
        }
    }

    // connect request
    let mut request = vec![SOCKS5_VERSION, SOCKS5_CMD_CONNECT, 0x00];
    if let Ok(ip) = target.host().parse::<std::net::IpAddr>() {
        match ip {
            std::net::IpAddr::V4(v4) => {
                request.push(SOCKS5_ATYP_IPV4);
                request.extend_from_slice(&v4.octets());
            }
            std::net::IpAddr::V6(v6) => {
                request.push(SOCKS5_ATYP_IPV6);
                request.extend_from_slice(&v6.octets());
            }
        }
    } else {
        let host = target.host().as_bytes();
        if host.len() > 255 {
            return Err(Error::new_connect("domain too long for socks5"));
        }
        request.push(SOCKS5_ATYP_DOMAIN);
        request.push(host.len() as u8);
        request.extend_from_slice(host);
    }
    let mut port = [0u8; 2];
    BigEndian::write_u16(&mut port, target.port());
    request.extend_from_slice(&port);

    stream
        .write_all(&request)
        .await
        .map_err(Error::new_connect)?;

    let mut head = [0u8; 4];
    stream
        .read_exact(&mut head)
        .await
        .map_err(Error::new_connect)?;
    if head[1] != 0x00 {
        return Err(Error::new_connect(format!(
            "socks5 connect refused: code {:#04x}",
            head[1]
        )));
    }
    // drain the bound address, length depends on the address type
    let addr_len = match head[3] {
        SOCKS5_ATYP_IPV4 => 4,
        SOCKS5_ATYP_IPV6 => 16,
        SOCKS5_ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream
                .read_exact(&mut len)
                .await
                .map_err(Error::new_connect)?;
            len[0] as usize
        }
        atyp => {
            return Err(Error::new_connect(format!(
                "socks5 reply with unknown address type {atyp:#04x}"
            )));
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream
        .read_exact(&mut bound)
        .await
        .map_err(Error::new_connect)?;

    trace!(%target, "socks5 tunnel established");
    Ok(stream)
}
