//! Transport channels.
//!
//! A transport channel is an established byte pipe to the remote endpoint:
//! a TCP socket, optionally tunneled through an HTTP or SOCKS proxy, and
//! optionally wrapped in TLS with ALPN deciding the application protocol.
//! The pool opens channels through a [`ChannelFactory`], which keeps the
//! whole client testable against in-memory pipes.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, TcpStream, lookup_host};
use tracing::{debug, trace};

use crate::config::{ClientConfig, HttpVersion};
use crate::error::{Error, Result};

mod proxy;
mod tls;

pub use tls::TlsConfig;

/// Byte-pipe requirements for anything the protocol layers run on.
pub trait Channel: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Channel for T {}

/// An erased transport channel.
pub type BoxChannel = Box<dyn Channel>;

/// The remote address an endpoint targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Authority {
    host: String,
    port: u16,
}

impl Authority {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Application protocol selected while opening a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NegotiatedProtocol {
    /// Speak HTTP/1.x for the lifetime of the connection.
    Http1,
    /// Speak HTTP/1.1, attempting the h2c upgrade on the first request.
    Http1WithH2cUpgrade,
    /// Speak HTTP/2: either negotiated via ALPN or prior knowledge.
    H2,
}

/// A freshly opened channel together with what was negotiated for it.
pub struct EstablishedChannel {
    pub(crate) io: BoxChannel,
    pub(crate) negotiated: NegotiatedProtocol,
    pub(crate) local_addr: Option<SocketAddr>,
    pub(crate) peer_addr: Option<SocketAddr>,
}

impl EstablishedChannel {
    pub(crate) fn new(io: BoxChannel, negotiated: NegotiatedProtocol) -> Self {
        Self {
            io,
            negotiated,
            local_addr: None,
            peer_addr: None,
        }
    }
}

impl fmt::Debug for EstablishedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EstablishedChannel")
            .field("negotiated", &self.negotiated)
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

/// Opens transport channels to the endpoint.
///
/// The default implementation is [`TcpChannelFactory`]; tests swap in an
/// in-memory factory to observe exactly when connections are opened.
pub trait ChannelFactory: Send + Sync + 'static {
    fn open(&self) -> BoxFuture<'_, Result<EstablishedChannel>>;
}

/// Production [`ChannelFactory`]: TCP, optional proxy tunnel, optional TLS.
pub struct TcpChannelFactory {
    authority: Authority,
    local_address: Option<SocketAddr>,
    tls: Option<Arc<TlsConfig>>,
    config: Arc<ClientConfig>,
}

impl TcpChannelFactory {
    pub(crate) fn new(
        authority: Authority,
        local_address: Option<SocketAddr>,
        tls: Option<Arc<TlsConfig>>,
        config: Arc<ClientConfig>,
    ) -> Self {
        Self {
            authority,
            local_address,
            tls,
            config,
        }
    }

    /// Protocol selection for plaintext channels, driven by configuration
    /// alone: `{h2}` means prior knowledge, `{h2, h1}` means upgrade.
    fn plaintext_protocol(&self) -> NegotiatedProtocol {
        if self.config.wants_h2_prior_knowledge() {
            NegotiatedProtocol::H2
        } else if self.config.wants_h2c_upgrade() {
            NegotiatedProtocol::Http1WithH2cUpgrade
        } else {
            NegotiatedProtocol::Http1
        }
    }

    async fn connect_tcp(&self, host: &str, port: u16) -> Result<TcpStream> {
        let mut last_err = None;
        let addrs = lookup_host((host, port))
            .await
            .map_err(Error::new_connect)?;
        for addr in addrs {
            trace!(%addr, "attempt tcp connect");
            let attempt = match self.local_address {
                Some(local) => {
                    let socket = if addr.is_ipv4() {
                        TcpSocket::new_v4()
                    } else {
                        TcpSocket::new_v6()
                    }
                    .map_err(Error::new_connect)?;
                    socket.bind(local).map_err(Error::new_connect)?;
                    socket.connect(addr).await
                }
                None => TcpStream::connect(addr).await,
            };
            match attempt {
                Ok(stream) => return Ok(stream),
                Err(err) => last_err = Some(err),
            }
        }
        Err(match last_err {
            Some(err) => Error::new_connect(err),
            None => Error::new_connect("address resolved to nothing"),
        })
    }
}

impl ChannelFactory for TcpChannelFactory {
    fn open(&self) -> BoxFuture<'_, Result<EstablishedChannel>> {
        Box::pin(async move {
            let (connect_host, connect_port) = match self.config.proxy {
                Some(ref proxy) => (proxy.host.as_str(), proxy.port),
                None => (self.authority.host(), self.authority.port()),
            };

            let stream = self.connect_tcp(connect_host, connect_port).await?;
            let local_addr = stream.local_addr().ok();
            let peer_addr = stream.peer_addr().ok();
            stream.set_nodelay(true).map_err(Error::new_connect)?;

            let stream = match self.config.proxy {
                Some(ref proxy) => {
                    debug!(
                        proxy.kind = ?proxy.kind,
                        authority = %self.authority,
                        "tunnel channel through proxy"
                    );
                    proxy::tunnel(stream, &self.authority, proxy).await?
                }
                None => stream,
            };

            match self.tls {
                Some(ref tls) => {
                    let (io, alpn) = tls.handshake(stream, &self.config).await?;
                    let negotiated = match alpn.as_deref() {
                        Some(b"h2") => NegotiatedProtocol::H2,
                        Some(b"http/1.1") | Some(b"http/1.0") => NegotiatedProtocol::Http1,
                        // no ALPN response at all: fall back to http/1.1 when
                        // configured, otherwise the endpoint is unreachable
                        None if self.config.supports(HttpVersion::Http11)
                            || self.config.supports(HttpVersion::Http10) =>
                        {
                            NegotiatedProtocol::Http1
                        }
                        other => {
                            return Err(Error::new_connect(format!(
                                "alpn selected unsupported protocol: {:?}",
                                other.map(String::from_utf8_lossy)
                            )));
                        }
                    };
                    debug!(?negotiated, "tls channel established");
                    let mut channel = EstablishedChannel::new(io, negotiated);
                    channel.local_addr = local_addr;
                    channel.peer_addr = peer_addr;
                    Ok(channel)
                }
                None => {
                    let negotiated = self.plaintext_protocol();
                    debug!(?negotiated, "plaintext channel established");
                    let mut channel = EstablishedChannel::new(Box::new(stream), negotiated);
                    channel.local_addr = local_addr;
                    channel.peer_addr = peer_addr;
                    Ok(channel)
                }
            }
        })
    }
}
