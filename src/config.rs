//! Client configuration.
//!
//! A [`ClientConfig`] is an immutable snapshot taken when an
//! [`Endpoint`][crate::Endpoint] is built. Pool tuning knobs are
//! validated at set time: `pool_select_choice_count` is capped to
//! `pool_max_size` and `pool_select_load_threshold` is clamped to
//! `[0.0, 1.0]`, so the selection algorithm never has to re-check them.

use std::time::Duration;

/// Application protocols the client may speak with the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpVersion {
    Http10,
    Http11,
    H2,
}

impl HttpVersion {
    /// ALPN protocol identifier.
    pub(crate) fn alpn_id(&self) -> &'static [u8] {
        match self {
            Self::Http10 => b"http/1.0",
            Self::Http11 => b"http/1.1",
            Self::H2 => b"h2",
        }
    }
}

/// Proxy protocol used to tunnel the transport channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Http,
    Socks4,
    Socks5,
}

/// Proxy tunnel configuration: protocol, address and optional credentials.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyConfig {
    pub fn new(kind: ProxyKind, host: impl Into<String>, port: u16) -> Self {
        Self {
            kind,
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

/// Immutable configuration snapshot for an endpoint and its pool.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub(crate) protocols: Vec<HttpVersion>,
    pub(crate) user_agent: String,
    pub(crate) decompression_enabled: bool,

    pub(crate) pool_max_size: usize,
    pub(crate) pool_buffer_size: Option<usize>,
    pub(crate) pool_clean_period: Duration,
    pub(crate) pool_connect_timeout: Duration,
    pub(crate) pool_keep_alive_timeout: Option<Duration>,
    pool_select_choice_count: usize,
    pool_select_load_threshold: f64,

    pub(crate) request_timeout: Duration,
    pub(crate) graceful_shutdown_timeout: Duration,

    pub(crate) http1_max_concurrent_requests: Option<usize>,

    pub(crate) http2_header_table_size: u32,
    pub(crate) http2_initial_window_size: u32,
    pub(crate) http2_max_frame_size: u32,
    pub(crate) http2_max_header_list_size: Option<u32>,
    pub(crate) http2_max_concurrent_streams: u32,

    pub(crate) ws_max_frame_size: usize,
    pub(crate) ws_max_message_size: usize,
    pub(crate) ws_frame_compression: bool,
    pub(crate) ws_frame_compression_no_context_takeover: bool,
    pub(crate) ws_message_compression: bool,
    pub(crate) ws_message_compression_no_client_context_takeover: bool,
    pub(crate) ws_message_compression_no_server_context_takeover: bool,
    pub(crate) ws_inbound_close_frame_timeout: Duration,
    pub(crate) ws_close_on_outbound_complete: bool,

    pub(crate) proxy: Option<ProxyConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            protocols: vec![HttpVersion::H2, HttpVersion::Http11],
            user_agent: concat!("remora/", env!("CARGO_PKG_VERSION")).to_owned(),
            decompression_enabled: false,

            pool_max_size: 16,
            pool_buffer_size: None,
            pool_clean_period: Duration::from_secs(1),
            pool_connect_timeout: Duration::from_secs(10),
            pool_keep_alive_timeout: None,
            pool_select_choice_count: 2,
            pool_select_load_threshold: 0.8,

            request_timeout: Duration::from_secs(60),
            graceful_shutdown_timeout: Duration::from_secs(30),

            http1_max_concurrent_requests: Some(10),

            http2_header_table_size: 4_096,
            http2_initial_window_size: 65_535,
            http2_max_frame_size: 16_384,
            http2_max_header_list_size: None,
            http2_max_concurrent_streams: 100,

            ws_max_frame_size: 64 << 10,
            ws_max_message_size: 16 << 20,
            ws_frame_compression: false,
            ws_frame_compression_no_context_takeover: false,
            ws_message_compression: false,
            ws_message_compression_no_client_context_takeover: false,
            ws_message_compression_no_server_context_takeover: false,
            ws_inbound_close_frame_timeout: Duration::from_secs(20),
            ws_close_on_outbound_complete: false,

            proxy: None,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Protocols the endpoint may negotiate, in preference order.
    ///
    /// With TLS the list is advertised through ALPN. Without TLS a list
    /// containing both `H2` and `Http11` means an h2c upgrade is attempted
    /// on the first request, while `[H2]` alone means prior-knowledge
    /// HTTP/2 (the connection preface is sent immediately).
    pub fn with_protocols(mut self, protocols: Vec<HttpVersion>) -> Self {
        self.protocols = protocols;
        self
    }

    pub fn with_user_agent(mut self, value: impl Into<String>) -> Self {
        self.user_agent = value.into();
        self
    }

    /// Decompress response bodies based on `Content-Encoding`, and advertise
    /// `Accept-Encoding` on outgoing requests.
    pub fn with_decompression(mut self, enabled: bool) -> Self {
        self.decompression_enabled = enabled;
        self
    }

    pub fn with_pool_max_size(mut self, value: usize) -> Self {
        self.pool_max_size = value.max(1);
        self.pool_select_choice_count = self.pool_select_choice_count.min(self.pool_max_size);
        self
    }

    /// Maximum number of buffered waiters; `None` means unbounded.
    pub fn with_pool_buffer_size(mut self, value: Option<usize>) -> Self {
        self.pool_buffer_size = value;
        self
    }

    pub fn with_pool_clean_period(mut self, value: Duration) -> Self {
        self.pool_clean_period = value;
        self
    }

    pub fn with_pool_connect_timeout(mut self, value: Duration) -> Self {
        self.pool_connect_timeout = value;
        self
    }

    pub fn with_pool_keep_alive_timeout(mut self, value: Option<Duration>) -> Self {
        self.pool_keep_alive_timeout = value;
        self
    }

    /// Number of candidate connections sampled per acquisition.
    ///
    /// Kept within `1..=pool_max_size`.
    pub fn with_pool_select_choice_count(mut self, value: usize) -> Self {
        self.pool_select_choice_count = value.clamp(1, self.pool_max_size);
        self
    }

    /// Load factor above which the pool prefers growing over reusing.
    ///
    /// Clamped to `[0.0, 1.0]`.
    pub fn with_pool_select_load_threshold(mut self, value: f64) -> Self {
        self.pool_select_load_threshold = value.clamp(0.0, 1.0);
        self
    }

    pub fn with_request_timeout(mut self, value: Duration) -> Self {
        self.request_timeout = value;
        self
    }

    pub fn with_graceful_shutdown_timeout(mut self, value: Duration) -> Self {
        self.graceful_shutdown_timeout = value;
        self
    }

    /// Cap on pipelined in-flight requests per HTTP/1.x connection;
    /// `None` removes the cap.
    pub fn with_http1_max_concurrent_requests(mut self, value: Option<usize>) -> Self {
        self.http1_max_concurrent_requests = value;
        self
    }

    pub fn with_http2_header_table_size(mut self, value: u32) -> Self {
        self.http2_header_table_size = value;
        self
    }

    pub fn with_http2_initial_window_size(mut self, value: u32) -> Self {
        self.http2_initial_window_size = value;
        self
    }

    pub fn with_http2_max_frame_size(mut self, value: u32) -> Self {
        self.http2_max_frame_size = value.clamp(16_384, (1 << 24) - 1);
        self
    }

    pub fn with_http2_max_header_list_size(mut self, value: Option<u32>) -> Self {
        self.http2_max_header_list_size = value;
        self
    }

    /// Local cap on concurrent HTTP/2 streams; the effective capacity of a
    /// connection is `min(this, server MAX_CONCURRENT_STREAMS)`.
    pub fn with_http2_max_concurrent_streams(mut self, value: u32) -> Self {
        self.http2_max_concurrent_streams = value.max(1);
        self
    }

    pub fn with_ws_max_frame_size(mut self, value: usize) -> Self {
        self.ws_max_frame_size = value;
        self
    }

    pub fn with_ws_max_message_size(mut self, value: usize) -> Self {
        self.ws_max_message_size = value;
        self
    }

    /// Offer the `deflate-frame` extension during the WebSocket handshake.
    pub fn with_ws_frame_compression(mut self, enabled: bool, no_context_takeover: bool) -> Self {
        self.ws_frame_compression = enabled;
        self.ws_frame_compression_no_context_takeover = no_context_takeover;
        self
    }

    /// Offer the `permessage-deflate` extension during the WebSocket handshake.
    pub fn with_ws_message_compression(
        mut self,
        enabled: bool,
        no_client_context_takeover: bool,
        no_server_context_takeover: bool,
    ) -> Self {
        self.ws_message_compression = enabled;
        self.ws_message_compression_no_client_context_takeover = no_client_context_takeover;
        self.ws_message_compression_no_server_context_takeover = no_server_context_takeover;
        self
    }

    pub fn with_ws_inbound_close_frame_timeout(mut self, value: Duration) -> Self {
        self.ws_inbound_close_frame_timeout = value;
        self
    }

    /// Send a CLOSE frame as soon as the outbound frame stream completes.
    pub fn with_ws_close_on_outbound_complete(mut self, enabled: bool) -> Self {
        self.ws_close_on_outbound_complete = enabled;
        self
    }

    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub(crate) fn pool_select_choice_count(&self) -> usize {
        self.pool_select_choice_count
    }

    pub(crate) fn pool_select_load_threshold(&self) -> f64 {
        self.pool_select_load_threshold
    }

    pub(crate) fn supports(&self, version: HttpVersion) -> bool {
        self.protocols.contains(&version)
    }

    /// True when the endpoint should attempt an h2c upgrade on the first
    /// request of a plaintext connection.
    pub(crate) fn wants_h2c_upgrade(&self) -> bool {
        self.supports(HttpVersion::H2) && self.supports(HttpVersion::Http11)
    }

    /// True when plaintext connections should speak HTTP/2 from the first
    /// byte (connection preface, no upgrade dance).
    pub(crate) fn wants_h2_prior_knowledge(&self) -> bool {
        self.supports(HttpVersion::H2) && !self.supports(HttpVersion::Http11)
    }
}
