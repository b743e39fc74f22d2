//! The endpoint façade.
//!
//! An [`Endpoint`] targets one remote authority and owns exactly one
//! connection pool. Exchanges are built through it, run through the
//! interceptor chain, and dispatched onto pooled connections; WebSocket
//! requests ride dedicated channels opened by the same factory.

use std::net::SocketAddr;
use std::sync::Arc;

use http::Method;
use http::header::HeaderMap;
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::exchange::{Exchange, ExchangeTask, Request, Response};
use crate::pool::Pool;
use crate::transport::{
    Authority, ChannelFactory, EstablishedChannel, TcpChannelFactory, TlsConfig,
};
use crate::ws::WebSocketRequest;

pub mod intercept;

use intercept::{Interceptor, Outcome};

/// A client endpoint: one remote authority, one pool, one interceptor
/// chain.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

pub(crate) struct EndpointInner {
    authority: Authority,
    authority_str: Arc<str>,
    scheme: &'static str,
    config: Arc<ClientConfig>,
    factory: Arc<dyn ChannelFactory>,
    pool: Pool,
    interceptors: Vec<Interceptor>,
}

impl Endpoint {
    /// Start building an endpoint for `host:port`.
    pub fn builder(host: impl Into<String>, port: u16) -> Builder {
        Builder {
            authority: Authority::new(host, port),
            local_address: None,
            config: ClientConfig::default(),
            tls: None,
            interceptors: Vec::new(),
            factory: None,
        }
    }

    pub fn authority(&self) -> &Authority {
        &self.inner.authority
    }

    /// Build an exchange for an absolute request target.
    pub fn exchange(&self, method: Method, request_target: &str) -> Result<Exchange> {
        let request = Request::new(method, request_target)?;
        Ok(Exchange {
            endpoint: self.inner.clone(),
            request,
        })
    }

    /// Build a WebSocket request for an absolute request target.
    pub fn websocket_request(&self, request_target: &str) -> Result<WebSocketRequest> {
        if !request_target.starts_with('/') {
            return Err(Error::new_http().with_message(format!(
                "request target must be absolute: {request_target:?}"
            )));
        }
        Ok(WebSocketRequest {
            endpoint: self.inner.clone(),
            target: request_target.to_owned(),
            subprotocols: Vec::new(),
            headers: HeaderMap::new(),
        })
    }

    /// Close the endpoint immediately; in-flight exchanges fail.
    pub async fn shutdown(&self) {
        debug!(authority = %self.inner.authority, "endpoint shutdown");
        self.inner.pool.shutdown(false).await;
    }

    /// Drain every connection, then close. Completes once all connections
    /// terminated (bounded by the configured graceful shutdown timeout).
    pub async fn shutdown_gracefully(&self) {
        debug!(authority = %self.inner.authority, "endpoint graceful shutdown");
        self.inner.pool.shutdown(true).await;
    }

    /// `connecting + in-use allocations + buffered waiters`.
    pub fn active_requests(&self) -> usize {
        self.inner.pool.active_requests()
    }

    /// Mean load factor over the pool's active connections.
    pub async fn load_factor(&self) -> f64 {
        self.inner.pool.load_factor().await
    }

    #[doc(hidden)]
    pub async fn pool_report(&self) -> Option<crate::pool::PoolReport> {
        self.inner.pool.report().await
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("authority", &self.inner.authority)
            .field("scheme", &self.inner.scheme)
            .finish()
    }
}

impl EndpointInner {
    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn authority_str(&self) -> &str {
        &self.authority_str
    }

    /// Open a dedicated (non-pooled) channel, for WebSocket upgrades.
    pub(crate) async fn open_channel(&self) -> Result<EstablishedChannel> {
        tokio::time::timeout(self.config.pool_connect_timeout, self.factory.open())
            .await
            .map_err(|_| Error::new_timeout())?
    }

    /// Dispatch a finalized request: interceptors first, then the pool.
    pub(crate) async fn dispatch(self: Arc<Self>, request: Request) -> Result<Response> {
        if self.pool.is_closed() {
            return Err(Error::new_pool_closed());
        }

        let (request, response_transformers) = if self.interceptors.is_empty() {
            (request, Vec::new())
        } else {
            match intercept::run_chain(&self.interceptors, request).await? {
                Outcome::Proceed(request, transformers) => (request, transformers),
                Outcome::ShortCircuit(response) => {
                    debug!("interceptor chain short-circuited the exchange");
                    return Ok(response);
                }
            }
        };

        let handle = self.pool.acquire().await?;
        let (task, response_rx) = ExchangeTask::new(
            request,
            self.config.request_timeout,
            self.config.decompression_enabled,
        );
        handle.send(task);

        let mut response = response_rx
            .await
            .map_err(|_| Error::new_http().with_message("exchange dropped by connection"))??;
        for transform in response_transformers {
            response.body_mut().transform(transform)?;
        }
        Ok(response)
    }
}

/// Builds an [`Endpoint`].
pub struct Builder {
    authority: Authority,
    local_address: Option<SocketAddr>,
    config: ClientConfig,
    tls: Option<TlsConfig>,
    interceptors: Vec<Interceptor>,
    factory: Option<Arc<dyn ChannelFactory>>,
}

impl Builder {
    pub fn with_configuration(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Enable TLS with the given material; ALPN advertises the configured
    /// protocols.
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Bind outgoing connections to a local address.
    pub fn with_local_address(mut self, address: SocketAddr) -> Self {
        self.local_address = Some(address);
        self
    }

    /// Append an interceptor; the chain runs in registration order.
    pub fn with_interceptor(mut self, interceptor: Interceptor) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Replace the transport channel factory. Intended for tests that run
    /// the endpoint against in-memory channels.
    pub fn with_channel_factory(mut self, factory: Arc<dyn ChannelFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Build the endpoint. Must be called within a tokio runtime: the
    /// pool task is spawned here.
    pub fn build(self) -> Result<Endpoint> {
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        let config = Arc::new(self.config);
        let authority_str: Arc<str> = Arc::from(self.authority.to_string());

        let factory = match self.factory {
            Some(factory) => factory,
            None => Arc::new(TcpChannelFactory::new(
                self.authority.clone(),
                self.local_address,
                self.tls.map(Arc::new),
                config.clone(),
            )),
        };

        let pool = Pool::new(
            config.clone(),
            factory.clone(),
            authority_str.clone(),
            scheme,
        );

        Ok(Endpoint {
            inner: Arc::new(EndpointInner {
                authority: self.authority,
                authority_str,
                scheme,
                config,
                factory,
                pool,
                interceptors: self.interceptors,
            }),
        })
    }
}

impl std::fmt::Debug for Builder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder")
            .field("authority", &self.authority)
            .field("tls", &self.tls.is_some())
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}
