//! Test utilities: in-memory transport channels.
//!
//! [`MockChannelFactory`] lets tests run an endpoint against a server
//! closure over a duplex pipe, without opening sockets, while counting
//! exactly how many channels were opened.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::future::BoxFuture;
use tokio::io::DuplexStream;

use crate::config::ClientConfig;
use crate::error::Result;
use crate::transport::{ChannelFactory, EstablishedChannel, NegotiatedProtocol};

/// The server side of a mock channel.
pub type MockServerFn =
    Arc<dyn Fn(DuplexStream) -> BoxFuture<'static, ()> + Send + Sync + 'static>;

/// A [`ChannelFactory`] producing in-memory duplex channels, each served
/// by a fresh invocation of the server closure.
pub struct MockChannelFactory {
    serve: MockServerFn,
    negotiated: NegotiatedProtocol,
    buffer_size: usize,
    opened: AtomicUsize,
}

impl MockChannelFactory {
    /// Channels negotiate like plaintext TCP would under `config`:
    /// `{h2}` prior knowledge, `{h2, h1}` upgrade, otherwise http/1.1.
    pub fn new<F, Fut>(config: &ClientConfig, serve: F) -> Arc<Self>
    where
        F: Fn(DuplexStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let negotiated = if config.wants_h2_prior_knowledge() {
            NegotiatedProtocol::H2
        } else if config.wants_h2c_upgrade() {
            NegotiatedProtocol::Http1WithH2cUpgrade
        } else {
            NegotiatedProtocol::Http1
        };
        Arc::new(Self {
            serve: Arc::new(move |stream| Box::pin(serve(stream))),
            negotiated,
            buffer_size: 64 << 10,
            opened: AtomicUsize::new(0),
        })
    }

    /// How many channels this factory has opened.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::Acquire)
    }
}

impl ChannelFactory for MockChannelFactory {
    fn open(&self) -> BoxFuture<'_, Result<EstablishedChannel>> {
        Box::pin(async move {
            let (client, server) = tokio::io::duplex(self.buffer_size);
            self.opened.fetch_add(1, Ordering::AcqRel);
            let serve = self.serve.clone();
            tokio::spawn(async move {
                serve(server).await;
            });
            Ok(EstablishedChannel::new(Box::new(client), self.negotiated))
        })
    }
}

impl std::fmt::Debug for MockChannelFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockChannelFactory")
            .field("negotiated", &self.negotiated)
            .field("opened", &self.opened())
            .finish()
    }
}
