//! TLS session setup with opportunistic ALPN.

use std::sync::Arc;

use rustls::RootCertStore;
use rustls_pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::trace;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::transport::{BoxChannel, Channel};

/// TLS material for an endpoint: a rustls client configuration and the
/// server name presented during the handshake.
///
/// ALPN protocols are derived from the endpoint configuration at handshake
/// time, ordered the way they were configured.
pub struct TlsConfig {
    client_config: rustls::ClientConfig,
    server_name: ServerName<'static>,
}

impl TlsConfig {
    /// TLS against `server_name`, trusting the platform root store.
    pub fn new(server_name: impl Into<String>) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for cert in native.certs {
            // ignore unparsable platform certificates
            let _ = roots.add(cert);
        }
        let client_config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(Error::new_connect)?
        .with_root_certificates(roots)
        .with_no_client_auth();
        Self::with_rustls_config(server_name, client_config)
    }

    /// TLS with a caller-provided rustls configuration.
    pub fn with_rustls_config(
        server_name: impl Into<String>,
        client_config: rustls::ClientConfig,
    ) -> Result<Self> {
        let server_name = ServerName::try_from(server_name.into())
            .map_err(|err| Error::new_connect(err).with_message("invalid tls server name"))?;
        Ok(Self {
            client_config,
            server_name,
        })
    }

    /// Run the handshake, returning the session and the ALPN protocol the
    /// server selected (if any).
    pub(crate) async fn handshake<T: Channel>(
        &self,
        io: T,
        config: &ClientConfig,
    ) -> Result<(BoxChannel, Option<Vec<u8>>)> {
        let mut client_config = self.client_config.clone();
        if client_config.alpn_protocols.is_empty() {
            client_config.alpn_protocols = config
                .protocols
                .iter()
                .map(|proto| proto.alpn_id().to_vec())
                .collect();
        }
        trace!(
            alpn = ?client_config
                .alpn_protocols
                .iter()
                .map(|p| String::from_utf8_lossy(p).into_owned())
                .collect::<Vec<_>>(),
            "start tls handshake"
        );

        let connector = TlsConnector::from(Arc::new(client_config));
        let stream = connector
            .connect(self.server_name.clone(), io)
            .await
            .map_err(Error::new_connect)?;

        let alpn = stream
            .get_ref()
            .1
            .alpn_protocol()
            .map(|proto| proto.to_vec());
        Ok((Box::new(stream), alpn))
    }
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("server_name", &self.server_name)
            .finish()
    }
}
