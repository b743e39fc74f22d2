//! A reactive HTTP client core for a single remote endpoint.
//!
//! `remora` multiplexes exchanges over a bounded pool of connections
//! speaking HTTP/1.0, HTTP/1.1 or HTTP/2 — negotiated through ALPN,
//! spoken with prior knowledge, or reached through the h2c upgrade —
//! with WebSocket sessions layered on HTTP/1.1.
//!
//! # Shape
//!
//! * [`Endpoint`] — one remote authority, one pool, one interceptor chain.
//! * [`exchange::Exchange`] — a single request/response pair with
//!   streaming payloads, trailers and cancellation-by-drop.
//! * The pool selects connections by load factor over a random sample,
//!   buffers waiters when it cannot grow, and parks idle connections
//!   until a keep-alive timeout reclaims them.
//!
//! # Example
//!
//! ```no_run
//! use remora::{ClientConfig, Endpoint};
//!
//! # async fn run() -> remora::Result<()> {
//! let endpoint = Endpoint::builder("example.org", 8080)
//!     .with_configuration(ClientConfig::new().with_decompression(true))
//!     .build()?;
//!
//! let response = endpoint
//!     .exchange(remora::http::Method::GET, "/hello")?
//!     .send()
//!     .await?;
//! assert!(response.status().is_success());
//! let body = response.into_bytes().await?;
//! # let _ = body;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(test, allow(clippy::float_cmp))]
#![cfg_attr(not(test), warn(clippy::print_stdout, clippy::dbg_macro))]

pub use http;

pub mod config;
pub use config::{ClientConfig, HttpVersion, ProxyConfig, ProxyKind};

mod conn;
mod decompress;

pub mod endpoint;
pub use endpoint::{Builder, Endpoint};
pub use endpoint::intercept::{InterceptedExchange, Interceptor, InterceptorFuture};

mod error;
pub use error::{BoxError, Error, Result};

pub mod exchange;
pub use exchange::{Exchange, Request, Response};

mod pool;
#[doc(hidden)]
pub use pool::PoolReport;

mod proto;

pub mod transport;
pub use transport::{Authority, BoxChannel, Channel, ChannelFactory, TlsConfig};

pub mod ws;

pub mod test_utils;
