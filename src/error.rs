//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

/// Alias for a type-erased error type.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Result type often returned from methods that can fail with a client [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Represents errors that can occur while driving a client exchange.
///
/// # Formatting
///
/// The `Display` implementation of this type only prints the details of
/// this level of error, even though it may have been caused by another error
/// and contain that error in its source chain. To print all the relevant
/// information use something like `std::error::Report`.
///
/// # Source
///
/// An `Error` may be caused by another error. To aid in debugging,
/// those are exposed in `Error::source()` as erased types.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<BoxError>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// TCP connect, proxy tunnel, TLS handshake or ALPN selection failed.
    EndpointConnect,
    /// A waiter, handshake or request deadline elapsed.
    ConnectionTimeout,
    /// Generic protocol-level failure.
    HttpClient,
    /// The h2c upgrade was attempted and could not complete.
    HttpClientUpgrade,
    /// The pool is closed, or its pending-request buffer overflowed.
    ConnectionPool(Pool),
    /// The exchange was canceled by the caller.
    Cancelled,
    /// The WebSocket opening handshake failed.
    WebSocketHandshake,
    /// The peer violated the WebSocket framing protocol.
    WebSocketProtocol,
}

#[derive(Debug)]
pub(crate) enum Pool {
    Closed,
    MaxPendingConnectionsExceeded,
}

// Sentinel type marking an error as caused by a timer firing.
#[derive(Debug)]
pub(crate) struct TimedOut;

impl Error {
    #[inline(always)]
    pub(crate) fn new(kind: Kind) -> Self {
        Self {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    #[inline(always)]
    pub(crate) fn with<C: Into<BoxError>>(mut self, cause: C) -> Self {
        self.inner.cause = Some(cause.into());
        self
    }

    #[inline(always)]
    pub(crate) fn with_message(self, msg: impl Into<String>) -> Self {
        self.with(Message(msg.into()))
    }

    #[inline(always)]
    pub(crate) fn kind(&self) -> &Kind {
        &self.inner.kind
    }

    /// Returns true if establishing the transport channel failed
    /// (TCP, proxy tunnel, TLS or ALPN).
    #[must_use]
    pub fn is_connect(&self) -> bool {
        matches!(self.inner.kind, Kind::EndpointConnect)
    }

    /// Returns true if a connection could not be obtained in time,
    /// or a started request saw no response headers in time.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::ConnectionTimeout)
            || self.find_source::<TimedOut>().is_some()
    }

    /// Returns true if this is a generic HTTP protocol failure.
    #[must_use]
    pub fn is_http(&self) -> bool {
        matches!(self.inner.kind, Kind::HttpClient)
    }

    /// Returns true if the h2c upgrade failed.
    #[must_use]
    pub fn is_upgrade(&self) -> bool {
        matches!(self.inner.kind, Kind::HttpClientUpgrade)
    }

    /// Returns true if the pool rejected the acquisition.
    #[must_use]
    pub fn is_pool(&self) -> bool {
        matches!(self.inner.kind, Kind::ConnectionPool(_))
    }

    /// Returns true if the pool rejected the acquisition because it is closed.
    #[must_use]
    pub fn is_pool_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::ConnectionPool(Pool::Closed))
    }

    /// Returns true if the exchange was canceled by the caller.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.inner.kind, Kind::Cancelled)
    }

    /// Returns true if the WebSocket opening handshake failed.
    #[must_use]
    pub fn is_ws_handshake(&self) -> bool {
        matches!(self.inner.kind, Kind::WebSocketHandshake)
    }

    /// Returns true if the peer violated the WebSocket framing protocol.
    #[must_use]
    pub fn is_ws_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::WebSocketProtocol)
    }

    pub(crate) fn find_source<E: StdError + 'static>(&self) -> Option<&E> {
        let mut cause = self.source();
        while let Some(err) = cause {
            if let Some(typed) = err.downcast_ref() {
                return Some(typed);
            }
            cause = err.source();
        }
        None
    }

    #[inline(always)]
    pub(crate) fn new_connect<C: Into<BoxError>>(cause: C) -> Self {
        Self::new(Kind::EndpointConnect).with(cause)
    }

    #[inline(always)]
    pub(crate) fn new_timeout() -> Self {
        Self::new(Kind::ConnectionTimeout).with(TimedOut)
    }

    #[inline(always)]
    pub(crate) fn new_http() -> Self {
        Self::new(Kind::HttpClient)
    }

    #[inline(always)]
    pub(crate) fn new_io(cause: std::io::Error) -> Self {
        Self::new(Kind::HttpClient).with(cause)
    }

    #[inline(always)]
    pub(crate) fn new_upgrade() -> Self {
        Self::new(Kind::HttpClientUpgrade)
    }

    #[inline(always)]
    pub(crate) fn new_pool_closed() -> Self {
        Self::new(Kind::ConnectionPool(Pool::Closed))
    }

    #[inline(always)]
    pub(crate) fn new_pool_overflow() -> Self {
        Self::new(Kind::ConnectionPool(Pool::MaxPendingConnectionsExceeded))
    }

    #[inline(always)]
    pub(crate) fn new_cancelled() -> Self {
        Self::new(Kind::Cancelled)
    }

    #[inline(always)]
    pub(crate) fn new_ws_handshake() -> Self {
        Self::new(Kind::WebSocketHandshake)
    }

    #[inline(always)]
    pub(crate) fn new_ws_protocol() -> Self {
        Self::new(Kind::WebSocketProtocol)
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::EndpointConnect => "error connecting to endpoint",
            Kind::ConnectionTimeout => "connection timed out",
            Kind::HttpClient => "http client error",
            Kind::HttpClientUpgrade => "h2c upgrade failed",
            Kind::ConnectionPool(Pool::Closed) => "connection pool is closed",
            Kind::ConnectionPool(Pool::MaxPendingConnectionsExceeded) => {
                "maximum number of pending connections exceeded"
            }
            Kind::Cancelled => "exchange was cancelled",
            Kind::WebSocketHandshake => "websocket handshake failed",
            Kind::WebSocketProtocol => "websocket protocol violated",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("remora::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

// required by the codec layer driving WebSocket frames
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::new_io(err)
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        // Causes are not clonable; keep the kind and render the cause chain
        // into a message so fan-out to multiple exchanges stays lossless
        // enough for callers.
        let kind = match self.inner.kind {
            Kind::EndpointConnect => Kind::EndpointConnect,
            Kind::ConnectionTimeout => Kind::ConnectionTimeout,
            Kind::HttpClient => Kind::HttpClient,
            Kind::HttpClientUpgrade => Kind::HttpClientUpgrade,
            Kind::ConnectionPool(Pool::Closed) => Kind::ConnectionPool(Pool::Closed),
            Kind::ConnectionPool(Pool::MaxPendingConnectionsExceeded) => {
                Kind::ConnectionPool(Pool::MaxPendingConnectionsExceeded)
            }
            Kind::Cancelled => Kind::Cancelled,
            Kind::WebSocketHandshake => Kind::WebSocketHandshake,
            Kind::WebSocketProtocol => Kind::WebSocketProtocol,
        };
        let mut err = Self::new(kind);
        if let Some(ref cause) = self.inner.cause {
            err = err.with_message(cause.to_string());
            if matches!(err.inner.kind, Kind::ConnectionTimeout) {
                // keep `is_timeout` observable through the clone
                err = Self::new(Kind::ConnectionTimeout).with(TimedOut);
            }
        } else if matches!(err.inner.kind, Kind::ConnectionTimeout) {
            err = Self::new_timeout();
        }
        err
    }
}

struct Message(String);

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl StdError for Message {}

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation timed out")
    }
}

impl StdError for TimedOut {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    fn assert_send_sync<T: Send + Sync + 'static>() {}

    #[test]
    fn error_satisfies_send_sync() {
        assert_send_sync::<Error>()
    }

    #[test]
    fn error_size_of() {
        assert_eq!(mem::size_of::<Error>(), mem::size_of::<usize>());
    }

    #[test]
    fn timeout_observable_through_source_chain() {
        let err = Error::new_http().with(Error::new_timeout());
        assert!(err.find_source::<TimedOut>().is_some());
        assert!(err.is_timeout());
    }

    #[test]
    fn clone_keeps_kind() {
        let err = Error::new_pool_overflow().with_message("buffer full");
        let clone = err.clone();
        assert!(clone.is_pool());
        assert!(!clone.is_pool_closed());
        assert!(Error::new_timeout().clone().is_timeout());
    }
}
