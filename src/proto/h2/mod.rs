//! HTTP/2 client connection: stream multiplexing, HPACK, flow control,
//! SETTINGS negotiation and capacity feedback into the pool.

pub(crate) mod conn;
pub(crate) mod flow;
pub(crate) mod frame;
pub(crate) mod hpack;

pub(crate) use conn::{Http2Connection, run_upgraded};
