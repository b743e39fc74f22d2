//! Connection handles shared between the pool and the protocol tasks.
//!
//! Every connection is owned by exactly one spawned task; the rest of the
//! client talks to it through a [`ConnHandle`] command channel and hears
//! back through pool commands ([`ConnEvents`]).

use tokio::sync::mpsc;
use tracing::trace;

use crate::exchange::ExchangeTask;
use crate::pool;

/// Protocol family a connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnKind {
    Http1,
    Http2,
}

/// Commands a connection task accepts.
pub(crate) enum ConnCommand {
    Exchange(ExchangeTask),
    /// Finish in-flight exchanges, then close.
    ShutdownGracefully,
    /// Close now; in-flight exchanges fail.
    Close,
}

/// Cloneable sender half of a connection's command channel.
#[derive(Clone)]
pub(crate) struct ConnHandle {
    tx: mpsc::UnboundedSender<ConnCommand>,
    kind: ConnKind,
}

impl ConnHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ConnCommand>, kind: ConnKind) -> Self {
        Self { tx, kind }
    }

    /// Hand an exchange to the connection; returns it when the task is gone.
    pub(crate) fn send_exchange(
        &self,
        task: ExchangeTask,
    ) -> std::result::Result<(), ExchangeTask> {
        self.tx
            .send(ConnCommand::Exchange(task))
            .map_err(|err| match err.0 {
                ConnCommand::Exchange(task) => task,
                _ => unreachable!("exchange commands round-trip"),
            })
    }

    pub(crate) fn shutdown_gracefully(&self) {
        let _ = self.tx.send(ConnCommand::ShutdownGracefully);
    }

    pub(crate) fn close(&self) {
        let _ = self.tx.send(ConnCommand::Close);
    }
}

impl std::fmt::Debug for ConnHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnHandle").field("kind", &self.kind).finish()
    }
}

/// How a connection task reports lifecycle changes back to its pool.
#[derive(Clone)]
pub(crate) struct ConnEvents {
    tx: mpsc::UnboundedSender<pool::Command>,
    pub(crate) conn_id: u64,
}

impl ConnEvents {
    pub(crate) fn new(tx: mpsc::UnboundedSender<pool::Command>, conn_id: u64) -> Self {
        Self { tx, conn_id }
    }

    /// The transport closed; the pool drops the connection.
    pub(crate) fn closed(&self) {
        trace!(conn.id = self.conn_id, "connection closed");
        let _ = self.tx.send(pool::Command::ConnClosed { id: self.conn_id });
    }

    /// The connection's concurrency capacity changed (h2 SETTINGS, h2c
    /// upgrade resolution).
    pub(crate) fn capacity_changed(&self, capacity: usize) {
        trace!(conn.id = self.conn_id, capacity, "connection capacity changed");
        let _ = self.tx.send(pool::Command::ConnCapacity {
            id: self.conn_id,
            capacity,
        });
    }
}
