//! Per-endpoint connection pool.
//!
//! All pool state lives inside one spawned task fed by an MPSC command
//! queue; public operations enqueue commands and await replies. There is
//! no other synchronization: the active array, the parked deque, the
//! waiter buffer and every counter are touched by the pool task alone.
//!
//! Acquisition uses power-of-k-choices selection over the active array,
//! growing the pool when the sampled candidates are loaded beyond the
//! configured threshold, buffering waiters when it cannot grow, and
//! failing them when the waiter buffer is bounded and full.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::config::ClientConfig;
use crate::conn::{ConnEvents, ConnHandle};
use crate::error::{Error, Result};
use crate::exchange::ExchangeTask;
use crate::proto::{h1, h2};
use crate::transport::{ChannelFactory, EstablishedChannel, NegotiatedProtocol};

/// Stand-in capacity for connections without a concurrency cap.
pub(crate) const UNBOUNDED_CAPACITY: usize = u32::MAX as usize;

/// Commands accepted by the pool task.
pub(crate) enum Command {
    Acquire(Waiter),
    /// An exchange terminated; one allocation returns to `id`.
    Release { id: u64 },
    ConnClosed { id: u64 },
    ConnCapacity { id: u64, capacity: usize },
    Established { id: u64, channel: EstablishedChannel },
    EstablishFailed { id: u64, error: Error },
    Shutdown { graceful: bool, ack: oneshot::Sender<()> },
    ForceClose,
    Report(oneshot::Sender<PoolReport>),
}

/// A pending acquisition: the oneshot the handle is delivered through.
/// A dropped receiver marks the waiter canceled; the pool skips it.
pub(crate) struct Waiter {
    tx: oneshot::Sender<Result<PoolHandle>>,
}

/// Releases one allocation back to the pool on drop.
pub(crate) struct ReleaseGuard {
    tx: mpsc::UnboundedSender<Command>,
    conn_id: u64,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Release { id: self.conn_id });
    }
}

impl std::fmt::Debug for ReleaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseGuard")
            .field("conn_id", &self.conn_id)
            .finish()
    }
}

/// A reservation on a connection.
///
/// Sending an exchange moves the reservation into the exchange; dropping
/// the handle unused returns the allocation immediately.
pub(crate) struct PoolHandle {
    conn: ConnHandle,
    guard: Option<ReleaseGuard>,
}

impl PoolHandle {
    /// Forward the exchange to the connection. The allocation is released
    /// when the exchange terminates, whatever way it terminates.
    pub(crate) fn send(mut self, mut task: ExchangeTask) {
        task.guard = self.guard.take();
        if let Err(task) = self.conn.send_exchange(task) {
            let (mut inflight, _request) = task.into_inflight();
            inflight.dispose(Some(
                Error::new_http().with_message("connection closed before exchange started"),
            ));
        }
    }
}

/// Snapshot of the pool counters, served by the pool task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolReport {
    pub size: usize,
    pub parked: usize,
    pub connecting: usize,
    pub queued: usize,
    pub capacity: usize,
    pub total_capacity: usize,
    pub load_factor: f64,
}

#[derive(Default)]
struct PoolMetrics {
    connecting: AtomicUsize,
    queued: AtomicUsize,
    in_use: AtomicUsize,
}

/// Handle to a running pool task.
pub(crate) struct Pool {
    tx: mpsc::UnboundedSender<Command>,
    closed: Arc<AtomicBool>,
    metrics: Arc<PoolMetrics>,
    connect_timeout: Duration,
}

impl Pool {
    /// Spawn the pool task. Must run inside a tokio runtime.
    pub(crate) fn new(
        config: Arc<ClientConfig>,
        factory: Arc<dyn ChannelFactory>,
        authority: Arc<str>,
        scheme: &'static str,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let metrics = Arc::new(PoolMetrics::default());
        let connect_timeout = config.pool_connect_timeout;

        let task = PoolTask::new(config, factory, authority, scheme, tx.clone(), metrics.clone());
        tokio::spawn(task.run(rx));

        Self {
            tx,
            closed,
            metrics,
            connect_timeout,
        }
    }

    /// Acquire a connection reservation, waiting up to the configured
    /// connect timeout for capacity to appear.
    pub(crate) async fn acquire(&self) -> Result<PoolHandle> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::new_pool_closed());
        }
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Acquire(Waiter { tx })).is_err() {
            return Err(Error::new_pool_closed());
        }
        match tokio::time::timeout(self.connect_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::new_pool_closed()),
            Err(_) => Err(Error::new_timeout()),
        }
    }

    /// `connecting + (total_capacity − capacity) + queued`.
    pub(crate) fn active_requests(&self) -> usize {
        self.metrics.connecting.load(Ordering::Acquire)
            + self.metrics.in_use.load(Ordering::Acquire)
            + self.metrics.queued.load(Ordering::Acquire)
    }

    /// Mean load factor over active connections.
    pub(crate) async fn load_factor(&self) -> f64 {
        self.report().await.map(|report| report.load_factor).unwrap_or(0.0)
    }

    pub(crate) async fn report(&self) -> Option<PoolReport> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(Command::Report(tx)).ok()?;
        rx.await.ok()
    }

    /// Close the pool. Completes once every connection terminated.
    pub(crate) async fn shutdown(&self, graceful: bool) {
        self.closed.store(true, Ordering::Release);
        let (ack, done) = oneshot::channel();
        if self.tx.send(Command::Shutdown { graceful, ack }).is_ok() {
            let _ = done.await;
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

struct ConnEntry {
    id: u64,
    handle: ConnHandle,
    capacity: usize,
    allocated: usize,
    last_released_at: Instant,
}

impl ConnEntry {
    fn load_factor(&self) -> f64 {
        if self.capacity == 0 {
            1.0
        } else {
            self.allocated as f64 / self.capacity as f64
        }
    }

    fn spare(&self) -> usize {
        self.capacity.saturating_sub(self.allocated)
    }
}

enum Lifecycle {
    Open,
    ShuttingDown { acks: Vec<oneshot::Sender<()>> },
}

struct PoolTask {
    config: Arc<ClientConfig>,
    factory: Arc<dyn ChannelFactory>,
    authority: Arc<str>,
    scheme: &'static str,
    tx: mpsc::UnboundedSender<Command>,
    metrics: Arc<PoolMetrics>,

    active: Vec<ConnEntry>,
    parked: VecDeque<ConnEntry>,
    /// Waiter buffer: enqueued at the head, drained from the tail, so
    /// waiters are served in arrival order.
    buffer: VecDeque<Waiter>,
    /// Waiters riding on an in-progress connection attempt, by attempt id.
    pending: HashMap<u64, Waiter>,
    connecting: usize,
    next_id: u64,
    lifecycle: Lifecycle,
}

impl PoolTask {
    fn new(
        config: Arc<ClientConfig>,
        factory: Arc<dyn ChannelFactory>,
        authority: Arc<str>,
        scheme: &'static str,
        tx: mpsc::UnboundedSender<Command>,
        metrics: Arc<PoolMetrics>,
    ) -> Self {
        Self {
            config,
            factory,
            authority,
            scheme,
            tx,
            metrics,
            active: Vec::new(),
            parked: VecDeque::new(),
            buffer: VecDeque::new(),
            pending: HashMap::new(),
            connecting: 0,
            next_id: 1,
            lifecycle: Lifecycle::Open,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let mut clean = tokio::time::interval(self.config.pool_clean_period);
        clean.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => {
                        // endpoint dropped without shutdown: force close
                        self.close_all();
                        break;
                    }
                },
                _ = clean.tick() => self.clean(),
            }

            if let Lifecycle::ShuttingDown { ref mut acks } = self.lifecycle {
                if self.active.is_empty() && self.parked.is_empty() {
                    for ack in acks.drain(..) {
                        let _ = ack.send(());
                    }
                    break;
                }
            }
            self.refresh_metrics();
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Acquire(waiter) => self.acquire(waiter),
            Command::Release { id } => self.release(id),
            Command::ConnClosed { id } => self.conn_closed(id),
            Command::ConnCapacity { id, capacity } => self.conn_capacity(id, capacity),
            Command::Established { id, channel } => self.established(id, channel),
            Command::EstablishFailed { id, error } => self.establish_failed(id, error),
            Command::Shutdown { graceful, ack } => self.shutdown(graceful, ack),
            Command::ForceClose => self.close_all(),
            Command::Report(tx) => {
                let _ = tx.send(self.report());
            }
        }
    }

    fn report(&self) -> PoolReport {
        PoolReport {
            size: self.active.len(),
            parked: self.parked.len(),
            connecting: self.connecting,
            queued: self.buffer.len(),
            capacity: self.capacity(),
            total_capacity: self.total_capacity(),
            load_factor: self.mean_load_factor(),
        }
    }

    fn capacity(&self) -> usize {
        self.active.iter().map(ConnEntry::spare).sum()
    }

    fn total_capacity(&self) -> usize {
        self.active.iter().map(|entry| entry.capacity).sum()
    }

    fn mean_load_factor(&self) -> f64 {
        if self.active.is_empty() {
            return 0.0;
        }
        self.active
            .iter()
            .map(ConnEntry::load_factor)
            .sum::<f64>()
            / self.active.len() as f64
    }

    fn total_allocated(&self) -> usize {
        self.active
            .iter()
            .chain(self.parked.iter())
            .map(|entry| entry.allocated)
            .sum()
    }

    fn refresh_metrics(&self) {
        self.metrics
            .connecting
            .store(self.connecting, Ordering::Release);
        self.metrics
            .queued
            .store(self.buffer.len(), Ordering::Release);
        self.metrics.in_use.store(
            self.active.iter().map(|entry| entry.allocated).sum(),
            Ordering::Release,
        );
    }

    fn is_shutting_down(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::ShuttingDown { .. })
    }

    // ===== acquisition =====

    fn acquire(&mut self, waiter: Waiter) {
        if self.is_shutting_down() {
            let _ = waiter.tx.send(Err(Error::new_pool_closed()));
            return;
        }
        if waiter.tx.is_closed() {
            return;
        }

        // selection over a k-sample of the active array
        let n = self.active.len();
        if n > 0 && self.capacity() > 0 {
            let k = self.config.pool_select_choice_count().min(n);
            let mut rng = rand::rng();
            let sampled = rand::seq::index::sample(&mut rng, n, k);
            let best = sampled
                .iter()
                .min_by(|a, b| {
                    let fa = self.active[*a].load_factor();
                    let fb = self.active[*b].load_factor();
                    fa.partial_cmp(&fb).unwrap_or(std::cmp::Ordering::Equal)
                })
                .unwrap_or(0);
            let f = self.active[best].load_factor();
            let room_to_grow =
                self.active.len() + self.connecting < self.config.pool_max_size;
            if f < 1.0 && !(f > self.config.pool_select_load_threshold() && room_to_grow) {
                self.assign(best, waiter);
                return;
            }
            trace!(load_factor = f, "sampled candidates rejected");
        }

        // rejection path: grow, buffer, or fail
        if self.active.len() + self.connecting < self.config.pool_max_size {
            self.grow(waiter);
        } else {
            self.buffer_waiter(waiter);
        }
    }

    fn assign(&mut self, index: usize, waiter: Waiter) {
        let entry = &mut self.active[index];
        entry.allocated += 1;
        let handle = PoolHandle {
            conn: entry.handle.clone(),
            guard: Some(ReleaseGuard {
                tx: self.tx.clone(),
                conn_id: entry.id,
            }),
        };
        trace!(
            conn.id = entry.id,
            allocated = entry.allocated,
            capacity = entry.capacity,
            "assigned connection"
        );
        if waiter.tx.send(Ok(handle)).is_err() {
            // waiter canceled in the meantime; the guard in the rejected
            // handle releases the allocation right away
        }
    }

    fn grow(&mut self, waiter: Waiter) {
        // revive the most recently parked, non-expired connection first
        while let Some(mut entry) = self.parked.pop_back() {
            if self.expired(&entry) {
                debug!(conn.id = entry.id, "drop expired parked connection");
                entry.handle.close();
                continue;
            }
            trace!(conn.id = entry.id, "revive parked connection");
            entry.last_released_at = Instant::now();
            self.active.push(entry);
            let index = self.active.len() - 1;
            self.assign(index, waiter);
            return;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.connecting += 1;
        self.pending.insert(id, waiter);

        let factory = self.factory.clone();
        let tx = self.tx.clone();
        let connect_timeout = self.config.pool_connect_timeout;
        debug!(conn.id = id, "open new channel");
        tokio::spawn(async move {
            let command = match tokio::time::timeout(connect_timeout, factory.open()).await {
                Ok(Ok(channel)) => Command::Established { id, channel },
                Ok(Err(error)) => Command::EstablishFailed { id, error },
                Err(_) => Command::EstablishFailed {
                    id,
                    error: Error::new_timeout(),
                },
            };
            let _ = tx.send(command);
        });
    }

    fn buffer_waiter(&mut self, waiter: Waiter) {
        self.buffer.retain(|waiter| !waiter.tx.is_closed());
        let has_room = match self.config.pool_buffer_size {
            None => true,
            Some(buffer_size) => {
                buffer_size > self.buffer.len() + self.connecting
            }
        };
        if has_room {
            trace!(queued = self.buffer.len() + 1, "buffer waiter");
            self.buffer.push_front(waiter);
        } else {
            let _ = waiter.tx.send(Err(Error::new_pool_overflow()));
        }
    }

    fn drain_waiters(&mut self) {
        let mut rounds = self.buffer.len();
        while rounds > 0 && self.capacity() > 0 {
            rounds -= 1;
            let Some(waiter) = self.buffer.pop_back() else {
                break;
            };
            if waiter.tx.is_closed() {
                continue;
            }
            self.acquire(waiter);
        }
    }

    // ===== connection lifecycle =====

    fn established(&mut self, id: u64, channel: EstablishedChannel) {
        self.connecting = self.connecting.saturating_sub(1);
        let waiter = self.pending.remove(&id);

        if self.is_shutting_down() {
            // channel arrived late; drop it on the floor
            if let Some(waiter) = waiter {
                let _ = waiter.tx.send(Err(Error::new_pool_closed()));
            }
            return;
        }

        let events = ConnEvents::new(self.tx.clone(), id);
        let (handle, capacity) = match channel.negotiated {
            NegotiatedProtocol::H2 => {
                let handle = h2::Http2Connection::spawn(
                    channel.io,
                    self.config.clone(),
                    self.authority.clone(),
                    self.scheme,
                    events,
                );
                (handle, self.config.http2_max_concurrent_streams as usize)
            }
            NegotiatedProtocol::Http1 => {
                let handle = h1::Http1Connection::spawn(
                    channel.io,
                    self.config.clone(),
                    self.authority.clone(),
                    false,
                    events,
                );
                let capacity = self
                    .config
                    .http1_max_concurrent_requests
                    .unwrap_or(UNBOUNDED_CAPACITY);
                (handle, capacity)
            }
            NegotiatedProtocol::Http1WithH2cUpgrade => {
                let handle = h1::Http1Connection::spawn(
                    channel.io,
                    self.config.clone(),
                    self.authority.clone(),
                    true,
                    events,
                );
                // a single exchange decides the upgrade; capacity widens
                // once the connection reports the outcome
                (handle, 1)
            }
        };

        debug!(conn.id = id, capacity, "connection established");
        self.active.push(ConnEntry {
            id,
            handle,
            capacity,
            allocated: 0,
            last_released_at: Instant::now(),
        });
        let index = self.active.len() - 1;

        if let Some(waiter) = waiter {
            if waiter.tx.is_closed() {
                trace!(conn.id = id, "growth waiter canceled before establishment");
            } else {
                self.assign(index, waiter);
            }
        }
        self.drain_waiters();
    }

    fn establish_failed(&mut self, id: u64, error: Error) {
        self.connecting = self.connecting.saturating_sub(1);
        warn!(conn.id = id, error = %error, "channel establishment failed");
        if let Some(waiter) = self.pending.remove(&id) {
            let _ = waiter.tx.send(Err(error));
        }
        // freed connecting slot: buffered waiters may now trigger growth
        self.drain_buffered_into_growth();
    }

    fn drain_buffered_into_growth(&mut self) {
        if self.is_shutting_down() {
            return;
        }
        while self.active.len() + self.connecting < self.config.pool_max_size {
            let Some(waiter) = self.buffer.pop_back() else {
                return;
            };
            if waiter.tx.is_closed() {
                continue;
            }
            self.acquire(waiter);
        }
    }

    fn release(&mut self, id: u64) {
        let now = Instant::now();
        if let Some(entry) = self.active.iter_mut().find(|entry| entry.id == id) {
            entry.allocated = entry.allocated.saturating_sub(1);
            entry.last_released_at = now;
            trace!(conn.id = id, allocated = entry.allocated, "released allocation");
            self.drain_waiters();
        } else if let Some(entry) = self.parked.iter_mut().find(|entry| entry.id == id) {
            entry.allocated = entry.allocated.saturating_sub(1);
            entry.last_released_at = now;
        }
    }

    fn conn_closed(&mut self, id: u64) {
        self.active.retain(|entry| entry.id != id);
        self.parked.retain(|entry| entry.id != id);
        debug!(conn.id = id, size = self.active.len(), "removed closed connection");
        if !self.is_shutting_down() {
            // lost capacity may leave waiters stranded; try growing for them
            self.drain_buffered_into_growth();
        }
    }

    fn conn_capacity(&mut self, id: u64, capacity: usize) {
        if let Some(entry) = self
            .active
            .iter_mut()
            .chain(self.parked.iter_mut())
            .find(|entry| entry.id == id)
        {
            let grew = capacity > entry.capacity;
            // zero capacity is honored: the connection accepts no new
            // exchanges until the peer raises the limit again
            entry.capacity = capacity;
            if grew {
                self.drain_waiters();
            }
        }
    }

    // ===== parking & cleanup =====

    fn expired(&self, entry: &ConnEntry) -> bool {
        match self.config.pool_keep_alive_timeout {
            Some(keep_alive) => {
                entry.allocated == 0 && Instant::now() >= entry.last_released_at + keep_alive
            }
            None => false,
        }
    }

    fn clean(&mut self) {
        if self.is_shutting_down() {
            return;
        }

        // evict expired parked connections
        let keep_alive = self.config.pool_keep_alive_timeout;
        let now = Instant::now();
        self.parked.retain(|entry| {
            let expired = match keep_alive {
                Some(keep_alive) => {
                    entry.allocated == 0 && now >= entry.last_released_at + keep_alive
                }
                None => false,
            };
            if expired {
                debug!(conn.id = entry.id, "evict expired parked connection");
                entry.handle.close();
            }
            !expired
        });

        // park underutilized connections, least-loaded first, as long as
        // the remaining active capacity still covers every allocation
        let threshold = self.config.pool_select_load_threshold();
        let mut buckets: Vec<Vec<u64>> = vec![Vec::new(); 10];
        for entry in &self.active {
            let f = entry.load_factor();
            if f <= threshold {
                let bucket = ((f * 10.0) as usize).min(9);
                buckets[bucket].push(entry.id);
            }
        }

        let total_allocated = self.total_allocated();
        let mut active_capacity = self.total_capacity();
        'parking: for bucket in buckets {
            for id in bucket {
                let Some(index) = self.active.iter().position(|entry| entry.id == id) else {
                    continue;
                };
                let capacity = self.active[index].capacity;
                if active_capacity.saturating_sub(capacity) < total_allocated {
                    break 'parking;
                }
                active_capacity -= capacity;
                let entry = self.active.swap_remove(index);
                trace!(conn.id = entry.id, "parked connection");
                self.parked.push_back(entry);
            }
        }
    }

    // ===== shutdown =====

    fn shutdown(&mut self, graceful: bool, ack: oneshot::Sender<()>) {
        debug!(graceful, "pool shutting down");
        for waiter in self.buffer.drain(..) {
            let _ = waiter.tx.send(Err(Error::new_pool_closed()));
        }
        for (_, waiter) in self.pending.drain() {
            let _ = waiter.tx.send(Err(Error::new_pool_closed()));
        }

        for entry in self.active.iter().chain(self.parked.iter()) {
            if graceful {
                entry.handle.shutdown_gracefully();
            } else {
                entry.handle.close();
            }
        }

        match self.lifecycle {
            Lifecycle::Open => {
                self.lifecycle = Lifecycle::ShuttingDown { acks: vec![ack] };
            }
            Lifecycle::ShuttingDown { ref mut acks } => acks.push(ack),
        }

        if graceful {
            let tx = self.tx.clone();
            let deadline = self.config.graceful_shutdown_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                let _ = tx.send(Command::ForceClose);
            });
        }
    }

    fn close_all(&mut self) {
        for entry in self.active.iter().chain(self.parked.iter()) {
            entry.handle.close();
        }
    }
}
