//! The connection hub: sole owner of the live connection set.
//!
//! Every membership change and every broadcast fan-out goes through one
//! control loop running on its own task. Other tasks only ever talk to it
//! through a [`Hub`] handle, which wraps the sending halves of three bounded
//! channels (register, unregister, broadcast). The loop never performs
//! socket I/O; it only moves [`Payload`]s into per-connection outbound
//! queues with a non-blocking `try_send`.
//!
//! A connection whose outbound queue is full when a broadcast arrives is
//! evicted on the spot. Dropping the hub-held sender is what closes a
//! queue, so a queue can be closed at most once.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use bytes::Bytes;
use thiserror::Error;
use tokio::{
    select,
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot,
    },
};
use tracing::{debug, info, warn};

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;
/// Upper bound for any queue or channel capacity the hub creates.
pub const MAX_CAPACITY: usize = 1_000_000;

/// Identity of one live connection. Allocated by the hub and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// An opaque message. The frame kind is kept so it can be re-emitted with
/// the same opcode; the content is never inspected.
///
/// Clones share one allocation, so a payload sitting in many outbound
/// queues is stored once. Each write task still copies it into an owned
/// axum `Message` when it reaches the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(Arc<str>),
    Binary(Bytes),
}

impl Payload {
    fn len(&self) -> usize {
        match self {
            Payload::Text(text) => text.len(),
            Payload::Binary(bytes) => bytes.len(),
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(Arc::from(text))
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(Arc::from(text))
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Binary(Bytes::from(bytes))
    }
}

/// Capacities outside `1..=MAX_CAPACITY` are clamped when the hub starts.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of every connection's outbound queue.
    pub queue_capacity: usize,
    /// Capacity of each of the hub's three inbound event channels.
    pub channel_capacity: usize,
    /// Relay a sender's own messages back to it.
    pub echo: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            echo: false,
        }
    }
}

impl HubConfig {
    fn clamped(self) -> Self {
        let queue_capacity = self.queue_capacity.clamp(1, MAX_CAPACITY);
        let channel_capacity = self.channel_capacity.clamp(1, MAX_CAPACITY);
        if queue_capacity != self.queue_capacity || channel_capacity != self.channel_capacity {
            warn!(
                queue_capacity,
                channel_capacity, "hub capacities out of range, clamped"
            );
        }
        Self {
            queue_capacity,
            channel_capacity,
            ..self
        }
    }
}

/// Returned when the control loop is no longer running.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("hub control loop is not running")]
pub struct HubClosed;

/// What a caller gets back from [`Hub::register`]: its identity and the
/// receiving end of its outbound queue.
#[derive(Debug)]
pub struct Registration {
    pub id: ConnectionId,
    pub queue: mpsc::Receiver<Payload>,
}

struct RegisterRequest {
    id: ConnectionId,
    queue: mpsc::Sender<Payload>,
    ack: oneshot::Sender<()>,
}

struct BroadcastRequest {
    from: ConnectionId,
    payload: Payload,
}

/// Cloneable handle to the hub control loop.
#[derive(Clone)]
pub struct Hub {
    register_tx: mpsc::Sender<RegisterRequest>,
    unregister_tx: mpsc::Sender<ConnectionId>,
    broadcast_tx: mpsc::Sender<BroadcastRequest>,
    next_id: Arc<AtomicU64>,
    live: Arc<AtomicUsize>,
    queue_capacity: usize,
}

impl Hub {
    /// Starts the control loop on the current Tokio runtime.
    ///
    /// The loop runs until every handle has been dropped.
    pub fn spawn(config: HubConfig) -> Self {
        let (hub, control) = Self::new(config);
        tokio::spawn(control.run());
        hub
    }

    fn new(config: HubConfig) -> (Self, ControlLoop) {
        let config = config.clamped();
        let (register_tx, register_rx) = mpsc::channel(config.channel_capacity);
        let (unregister_tx, unregister_rx) = mpsc::channel(config.channel_capacity);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(config.channel_capacity);
        let live = Arc::new(AtomicUsize::new(0));

        let hub = Self {
            register_tx,
            unregister_tx,
            broadcast_tx,
            next_id: Arc::new(AtomicU64::new(1)),
            live: Arc::clone(&live),
            queue_capacity: config.queue_capacity,
        };
        let control = ControlLoop {
            register_rx,
            unregister_rx,
            broadcast_rx,
            live_set: LiveSet::new(config.echo),
            gauge: live,
        };
        (hub, control)
    }

    fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Creates a new connection record and adds it to the live set.
    ///
    /// Returns once the control loop has processed the registration, so
    /// every broadcast submitted afterwards will consider this connection.
    pub async fn register(&self) -> Result<Registration, HubClosed> {
        let id = self.next_id();
        let (queue_tx, queue_rx) = mpsc::channel(self.queue_capacity);
        let (ack_tx, ack_rx) = oneshot::channel();

        self.register_tx
            .send(RegisterRequest {
                id,
                queue: queue_tx,
                ack: ack_tx,
            })
            .await
            .map_err(|_| HubClosed)?;
        ack_rx.await.map_err(|_| HubClosed)?;

        Ok(Registration {
            id,
            queue: queue_rx,
        })
    }

    /// Asks the hub to drop `id` and close its queue. Unknown ids are ignored.
    pub async fn unregister(&self, id: ConnectionId) -> Result<(), HubClosed> {
        self.unregister_tx.send(id).await.map_err(|_| HubClosed)
    }

    /// Hands a message to the hub for fan-out.
    ///
    /// Waits only while the hub's inbound channel is full; delivery to each
    /// recipient is attempted without blocking.
    pub async fn broadcast(&self, from: ConnectionId, payload: Payload) -> Result<(), HubClosed> {
        self.broadcast_tx
            .send(BroadcastRequest { from, payload })
            .await
            .map_err(|_| HubClosed)
    }

    /// Size of the live set as last published by the control loop.
    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

struct ControlLoop {
    register_rx: mpsc::Receiver<RegisterRequest>,
    unregister_rx: mpsc::Receiver<ConnectionId>,
    broadcast_rx: mpsc::Receiver<BroadcastRequest>,
    live_set: LiveSet,
    gauge: Arc<AtomicUsize>,
}

impl ControlLoop {
    async fn run(mut self) {
        debug!("hub control loop started");
        loop {
            // Membership changes take priority over fan-out.
            select! {
                biased;
                Some(request) = self.register_rx.recv() => self.handle_register(request),
                Some(id) = self.unregister_rx.recv() => self.handle_unregister(id),
                Some(request) = self.broadcast_rx.recv() => self.handle_broadcast(request),
                else => break,
            }
            self.gauge.store(self.live_set.len(), Ordering::Release);
        }
        debug!("hub control loop stopped");
    }

    fn handle_register(&mut self, request: RegisterRequest) {
        let RegisterRequest { id, queue, ack } = request;
        self.live_set.register(id, queue);
        self.gauge.store(self.live_set.len(), Ordering::Release);
        info!(connection = %id, total = self.live_set.len(), "client connected");
        // The registering task may have given up waiting; nothing to undo.
        let _ = ack.send(());
    }

    fn handle_unregister(&mut self, id: ConnectionId) {
        if self.live_set.unregister(id) {
            info!(connection = %id, total = self.live_set.len(), "client disconnected");
        }
    }

    fn handle_broadcast(&mut self, request: BroadcastRequest) {
        let report = self.live_set.broadcast(request.from, &request.payload);
        for id in &report.evicted {
            warn!(
                connection = %id,
                total = self.live_set.len(),
                "outbound queue full, evicting slow client"
            );
        }
        for id in &report.gone {
            debug!(connection = %id, "outbound queue already closed, dropping client");
        }
        debug!(
            from = %request.from,
            bytes = request.payload.len(),
            delivered = report.delivered,
            "broadcast relayed"
        );
    }
}

/// Outcome of one fan-out pass.
#[derive(Debug, Default, PartialEq, Eq)]
struct BroadcastReport {
    delivered: usize,
    evicted: Vec<ConnectionId>,
    gone: Vec<ConnectionId>,
}

/// The live set itself. Only the control loop holds one.
struct LiveSet {
    connections: HashMap<ConnectionId, mpsc::Sender<Payload>>,
    echo: bool,
}

impl LiveSet {
    fn new(echo: bool) -> Self {
        Self {
            connections: HashMap::new(),
            echo,
        }
    }

    fn len(&self) -> usize {
        self.connections.len()
    }

    fn register(&mut self, id: ConnectionId, queue: mpsc::Sender<Payload>) {
        self.connections.insert(id, queue);
    }

    /// Removes `id`, dropping its sender and thereby closing the queue.
    /// Returns whether the connection was present.
    fn unregister(&mut self, id: ConnectionId) -> bool {
        self.connections.remove(&id).is_some()
    }

    fn broadcast(&mut self, from: ConnectionId, payload: &Payload) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let echo = self.echo;

        self.connections.retain(|&id, queue| {
            if id == from && !echo {
                return true;
            }
            match queue.try_send(payload.clone()) {
                Ok(()) => {
                    report.delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    report.evicted.push(id);
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    report.gone.push(id);
                    false
                }
            }
        });

        report.evicted.sort_unstable();
        report.gone.sort_unstable();
        report
    }

    #[cfg(test)]
    fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.connections.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
