use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::RwLock;
use tokio::sync::{mpsc, Notify};
use tracing::debug;
use uuid::Uuid;

use super::{DeliveryFault, Message, Outbound};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> ConnectionId {
        ConnectionId(Uuid::now_v7())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Handle to one open client session: an id plus the sending half of its outbound queue.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    outbox: mpsc::Sender<Outbound>,
    evicted: Arc<Notify>,
}

impl Connection {
    pub fn new(capacity: usize) -> (Connection, mpsc::Receiver<Outbound>) {
        let (outbox, rx) = mpsc::channel(capacity);
        (
            Connection {
                id: ConnectionId::new(),
                outbox,
                evicted: Arc::new(Notify::new()),
            },
            rx,
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues a broadcast without waiting.
    pub fn deliver(&self, message: Arc<Message>) -> Result<(), DeliveryFault> {
        self.outbox
            .try_send(Outbound::Message(message))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => DeliveryFault::Full,
                mpsc::error::TrySendError::Closed(_) => DeliveryFault::Closed,
            })
    }

    /// Queues a reply for this connection alone, waiting for room if needed.
    pub async fn reply(&self, item: Outbound) -> Result<(), DeliveryFault> {
        self.outbox
            .send(item)
            .await
            .map_err(|_| DeliveryFault::Closed)
    }

    /// Tells the owning session it has been dropped from the registry.
    pub fn evict(&self) {
        self.evicted.notify_one();
    }

    /// Resolves once `evict` has been called, even if that happened first.
    pub async fn evicted(&self) {
        self.evicted.notified().await
    }
}

pub type Snapshot = Arc<HashMap<ConnectionId, Connection>>;

/// The live set of connections.
///
/// Membership lives behind an `Arc` that is swapped on write, so a snapshot is a refcount bump
/// and fan-out iterates it with no lock held.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    live: Arc<RwLock<Snapshot>>,
}

impl ConnectionRegistry {
    pub fn new() -> ConnectionRegistry {
        Self::default()
    }

    /// Returns false if the connection was already registered.
    pub fn register(&self, connection: Connection) -> bool {
        let mut live = self.live.write();
        if live.contains_key(&connection.id) {
            return false;
        }

        let id = connection.id;
        Arc::make_mut(&mut *live).insert(id, connection);
        debug!(conn = %id, live = live.len(), "registered");
        true
    }

    /// Returns false if the connection was not registered.
    pub fn deregister(&self, id: ConnectionId) -> bool {
        let mut live = self.live.write();
        if !live.contains_key(&id) {
            return false;
        }

        Arc::make_mut(&mut *live).remove(&id);
        debug!(conn = %id, live = live.len(), "deregistered");
        true
    }

    pub fn snapshot(&self) -> Snapshot {
        self.live.read().clone()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.live.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.live.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
