use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{ChatError, ConnectionRegistry, Message, MessageStore, Submission};

/// Persists submissions and fans them out to every live connection.
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn MessageStore>,
    registry: ConnectionRegistry,
    default_color: String,

    /// Held from append until the message is queued everywhere, so each
    /// connection sees messages in id order.
    turn: Mutex<()>,
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct FanOut {
    delivered: usize,
    evicted: usize,
}

impl Broadcaster {
    pub fn new(store: Arc<dyn MessageStore>, registry: ConnectionRegistry, default_color: impl Into<String>) -> Broadcaster {
        Broadcaster {
            inner: Arc::new(Inner {
                store,
                registry,
                default_color: default_color.into(),
                turn: Mutex::new(()),
            }),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    /// Validates, persists, then delivers. Nothing is delivered unless the append succeeded.
    pub async fn publish(&self, submission: Submission) -> Result<Message, ChatError> {
        let draft = submission.validate(&self.inner.default_color)?;

        let _turn = self.inner.turn.lock().await;
        let message = self.inner.store.append(draft).await.map_err(|e| {
            warn!(error = %e, "append failed, nothing delivered");
            ChatError::from(e)
        })?;

        let fan_out = self.fan_out(&message);
        debug!(
            id = message.id,
            delivered = fan_out.delivered,
            evicted = fan_out.evicted,
            "published"
        );

        Ok(message)
    }

    /// Best-effort delivery to the current snapshot; faulted connections are deregistered.
    fn fan_out(&self, message: &Message) -> FanOut {
        let message = Arc::new(message.clone());
        let mut fan_out = FanOut::default();

        for (id, connection) in self.inner.registry.snapshot().iter() {
            match connection.deliver(Arc::clone(&message)) {
                Ok(()) => fan_out.delivered += 1,
                Err(fault) => {
                    warn!(conn = %id, %fault, "delivery failed, dropping connection");
                    self.inner.registry.deregister(*id);
                    connection.evict();
                    fan_out.evicted += 1;
                }
            }
        }

        fan_out
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use crate::chat::{Connection, NewMessage, Outbound, SqliteMessageStore, StorageFailure};
    use crate::db;

    use super::*;

    struct CountingStore {
        inner: SqliteMessageStore,
        appends: AtomicUsize,
    }

    #[async_trait]
    impl MessageStore for CountingStore {
        async fn append(&self, message: NewMessage) -> Result<Message, StorageFailure> {
            self.appends.fetch_add(1, Ordering::SeqCst);
            self.inner.append(message).await
        }

        async fn recent(&self, limit: usize) -> Result<Vec<Message>, StorageFailure> {
            self.inner.recent(limit).await
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl MessageStore for BrokenStore {
        async fn append(&self, _message: NewMessage) -> Result<Message, StorageFailure> {
            Err(StorageFailure(sqlx::Error::PoolClosed))
        }

        async fn recent(&self, _limit: usize) -> Result<Vec<Message>, StorageFailure> {
            Err(StorageFailure(sqlx::Error::PoolClosed))
        }
    }

    async fn counting() -> (Broadcaster, Arc<CountingStore>) {
        let store = Arc::new(CountingStore {
            inner: SqliteMessageStore::new(db::memory().await),
            appends: AtomicUsize::new(0),
        });
        let broadcaster = Broadcaster::new(store.clone(), ConnectionRegistry::new(), "#FFFFFF");
        (broadcaster, store)
    }

    fn join(broadcaster: &Broadcaster) -> (Connection, mpsc::Receiver<Outbound>) {
        let (conn, rx) = Connection::new(16);
        broadcaster.registry().register(conn.clone());
        (conn, rx)
    }

    async fn next_message(rx: &mut mpsc::Receiver<Outbound>) -> Arc<Message> {
        match timeout(Duration::from_millis(250), rx.recv())
            .await
            .expect("expected to receive within timeout")
            .expect("channel open")
        {
            Outbound::Message(message) => message,
            other => panic!("expected a message, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn every_live_connection_receives_the_stored_message() {
        let (broadcaster, _store) = counting().await;
        let (_a, mut rx_a) = join(&broadcaster);
        let (_b, mut rx_b) = join(&broadcaster);

        let stored = broadcaster.publish(Submission::new("alice", "hi")).await.unwrap();
        assert_eq!(stored.id, 1);

        for rx in [&mut rx_a, &mut rx_b] {
            let got = next_message(rx).await;
            assert_eq!(*got, stored);
        }
    }

    #[tokio::test]
    async fn blank_content_never_reaches_the_store_or_connections() {
        let (broadcaster, store) = counting().await;
        let (_a, mut rx_a) = join(&broadcaster);

        let err = broadcaster.publish(Submission::new("alice", "  \n ")).await.unwrap_err();
        assert!(matches!(err, ChatError::InvalidMessage));
        assert_eq!(store.appends.load(Ordering::SeqCst), 0);
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn storage_failure_delivers_nothing() {
        let broadcaster = Broadcaster::new(Arc::new(BrokenStore), ConnectionRegistry::new(), "#FFFFFF");
        let (_a, mut rx_a) = join(&broadcaster);

        let err = broadcaster.publish(Submission::new("alice", "hi")).await.unwrap_err();
        assert!(matches!(err, ChatError::Storage(_)));
        assert!(rx_a.try_recv().is_err());
        assert_eq!(broadcaster.registry().len(), 1);
    }

    #[tokio::test]
    async fn a_dead_connection_does_not_stop_the_others() {
        let (broadcaster, _store) = counting().await;
        let (a, rx_a) = join(&broadcaster);
        let (_b, mut rx_b) = join(&broadcaster);
        let (_c, mut rx_c) = join(&broadcaster);
        drop(rx_a);

        let stored = broadcaster.publish(Submission::new("bob", "yo")).await.unwrap();

        assert_eq!(next_message(&mut rx_b).await.id, stored.id);
        assert_eq!(next_message(&mut rx_c).await.id, stored.id);
        assert!(!broadcaster.registry().contains(a.id()));
        assert_eq!(broadcaster.registry().len(), 2);
    }

    #[tokio::test]
    async fn a_full_queue_evicts_the_slow_connection() {
        let (broadcaster, _store) = counting().await;
        let (slow, _rx_slow) = Connection::new(1);
        broadcaster.registry().register(slow.clone());
        let (_fast, mut rx_fast) = join(&broadcaster);

        broadcaster.publish(Submission::new("alice", "one")).await.unwrap();
        broadcaster.publish(Submission::new("alice", "two")).await.unwrap();

        assert!(!broadcaster.registry().contains(slow.id()));
        tokio::time::timeout(Duration::from_millis(250), slow.evicted())
            .await
            .expect("slow connection should be told it was evicted");
        assert_eq!(next_message(&mut rx_fast).await.content, "one");
        assert_eq!(next_message(&mut rx_fast).await.content, "two");
    }

    #[tokio::test]
    async fn deregistered_connections_receive_nothing() {
        let (broadcaster, _store) = counting().await;
        let (a, mut rx_a) = join(&broadcaster);
        broadcaster.registry().deregister(a.id());

        broadcaster.publish(Submission::new("alice", "hi")).await.unwrap();
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn concurrent_publishers_are_delivered_in_id_order() {
        let (broadcaster, _store) = counting().await;
        let (_watcher, mut rx) = {
            let (conn, rx) = Connection::new(256);
            broadcaster.registry().register(conn.clone());
            (conn, rx)
        };

        let tasks: Vec<_> = (0..4)
            .map(|writer| {
                let broadcaster = broadcaster.clone();
                tokio::spawn(async move {
                    for i in 0..10 {
                        broadcaster
                            .publish(Submission::new(format!("writer{writer}"), format!("{i}")))
                            .await
                            .unwrap();
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let mut last_id = 0;
        let mut last_seen_per_writer = std::collections::HashMap::new();
        for _ in 0..40 {
            let message = next_message(&mut rx).await;
            assert!(message.id > last_id);
            last_id = message.id;

            let seq: u32 = message.content.parse().unwrap();
            let prev = last_seen_per_writer.insert(message.author_name.clone(), seq);
            assert!(prev.is_none_or(|prev| prev < seq));
        }
        assert_eq!(last_id, 40);
    }
}
