use async_trait::async_trait;
use sqlx::SqlitePool;
use time::OffsetDateTime;

use super::{Message, NewMessage, StorageFailure};

/// Append-only, totally ordered log of chat messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Assigns the next id and timestamp and writes the message durably.
    async fn append(&self, message: NewMessage) -> Result<Message, StorageFailure>;

    /// Up to `limit` most recent messages, oldest first.
    async fn recent(&self, limit: usize) -> Result<Vec<Message>, StorageFailure>;
}

#[derive(Clone)]
pub struct SqliteMessageStore {
    db_pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: i64,
    author_name: String,
    content: String,
    display_color: String,
    author_is_privileged: bool,
    created_at: i64,
}

impl TryFrom<MessageRow> for Message {
    type Error = StorageFailure;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Message {
            id: row.id,
            author_name: row.author_name,
            content: row.content,
            display_color: row.display_color,
            author_is_privileged: row.author_is_privileged,
            created_at: from_unix_millis(row.created_at)?,
        })
    }
}

impl SqliteMessageStore {
    pub fn new(db_pool: SqlitePool) -> SqliteMessageStore {
        SqliteMessageStore { db_pool }
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn append(&self, message: NewMessage) -> Result<Message, StorageFailure> {
        let now = unix_millis(OffsetDateTime::now_utc());

        // one statement, so id and created_at are picked under the same write lock
        let (id, created_at): (i64, i64) = sqlx::query_as(
            "INSERT INTO messages (author_name,content,display_color,author_is_privileged,created_at) \
            VALUES (?,?,?,?,MAX(?,COALESCE((SELECT MAX(created_at) FROM messages),0))) \
            RETURNING id,created_at",
        )
        .bind(&message.author_name)
        .bind(&message.content)
        .bind(&message.display_color)
        .bind(message.author_is_privileged)
        .bind(now)
        .fetch_one(&self.db_pool)
        .await?;

        Ok(Message {
            id,
            author_name: message.author_name,
            content: message.content,
            display_color: message.display_color,
            author_is_privileged: message.author_is_privileged,
            created_at: from_unix_millis(created_at)?,
        })
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Message>, StorageFailure> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT * FROM ( \
                SELECT id,author_name,content,display_color,author_is_privileged,created_at \
                FROM messages ORDER BY id DESC LIMIT ? \
            ) ORDER BY id ASC",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.db_pool)
        .await?;

        rows.into_iter().map(Message::try_from).collect()
    }
}

fn unix_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

fn from_unix_millis(millis: i64) -> Result<OffsetDateTime, StorageFailure> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .map_err(|e| StorageFailure(sqlx::Error::Decode(Box::new(e))))
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, sync::Arc};

    use crate::db;

    use super::*;

    fn draft(author: &str, content: &str) -> NewMessage {
        NewMessage {
            author_name: author.to_owned(),
            content: content.to_owned(),
            display_color: "#FFFFFF".to_owned(),
            author_is_privileged: false,
        }
    }

    #[tokio::test]
    async fn append_assigns_sequential_ids() {
        let store = SqliteMessageStore::new(db::memory().await);

        let first = store.append(draft("alice", "hi")).await.unwrap();
        let second = store.append(draft("bob", "yo")).await.unwrap();

        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(second.author_name, "bob");
        assert!(second.created_at >= first.created_at);
    }

    #[tokio::test]
    async fn concurrent_appends_never_duplicate_or_skip_ids() {
        let store = Arc::new(SqliteMessageStore::new(db::memory().await));

        let tasks: Vec<_> = (0..40)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.append(draft("writer", &format!("msg {i}"))).await.unwrap() })
            })
            .collect();

        let mut ids = BTreeSet::new();
        for task in tasks {
            assert!(ids.insert(task.await.unwrap().id));
        }
        assert_eq!(ids, (1..=40).collect::<BTreeSet<i64>>());

        let all = store.recent(100).await.unwrap();
        assert_eq!(all.len(), 40);
        assert!(all.windows(2).all(|w| w[0].id < w[1].id && w[0].created_at <= w[1].created_at));
    }

    #[tokio::test]
    async fn recent_returns_newest_in_ascending_order() {
        let store = SqliteMessageStore::new(db::memory().await);
        for i in 1..=10 {
            store.append(draft("alice", &format!("msg {i}"))).await.unwrap();
        }

        let recent = store.recent(3).await.unwrap();
        let ids: Vec<i64> = recent.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![8, 9, 10]);
        assert_eq!(recent[0].content, "msg 8");
    }

    #[tokio::test]
    async fn recent_beyond_history_returns_everything() {
        let store = SqliteMessageStore::new(db::memory().await);
        assert!(store.recent(50).await.unwrap().is_empty());

        store.append(draft("alice", "only")).await.unwrap();
        assert_eq!(store.recent(50).await.unwrap().len(), 1);
        assert!(store.recent(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn created_at_never_goes_backwards() {
        let db_pool = db::memory().await;
        // a row stamped in the future, as if the clock had stepped back since
        let future = unix_millis(OffsetDateTime::now_utc()) + 60_000;
        sqlx::query("INSERT INTO messages (author_name,content,display_color,author_is_privileged,created_at) VALUES ('a','b','#FFFFFF',0,?)")
            .bind(future)
            .execute(&db_pool)
            .await
            .unwrap();

        let store = SqliteMessageStore::new(db_pool);
        let message = store.append(draft("alice", "later")).await.unwrap();
        assert_eq!(message.id, 2);
        assert_eq!(unix_millis(message.created_at), future);
    }

    #[tokio::test]
    async fn closed_pool_surfaces_storage_failure() {
        let db_pool = db::memory().await;
        let store = SqliteMessageStore::new(db_pool.clone());
        db_pool.close().await;

        assert!(store.append(draft("alice", "hi")).await.is_err());
        assert!(store.recent(5).await.is_err());
    }
}
