//! Per-user notification feed.
//!
//! Notifications live at `notification:{user}:{id}` until dismissed or
//! expired, and each new one is also pushed on `user-notifications` so
//! connected clients can refresh without polling.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::{now_ms, CacheClient, PubSub};
use crate::keyspace::Channel;

/// What a caller supplies when notifying a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewNotification {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub data: Value,
    pub created_at: i64,
}

#[derive(Clone)]
pub struct NotificationFeed {
    cache: CacheClient,
    pubsub: PubSub,
}

impl NotificationFeed {
    /// `cache` must be bound to the notification namespace.
    pub fn new(cache: CacheClient, pubsub: PubSub) -> Self {
        Self { cache, pubsub }
    }

    fn entry(user_id: &str, id: &str) -> String {
        format!("{user_id}:{id}")
    }

    /// Store and announce a notification.  The record is returned even if
    /// the store or the channel was unreachable.
    pub async fn push(&self, user_id: &str, notification: NewNotification) -> Notification {
        let record = Notification {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            kind: notification.kind,
            message: notification.message,
            data: notification.data,
            created_at: now_ms(),
        };

        let entry = Self::entry(user_id, &record.id);
        if !self.cache.set(&entry, &record, None).await {
            warn!(%user_id, id = %record.id, "notification not stored");
        }
        if !self.pubsub.publish(Channel::UserNotifications, &record).await {
            warn!(%user_id, id = %record.id, "notification not announced");
        }
        debug!(%user_id, id = %record.id, kind = %record.kind, "notification pushed");
        record
    }

    /// Live notifications for `user_id`, newest first.
    pub async fn list(&self, user_id: &str) -> Vec<Notification> {
        let entries = self.cache.ids(&format!("{user_id}:*")).await;
        let reads = entries.iter().map(|e| self.cache.get::<Notification>(e));
        let mut notifications: Vec<Notification> = join_all(reads)
            .await
            .into_iter()
            .flatten()
            .filter(|n| n.user_id == user_id)
            .collect();
        notifications.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        notifications
    }

    /// Remove one notification.  Returns whether it existed.
    pub async fn dismiss(&self, user_id: &str, id: &str) -> bool {
        self.cache.del(&Self::entry(user_id, id)).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::coordination::testing::{failing_store, memory_store, metrics};
    use crate::keyspace::Namespace;
    use crate::store::Store;

    fn feed(store: Arc<dyn Store>) -> NotificationFeed {
        NotificationFeed::new(
            CacheClient::new(
                Arc::clone(&store),
                Namespace::Notification,
                Duration::from_secs(3600),
                metrics(),
            ),
            PubSub::new(store, metrics()),
        )
    }

    fn note(message: &str) -> NewNotification {
        NewNotification {
            kind: "rental".into(),
            message: message.into(),
            data: json!({"lockerId": 5}),
        }
    }

    #[tokio::test]
    async fn push_stores_under_user_key() {
        let store = memory_store();
        let feed = feed(Arc::clone(&store));
        let pushed = feed.push("user-1", note("Locker 5 is ready")).await;

        let key = format!("notification:user-1:{}", pushed.id);
        assert!(store.exists(&key).await.unwrap());
        assert_eq!(feed.list("user-1").await, vec![pushed]);
        assert!(feed.list("user-2").await.is_empty());
    }

    #[tokio::test]
    async fn list_is_newest_first() {
        let feed = feed(memory_store());
        let first = feed.push("user-1", note("first")).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = feed.push("user-1", note("second")).await;
        assert!(second.created_at > first.created_at);

        let ids: Vec<String> = feed.list("user-1").await.into_iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }

    #[tokio::test]
    async fn dismiss_removes_one() {
        let feed = feed(memory_store());
        let keep = feed.push("user-1", note("keep")).await;
        let gone = feed.push("user-1", note("drop")).await;

        assert!(feed.dismiss("user-1", &gone.id).await);
        assert!(!feed.dismiss("user-1", &gone.id).await);
        assert_eq!(feed.list("user-1").await, vec![keep]);
    }

    #[tokio::test]
    async fn push_is_announced() {
        let store = memory_store();
        let feed = feed(Arc::clone(&store));
        let listener = PubSub::new(store, metrics());
        let (tx, mut rx) = mpsc::unbounded_channel();
        listener
            .subscribe(Channel::UserNotifications, move |payload, _| {
                let _ = tx.send(payload);
            })
            .await
            .unwrap();

        let pushed = feed.push("user-1", note("hello")).await;
        let payload = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload["id"], json!(pushed.id));
        assert_eq!(payload["userId"], "user-1");
    }

    #[tokio::test]
    async fn store_outage_degrades_quietly() {
        let feed = feed(failing_store());
        let pushed = feed.push("user-1", note("hello")).await;
        assert_eq!(pushed.message, "hello");
        assert!(feed.list("user-1").await.is_empty());
        assert!(!feed.dismiss("user-1", &pushed.id).await);
    }
}
