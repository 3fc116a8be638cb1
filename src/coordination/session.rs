//! User sessions with sliding or fixed expiry.

use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::{now_ms, CacheClient};
use crate::store::{Expiry, SetCondition};

/// Arbitrary claims carried by a session.
pub type Claims = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user_id: String,
    #[serde(default)]
    pub claims: Claims,
    pub created_at: i64,
    pub updated_at: i64,
    /// Lifetime in seconds that a sliding read renews to.  Zero means the
    /// namespace default.
    #[serde(default)]
    pub ttl_secs: u64,
}

impl Session {
    fn lifetime(&self, default: Duration) -> Duration {
        match self.ttl_secs {
            0 => default,
            secs => Duration::from_secs(secs),
        }
    }
}

/// Whole seconds, rounding a sub-second remainder up.
fn lifetime_secs(ttl: Duration) -> u64 {
    ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0)
}

#[derive(Clone)]
pub struct SessionStore {
    cache: CacheClient,
    sliding: bool,
}

impl SessionStore {
    /// `cache` must be bound to the session namespace; its default TTL is
    /// the session lifetime.
    pub fn new(cache: CacheClient, sliding: bool) -> Self {
        Self { cache, sliding }
    }

    /// Store a new session under a caller-supplied id.  Returns `None` if it
    /// could not be persisted.
    pub async fn create(
        &self,
        id: &str,
        user_id: &str,
        claims: Claims,
        ttl: Option<Duration>,
    ) -> Option<Session> {
        let now = now_ms();
        let session = Session {
            user_id: user_id.to_string(),
            claims,
            created_at: now,
            updated_at: now,
            ttl_secs: lifetime_secs(ttl.unwrap_or(self.cache.default_ttl())),
        };
        if !self.cache.set(id, &session, ttl).await {
            return None;
        }
        info!(session_id = %id, %user_id, "session created");
        Some(session)
    }

    /// Store a new session under a freshly generated id.
    pub async fn create_generated(
        &self,
        user_id: &str,
        claims: Claims,
        ttl: Option<Duration>,
    ) -> Option<(String, Session)> {
        let id = uuid::Uuid::new_v4().to_string();
        let session = self.create(&id, user_id, claims, ttl).await?;
        Some((id, session))
    }

    /// Resolve a session.  With sliding expiry every successful read renews
    /// the session's own lifetime, as set by `create` or the last `update`
    /// that passed a TTL.
    pub async fn get(&self, id: &str) -> Option<Session> {
        let session: Session = self.cache.get(id).await?;
        if self.sliding {
            let lifetime = session.lifetime(self.cache.default_ttl());
            self.cache.expire(id, lifetime).await;
        }
        Some(session)
    }

    /// Merge `partial` into the session's claims.  `ttl` renews the lifetime;
    /// `None` keeps the remaining one.  Never recreates a missing or expired
    /// session: the write only lands if the key still exists.
    pub async fn update(
        &self,
        id: &str,
        partial: Claims,
        ttl: Option<Duration>,
    ) -> Option<Session> {
        let mut session: Session = self.cache.get(id).await?;
        session.claims.extend(partial);
        session.updated_at = now_ms();
        if let Some(ttl) = ttl {
            session.ttl_secs = lifetime_secs(ttl);
        }

        let expiry = ttl.map_or(Expiry::KeepTtl, Expiry::Ttl);
        if !self
            .cache
            .set_with(id, &session, expiry, SetCondition::IfExists)
            .await
        {
            debug!(session_id = %id, "session vanished before update, not recreated");
            return None;
        }
        Some(session)
    }

    /// Remove a session.  Returns whether it existed.
    pub async fn destroy(&self, id: &str) -> bool {
        let existed = self.cache.del(id).await;
        if existed {
            info!(session_id = %id, "session destroyed");
        }
        existed
    }

    /// Every live session belonging to `user_id`.
    ///
    /// Scans the whole session namespace, so cost grows with the total number
    /// of sessions, not with the user's.
    pub async fn list_by_user(&self, user_id: &str) -> Vec<(String, Session)> {
        let ids = self.cache.ids("*").await;
        let reads = ids.iter().map(|id| self.cache.get::<Session>(id));
        let mut sessions: Vec<(String, Session)> = ids
            .iter()
            .cloned()
            .zip(join_all(reads).await)
            .filter_map(|(id, session)| session.map(|s| (id, s)))
            .filter(|(_, s)| s.user_id == user_id)
            .collect();
        sessions.sort_by_key(|(_, s)| s.created_at);
        sessions
    }

    /// Log `user_id` out everywhere.  Returns how many sessions were removed.
    pub async fn destroy_all_for_user(&self, user_id: &str) -> usize {
        let mut removed = 0;
        for (id, _) in self.list_by_user(user_id).await {
            if self.cache.del(&id).await {
                removed += 1;
            }
        }
        info!(%user_id, removed, "sessions destroyed for user");
        removed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::coordination::testing::{failing_store, memory_store, metrics};
    use crate::keyspace::Namespace;
    use crate::store::Store;

    const TTL: Duration = Duration::from_secs(600);

    fn sessions(store: Arc<dyn Store>, sliding: bool) -> SessionStore {
        SessionStore::new(
            CacheClient::new(store, Namespace::Session, TTL, metrics()),
            sliding,
        )
    }

    fn claims(value: Value) -> Claims {
        match value {
            Value::Object(map) => map,
            _ => unreachable!("claims fixture must be an object"),
        }
    }

    #[tokio::test]
    async fn create_then_get() {
        let store = sessions(memory_store(), false);
        let created = store
            .create("s1", "user-1", claims(json!({"role": "student"})), None)
            .await
            .unwrap();
        let fetched = store.get("s1").await.unwrap();
        assert_eq!(fetched, created);
        assert_eq!(fetched.claims["role"], "student");
    }

    #[tokio::test]
    async fn generated_ids_are_unique() {
        let store = sessions(memory_store(), false);
        let (a, _) = store
            .create_generated("user-1", Claims::new(), None)
            .await
            .unwrap();
        let (b, _) = store
            .create_generated("user-1", Claims::new(), None)
            .await
            .unwrap();
        assert_ne!(a, b);
        assert!(store.get(&a).await.is_some());
    }

    #[tokio::test]
    async fn update_merges_claims() {
        let store = sessions(memory_store(), false);
        store
            .create("s1", "user-1", claims(json!({"role": "student", "locale": "en"})), None)
            .await;
        let merged = store
            .update("s1", claims(json!({"locale": "fr", "cart": 3})), None)
            .await
            .unwrap();
        assert_eq!(merged.claims["role"], "student");
        assert_eq!(merged.claims["locale"], "fr");
        assert_eq!(merged.claims["cart"], 3);
        assert_eq!(store.get("s1").await.unwrap(), merged);
    }

    #[tokio::test]
    async fn update_of_missing_session_does_not_create_it() {
        let store = sessions(memory_store(), false);
        assert!(store.update("ghost", Claims::new(), Some(TTL)).await.is_none());
        assert!(store.get("ghost").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn update_of_expired_session_does_not_resurrect_it() {
        let store = sessions(memory_store(), false);
        store
            .create("s1", "user-1", Claims::new(), Some(Duration::from_secs(10)))
            .await;
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(store.update("s1", Claims::new(), Some(TTL)).await.is_none());
        assert!(store.get("s1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn update_without_ttl_keeps_remaining_lifetime() {
        let store = sessions(memory_store(), false);
        store
            .create("s1", "user-1", Claims::new(), Some(Duration::from_secs(20)))
            .await;
        tokio::time::advance(Duration::from_secs(15)).await;
        store.update("s1", claims(json!({"k": 1})), None).await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(store.get("s1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sliding_expiry_renews_on_read() {
        let store = sessions(memory_store(), true);
        store.create("s1", "user-1", Claims::new(), None).await;
        for _ in 0..3 {
            tokio::time::advance(TTL - Duration::from_secs(1)).await;
            assert!(store.get("s1").await.is_some());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sliding_read_renews_to_the_session_lifetime() {
        let store = sessions(memory_store(), true);
        store
            .create("s1", "user-1", Claims::new(), Some(Duration::from_secs(60)))
            .await;
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(store.get("s1").await.is_some());

        // Renewed to 60s from the read, not to the 600s namespace default.
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(store.get("s1").await.is_some());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(store.get("s1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn update_with_ttl_changes_the_sliding_lifetime() {
        let store = sessions(memory_store(), true);
        store
            .create("s1", "user-1", Claims::new(), Some(Duration::from_secs(60)))
            .await;
        let updated = store
            .update("s1", Claims::new(), Some(Duration::from_secs(120)))
            .await
            .unwrap();
        assert_eq!(updated.ttl_secs, 120);

        tokio::time::advance(Duration::from_secs(100)).await;
        assert!(store.get("s1").await.is_some());
        tokio::time::advance(Duration::from_secs(121)).await;
        assert!(store.get("s1").await.is_none());
    }

    #[test]
    fn stored_session_without_lifetime_uses_default() {
        let session: Session = serde_json::from_value(json!({
            "userId": "user-1",
            "createdAt": 1,
            "updatedAt": 1,
        }))
        .unwrap();
        assert_eq!(session.lifetime(TTL), TTL);
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_expiry_does_not_renew() {
        let store = sessions(memory_store(), false);
        store.create("s1", "user-1", Claims::new(), None).await;
        tokio::time::advance(TTL - Duration::from_secs(1)).await;
        assert!(store.get("s1").await.is_some());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(store.get("s1").await.is_none());
    }

    #[tokio::test]
    async fn list_and_destroy_by_user() {
        let store = sessions(memory_store(), false);
        store.create("a", "user-1", Claims::new(), None).await;
        store.create("b", "user-2", Claims::new(), None).await;
        store.create("c", "user-1", Claims::new(), None).await;

        let mut ids: Vec<String> = store
            .list_by_user("user-1")
            .await
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "c"]);

        assert_eq!(store.destroy_all_for_user("user-1").await, 2);
        assert!(store.list_by_user("user-1").await.is_empty());
        assert!(store.get("b").await.is_some());
        assert!(store.destroy("b").await);
        assert!(!store.destroy("b").await);
    }

    #[tokio::test]
    async fn store_outage_reports_none() {
        let store = sessions(failing_store(), true);
        assert!(store.create("s1", "user-1", Claims::new(), None).await.is_none());
        assert!(store.get("s1").await.is_none());
        assert!(store.update("s1", Claims::new(), None).await.is_none());
        assert!(store.list_by_user("user-1").await.is_empty());
    }
}
