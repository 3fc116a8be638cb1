//! Ephemeral coordination layer in front of the durable store.
//!
//! One shared expiring key-value store serves as read-through cache,
//! fixed-window rate limiter, session store, one-time-token vault, status
//! board with pub/sub fan-out, and per-day counter space.  Each component
//! picks its own safe default when the store is unreachable; none of them
//! surface transient store failures to business logic.

pub mod cache;
pub mod counters;
pub mod notifications;
pub mod pubsub;
pub mod rate_limit;
pub mod session;
pub mod status;
pub mod tokens;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::Config;
use crate::keyspace::Namespace;
use crate::metrics::Metrics;
use crate::store::Store;

pub use cache::CacheClient;
pub use counters::MetricsCounter;
pub use notifications::NotificationFeed;
pub use pubsub::PubSub;
pub use rate_limit::RateLimiter;
pub use session::SessionStore;
pub use status::StatusBoard;
pub use tokens::TokenVault;

/// Wall-clock time in epoch milliseconds, as embedded in stored records.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Every coordination component, wired to one shared store handle.
///
/// Built once at process start and passed to request handlers; there is no
/// ambient global client.
#[derive(Clone)]
pub struct Coordinator {
    store: Arc<dyn Store>,
    pub cache: CacheClient,
    pub rate_limiter: RateLimiter,
    pub sessions: SessionStore,
    pub status: StatusBoard,
    pub pubsub: PubSub,
    pub tokens: TokenVault,
    pub counters: MetricsCounter,
    pub notifications: NotificationFeed,
}

impl Coordinator {
    pub fn new(store: Arc<dyn Store>, config: &Config, metrics: Arc<Metrics>) -> Self {
        let secs = Duration::from_secs;

        let cache = CacheClient::new(
            Arc::clone(&store),
            Namespace::Cache,
            secs(config.cache.default_ttl),
            Arc::clone(&metrics),
        );
        let pubsub = PubSub::new(Arc::clone(&store), Arc::clone(&metrics));
        let rate_limiter = RateLimiter::new(
            Arc::clone(&store),
            config.rate_limits.clone(),
            Arc::clone(&metrics),
        );
        let sessions = SessionStore::new(
            CacheClient::new(
                Arc::clone(&store),
                Namespace::Session,
                secs(config.session.ttl),
                Arc::clone(&metrics),
            ),
            config.session.sliding,
        );
        let status = StatusBoard::new(
            CacheClient::new(
                Arc::clone(&store),
                Namespace::LockStatus,
                secs(config.status.lock_ttl),
                Arc::clone(&metrics),
            ),
            CacheClient::new(
                Arc::clone(&store),
                Namespace::HardwareStatus,
                secs(config.status.hardware_ttl),
                Arc::clone(&metrics),
            ),
            pubsub.clone(),
            Arc::clone(&metrics),
        );
        let tokens = TokenVault::new(
            Arc::clone(&store),
            secs(config.tokens.default_ttl),
            Arc::clone(&metrics),
        );
        let counters = MetricsCounter::new(
            Arc::clone(&store),
            secs(config.metrics.retention),
            Arc::clone(&metrics),
        );
        let notifications = NotificationFeed::new(
            CacheClient::new(
                Arc::clone(&store),
                Namespace::Notification,
                secs(config.notifications.ttl),
                Arc::clone(&metrics),
            ),
            pubsub.clone(),
        );

        Self {
            store,
            cache,
            rate_limiter,
            sessions,
            status,
            pubsub,
            tokens,
            counters,
            notifications,
        }
    }

    /// The shared store handle, e.g. for health checks.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Drop every subscription and release store connections.
    pub async fn shutdown(&self) {
        self.pubsub.unsubscribe_all().await;
        match self.store.close().await {
            Ok(()) => info!("coordination layer shut down"),
            Err(e) => warn!(error = %e, "store close failed during shutdown"),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{memory_store, metrics};
    use super::*;
    use crate::coordination::status::{LockReport, LockState};

    #[tokio::test]
    async fn components_share_one_store() {
        let store = memory_store();
        let coordinator = Coordinator::new(Arc::clone(&store), &Config::default(), metrics());

        coordinator.cache.set("locker:5", &5, None).await;
        coordinator
            .status
            .set_lock_status("5", LockReport::new(LockState::Open), None)
            .await;
        coordinator.counters.increment_default("scan").await;

        let mut keys = store.keys("*").await.unwrap();
        keys.retain(|k| !k.starts_with("metrics:"));
        assert_eq!(keys, vec!["cache:locker:5", "lock_status:5"]);
    }

    #[tokio::test]
    async fn shutdown_closes_the_store() {
        let store = memory_store();
        let coordinator = Coordinator::new(Arc::clone(&store), &Config::default(), metrics());
        coordinator.shutdown().await;
        assert!(coordinator.store().ping().await.is_err());
    }
}
