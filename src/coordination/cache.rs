//! Namespaced JSON cache over the shared store.
//!
//! The cache is always optional relative to the source of truth it fronts:
//! a store outage or an undecodable entry reads as a miss, and failed writes
//! are logged and swallowed.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::keyspace::Namespace;
use crate::metrics::Metrics;
use crate::store::{Expiry, SetCondition, Store};

/// Read/write/invalidate wrapper bound to one key namespace.
#[derive(Clone)]
pub struct CacheClient {
    store: Arc<dyn Store>,
    namespace: Namespace,
    default_ttl: Duration,
    metrics: Arc<Metrics>,
}

impl CacheClient {
    pub fn new(
        store: Arc<dyn Store>,
        namespace: Namespace,
        default_ttl: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            namespace,
            default_ttl,
            metrics,
        }
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Full storage key for `id`.
    pub fn key(&self, id: &str) -> String {
        self.namespace.key(&[id])
    }

    /// Serialize and store `value`, expiring after `ttl` (or the default).
    /// Returns whether the entry was written.
    pub async fn set<T>(&self, id: &str, value: &T, ttl: Option<Duration>) -> bool
    where
        T: Serialize + ?Sized,
    {
        let ttl = ttl.unwrap_or(self.default_ttl);
        self.set_with(id, value, Expiry::Ttl(ttl), SetCondition::Always)
            .await
    }

    /// Like [`CacheClient::set`] with explicit expiry and existence policy.
    pub async fn set_with<T>(
        &self,
        id: &str,
        value: &T,
        expiry: Expiry,
        condition: SetCondition,
    ) -> bool
    where
        T: Serialize + ?Sized,
    {
        let key = self.key(id);
        let encoded = match serde_json::to_string(value) {
            Ok(s) => s,
            Err(e) => {
                warn!(%key, error = %e, "cache value failed to serialize, not stored");
                return false;
            }
        };
        match self.store.set(&key, &encoded, expiry, condition).await {
            Ok(written) => {
                debug!(%key, ?expiry, ?condition, written, "cache set");
                written
            }
            Err(e) => {
                self.metrics.store_error("cache_set");
                warn!(%key, error = %e, "cache set failed");
                false
            }
        }
    }

    /// Read and decode `id`.  Absent, expired, undecodable, and unreachable
    /// all report `None`.
    pub async fn get<T: DeserializeOwned>(&self, id: &str) -> Option<T> {
        let key = self.key(id);
        let raw = match self.store.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.metrics.cache_misses.inc();
                trace!(%key, "cache miss");
                return None;
            }
            Err(e) => {
                self.metrics.cache_misses.inc();
                self.metrics.store_error("cache_get");
                warn!(%key, error = %e, "cache get failed, treating as miss");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => {
                self.metrics.cache_hits.inc();
                trace!(%key, "cache hit");
                Some(value)
            }
            Err(e) => {
                self.metrics.cache_misses.inc();
                warn!(%key, error = %e, "cache entry undecodable, treating as miss");
                None
            }
        }
    }

    /// Return the cached value for `id`, or run `loader`, cache its result,
    /// and return it.  Loader errors propagate; cache errors never do.
    pub async fn get_or_insert_with<T, E, F, Fut>(
        &self,
        id: &str,
        ttl: Option<Duration>,
        loader: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(hit) = self.get(id).await {
            return Ok(hit);
        }
        let value = loader().await?;
        self.set(id, &value, ttl).await;
        Ok(value)
    }

    /// Remove `id`; returns whether it existed.
    pub async fn del(&self, id: &str) -> bool {
        let key = self.key(id);
        match self.store.del(&key).await {
            Ok(existed) => existed,
            Err(e) => {
                self.metrics.store_error("cache_del");
                warn!(%key, error = %e, "cache delete failed");
                false
            }
        }
    }

    pub async fn exists(&self, id: &str) -> bool {
        let key = self.key(id);
        match self.store.exists(&key).await {
            Ok(exists) => exists,
            Err(e) => {
                self.metrics.store_error("cache_exists");
                warn!(%key, error = %e, "cache exists check failed");
                false
            }
        }
    }

    /// Rewrite the remaining lifetime of `id`; returns whether it existed.
    pub async fn expire(&self, id: &str, ttl: Duration) -> bool {
        let key = self.key(id);
        match self.store.expire(&key, ttl).await {
            Ok(existed) => existed,
            Err(e) => {
                self.metrics.store_error("cache_expire");
                warn!(%key, error = %e, "cache expire failed");
                false
            }
        }
    }

    /// Remove every entry whose id matches the glob `pattern`, e.g.
    /// `locker:*` to drop all cached lockers.  Returns how many were removed.
    pub async fn delete_pattern(&self, pattern: &str) -> u64 {
        let pattern = self.namespace.pattern(pattern);
        match self.store.del_pattern(&pattern).await {
            Ok(count) => {
                if count > 0 {
                    debug!(%pattern, count, "cache invalidated");
                }
                count
            }
            Err(e) => {
                self.metrics.store_error("cache_delete_pattern");
                warn!(%pattern, error = %e, "cache pattern delete failed");
                0
            }
        }
    }

    /// Ids (namespace-relative) of every live entry matching `pattern`.
    /// Point-in-time and O(n) over the namespace.
    pub async fn ids(&self, pattern: &str) -> Vec<String> {
        let pattern = self.namespace.pattern(pattern);
        match self.store.keys(&pattern).await {
            Ok(keys) => keys
                .iter()
                .filter_map(|k| self.namespace.strip(k).map(String::from))
                .collect(),
            Err(e) => {
                self.metrics.store_error("cache_keys");
                warn!(%pattern, error = %e, "cache scan failed");
                Vec::new()
            }
        }
    }
}
