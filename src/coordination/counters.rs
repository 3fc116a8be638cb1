//! Fleet-wide per-day counters kept in the shared store.
//!
//! One key per (metric, UTC day): `metrics:{name}:{YYYY-MM-DD}`.  Every
//! increment rewrites the bucket's expiry, so a bucket lives for the
//! retention window after its most recent write.  Best-effort telemetry:
//! failures are logged and read as zero.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, NaiveDate, Utc};
use tracing::{debug, warn};

use crate::keyspace::Namespace;
use crate::metrics::Metrics;
use crate::store::Store;

#[derive(Clone)]
pub struct MetricsCounter {
    store: Arc<dyn Store>,
    default_retention: Duration,
    metrics: Arc<Metrics>,
}

impl MetricsCounter {
    pub fn new(store: Arc<dyn Store>, default_retention: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            default_retention,
            metrics,
        }
    }

    fn key(name: &str, day: NaiveDate) -> String {
        let bucket = day.format("%Y-%m-%d").to_string();
        Namespace::Metrics.key(&[name, &bucket])
    }

    fn today() -> NaiveDate {
        Utc::now().date_naive()
    }

    /// Add `amount` to today's bucket for `name` and renew its retention.
    /// Returns the new bucket value, or `None` if the store was unreachable.
    pub async fn increment(&self, name: &str, amount: i64, retention: Duration) -> Option<i64> {
        let key = Self::key(name, Self::today());
        let value = match self.store.incr_by_with_ttl(&key, amount, retention).await {
            Ok(value) => value,
            Err(e) => {
                self.metrics.store_error("counter_incr");
                warn!(%key, error = %e, "counter increment failed");
                return None;
            }
        };
        debug!(%key, value, "counter incremented");
        Some(value)
    }

    /// Increment by one with the configured retention.
    pub async fn increment_default(&self, name: &str) -> Option<i64> {
        self.increment(name, 1, self.default_retention).await
    }

    /// Value of the `day` bucket for `name`; absent buckets read as 0.
    pub async fn get(&self, name: &str, day: NaiveDate) -> i64 {
        let key = Self::key(name, day);
        match self.store.get(&key).await {
            Ok(Some(raw)) => raw.parse().unwrap_or_else(|_| {
                warn!(%key, %raw, "counter bucket is not an integer");
                0
            }),
            Ok(None) => 0,
            Err(e) => {
                self.metrics.store_error("counter_get");
                warn!(%key, error = %e, "counter read failed");
                0
            }
        }
    }

    /// The last `days` buckets for `name`, today first, absent days as 0.
    pub async fn history(&self, name: &str, days: u32) -> Vec<(NaiveDate, i64)> {
        let today = Self::today();
        let mut out = Vec::with_capacity(days as usize);
        for offset in 0..u64::from(days) {
            let Some(day) = today.checked_sub_days(Days::new(offset)) else {
                break;
            };
            out.push((day, self.get(name, day).await));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::testing::{failing_store, memory_store, metrics};

    const RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

    fn counter(store: Arc<dyn Store>) -> MetricsCounter {
        MetricsCounter::new(store, RETENTION, metrics())
    }

    #[test]
    fn key_uses_iso_day_bucket() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(MetricsCounter::key("scan", day), "metrics:scan:2024-03-09");
    }

    #[tokio::test]
    async fn increments_accumulate_in_todays_bucket() {
        let counter = counter(memory_store());
        for _ in 0..3 {
            counter.increment_default("qr_scans").await;
        }
        assert_eq!(counter.get("qr_scans", Utc::now().date_naive()).await, 3);
        assert_eq!(counter.increment("qr_scans", 10, RETENTION).await, Some(13));
    }

    #[tokio::test]
    async fn absent_bucket_reads_zero() {
        let counter = counter(memory_store());
        let day = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        assert_eq!(counter.get("qr_scans", day).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retention_counts_from_latest_write() {
        let store = memory_store();
        let counter = counter(Arc::clone(&store));
        let retention = Duration::from_secs(100);
        let key = MetricsCounter::key("logins", Utc::now().date_naive());

        counter.increment("logins", 1, retention).await;
        tokio::time::advance(Duration::from_secs(80)).await;
        counter.increment("logins", 1, retention).await;
        tokio::time::advance(Duration::from_secs(80)).await;

        assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("2"));
        let remaining = store.ttl(&key).await.unwrap().unwrap();
        assert!(remaining <= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn new_bucket_is_never_persistent() {
        let store = memory_store();
        let counter = counter(Arc::clone(&store));
        let key = MetricsCounter::key("unlocks", Utc::now().date_naive());

        assert_eq!(counter.increment("unlocks", 2, RETENTION).await, Some(2));
        assert_eq!(store.ttl(&key).await.unwrap(), Some(RETENTION));
    }

    #[tokio::test]
    async fn history_is_zero_filled_most_recent_first() {
        let counter = counter(memory_store());
        counter.increment("scan", 4, RETENTION).await;

        let history = counter.history("scan", 3).await;
        assert_eq!(history.len(), 3);
        assert_eq!(history[0], (Utc::now().date_naive(), 4));
        assert_eq!(history[1].1, 0);
        assert!(history[1].0 < history[0].0);
        assert!(history[2].0 < history[1].0);
    }

    #[tokio::test]
    async fn store_outage_reads_zero() {
        let counter = counter(failing_store());
        assert_eq!(counter.increment_default("scan").await, None);
        assert_eq!(counter.get("scan", Utc::now().date_naive()).await, 0);
    }
}
