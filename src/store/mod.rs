//! The shared expiring key-value store.
//!
//! Every coordination component talks to the store exclusively through the
//! [`Store`] trait so that the same component code runs against KeyDB/Redis in
//! production ([`redis::RedisStore`]) and against an in-process map in tests
//! and local development ([`memory::MemoryStore`]).
//!
//! All cross-request coordination goes through the store's atomic primitives
//! (`incr_window`, `get_del`, conditional `set`); nothing in this layer relies
//! on in-process locks, so correctness holds across many process instances.

pub mod memory;
pub mod redis;

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::StoreError;

pub type StoreResult<T> = Result<T, StoreError>;

/// Capacity of the per-subscription delivery buffer.  Messages arriving while
/// the buffer is full are dropped; pub/sub is best-effort.
pub const SUBSCRIPTION_BUFFER: usize = 256;

// ---------------------------------------------------------------------------
// Write options
// ---------------------------------------------------------------------------

/// Lifetime applied by a `set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Replace any existing lifetime with `ttl`.
    Ttl(Duration),
    /// Keep the lifetime of the existing key.
    KeepTtl,
}

/// Existence precondition for a `set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetCondition {
    #[default]
    Always,
    /// Only overwrite a key that currently exists (`XX`).
    IfExists,
    /// Only create a key that does not exist yet (`NX`).
    IfAbsent,
}

/// Result of a fixed-window increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Post-increment value of the counter.
    pub count: i64,
    /// Time left until the window (and the counter) expires.
    pub remaining: Duration,
}

/// Raw message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMessage {
    pub channel: String,
    pub payload: String,
}

/// Identifies one subscription among possibly many on the same channel.
pub type SubscriptionId = u64;

/// Receiving half of a channel subscription.
///
/// `recv` yields `None` once this subscription has been released or the
/// store has been closed.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::Receiver<StoreMessage>,
}

impl Subscription {
    pub(crate) fn new(id: SubscriptionId, rx: mpsc::Receiver<StoreMessage>) -> Self {
        Self { id, rx }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<StoreMessage> {
        self.rx.recv().await
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Operations the coordination layer needs from the backing store.
///
/// Each method is a single logical round trip with at most one attempt.
/// Implementations bound every call by a timeout and report elapse as
/// [`StoreError::Timeout`].
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Liveness probe.
    async fn ping(&self) -> StoreResult<()>;

    /// Write `value` under `key`.  Returns `false` when `condition` prevented
    /// the write.
    async fn set(
        &self,
        key: &str,
        value: &str,
        expiry: Expiry,
        condition: SetCondition,
    ) -> StoreResult<bool>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Atomically read and delete `key`.  Of any number of concurrent callers
    /// at most one observes the value.
    async fn get_del(&self, key: &str) -> StoreResult<Option<String>>;

    /// Delete `key`; returns whether it existed.
    async fn del(&self, key: &str) -> StoreResult<bool>;

    /// Delete every key matching the glob `pattern`; returns how many.
    async fn del_pattern(&self, pattern: &str) -> StoreResult<u64>;

    /// All live keys matching the glob `pattern`.
    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Reset the remaining lifetime of `key`; returns whether it existed.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Remaining lifetime of `key`, or `None` when it is missing or has no
    /// expiry.
    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    /// Atomically add `amount` to the integer at `key` (missing counts as 0).
    async fn incr_by(&self, key: &str, amount: i64) -> StoreResult<i64>;

    /// Atomically add `amount` to the integer at `key` and reset its
    /// lifetime to `ttl`, in one round trip.
    async fn incr_by_with_ttl(&self, key: &str, amount: i64, ttl: Duration) -> StoreResult<i64>;

    /// Atomically increment the counter at `key` by one.  The first increment
    /// of a window (post-increment value 1) sets the expiry to `window`; later
    /// increments share it.
    async fn incr_window(&self, key: &str, window: Duration) -> StoreResult<WindowCount>;

    /// Publish `message` on `channel`; returns the number of receivers.
    async fn publish(&self, channel: &str, message: &str) -> StoreResult<u64>;

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription>;

    /// Release one subscription.  Other subscriptions on the same channel
    /// keep receiving; the backend stops listening once the last is gone.
    async fn unsubscribe(&self, channel: &str, id: SubscriptionId) -> StoreResult<()>;

    /// Release connections.  Later calls fail with `Unavailable`.
    async fn close(&self) -> StoreResult<()>;
}

/// Run one store call under `limit`.  Elapse is reported as
/// [`StoreError::Timeout`], which every component treats as the store being
/// unavailable.
pub(crate) async fn with_timeout<T, F>(limit: Duration, fut: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or(Err(StoreError::Timeout(limit)))
}

/// Whole seconds for an `EX`-style expiry, rounding sub-second remainders up.
///
/// A zero TTL is a caller bug, not a runtime condition.
pub(crate) fn whole_secs(ttl: Duration) -> i64 {
    assert!(!ttl.is_zero(), "TTL must be greater than zero");
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    i64::try_from(secs).unwrap_or(i64::MAX)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Store doubles for exercising degraded paths.

    use super::*;

    /// Every call is refused immediately.
    pub struct FailingStore;

    fn down<T>() -> StoreResult<T> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    #[async_trait::async_trait]
    impl Store for FailingStore {
        async fn ping(&self) -> StoreResult<()> {
            down()
        }
        async fn set(&self, _: &str, _: &str, _: Expiry, _: SetCondition) -> StoreResult<bool> {
            down()
        }
        async fn get(&self, _: &str) -> StoreResult<Option<String>> {
            down()
        }
        async fn get_del(&self, _: &str) -> StoreResult<Option<String>> {
            down()
        }
        async fn del(&self, _: &str) -> StoreResult<bool> {
            down()
        }
        async fn del_pattern(&self, _: &str) -> StoreResult<u64> {
            down()
        }
        async fn keys(&self, _: &str) -> StoreResult<Vec<String>> {
            down()
        }
        async fn exists(&self, _: &str) -> StoreResult<bool> {
            down()
        }
        async fn expire(&self, _: &str, _: Duration) -> StoreResult<bool> {
            down()
        }
        async fn ttl(&self, _: &str) -> StoreResult<Option<Duration>> {
            down()
        }
        async fn incr_by(&self, _: &str, _: i64) -> StoreResult<i64> {
            down()
        }
        async fn incr_by_with_ttl(&self, _: &str, _: i64, _: Duration) -> StoreResult<i64> {
            down()
        }
        async fn incr_window(&self, _: &str, _: Duration) -> StoreResult<WindowCount> {
            down()
        }
        async fn publish(&self, _: &str, _: &str) -> StoreResult<u64> {
            down()
        }
        async fn subscribe(&self, _: &str) -> StoreResult<Subscription> {
            down()
        }
        async fn unsubscribe(&self, _: &str, _: SubscriptionId) -> StoreResult<()> {
            down()
        }
        async fn close(&self) -> StoreResult<()> {
            Ok(())
        }
    }

    /// Every call hangs until the command timeout elapses.
    pub struct StalledStore {
        pub limit: Duration,
    }

    impl StalledStore {
        async fn stall<T>(&self) -> StoreResult<T> {
            with_timeout(self.limit, std::future::pending()).await
        }
    }

    #[async_trait::async_trait]
    impl Store for StalledStore {
        async fn ping(&self) -> StoreResult<()> {
            self.stall().await
        }
        async fn set(&self, _: &str, _: &str, _: Expiry, _: SetCondition) -> StoreResult<bool> {
            self.stall().await
        }
        async fn get(&self, _: &str) -> StoreResult<Option<String>> {
            self.stall().await
        }
        async fn get_del(&self, _: &str) -> StoreResult<Option<String>> {
            self.stall().await
        }
        async fn del(&self, _: &str) -> StoreResult<bool> {
            self.stall().await
        }
        async fn del_pattern(&self, _: &str) -> StoreResult<u64> {
            self.stall().await
        }
        async fn keys(&self, _: &str) -> StoreResult<Vec<String>> {
            self.stall().await
        }
        async fn exists(&self, _: &str) -> StoreResult<bool> {
            self.stall().await
        }
        async fn expire(&self, _: &str, _: Duration) -> StoreResult<bool> {
            self.stall().await
        }
        async fn ttl(&self, _: &str) -> StoreResult<Option<Duration>> {
            self.stall().await
        }
        async fn incr_by(&self, _: &str, _: i64) -> StoreResult<i64> {
            self.stall().await
        }
        async fn incr_by_with_ttl(&self, _: &str, _: i64, _: Duration) -> StoreResult<i64> {
            self.stall().await
        }
        async fn incr_window(&self, _: &str, _: Duration) -> StoreResult<WindowCount> {
            self.stall().await
        }
        async fn publish(&self, _: &str, _: &str) -> StoreResult<u64> {
            self.stall().await
        }
        async fn subscribe(&self, _: &str) -> StoreResult<Subscription> {
            self.stall().await
        }
        async fn unsubscribe(&self, _: &str, _: SubscriptionId) -> StoreResult<()> {
            self.stall().await
        }
        async fn close(&self) -> StoreResult<()> {
            Ok(())
        }
    }
}
