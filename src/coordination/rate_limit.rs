//! Fixed-window rate limiting keyed by (actor, action).
//!
//! One atomic increment per check: the first hit of a window sets its expiry
//! and every later hit shares it.  Traffic clustered around a window boundary
//! can therefore admit up to twice the limit across the boundary; this is the
//! accepted cost of O(1) state and a single round trip.
//!
//! The limiter fails open: if the store is unreachable the request is allowed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use super::now_ms;
use crate::config::RateLimitPolicy;
use crate::keyspace::Namespace;
use crate::metrics::Metrics;
use crate::store::Store;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests counted in the current window, including this one.
    pub current: u64,
    /// Requests still admitted in the current window.
    pub remaining: u64,
    /// Epoch milliseconds at which the window resets.
    pub reset_at: i64,
}

impl RateLimitDecision {
    fn fail_open(limit: u64, window: Duration) -> Self {
        Self {
            allowed: true,
            current: 0,
            remaining: limit,
            reset_at: now_ms() + window.as_millis() as i64,
        }
    }

    /// Whole seconds until the window resets, for `Retry-After` headers.
    pub fn retry_after_secs(&self) -> u64 {
        let ms = (self.reset_at - now_ms()).max(0) as u64;
        ms.div_ceil(1000)
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn Store>,
    policies: Arc<HashMap<String, RateLimitPolicy>>,
    metrics: Arc<Metrics>,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn Store>,
        policies: HashMap<String, RateLimitPolicy>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            policies: Arc::new(policies),
            metrics,
        }
    }

    fn key(actor: &str, action: &str) -> String {
        Namespace::RateLimit.key(&[actor, action])
    }

    /// Count one request by `actor` for `action` against `limit` per `window`.
    ///
    /// # Panics
    ///
    /// If `limit` or `window` is zero.
    pub async fn check(
        &self,
        actor: &str,
        action: &str,
        limit: u64,
        window: Duration,
    ) -> RateLimitDecision {
        assert!(limit > 0, "rate limit must be greater than zero");
        assert!(!window.is_zero(), "rate-limit window must be greater than zero");

        let key = Self::key(actor, action);
        let counted = match self.store.incr_window(&key, window).await {
            Ok(counted) => counted,
            Err(e) => {
                self.metrics.store_error("rate_limit");
                warn!(%key, error = %e, "rate limit check failed, allowing request");
                return RateLimitDecision::fail_open(limit, window);
            }
        };

        let current = counted.count.max(0) as u64;
        let allowed = current <= limit;
        let decision = RateLimitDecision {
            allowed,
            current,
            remaining: limit.saturating_sub(current),
            reset_at: now_ms() + counted.remaining.as_millis() as i64,
        };
        if allowed {
            debug!(%key, current, limit, "rate limit ok");
        } else {
            self.metrics.rate_limit_rejections.inc();
            debug!(%key, current, limit, "rate limit exceeded");
        }
        decision
    }

    /// Check against a named policy from configuration.  The policy name is
    /// used as the action.  An unknown policy is a configuration bug and is
    /// allowed with a warning rather than blocking traffic.
    pub async fn check_policy(&self, actor: &str, policy: &str) -> RateLimitDecision {
        match self.policies.get(policy) {
            Some(p) => self.check(actor, policy, p.limit, p.window()).await,
            None => {
                warn!(%policy, "unknown rate-limit policy, allowing request");
                RateLimitDecision {
                    allowed: true,
                    current: 0,
                    remaining: u64::MAX,
                    reset_at: now_ms(),
                }
            }
        }
    }

    /// Force-clear the counter for (`actor`, `action`).  Returns whether a
    /// counter existed.
    pub async fn reset(&self, actor: &str, action: &str) -> bool {
        let key = Self::key(actor, action);
        match self.store.del(&key).await {
            Ok(existed) => {
                debug!(%key, existed, "rate limit reset");
                existed
            }
            Err(e) => {
                self.metrics.store_error("rate_limit_reset");
                warn!(%key, error = %e, "rate limit reset failed");
                false
            }
        }
    }
}
