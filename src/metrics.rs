use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OpLabels {
    pub op: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ChannelLabels {
    pub channel: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReasonLabels {
    pub reason: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum StatusKind {
    Locker,
    Hardware,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StatusLabels {
    pub kind: StatusKind,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Process-local Prometheus instrumentation of the coordination layer.
///
/// These counters describe this process only.  Fleet-wide operational
/// counters live in the store (see [`crate::coordination::counters`]).
pub struct Metrics {
    // -- cache --
    pub cache_hits: Counter,
    pub cache_misses: Counter,

    // -- store --
    pub store_errors: Family<OpLabels, Counter>,

    // -- rate limit --
    pub rate_limit_rejections: Counter,

    // -- tokens --
    pub tokens_redeemed: Counter,
    pub token_rejections: Family<ReasonLabels, Counter>,

    // -- pub/sub --
    pub pubsub_published: Family<ChannelLabels, Counter>,
    pub pubsub_received: Family<ChannelLabels, Counter>,

    // -- status --
    pub status_writes: Family<StatusLabels, Counter>,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let cache_hits = Counter::default();
        registry.register(
            "lockerd_cache_hits",
            "Cache reads answered from the store",
            cache_hits.clone(),
        );

        let cache_misses = Counter::default();
        registry.register(
            "lockerd_cache_misses",
            "Cache reads that found nothing usable (absent, expired, undecodable, or store down)",
            cache_misses.clone(),
        );

        let store_errors = Family::<OpLabels, Counter>::default();
        registry.register(
            "lockerd_store_errors",
            "Store calls that failed or timed out, by operation",
            store_errors.clone(),
        );

        let rate_limit_rejections = Counter::default();
        registry.register(
            "lockerd_rate_limit_rejections",
            "Requests rejected by a fixed-window rate limit",
            rate_limit_rejections.clone(),
        );

        let tokens_redeemed = Counter::default();
        registry.register(
            "lockerd_tokens_redeemed",
            "One-time tokens successfully consumed",
            tokens_redeemed.clone(),
        );

        let token_rejections = Family::<ReasonLabels, Counter>::default();
        registry.register(
            "lockerd_token_rejections",
            "One-time token consume attempts rejected, by reason",
            token_rejections.clone(),
        );

        let pubsub_published = Family::<ChannelLabels, Counter>::default();
        registry.register(
            "lockerd_pubsub_published",
            "Envelopes published, by channel",
            pubsub_published.clone(),
        );

        let pubsub_received = Family::<ChannelLabels, Counter>::default();
        registry.register(
            "lockerd_pubsub_received",
            "Envelopes delivered to local handlers, by channel",
            pubsub_received.clone(),
        );

        let status_writes = Family::<StatusLabels, Counter>::default();
        registry.register(
            "lockerd_status_writes",
            "Status records written, by entity kind",
            status_writes.clone(),
        );

        Self {
            cache_hits,
            cache_misses,
            store_errors,
            rate_limit_rejections,
            tokens_redeemed,
            token_rejections,
            pubsub_published,
            pubsub_received,
            status_writes,
        }
    }

    pub fn store_error(&self, op: &'static str) {
        self.store_errors.get_or_create(&OpLabels { op }).inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all coordination metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut body = String::new();
        prometheus_client::encoding::text::encode(&mut body, &self.registry)?;
        Ok(body)
    }
}
