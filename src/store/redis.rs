//! KeyDB / Redis backed [`Store`].
//!
//! Commands go through a [`fred::clients::Pool`]; each call borrows a pooled
//! connection for exactly one round trip and is bounded by the configured
//! command timeout.  Subscriptions share one dedicated [`SubscriberClient`]
//! whose message stream is demultiplexed per channel.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use fred::clients::{Pool, SubscriberClient};
use fred::interfaces::{ClientLike, EventInterface, KeysInterface, LuaInterface, PubsubInterface};
use fred::types::config::{Config as FredConfig, ReconnectPolicy, ServerConfig, TlsConnector};
use fred::types::{Builder, CustomCommand, Expiration, SetOptions};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{
    with_timeout, Expiry, SetCondition, Store, StoreMessage, StoreResult, Subscription,
    SubscriptionId, WindowCount, SUBSCRIPTION_BUFFER,
};
use crate::config::StoreConfig;
use crate::error::StoreError;

/// Read-and-delete in one script so two concurrent callers can never both
/// observe the value.
const GET_DEL_SCRIPT: &str = r#"
    local val = redis.call('GET', KEYS[1])
    if val then
        redis.call('DEL', KEYS[1])
    end
    return val
"#;

/// INCR, then set the window expiry when this was the first hit (or the key
/// lost its expiry), and report the remaining window in milliseconds.
const INCR_WINDOW_SCRIPT: &str = r#"
    local count = redis.call('INCR', KEYS[1])
    local ttl = redis.call('PTTL', KEYS[1])
    if count == 1 or ttl < 0 then
        redis.call('EXPIRE', KEYS[1], ARGV[1])
        ttl = tonumber(ARGV[1]) * 1000
    end
    return {count, ttl}
"#;

/// INCRBY and EXPIRE together, so a bucket never loses its expiry between
/// the two.
const INCR_TTL_SCRIPT: &str = r#"
    local value = redis.call('INCRBY', KEYS[1], ARGV[1])
    redis.call('EXPIRE', KEYS[1], ARGV[2])
    return value
"#;

type Forwarders = HashMap<String, Vec<(SubscriptionId, JoinHandle<()>)>>;

pub struct RedisStore {
    pool: Pool,
    subscriber: SubscriberClient,
    timeout: Duration,
    forwarders: Mutex<Forwarders>,
    next_subscription: AtomicU64,
}

impl RedisStore {
    /// Connect a pool and a subscriber client from the application config.
    ///
    /// The pool is PING-verified before being returned.  If `config.tls` is
    /// set the connection uses `rustls`; the password is read from the
    /// environment variable named by `config.auth_token_env`.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let auth_token = std::env::var(&config.auth_token_env).ok();

        let endpoint = config
            .endpoint
            .trim_start_matches("rediss://")
            .trim_start_matches("redis://");
        let (host, port) = parse_host_port(endpoint)?;

        let mut fred_config = FredConfig {
            server: ServerConfig::new_centralized(host, port),
            ..FredConfig::default()
        };
        if config.tls {
            fred_config.tls = Some(TlsConnector::default_rustls()?.into());
        }
        if let Some(token) = auth_token {
            fred_config.password = Some(token);
        }

        let policy = ReconnectPolicy::new_exponential(0, 100, 30_000, 2);
        let mut builder = Builder::from_config(fred_config.clone());
        builder.set_policy(policy.clone());

        let pool = builder
            .build_pool(config.pool_size)
            .context("failed to build store connection pool")?;
        pool.init().await.context("failed to connect to store")?;
        let _: String = pool
            .ping(None)
            .await
            .context("store PING failed after connect")?;

        let subscriber = SubscriberClient::new(fred_config, None, None, Some(policy));
        let _connect = subscriber.connect();
        subscriber
            .wait_for_connect()
            .await
            .context("subscriber connect")?;
        // Re-issue SUBSCRIBE for every tracked channel after a reconnect.
        let _resubscribe = subscriber.manage_subscriptions();

        info!(
            host,
            port,
            tls = config.tls,
            pool_size = config.pool_size,
            timeout_ms = config.command_timeout_ms,
            "store pool created and verified"
        );

        Ok(Self {
            pool,
            subscriber,
            timeout: Duration::from_millis(config.command_timeout_ms),
            forwarders: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(0),
        })
    }

    /// Run one store command under the configured timeout.
    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> StoreResult<T>
    where
        F: Future<Output = Result<T, fred::error::Error>>,
    {
        let limit = self.timeout;
        with_timeout(limit, async move {
            fut.await.map_err(|e| {
                trace!(op, error = %e, "store command failed");
                classify(e, limit)
            })
        })
        .await
    }

    fn forwarders(&self) -> std::sync::MutexGuard<'_, Forwarders> {
        self.forwarders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait::async_trait]
impl Store for RedisStore {
    async fn ping(&self) -> StoreResult<()> {
        let _: String = self.bounded("PING", self.pool.ping(None)).await?;
        Ok(())
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        expiry: Expiry,
        condition: SetCondition,
    ) -> StoreResult<bool> {
        let expiration = match expiry {
            Expiry::Ttl(ttl) => Expiration::EX(super::whole_secs(ttl)),
            Expiry::KeepTtl => Expiration::KEEPTTL,
        };
        let options = match condition {
            SetCondition::Always => None,
            SetCondition::IfExists => Some(SetOptions::XX),
            SetCondition::IfAbsent => Some(SetOptions::NX),
        };
        // SET replies "OK" when written and nil when a condition blocked it.
        let reply: Option<String> = self
            .bounded(
                "SET",
                self.pool.set(key, value, Some(expiration), options, false),
            )
            .await?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.bounded("GET", self.pool.get(key)).await
    }

    async fn get_del(&self, key: &str) -> StoreResult<Option<String>> {
        self.bounded(
            "EVAL get_del",
            self.pool
                .eval(GET_DEL_SCRIPT, vec![key.to_string()], Vec::<String>::new()),
        )
        .await
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let removed: i64 = self.bounded("DEL", self.pool.del(key)).await?;
        Ok(removed > 0)
    }

    async fn del_pattern(&self, pattern: &str) -> StoreResult<u64> {
        let keys = self.keys(pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let removed: i64 = self.bounded("DEL", self.pool.del(keys)).await?;
        debug!(%pattern, removed, "deleted keys by pattern");
        Ok(removed.max(0) as u64)
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        // KEYS is acceptable for the small namespaces scanned here (sessions,
        // hardware units, per-user notifications).
        self.bounded(
            "KEYS",
            self.pool.custom(
                CustomCommand::new_static("KEYS", None::<u16>, false),
                vec![pattern.to_string()],
            ),
        )
        .await
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.bounded("EXISTS", self.pool.exists(key)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.bounded(
            "EXPIRE",
            self.pool.expire(key, super::whole_secs(ttl), None),
        )
        .await
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        // PTTL: -2 missing, -1 no expiry.
        let ms: i64 = self.bounded("PTTL", self.pool.pttl(key)).await?;
        Ok((ms >= 0).then(|| Duration::from_millis(ms as u64)))
    }

    async fn incr_by(&self, key: &str, amount: i64) -> StoreResult<i64> {
        self.bounded("INCRBY", self.pool.incr_by(key, amount)).await
    }

    async fn incr_by_with_ttl(&self, key: &str, amount: i64, ttl: Duration) -> StoreResult<i64> {
        self.bounded(
            "EVAL incr_ttl",
            self.pool.eval(
                INCR_TTL_SCRIPT,
                vec![key.to_string()],
                vec![amount.to_string(), super::whole_secs(ttl).to_string()],
            ),
        )
        .await
    }

    async fn incr_window(&self, key: &str, window: Duration) -> StoreResult<WindowCount> {
        let secs = super::whole_secs(window);
        let reply: Vec<i64> = self
            .bounded(
                "EVAL incr_window",
                self.pool.eval(
                    INCR_WINDOW_SCRIPT,
                    vec![key.to_string()],
                    vec![secs.to_string()],
                ),
            )
            .await?;
        match reply.as_slice() {
            [count, ttl_ms] => Ok(WindowCount {
                count: *count,
                remaining: Duration::from_millis((*ttl_ms).max(0) as u64),
            }),
            other => Err(StoreError::Protocol(format!(
                "incr_window returned {} values",
                other.len()
            ))),
        }
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<u64> {
        // Pool does not implement PubsubInterface; publish via one client.
        let receivers: i64 = self
            .bounded("PUBLISH", self.pool.next().publish(channel, message))
            .await?;
        Ok(receivers.max(0) as u64)
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        // Take the broadcast receiver before SUBSCRIBE so nothing published
        // right after the subscription is confirmed can be missed.
        let mut messages = self.subscriber.message_rx();
        self.bounded("SUBSCRIBE", self.subscriber.subscribe(channel))
            .await?;

        let wanted = channel.to_string();
        let handle = tokio::spawn(async move {
            loop {
                match messages.recv().await {
                    Ok(msg) => {
                        if &*msg.channel != wanted.as_str() {
                            continue;
                        }
                        let Some(payload) = msg.value.as_string() else {
                            warn!(channel = %wanted, "dropping non-string pub/sub message");
                            continue;
                        };
                        let forwarded = StoreMessage {
                            channel: wanted.clone(),
                            payload,
                        };
                        match tx.try_send(forwarded) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                warn!(channel = %wanted, "subscriber buffer full, dropping message");
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => break,
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(channel = %wanted, skipped, "pub/sub receiver lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed) + 1;
        self.forwarders()
            .entry(channel.to_string())
            .or_default()
            .push((id, handle));
        debug!(%channel, id, "subscribed");
        Ok(Subscription::new(id, rx))
    }

    async fn unsubscribe(&self, channel: &str, id: SubscriptionId) -> StoreResult<()> {
        let last = release_forwarder(&mut self.forwarders(), channel, id);
        if last {
            self.bounded("UNSUBSCRIBE", self.subscriber.unsubscribe(channel))
                .await?;
        }
        debug!(%channel, id, last, "unsubscribed");
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        let handles: Vec<_> = self.forwarders().drain().flat_map(|(_, h)| h).collect();
        for (_, handle) in handles {
            handle.abort();
        }
        quit_all(vec![
            self.bounded("QUIT", self.subscriber.quit()).boxed(),
            self.bounded("QUIT", self.pool.quit()).boxed(),
        ])
        .await?;
        info!("store connections closed");
        Ok(())
    }
}

/// Map a client error, reporting the client's own timeouts against the
/// configured command limit.
fn classify(err: fred::error::Error, limit: Duration) -> StoreError {
    match err.kind() {
        fred::error::ErrorKind::Timeout => StoreError::Timeout(limit),
        _ => StoreError::from(err),
    }
}

/// Stop and forget forwarder `id` on `channel`.  Returns whether it was the
/// channel's last one, i.e. whether the server subscription can go.
fn release_forwarder(forwarders: &mut Forwarders, channel: &str, id: SubscriptionId) -> bool {
    let Some(handles) = forwarders.get_mut(channel) else {
        return false;
    };
    handles.retain(|(sub, handle)| {
        if *sub == id {
            handle.abort();
        }
        *sub != id
    });
    if handles.is_empty() {
        forwarders.remove(channel);
        true
    } else {
        false
    }
}

/// Run every shutdown step even if an earlier one fails; report the first
/// failure.
async fn quit_all(steps: Vec<BoxFuture<'_, StoreResult<()>>>) -> StoreResult<()> {
    let mut first = None;
    for step in steps {
        if let Err(e) = step.await {
            warn!(error = %e, "store shutdown step failed");
            first.get_or_insert(e);
        }
    }
    first.map_or(Ok(()), Err)
}

/// Parse a `host:port` string.  If the port is omitted, defaults to `6379`.
pub fn parse_host_port(endpoint: &str) -> Result<(&str, u16)> {
    // Strip any trailing path segments (e.g. a database index in a URI).
    let endpoint = endpoint.split('/').next().unwrap_or(endpoint);

    if let Some((host, port_str)) = endpoint.rsplit_once(':') {
        let port: u16 = port_str
            .parse()
            .with_context(|| format!("invalid port in endpoint: {endpoint}"))?;
        Ok((host, port))
    } else {
        Ok((endpoint, 6379))
    }
}
