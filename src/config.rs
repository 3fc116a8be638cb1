use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub tokens: TokenConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    /// Named fixed-window rate-limit policies.
    #[serde(default = "default_rate_limits")]
    pub rate_limits: HashMap<String, RateLimitPolicy>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            cache: CacheConfig::default(),
            session: SessionConfig::default(),
            tokens: TokenConfig::default(),
            status: StatusConfig::default(),
            metrics: MetricsConfig::default(),
            notifications: NotificationConfig::default(),
            rate_limits: default_rate_limits(),
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address for the ops listener (`/healthz`, `/metrics`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// KeyDB / Redis, shared by every process instance.
    #[default]
    Redis,
    /// In-process map.  Only coordinates within a single process.
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Connection string (e.g. `redis://keydb.local:6379`).
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Enable TLS for the store connection.
    #[serde(default)]
    pub tls: bool,
    /// Name of the environment variable that holds the store password.
    #[serde(default = "default_auth_token_env")]
    pub auth_token_env: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Upper bound on a single store round trip.  Elapse counts as the store
    /// being unavailable.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            endpoint: default_endpoint(),
            tls: false,
            auth_token_env: default_auth_token_env(),
            pool_size: default_pool_size(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

fn default_endpoint() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_auth_token_env() -> String {
    "LOCKERD_STORE_AUTH_TOKEN".to_string()
}

fn default_pool_size() -> usize {
    4
}

fn default_command_timeout_ms() -> u64 {
    500
}

// ---------------------------------------------------------------------------
// Per-component TTLs (seconds)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl")]
    pub default_ttl: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: default_cache_ttl(),
        }
    }
}

fn default_cache_ttl() -> u64 {
    3600
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_ttl")]
    pub ttl: u64,
    /// Renew the TTL on every successful read.
    #[serde(default = "bool_true")]
    pub sliding: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: default_session_ttl(),
            sliding: true,
        }
    }
}

fn default_session_ttl() -> u64 {
    86_400
}

fn bool_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    #[serde(default = "default_token_ttl")]
    pub default_ttl: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            default_ttl: default_token_ttl(),
        }
    }
}

fn default_token_ttl() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusConfig {
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl: u64,
    #[serde(default = "default_hardware_ttl")]
    pub hardware_ttl: u64,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            lock_ttl: default_lock_ttl(),
            hardware_ttl: default_hardware_ttl(),
        }
    }
}

fn default_lock_ttl() -> u64 {
    300
}

fn default_hardware_ttl() -> u64 {
    600
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// How long a daily bucket survives after its most recent write.
    #[serde(default = "default_retention")]
    pub retention: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            retention: default_retention(),
        }
    }
}

fn default_retention() -> u64 {
    7 * 86_400
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "default_notification_ttl")]
    pub ttl: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            ttl: default_notification_ttl(),
        }
    }
}

fn default_notification_ttl() -> u64 {
    7 * 86_400
}

// ---------------------------------------------------------------------------
// Rate limits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RateLimitPolicy {
    /// Requests admitted per window.
    pub limit: u64,
    /// Window length in seconds.
    pub window: u64,
}

impl RateLimitPolicy {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window)
    }
}

fn default_rate_limits() -> HashMap<String, RateLimitPolicy> {
    HashMap::from([
        (
            "api".to_string(),
            RateLimitPolicy {
                limit: 100,
                window: 60,
            },
        ),
        (
            "login".to_string(),
            RateLimitPolicy {
                limit: 5,
                window: 900,
            },
        ),
        (
            "qr_scan".to_string(),
            RateLimitPolicy {
                limit: 10,
                window: 60,
            },
        ),
    ])
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config = parse_config(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    Ok(config)
}

/// Parse and validate a YAML document.
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents)?;
    validate_config(&config)?;
    Ok(config)
}

/// Sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(config.store.pool_size > 0, "store.pool_size must be > 0");
    anyhow::ensure!(
        config.store.command_timeout_ms > 0,
        "store.command_timeout_ms must be > 0"
    );
    for (name, ttl) in [
        ("cache.default_ttl", config.cache.default_ttl),
        ("session.ttl", config.session.ttl),
        ("tokens.default_ttl", config.tokens.default_ttl),
        ("status.lock_ttl", config.status.lock_ttl),
        ("status.hardware_ttl", config.status.hardware_ttl),
        ("metrics.retention", config.metrics.retention),
        ("notifications.ttl", config.notifications.ttl),
    ] {
        anyhow::ensure!(ttl > 0, "{name} must be > 0");
    }
    for (name, policy) in &config.rate_limits {
        anyhow::ensure!(policy.limit > 0, "rate_limits.{name}.limit must be > 0");
        anyhow::ensure!(policy.window > 0, "rate_limits.{name}.window must be > 0");
    }
    Ok(())
}
