//! Single-use, time-boxed tokens (QR redemption).
//!
//! A token is Active while its key exists and Consumed-or-Expired once it is
//! gone; the transition is one-way.  Consumption is a single atomic
//! read-and-delete in the store, so of any number of concurrent consumers at
//! most one sees the payload.  The record also carries its own `expiresAt`,
//! which is checked independently of the store's TTL clock.
//!
//! Consumption never raises: every failure is an invalid redemption, and
//! callers must not retry a failed consume.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::now_ms;
use crate::error::TokenError;
use crate::keyspace::Namespace;
use crate::metrics::{Metrics, ReasonLabels};
use crate::store::{Expiry, SetCondition, Store};

/// Claim data redeemable through a token.
pub type Claims = Map<String, Value>;

/// A stored token: the caller's claims with creation and expiry embedded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    #[serde(flatten)]
    pub data: Claims,
    /// Epoch milliseconds.
    pub created_at: i64,
    /// Epoch milliseconds.
    pub expires_at: i64,
}

/// Why a consume attempt did not redeem a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Never issued, already consumed, or evicted by the store TTL.
    NotFound,
    /// Present but past its embedded expiry.
    Expired,
    /// Present but not a token record.
    Malformed,
    /// The store could not be reached; redemption state is unknown.
    Unavailable,
}

impl Rejection {
    pub fn message(self) -> &'static str {
        match self {
            Self::NotFound => "QR code not found or expired",
            Self::Expired => "QR code expired",
            Self::Malformed => "QR code record is malformed",
            Self::Unavailable => "QR code could not be verified",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Expired => "expired",
            Self::Malformed => "malformed",
            Self::Unavailable => "unavailable",
        }
    }
}

/// Result of [`TokenVault::consume`].
///
/// Serializes as `{"valid": true, "data": {..}}` or
/// `{"valid": false, "reason": ".."}`.
#[derive(Debug, Clone, PartialEq)]
pub enum Redemption {
    Valid(TokenRecord),
    Invalid(Rejection),
}

impl Redemption {
    pub fn is_valid(&self) -> bool {
        matches!(self, Redemption::Valid(_))
    }

    pub fn reason(&self) -> Option<&'static str> {
        match self {
            Redemption::Valid(_) => None,
            Redemption::Invalid(rejection) => Some(rejection.message()),
        }
    }
}

impl Serialize for Redemption {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Wire<'a> {
            valid: bool,
            #[serde(skip_serializing_if = "Option::is_none")]
            data: Option<&'a TokenRecord>,
            #[serde(skip_serializing_if = "Option::is_none")]
            reason: Option<&'static str>,
        }

        let wire = match self {
            Redemption::Valid(record) => Wire {
                valid: true,
                data: Some(record),
                reason: None,
            },
            Redemption::Invalid(rejection) => Wire {
                valid: false,
                data: None,
                reason: Some(rejection.message()),
            },
        };
        wire.serialize(serializer)
    }
}

#[derive(Clone)]
pub struct TokenVault {
    store: Arc<dyn Store>,
    default_ttl: Duration,
    metrics: Arc<Metrics>,
}

impl TokenVault {
    pub fn new(store: Arc<dyn Store>, default_ttl: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            default_ttl,
            metrics,
        }
    }

    fn key(token_id: &str) -> String {
        Namespace::Qr.key(&[token_id])
    }

    /// Issue a token.  Refuses to overwrite a live token with the same id.
    pub async fn create(
        &self,
        token_id: &str,
        mut claims: Claims,
        ttl: Option<Duration>,
    ) -> Result<TokenRecord, TokenError> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        // The embedded timestamps are owned by the vault.
        claims.remove("createdAt");
        claims.remove("expiresAt");

        let created_at = now_ms();
        let record = TokenRecord {
            data: claims,
            created_at,
            expires_at: created_at + ttl.as_millis() as i64,
        };
        let encoded = serde_json::to_string(&record).map_err(crate::error::StoreError::from)?;

        let key = Self::key(token_id);
        let written = self
            .store
            .set(&key, &encoded, Expiry::Ttl(ttl), SetCondition::IfAbsent)
            .await?;
        if !written {
            warn!(%token_id, "token id already in use");
            return Err(TokenError::AlreadyExists(token_id.to_string()));
        }
        info!(%token_id, ttl_secs = ttl.as_secs(), "token issued");
        Ok(record)
    }

    /// Redeem a token.  At most one call per token ever returns
    /// [`Redemption::Valid`].
    pub async fn consume(&self, token_id: &str) -> Redemption {
        let key = Self::key(token_id);
        let raw = match self.store.get_del(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return self.reject(token_id, Rejection::NotFound),
            Err(e) => {
                self.metrics.store_error("token_consume");
                warn!(%token_id, error = %e, "token consume failed");
                return self.reject(token_id, Rejection::Unavailable);
            }
        };

        let record: TokenRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(e) => {
                warn!(%token_id, error = %e, "token record undecodable");
                return self.reject(token_id, Rejection::Malformed);
            }
        };
        if record.expires_at <= now_ms() {
            return self.reject(token_id, Rejection::Expired);
        }

        self.metrics.tokens_redeemed.inc();
        info!(%token_id, "token redeemed");
        Redemption::Valid(record)
    }

    fn reject(&self, token_id: &str, rejection: Rejection) -> Redemption {
        self.metrics
            .token_rejections
            .get_or_create(&ReasonLabels {
                reason: rejection.label(),
            })
            .inc();
        debug!(%token_id, reason = rejection.label(), "token rejected");
        Redemption::Invalid(rejection)
    }

    /// Inspect a token without consuming it.  Expired, missing, malformed,
    /// and unreachable all report `None`.
    pub async fn peek(&self, token_id: &str) -> Option<TokenRecord> {
        let key = Self::key(token_id);
        let raw = match self.store.get(&key).await {
            Ok(raw) => raw?,
            Err(e) => {
                self.metrics.store_error("token_peek");
                warn!(%token_id, error = %e, "token peek failed");
                return None;
            }
        };
        serde_json::from_str::<TokenRecord>(&raw)
            .ok()
            .filter(|record| record.expires_at > now_ms())
    }

    /// Invalidate a token without redeeming it.  Returns whether it existed.
    pub async fn revoke(&self, token_id: &str) -> bool {
        let key = Self::key(token_id);
        match self.store.del(&key).await {
            Ok(existed) => {
                if existed {
                    info!(%token_id, "token revoked");
                }
                existed
            }
            Err(e) => {
                self.metrics.store_error("token_revoke");
                warn!(%token_id, error = %e, "token revoke failed");
                false
            }
        }
    }
}
