//! In-process [`Store`] used by the test suite and by `backend: memory`
//! single-node development setups.
//!
//! Expiry is evaluated lazily against [`tokio::time::Instant`], so tests can
//! drive TTLs with a paused clock and `tokio::time::advance`.  Each trait call
//! runs inside one critical section, which gives the same atomicity the Redis
//! backend gets from single commands and Lua scripts.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{
    Expiry, SetCondition, Store, StoreMessage, StoreResult, Subscription, SubscriptionId,
    WindowCount, SUBSCRIPTION_BUFFER,
};
use crate::error::StoreError;

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    channels: HashMap<String, Vec<(SubscriptionId, mpsc::Sender<StoreMessage>)>>,
    next_subscription: SubscriptionId,
    closed: bool,
}

impl Inner {
    /// Look up a live entry, evicting it first if it has expired.
    fn live(&mut self, key: &str, now: Instant) -> Option<&mut Entry> {
        if self.entries.get(key).is_some_and(|e| !e.is_live(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn matching_keys(&mut self, pattern: &str, now: Instant) -> Vec<String> {
        self.entries.retain(|_, e| e.is_live(now));
        let mut keys: Vec<String> = self
            .entries
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    fn incr(&mut self, key: &str, amount: i64, now: Instant) -> StoreResult<&mut Entry> {
        let current = match self.live(key, now) {
            Some(entry) => entry
                .value
                .parse::<i64>()
                .map_err(|_| StoreError::Protocol(format!("value at {key} is not an integer")))?,
            None => 0,
        };
        let next = current
            .checked_add(amount)
            .ok_or_else(|| StoreError::Protocol(format!("increment would overflow {key}")))?;
        let entry = self.entries.entry(key.to_string()).or_insert(Entry {
            value: String::new(),
            expires_at: None,
        });
        entry.value = next.to_string();
        Ok(entry)
    }
}

/// Single-process store backed by a mutex-guarded map.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        let guard = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.closed {
            return Err(StoreError::Unavailable("memory store closed".into()));
        }
        Ok(guard)
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        self.lock().map(|_| ())
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        expiry: Expiry,
        condition: SetCondition,
    ) -> StoreResult<bool> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        let existing = inner.live(key, now).map(|e| e.expires_at);
        match (condition, existing) {
            (SetCondition::IfExists, None) | (SetCondition::IfAbsent, Some(_)) => return Ok(false),
            _ => {}
        }
        let expires_at = match expiry {
            Expiry::Ttl(ttl) => Some(now + Duration::from_secs(super::whole_secs(ttl) as u64)),
            Expiry::KeepTtl => existing.flatten(),
        };
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut inner = self.lock()?;
        Ok(inner.live(key, Instant::now()).map(|e| e.value.clone()))
    }

    async fn get_del(&self, key: &str) -> StoreResult<Option<String>> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        if inner.live(key, now).is_none() {
            return Ok(None);
        }
        Ok(inner.entries.remove(key).map(|e| e.value))
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        let existed = inner.live(key, now).is_some();
        inner.entries.remove(key);
        Ok(existed)
    }

    async fn del_pattern(&self, pattern: &str) -> StoreResult<u64> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        let keys = inner.matching_keys(pattern, now);
        for key in &keys {
            inner.entries.remove(key);
        }
        Ok(keys.len() as u64)
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut inner = self.lock()?;
        Ok(inner.matching_keys(pattern, Instant::now()))
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        Ok(inner.live(key, Instant::now()).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        let secs = super::whole_secs(ttl) as u64;
        let mut inner = self.lock()?;
        match inner.live(key, now) {
            Some(entry) => {
                entry.expires_at = Some(now + Duration::from_secs(secs));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        Ok(inner
            .live(key, now)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn incr_by(&self, key: &str, amount: i64) -> StoreResult<i64> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        let entry = inner.incr(key, amount, now)?;
        entry
            .value
            .parse()
            .map_err(|_| StoreError::Protocol(format!("value at {key} is not an integer")))
    }

    async fn incr_by_with_ttl(&self, key: &str, amount: i64, ttl: Duration) -> StoreResult<i64> {
        let now = Instant::now();
        let secs = super::whole_secs(ttl) as u64;
        let mut inner = self.lock()?;
        let entry = inner.incr(key, amount, now)?;
        entry.expires_at = Some(now + Duration::from_secs(secs));
        entry
            .value
            .parse()
            .map_err(|_| StoreError::Protocol(format!("value at {key} is not an integer")))
    }

    async fn incr_window(&self, key: &str, window: Duration) -> StoreResult<WindowCount> {
        let now = Instant::now();
        let secs = super::whole_secs(window) as u64;
        let mut inner = self.lock()?;
        let entry = inner.incr(key, 1, now)?;
        let count: i64 = entry
            .value
            .parse()
            .map_err(|_| StoreError::Protocol(format!("value at {key} is not an integer")))?;
        if count == 1 || entry.expires_at.is_none() {
            entry.expires_at = Some(now + Duration::from_secs(secs));
        }
        let remaining = entry
            .expires_at
            .map(|at| at.saturating_duration_since(now))
            .unwrap_or(window);
        Ok(WindowCount { count, remaining })
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<u64> {
        let mut inner = self.lock()?;
        let Some(senders) = inner.channels.get_mut(channel) else {
            return Ok(0);
        };
        senders.retain(|(_, tx)| !tx.is_closed());
        let mut delivered = 0;
        for (_, tx) in senders.iter() {
            let msg = StoreMessage {
                channel: channel.to_string(),
                payload: message.to_string(),
            };
            match tx.try_send(msg) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(%channel, "subscriber buffer full, dropping message");
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let mut inner = self.lock()?;
        inner.next_subscription += 1;
        let id = inner.next_subscription;
        inner
            .channels
            .entry(channel.to_string())
            .or_default()
            .push((id, tx));
        debug!(%channel, id, "memory store subscription added");
        Ok(Subscription::new(id, rx))
    }

    async fn unsubscribe(&self, channel: &str, id: SubscriptionId) -> StoreResult<()> {
        let mut inner = self.lock()?;
        if let Some(senders) = inner.channels.get_mut(channel) {
            senders.retain(|(sub, _)| *sub != id);
            if senders.is_empty() {
                inner.channels.remove(channel);
            }
        }
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.closed = true;
        inner.channels.clear();
        inner.entries.clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Glob matching (Redis KEYS semantics)
// ---------------------------------------------------------------------------

/// Match `text` against a Redis-style glob: `*`, `?`, `[abc]`, `[a-z]`,
/// `[^a]`, and `\` escapes.
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    // Position after the last `*` and the text index it is currently covering.
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        let step = match p.get(pi) {
            Some('*') => {
                backtrack = Some((pi + 1, ti));
                pi += 1;
                continue;
            }
            Some('?') => Some(pi + 1),
            Some('[') => match_class(&p, pi, t[ti]),
            Some('\\') if pi + 1 < p.len() => (p[pi + 1] == t[ti]).then_some(pi + 2),
            Some(&c) => (c == t[ti]).then_some(pi + 1),
            None => None,
        };
        match step {
            Some(next) => {
                pi = next;
                ti += 1;
            }
            None => match backtrack {
                Some((star_pi, star_ti)) => {
                    pi = star_pi;
                    ti = star_ti + 1;
                    backtrack = Some((star_pi, star_ti + 1));
                }
                None => return false,
            },
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}

/// Match `c` against the character class opening at `p[start] == '['`.
/// Returns the pattern index just past the closing `]` on success.
fn match_class(p: &[char], start: usize, c: char) -> Option<usize> {
    let mut i = start + 1;
    let negate = matches!(p.get(i), Some('^') | Some('!'));
    if negate {
        i += 1;
    }
    let mut matched = false;
    while i < p.len() && p[i] != ']' {
        if p[i] == '\\' && i + 1 < p.len() {
            matched |= p[i + 1] == c;
            i += 2;
        } else if i + 2 < p.len() && p[i + 1] == '-' && p[i + 2] != ']' {
            let (lo, hi) = if p[i] <= p[i + 2] {
                (p[i], p[i + 2])
            } else {
                (p[i + 2], p[i])
            };
            matched |= (lo..=hi).contains(&c);
            i += 3;
        } else {
            matched |= p[i] == c;
            i += 1;
        }
    }
    if i >= p.len() {
        // Unterminated class: treat `[` literally.
        return (c == '[').then_some(start + 1);
    }
    (matched != negate).then_some(i + 1)
}
