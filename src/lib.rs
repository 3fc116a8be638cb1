//! Shared ephemeral coordination layer for the locker-checkout platform:
//! caching, rate limiting, sessions, device status with pub/sub fan-out,
//! single-use QR tokens, and per-day counters, all over one expiring
//! key-value store.

pub mod config;
pub mod coordination;
pub mod error;
pub mod health;
pub mod http;
pub mod keyspace;
pub mod metrics;
pub mod store;
