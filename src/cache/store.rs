//! The networked key-value store the cache layer orchestrates
//!
//! Implementations own nothing but a connection handle; the lifetime of every
//! cached value is governed by the TTL passed on write.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Memory and connection figures reported by the store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreInfo {
    /// Bytes currently used by the store
    pub used_memory_bytes: u64,
    /// Configured memory ceiling, 0 when unlimited
    pub max_memory_bytes: u64,
    /// Number of keys currently held
    pub keys: u64,
}

impl StoreInfo {
    /// Fraction of the memory ceiling in use, if a ceiling is configured.
    pub fn utilization(&self) -> Option<f64> {
        if self.max_memory_bytes == 0 {
            None
        } else {
            Some(self.used_memory_bytes as f64 / self.max_memory_bytes as f64)
        }
    }
}

/// Primitive operations the cache layer needs from a Redis-compatible store.
///
/// Batch operations (`get_many`, `set_many`, bit operations) must be sent as a
/// single pipelined round trip.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Values in the same order as `keys`; `None` for absent keys.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    async fn set_many(&self, items: &[(String, String)], ttl: Duration) -> Result<()>;

    async fn set_add(&self, key: &str, members: &[String], ttl: Duration) -> Result<()>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// Atomically replace a set with `members`; previous members are gone.
    async fn set_replace(&self, key: &str, members: &[String], ttl: Duration) -> Result<()>;

    /// Set every bit at `offsets` to 1.
    async fn set_bits(&self, key: &str, offsets: &[u64]) -> Result<()>;

    /// Bit values in the same order as `offsets`.
    async fn get_bits(&self, key: &str, offsets: &[u64]) -> Result<Vec<bool>>;

    async fn ping(&self) -> Result<()>;

    async fn info(&self) -> Result<StoreInfo>;
}
