//! Short-lived tombstones for symbols the backing store does not have

use crate::cache::keys::{KeyBuilder, KeyCategory, TtlPolicy};
use crate::cache::store::CacheStore;
use crate::error::Result;
use crate::monitor::CacheMonitor;
use crate::types::validate_symbol;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const TOMBSTONE: &str = "1";

/// Null-value cache stored alongside the cached data
#[derive(Clone)]
pub struct NullValueCache {
    store: Arc<dyn CacheStore>,
    keys: KeyBuilder,
    ttl: Duration,
    monitor: Arc<CacheMonitor>,
}

impl NullValueCache {
    pub fn new(
        store: Arc<dyn CacheStore>,
        keys: KeyBuilder,
        ttl: &TtlPolicy,
        monitor: Arc<CacheMonitor>,
    ) -> Self {
        Self {
            store,
            keys,
            ttl: ttl.ttl_for(KeyCategory::NullMarker),
            monitor,
        }
    }

    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.monitor.record_error();
        }
        result
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Mark `symbol` as confirmed absent for the tombstone TTL.
    pub async fn set_null_value(&self, symbol: &str) -> Result<()> {
        validate_symbol(symbol)?;
        let key = self.keys.null_marker(symbol);
        self.observe(self.store.set(&key, TOMBSTONE, self.ttl).await)?;
        debug!(symbol, "tombstone set");
        Ok(())
    }

    pub async fn is_null_value(&self, symbol: &str) -> Result<bool> {
        validate_symbol(symbol)?;
        self.observe(self.store.exists(&self.keys.null_marker(symbol)).await)
    }

    /// Returns whether a tombstone was removed.
    pub async fn clear_null_value(&self, symbol: &str) -> Result<bool> {
        validate_symbol(symbol)?;
        let removed = self.observe(self.store.delete(&self.keys.null_marker(symbol)).await)?;
        if removed {
            debug!(symbol, "tombstone cleared");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryStore;

    fn nulls_with_store() -> (NullValueCache, Arc<MemoryStore>, Arc<CacheMonitor>) {
        let store = Arc::new(MemoryStore::new());
        let monitor = Arc::new(CacheMonitor::default());
        let nulls = NullValueCache::new(
            store.clone(),
            KeyBuilder::default(),
            &TtlPolicy::default(),
            monitor.clone(),
        );
        (nulls, store, monitor)
    }

    fn nulls() -> NullValueCache {
        nulls_with_store().0
    }

    #[tokio::test]
    async fn test_set_and_clear() {
        let nulls = nulls();
        assert!(!nulls.is_null_value("FOO").await.unwrap());

        nulls.set_null_value("FOO").await.unwrap();
        assert!(nulls.is_null_value("FOO").await.unwrap());

        assert!(nulls.clear_null_value("FOO").await.unwrap());
        assert!(!nulls.is_null_value("FOO").await.unwrap());
        assert!(!nulls.clear_null_value("FOO").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tombstone_expires() {
        let nulls = nulls();
        nulls.set_null_value("FOO").await.unwrap();
        tokio::time::advance(nulls.ttl()).await;
        assert!(!nulls.is_null_value("FOO").await.unwrap());
    }

    #[tokio::test]
    async fn test_store_failures_reach_monitor() {
        let (nulls, store, monitor) = nulls_with_store();
        store.set_offline(true);

        assert!(nulls.set_null_value("FOO").await.is_err());
        assert!(nulls.is_null_value("FOO").await.is_err());
        assert!(nulls.clear_null_value("FOO").await.is_err());
        assert_eq!(monitor.stats().errors, 3);
    }

    #[tokio::test]
    async fn test_rejects_invalid_symbol() {
        assert!(nulls().set_null_value("A:B").await.is_err());
    }
}
