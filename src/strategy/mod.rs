//! Consistency strategies and the caller-facing coordinator
//!
//! The write/read policy is picked once, at construction, from
//! [`StrategyKind`]:
//!
//! | Strategy      | Write                                      | Read fill |
//! |---------------|--------------------------------------------|-----------|
//! | write-through | store, then cache (cache errors logged)    | inline    |
//! | write-behind  | cache, then detached store persist         | inline    |
//! | cache-aside   | store, then drop the cached copy           | detached  |
//!
//! Explicit invalidation is available under every strategy.

pub mod invalidation;
pub mod write_behind;

pub use invalidation::{InvalidationEvent, InvalidationReason, Invalidator};
pub use write_behind::WriteBehindQueue;

use crate::cache::keys::KeyBuilder;
use crate::cache::price::PriceCache;
use crate::cache::store::CacheStore;
use crate::config::AppConfig;
use crate::error::Result;
use crate::monitor::{check_store_health, CacheMonitor, CacheStats, HealthCheckResult};
use crate::protection::{BloomFilter, FillMode, NullValueCache, PenetrationGuard};
use crate::repository::PriceRepository;
use crate::resilience::{BreakerSnapshot, ResilientExecutor};
use crate::types::{validate_symbol, MetricsRecord, PriceRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Which consistency strategy a coordinator runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    WriteThrough,
    WriteBehind,
    CacheAside,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::WriteThrough => "write-through",
            StrategyKind::WriteBehind => "write-behind",
            StrategyKind::CacheAside => "cache-aside",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "write-through" => Ok(StrategyKind::WriteThrough),
            "write-behind" => Ok(StrategyKind::WriteBehind),
            "cache-aside" => Ok(StrategyKind::CacheAside),
            other => Err(format!(
                "unknown strategy '{}' (expected write-through, write-behind or cache-aside)",
                other
            )),
        }
    }
}

enum Strategy {
    WriteThrough,
    WriteBehind(WriteBehindQueue),
    CacheAside,
}

impl Strategy {
    fn kind(&self) -> StrategyKind {
        match self {
            Strategy::WriteThrough => StrategyKind::WriteThrough,
            Strategy::WriteBehind(_) => StrategyKind::WriteBehind,
            Strategy::CacheAside => StrategyKind::CacheAside,
        }
    }

    fn fill_mode(&self) -> FillMode {
        match self {
            Strategy::CacheAside => FillMode::Detached,
            Strategy::WriteThrough | Strategy::WriteBehind(_) => FillMode::Inline,
        }
    }
}

/// Caller-facing API over the cache, the backing store and their protections
pub struct CacheCoordinator {
    strategy: Strategy,
    guard: PenetrationGuard,
    invalidator: Invalidator,
    repository: Arc<dyn PriceRepository>,
    store: Arc<dyn CacheStore>,
    cache_exec: Arc<ResilientExecutor>,
    store_exec: Arc<ResilientExecutor>,
    monitor: Arc<CacheMonitor>,
    degraded_latency: Duration,
}

impl CacheCoordinator {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn CacheStore>,
        repository: Arc<dyn PriceRepository>,
    ) -> Result<Self> {
        let monitor = Arc::new(CacheMonitor::new(config.monitor.clone()));
        Self::with_monitor(config, store, repository, monitor)
    }

    /// Build with an existing monitor, e.g. one shared with a monitor loop.
    pub fn with_monitor(
        config: &AppConfig,
        store: Arc<dyn CacheStore>,
        repository: Arc<dyn PriceRepository>,
        monitor: Arc<CacheMonitor>,
    ) -> Result<Self> {
        config.validate()?;

        let keys = KeyBuilder::new(config.namespace.clone());
        let cache_exec = Arc::new(ResilientExecutor::new(
            "cache",
            config.cache_retry.clone(),
            config.cache_breaker.clone(),
        ));
        let store_exec = Arc::new(ResilientExecutor::new(
            "store",
            config.store_retry.clone(),
            config.store_breaker.clone(),
        ));

        let cache = PriceCache::new(
            Arc::clone(&store),
            keys.clone(),
            config.ttl.clone(),
            Arc::clone(&monitor),
        );
        let filter = Arc::new(BloomFilter::from_config(
            &config.bloom,
            Arc::clone(&store),
            &keys,
        )?);
        let nulls = NullValueCache::new(
            Arc::clone(&store),
            keys,
            &config.ttl,
            Arc::clone(&monitor),
        );
        let guard = PenetrationGuard::new(
            cache.clone(),
            filter,
            nulls,
            Arc::clone(&repository),
            Arc::clone(&cache_exec),
            Arc::clone(&store_exec),
        );
        let invalidator = Invalidator::new(cache, Arc::clone(&cache_exec));

        let strategy = match config.strategy {
            StrategyKind::WriteThrough => Strategy::WriteThrough,
            StrategyKind::WriteBehind => Strategy::WriteBehind(WriteBehindQueue::new(
                &config.write_behind,
                Arc::clone(&repository),
                Arc::clone(&store_exec),
                Arc::clone(&monitor),
            )),
            StrategyKind::CacheAside => Strategy::CacheAside,
        };

        info!(
            strategy = %config.strategy,
            namespace = %config.namespace,
            shared_bloom = config.bloom.shared,
            "Cache coordinator ready"
        );

        Ok(Self {
            strategy,
            guard,
            invalidator,
            repository,
            store,
            cache_exec,
            store_exec,
            monitor,
            degraded_latency: config.monitor.degraded_latency,
        })
    }

    pub fn kind(&self) -> StrategyKind {
        self.strategy.kind()
    }

    pub fn cache(&self) -> &PriceCache {
        self.guard.cache()
    }

    pub fn guard(&self) -> &PenetrationGuard {
        &self.guard
    }

    pub fn monitor(&self) -> &Arc<CacheMonitor> {
        &self.monitor
    }

    /// The write-behind queue, when running write-behind.
    pub fn write_behind(&self) -> Option<&WriteBehindQueue> {
        match &self.strategy {
            Strategy::WriteBehind(queue) => Some(queue),
            _ => None,
        }
    }

    async fn persist(&self, record: &PriceRecord) -> Result<()> {
        self.store_exec
            .execute("repository.upsert", || self.repository.upsert(record))
            .await
    }

    /// Write a price according to the configured strategy.
    pub async fn write_price(&self, record: &PriceRecord) -> Result<()> {
        record.validate()?;
        match &self.strategy {
            Strategy::WriteThrough => {
                self.persist(record).await?;
                if let Err(e) = self.guard.write(record).await {
                    warn!(
                        symbol = %record.symbol,
                        "Cache write failed after store write: {}",
                        e
                    );
                }
            }
            Strategy::WriteBehind(queue) => {
                self.guard.write(record).await?;
                queue.submit(record.clone());
            }
            Strategy::CacheAside => {
                self.persist(record).await?;
                if let Err(e) = self.guard.mark_present(&record.symbol).await {
                    warn!(symbol = %record.symbol, "Failed to mark symbol present: {}", e);
                }
                if let Err(e) = self
                    .invalidator
                    .invalidate_price(&record.symbol, InvalidationReason::StoreWrite)
                    .await
                {
                    warn!(
                        symbol = %record.symbol,
                        "Failed to drop cached price after store write: {}",
                        e
                    );
                }
            }
        }
        debug!(symbol = %record.symbol, strategy = %self.kind(), "price written");
        Ok(())
    }

    /// Read a price through penetration protection, falling back to the store.
    pub async fn read_price(&self, symbol: &str) -> Result<Option<PriceRecord>> {
        self.guard.read(symbol, self.strategy.fill_mode()).await
    }

    /// Cached prices only; symbols without an entry are omitted.
    pub async fn get_prices<S: AsRef<str> + Sync>(
        &self,
        symbols: &[S],
    ) -> Result<HashMap<String, PriceRecord>> {
        self.cache_exec
            .execute("cache.get_multiple_prices", || {
                self.cache().get_multiple_prices(symbols)
            })
            .await
    }

    pub async fn delete_price(&self, symbol: &str) -> Result<bool> {
        self.cache_exec
            .execute("cache.delete_price", || self.cache().delete_price(symbol))
            .await
    }

    pub async fn set_metrics(&self, metrics: &MetricsRecord) -> Result<()> {
        self.cache_exec
            .execute("cache.set_metrics", || self.cache().set_metrics(metrics))
            .await
    }

    pub async fn get_metrics(&self, symbol: &str) -> Result<Option<MetricsRecord>> {
        self.cache_exec
            .execute("cache.get_metrics", || self.cache().get_metrics(symbol))
            .await
    }

    /// Replace the active set; its members are added to the bloom filter.
    pub async fn set_active_symbols<S: AsRef<str> + Sync>(&self, symbols: &[S]) -> Result<()> {
        self.cache_exec
            .execute("cache.set_active_symbols", || {
                self.cache().set_active_symbols(symbols)
            })
            .await?;
        if let Err(e) = self.guard.preload(symbols).await {
            warn!("Failed to add active symbols to bloom filter: {}", e);
        }
        Ok(())
    }

    pub async fn get_active_symbols(&self) -> Result<Vec<String>> {
        self.cache_exec
            .execute("cache.get_active_symbols", || {
                self.cache().get_active_symbols()
            })
            .await
    }

    pub async fn invalidate_price(&self, symbol: &str) -> Result<InvalidationEvent> {
        validate_symbol(symbol)?;
        self.invalidator
            .invalidate_price(symbol, InvalidationReason::Manual)
            .await
    }

    pub async fn invalidate_all(&self) -> Result<InvalidationEvent> {
        self.invalidator.invalidate_all().await
    }

    pub fn stats(&self) -> CacheStats {
        self.monitor.stats()
    }

    pub async fn health(&self) -> HealthCheckResult {
        check_store_health(self.store.as_ref(), self.degraded_latency).await
    }

    pub fn breakers(&self) -> Vec<BreakerSnapshot> {
        vec![
            self.cache_exec.breaker().snapshot(),
            self.store_exec.breaker().snapshot(),
        ]
    }

    /// Seed the bloom filter from the backing store and the active set.
    ///
    /// Until this completes, protected reads treat every symbol as possibly
    /// present and ask the backing store. Returns the number of distinct
    /// symbols added.
    pub async fn warm_up(&self) -> Result<usize> {
        let mut symbols: BTreeSet<String> = self
            .store_exec
            .execute("repository.list_symbols", || self.repository.list_symbols())
            .await?
            .into_iter()
            .collect();

        match self.get_active_symbols().await {
            Ok(active) => symbols.extend(active),
            Err(e) => warn!("Active set unavailable during warm-up: {}", e),
        }

        let symbols: Vec<String> = symbols.into_iter().collect();
        let added = self.guard.warm(&symbols).await?;
        info!(symbols = added, "Bloom filter warmed up");
        Ok(added)
    }

    /// Wait for background persists to finish.
    pub async fn shutdown(&self) {
        if let Strategy::WriteBehind(queue) = &self.strategy {
            info!(in_flight = queue.in_flight(), "Draining write-behind persists");
            queue.drain().await;
        }
        info!("Cache coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::keys::TtlPolicy;
    use crate::cache::memory::MemoryStore;
    use crate::config::RetryConfig;
    use crate::error::CacheError;
    use crate::repository::MemoryRepository;

    fn config(strategy: StrategyKind) -> AppConfig {
        let fast = RetryConfig {
            max_retries: 1,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(5),
            backoff_factor: 1.0,
            jitter: false,
        };
        AppConfig::builder()
            .strategy(strategy)
            .ttl(TtlPolicy::exact())
            .cache_retry(fast.clone())
            .store_retry(fast)
            .build()
    }

    fn coordinator(
        strategy: StrategyKind,
    ) -> (CacheCoordinator, Arc<MemoryStore>, Arc<MemoryRepository>) {
        let store = Arc::new(MemoryStore::new());
        let repo = Arc::new(MemoryRepository::new());
        let coordinator =
            CacheCoordinator::new(&config(strategy), store.clone(), repo.clone()).unwrap();
        (coordinator, store, repo)
    }

    #[test]
    fn test_strategy_kind_parse() {
        assert_eq!(
            "write-through".parse::<StrategyKind>(),
            Ok(StrategyKind::WriteThrough)
        );
        assert_eq!(
            "WRITE_BEHIND".parse::<StrategyKind>(),
            Ok(StrategyKind::WriteBehind)
        );
        assert_eq!(
            " cache-aside ".parse::<StrategyKind>(),
            Ok(StrategyKind::CacheAside)
        );
        assert!("refresh-ahead".parse::<StrategyKind>().is_err());
        assert_eq!(StrategyKind::CacheAside.to_string(), "cache-aside");
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_through_store_failure_leaves_cache_untouched() {
        let (c, _, repo) = coordinator(StrategyKind::WriteThrough);
        repo.set_offline(true);

        let result = c.write_price(&PriceRecord::new("BTCUSDT", 1.0)).await;
        assert!(result.is_err());
        assert_eq!(c.cache().get_price("BTCUSDT").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_through_cache_failure_is_not_fatal() {
        let (c, store, repo) = coordinator(StrategyKind::WriteThrough);
        store.set_offline(true);

        c.write_price(&PriceRecord::new("BTCUSDT", 1.0))
            .await
            .unwrap();
        assert!(repo.stored("BTCUSDT").await.is_some());
        assert!(c.stats().errors >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_behind_returns_before_persist() {
        let (c, _, repo) = coordinator(StrategyKind::WriteBehind);
        repo.set_write_delay(Duration::from_millis(200));

        let record = PriceRecord::new("ETHUSDT", 3000.0);
        c.write_price(&record).await.unwrap();
        assert_eq!(c.cache().get_price("ETHUSDT").await.unwrap(), Some(record));
        assert!(repo.stored("ETHUSDT").await.is_none());

        c.shutdown().await;
        assert!(repo.stored("ETHUSDT").await.is_some());
        assert_eq!(c.write_behind().map(|q| q.persisted()), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_behind_cache_failure_propagates() {
        let (c, store, repo) = coordinator(StrategyKind::WriteBehind);
        store.set_offline(true);

        assert!(c.write_price(&PriceRecord::new("ETHUSDT", 1.0)).await.is_err());
        c.shutdown().await;
        assert_eq!(repo.writes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_aside_fills_in_background() {
        let (c, _, repo) = coordinator(StrategyKind::CacheAside);
        let record = PriceRecord::new("SOLUSDT", 150.0);
        repo.seed([record.clone()]).await;
        c.warm_up().await.unwrap();

        assert_eq!(c.read_price("SOLUSDT").await.unwrap(), Some(record.clone()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(c.cache().get_price("SOLUSDT").await.unwrap(), Some(record));
        assert_eq!(repo.reads(), 1);

        c.read_price("SOLUSDT").await.unwrap();
        assert_eq!(repo.reads(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_aside_write_drops_cached_copy() {
        let (c, _, repo) = coordinator(StrategyKind::CacheAside);
        let old = PriceRecord::new("SOLUSDT", 150.0);
        c.cache().set_price(&old).await.unwrap();

        let new = PriceRecord::new("SOLUSDT", 151.0);
        c.write_price(&new).await.unwrap();
        assert_eq!(c.cache().get_price("SOLUSDT").await.unwrap(), None);
        assert_eq!(c.read_price("SOLUSDT").await.unwrap(), Some(new));
        // One read from upsert, one from the cache miss.
        assert_eq!(repo.reads(), 2);
    }

    #[tokio::test]
    async fn test_validation_before_any_io() {
        let (c, store, repo) = coordinator(StrategyKind::WriteThrough);
        let result = c.write_price(&PriceRecord::new("", 1.0)).await;
        assert!(matches!(result, Err(CacheError::Validation(_))));
        assert_eq!(store.round_trips(), 0);
        assert_eq!(repo.writes(), 0);
    }

    #[tokio::test]
    async fn test_active_symbols_feed_bloom_filter() {
        let (c, _, repo) = coordinator(StrategyKind::WriteThrough);
        c.set_active_symbols(&["BTCUSDT"]).await.unwrap();
        assert!(c.guard().filter().contains("BTCUSDT").await);

        // Known to the filter, so the store is consulted.
        assert_eq!(c.read_price("BTCUSDT").await.unwrap(), None);
        assert_eq!(repo.reads(), 1);
    }

    #[tokio::test]
    async fn test_breakers_listed() {
        let (c, _, _) = coordinator(StrategyKind::WriteThrough);
        let names: Vec<String> = c.breakers().into_iter().map(|b| b.name).collect();
        assert_eq!(names, vec!["cache".to_string(), "store".to_string()]);
    }
}
