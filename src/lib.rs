//! # Market Cache (market-cache)
//!
//! Cache consistency and resilience layer for market data: a Redis-compatible
//! cache in front of a relational backing store.
//!
//! ## Features
//!
//! - Typed price, metrics, kline and active-symbol caching with a TTL table
//! - Write-through, write-behind and cache-aside consistency strategies
//! - Penetration protection (bloom filter + short-lived tombstones)
//! - Retries with capped exponential backoff, jitter, cancellation and deadlines
//! - Per-dependency circuit breakers
//! - Hit/miss/error counters and periodic store health polling
//!
//! ## Reading and Writing Prices
//!
//! ```no_run
//! use market_cache::{
//!     AppConfig, CacheCoordinator, MemoryRepository, PriceRecord, RedisStore,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::from_env()?;
//!     let store = Arc::new(RedisStore::connect(&config.redis).await?);
//!     let repository = Arc::new(MemoryRepository::new());
//!
//!     let coordinator = CacheCoordinator::new(&config, store, repository)?;
//!     coordinator.warm_up().await?;
//!
//!     coordinator
//!         .write_price(&PriceRecord::new("BTCUSDT", 50000.0))
//!         .await?;
//!     if let Some(price) = coordinator.read_price("BTCUSDT").await? {
//!         println!("{} = {}", price.symbol, price.price);
//!     }
//!
//!     coordinator.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Store Health
//!
//! ```no_run
//! use market_cache::{config::RedisConfig, RedisStore};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = RedisStore::connect(&RedisConfig::default()).await?;
//!
//!     let result = store
//!         .health_check_with_retry(Duration::from_millis(100), 3, Duration::from_millis(500))
//!         .await;
//!     if result.status.is_operational() {
//!         println!("Cache is operational ({}ms)", result.response_time_ms);
//!     }
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod monitor;
pub mod protection;
pub mod repository;
pub mod resilience;
pub mod strategy;
pub mod telemetry;
pub mod types;

// Re-export main types for convenience
pub use cache::{
    CacheStore, KeyBuilder, KeyCategory, MemoryStore, PriceCache, RedisStore, StoreInfo,
    TtlPolicy,
};
pub use config::{AppConfig, AppConfigBuilder};
pub use error::{CacheError, Result};
pub use monitor::{CacheMonitor, CacheStats, HealthCheckResult, HealthStatus, MonitorReport};
pub use protection::{BloomFilter, FillMode, NullValueCache, PenetrationGuard};
pub use repository::{MemoryRepository, PriceRepository};
pub use resilience::{CircuitBreaker, CircuitState, ResilientExecutor, RetryManager};
pub use strategy::{CacheCoordinator, InvalidationEvent, InvalidationReason, StrategyKind};
pub use types::{KlineRecord, MetricsRecord, PriceRecord};
