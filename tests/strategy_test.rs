//! Consistency strategy behaviour under concurrent callers

use futures::future::join_all;
use market_cache::config::{RetryConfig, WriteBehindConfig};
use market_cache::{
    AppConfig, CacheCoordinator, MemoryRepository, MemoryStore, PriceRecord, StrategyKind,
    TtlPolicy,
};
use std::sync::Arc;
use std::time::Duration;

fn config(strategy: StrategyKind) -> AppConfig {
    let fast = RetryConfig {
        max_retries: 2,
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        backoff_factor: 2.0,
        jitter: false,
    };
    AppConfig::builder()
        .strategy(strategy)
        .ttl(TtlPolicy::exact())
        .cache_retry(fast.clone())
        .store_retry(fast)
        .write_behind(WriteBehindConfig {
            max_in_flight: 8,
            persist_timeout: Duration::from_secs(2),
        })
        .build()
}

fn symbols(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("SYM{:03}USDT", i)).collect()
}

#[tokio::test]
async fn test_concurrent_write_through() {
    let store = Arc::new(MemoryStore::new());
    let repo = Arc::new(MemoryRepository::new());
    let coordinator = Arc::new(
        CacheCoordinator::new(&config(StrategyKind::WriteThrough), store, repo.clone()).unwrap(),
    );

    let writes = symbols(50).into_iter().enumerate().map(|(i, symbol)| {
        let coordinator = Arc::clone(&coordinator);
        async move {
            coordinator
                .write_price(&PriceRecord::new(symbol, i as f64 + 1.0))
                .await
        }
    });
    for result in join_all(writes).await {
        result.unwrap();
    }

    assert_eq!(repo.writes(), 50);
    let all = symbols(50);
    let cached = coordinator.get_prices(&all[..]).await.unwrap();
    assert_eq!(cached.len(), 50);
    assert_eq!(cached["SYM007USDT"].price, 8.0);
}

#[tokio::test]
async fn test_concurrent_lookups_lose_no_counts() {
    let store = Arc::new(MemoryStore::new());
    let repo = Arc::new(MemoryRepository::new());
    let coordinator = Arc::new(
        CacheCoordinator::new(&config(StrategyKind::WriteThrough), store, repo).unwrap(),
    );
    coordinator
        .cache()
        .set_price(&PriceRecord::new("BTCUSDT", 1.0))
        .await
        .unwrap();

    let lookups = (0..200).map(|i| {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            let symbol = if i % 4 == 0 { "ETHUSDT" } else { "BTCUSDT" };
            coordinator.cache().get_price(symbol).await
        })
    });
    for handle in join_all(lookups).await {
        handle.unwrap().unwrap();
    }

    let stats = coordinator.stats();
    assert_eq!(stats.hits, 150);
    assert_eq!(stats.misses, 50);
    assert_eq!(stats.total_operations, 200);
}

#[tokio::test(start_paused = true)]
async fn test_write_behind_drops_persists_beyond_cap() {
    let store = Arc::new(MemoryStore::new());
    let repo = Arc::new(MemoryRepository::new());
    repo.set_write_delay(Duration::from_millis(50));
    let coordinator =
        CacheCoordinator::new(&config(StrategyKind::WriteBehind), store, repo.clone()).unwrap();

    for symbol in symbols(8) {
        coordinator
            .write_price(&PriceRecord::new(symbol, 1.0))
            .await
            .unwrap();
    }
    // Beyond the in-flight cap: cached, but the persist is dropped.
    coordinator
        .write_price(&PriceRecord::new("OVERFLOWUSDT", 1.0))
        .await
        .unwrap();

    let queue = coordinator.write_behind().expect("write-behind queue");
    assert_eq!(queue.in_flight(), 8);
    assert_eq!(queue.dropped(), 1);
    assert!(coordinator
        .cache()
        .get_price("OVERFLOWUSDT")
        .await
        .unwrap()
        .is_some());

    coordinator.shutdown().await;
    assert_eq!(queue.persisted(), 8);
    assert_eq!(repo.writes(), 8);
    assert!(repo.stored("OVERFLOWUSDT").await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_write_behind_failure_only_reaches_monitor() {
    let store = Arc::new(MemoryStore::new());
    let repo = Arc::new(MemoryRepository::new());
    repo.set_offline(true);
    let coordinator =
        CacheCoordinator::new(&config(StrategyKind::WriteBehind), store, repo).unwrap();

    coordinator
        .write_price(&PriceRecord::new("BTCUSDT", 1.0))
        .await
        .unwrap();
    coordinator.shutdown().await;

    let queue = coordinator.write_behind().expect("write-behind queue");
    assert_eq!(queue.failed(), 1);
    assert!(coordinator.stats().errors >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_cache_aside_fills_after_returning() {
    let store = Arc::new(MemoryStore::new());
    let repo = Arc::new(MemoryRepository::new());
    let record = PriceRecord::new("SOLUSDT", 150.0);
    repo.seed([record.clone()]).await;
    let coordinator =
        CacheCoordinator::new(&config(StrategyKind::CacheAside), store.clone(), repo.clone())
            .unwrap();
    assert_eq!(coordinator.warm_up().await.unwrap(), 1);

    assert_eq!(coordinator.read_price("SOLUSDT").await.unwrap(), Some(record.clone()));
    assert_eq!(repo.reads(), 1);

    // The fill lands once the detached task gets to run.
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(coordinator.cache().get_price("SOLUSDT").await.unwrap(), Some(record));
}

#[tokio::test]
async fn test_strategy_from_config_string() {
    let store = Arc::new(MemoryStore::new());
    let repo = Arc::new(MemoryRepository::new());
    let kind: StrategyKind = "cache_aside".parse().unwrap();
    let coordinator = CacheCoordinator::new(&config(kind), store, repo).unwrap();
    assert_eq!(coordinator.kind(), StrategyKind::CacheAside);
    assert!(coordinator.write_behind().is_none());
}
