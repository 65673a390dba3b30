//! Retry and circuit breaker behaviour through the public API

use market_cache::config::{CircuitBreakerConfig, RetryConfig};
use market_cache::{
    AppConfig, CacheCoordinator, CacheError, CircuitBreaker, CircuitState, MemoryRepository,
    MemoryStore, PriceRecord, ResilientExecutor, RetryManager, StrategyKind,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn retry_config(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
        backoff_factor: 2.0,
        jitter: false,
    }
}

fn transient() -> CacheError {
    CacheError::Store("read tcp 10.0.0.5:6379: connection reset by peer".to_string())
}

#[tokio::test(start_paused = true)]
async fn test_two_transient_failures_then_success() {
    let manager = RetryManager::new(retry_config(3));
    let calls = AtomicU32::new(0);

    let result = manager
        .execute("flaky", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(transient())
            } else {
                Ok(n)
            }
        })
        .await;

    assert_eq!(result.unwrap(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_error_is_not_retried() {
    let manager = RetryManager::new(retry_config(3));
    let calls = AtomicU32::new(0);

    let result: Result<(), _> = manager
        .execute("conflict", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CacheError::Conflict("duplicate key".to_string()))
        })
        .await;

    assert!(matches!(result, Err(CacheError::Conflict(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_report_attempts() {
    let manager = RetryManager::new(retry_config(2));
    let result: Result<(), _> = manager
        .execute("down", || async { Err(transient()) })
        .await;

    match result {
        Err(CacheError::RetriesExhausted {
            operation,
            attempts,
            source,
        }) => {
            assert_eq!(operation, "down");
            assert_eq!(attempts, 3);
            assert!(source.is_retryable());
        }
        other => panic!("expected RetriesExhausted, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_interrupts_backoff() {
    let manager = RetryManager::new(RetryConfig {
        initial_delay: Duration::from_secs(10),
        max_delay: Duration::from_secs(10),
        ..retry_config(5)
    });
    let cancel = CancellationToken::new();
    let calls = AtomicU32::new(0);

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        canceller.cancel();
    });

    let result: Result<(), _> = manager
        .execute_with_cancel("slow", &cancel, None, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(transient())
        })
        .await;

    assert!(matches!(result, Err(CacheError::Cancelled(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_trip_probe_and_recover() {
    let breaker = CircuitBreaker::new(
        "store",
        CircuitBreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(60),
        },
    );
    let calls = AtomicU32::new(0);

    for _ in 0..3 {
        let _ = breaker
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(transient())
            })
            .await;
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let rejected = breaker
        .call(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
    assert!(matches!(rejected, Err(CacheError::CircuitOpen { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // Failed probe reopens and restarts the timer.
    tokio::time::advance(Duration::from_secs(60)).await;
    let _ = breaker
        .call(|| async { Err::<(), _>(transient()) })
        .await;
    assert_eq!(breaker.state(), CircuitState::Open);
    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(breaker.try_acquire().is_err());

    tokio::time::advance(Duration::from_secs(30)).await;
    breaker.call(|| async { Ok(()) }).await.unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failures(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_executor_stops_retrying_once_open() {
    let executor = ResilientExecutor::new(
        "cache",
        retry_config(10),
        CircuitBreakerConfig {
            failure_threshold: 2,
            reset_timeout: Duration::from_secs(30),
        },
    );
    let calls = AtomicU32::new(0);

    let result: Result<(), _> = executor
        .execute("cache.get", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(transient())
        })
        .await;

    assert!(matches!(result, Err(CacheError::CircuitOpen { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cache_and_store_breakers_are_independent() {
    let store = Arc::new(MemoryStore::new());
    let repo = Arc::new(MemoryRepository::new());
    let config = AppConfig::builder()
        .strategy(StrategyKind::WriteThrough)
        .cache_retry(retry_config(0))
        .cache_breaker(CircuitBreakerConfig {
            failure_threshold: 2,
            reset_timeout: Duration::from_secs(30),
        })
        .build();
    let coordinator = CacheCoordinator::new(&config, store.clone(), repo.clone()).unwrap();

    store.set_offline(true);
    for i in 0..3 {
        // The store write succeeds; cache failures are only logged.
        coordinator
            .write_price(&PriceRecord::new(format!("SYM{}USDT", i), 1.0))
            .await
            .unwrap();
    }

    let breakers = coordinator.breakers();
    assert_eq!(breakers[0].name, "cache");
    assert_eq!(breakers[0].state, CircuitState::Open);
    assert_eq!(breakers[1].name, "store");
    assert_eq!(breakers[1].state, CircuitState::Closed);
    assert_eq!(repo.writes(), 3);
}
