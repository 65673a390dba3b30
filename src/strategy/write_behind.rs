//! Detached, bounded persistence for write-behind
//!
//! Each submitted record is persisted by its own spawned task with its own
//! timeout. A semaphore caps the number of persists in flight; submissions
//! beyond the cap are dropped and reported, never queued without bound.
//! Persist outcomes reach logs and the monitor only.

use crate::config::WriteBehindConfig;
use crate::monitor::CacheMonitor;
use crate::repository::PriceRepository;
use crate::resilience::ResilientExecutor;
use crate::types::PriceRecord;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error};
use uuid::Uuid;

#[derive(Default)]
struct Counters {
    persisted: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Fire-and-forget persistence to the backing store
pub struct WriteBehindQueue {
    repository: Arc<dyn PriceRepository>,
    store_exec: Arc<ResilientExecutor>,
    monitor: Arc<CacheMonitor>,
    permits: Arc<Semaphore>,
    max_in_flight: usize,
    persist_timeout: Duration,
    counters: Arc<Counters>,
}

impl WriteBehindQueue {
    pub fn new(
        config: &WriteBehindConfig,
        repository: Arc<dyn PriceRepository>,
        store_exec: Arc<ResilientExecutor>,
        monitor: Arc<CacheMonitor>,
    ) -> Self {
        Self {
            repository,
            store_exec,
            monitor,
            permits: Arc::new(Semaphore::new(config.max_in_flight)),
            max_in_flight: config.max_in_flight,
            persist_timeout: config.persist_timeout,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Start persisting `record` in the background.
    ///
    /// Returns `false` when the in-flight cap is reached and the record was
    /// dropped. Never waits on the persist.
    pub fn submit(&self, record: PriceRecord) -> bool {
        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                self.monitor.record_error();
                error!(
                    symbol = %record.symbol,
                    max_in_flight = self.max_in_flight,
                    "Write-behind persist dropped: too many in flight"
                );
                return false;
            }
        };

        let repository = Arc::clone(&self.repository);
        let store_exec = Arc::clone(&self.store_exec);
        let monitor = Arc::clone(&self.monitor);
        let counters = Arc::clone(&self.counters);
        let timeout = self.persist_timeout;

        tokio::spawn(async move {
            let _permit = permit;
            let persist_id = Uuid::new_v4();
            debug!(%persist_id, symbol = %record.symbol, "write-behind persist started");

            let persist = store_exec.execute("repository.upsert", || repository.upsert(&record));
            match tokio::time::timeout(timeout, persist).await {
                Ok(Ok(())) => {
                    counters.persisted.fetch_add(1, Ordering::Relaxed);
                    debug!(%persist_id, symbol = %record.symbol, "write-behind persist done");
                }
                Ok(Err(e)) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    monitor.record_error();
                    error!(
                        %persist_id,
                        symbol = %record.symbol,
                        "Write-behind persist failed: {}",
                        e
                    );
                }
                Err(_) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    monitor.record_error();
                    error!(
                        %persist_id,
                        symbol = %record.symbol,
                        timeout_ms = timeout.as_millis() as u64,
                        "Write-behind persist timed out"
                    );
                }
            }
        });
        true
    }

    /// Persists currently running.
    pub fn in_flight(&self) -> usize {
        self.max_in_flight
            .saturating_sub(self.permits.available_permits())
    }

    pub fn persisted(&self) -> u64 {
        self.counters.persisted.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.counters.failed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    /// Wait until every in-flight persist has finished.
    pub async fn drain(&self) {
        let all = u32::try_from(self.max_in_flight).unwrap_or(u32::MAX);
        match self.permits.acquire_many(all).await {
            Ok(permits) => drop(permits),
            Err(e) => error!("Write-behind drain failed: {}", e),
        }
    }
}
