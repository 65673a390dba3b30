//! Backing store collaborator
//!
//! The durable relational store sits behind [`PriceRepository`]; this crate
//! never defines its schema. [`MemoryRepository`] is an in-process stand-in
//! for tests and local runs, with failure injection.

use crate::error::{CacheError, Result};
use crate::types::{validate_symbol, PriceRecord};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Transactional read/write access keyed by symbol
#[async_trait]
pub trait PriceRepository: Send + Sync {
    /// Latest stored record, `None` if the symbol has never been written.
    async fn get_latest(&self, symbol: &str) -> Result<Option<PriceRecord>>;

    /// Insert a new symbol; `Conflict` if it already exists.
    async fn create(&self, record: &PriceRecord) -> Result<()>;

    /// Replace the stored record for an existing symbol.
    async fn update(&self, record: &PriceRecord) -> Result<()>;

    /// Create or update; a concurrent create turns into an update.
    async fn upsert(&self, record: &PriceRecord) -> Result<()> {
        if self.get_latest(&record.symbol).await?.is_some() {
            return self.update(record).await;
        }
        match self.create(record).await {
            Err(CacheError::Conflict(_)) => self.update(record).await,
            other => other,
        }
    }

    /// Every symbol with a stored record.
    async fn list_symbols(&self) -> Result<Vec<String>>;
}

/// In-process repository
///
/// Rejects updates whose timestamp precedes the stored one with `Conflict`,
/// mirroring a store that enforces per-symbol timestamp order.
#[derive(Default)]
pub struct MemoryRepository {
    rows: RwLock<HashMap<String, PriceRecord>>,
    offline: AtomicBool,
    fail_next: AtomicU32,
    write_delay: Mutex<Duration>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate without going through the write path.
    pub async fn seed(&self, records: impl IntoIterator<Item = PriceRecord>) {
        let mut rows = self.rows.write().await;
        for record in records {
            rows.insert(record.symbol.clone(), record);
        }
    }

    /// Every call fails with a connection error while offline.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// The next `count` calls fail with a transient error.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Make `create`/`update` take at least `delay`.
    pub fn set_write_delay(&self, delay: Duration) {
        match self.write_delay.lock() {
            Ok(mut guard) => *guard = delay,
            Err(poisoned) => *poisoned.into_inner() = delay,
        }
    }

    /// `get_latest` calls made, including failed ones.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// `create`/`update` calls made, including failed ones.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn stored(&self, symbol: &str) -> Option<PriceRecord> {
        self.rows.read().await.get(symbol).cloned()
    }

    fn check_available(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(CacheError::Store(
                "dial tcp 127.0.0.1:5432: connection refused".to_string(),
            ));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(CacheError::Store("read: connection reset by peer".to_string()));
        }
        Ok(())
    }

    async fn delay_write(&self) {
        let delay = match self.write_delay.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl PriceRepository for MemoryRepository {
    async fn get_latest(&self, symbol: &str) -> Result<Option<PriceRecord>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        validate_symbol(symbol)?;
        self.check_available()?;
        Ok(self.rows.read().await.get(symbol).cloned())
    }

    async fn create(&self, record: &PriceRecord) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        record.validate()?;
        self.delay_write().await;
        self.check_available()?;

        let mut rows = self.rows.write().await;
        if rows.contains_key(&record.symbol) {
            return Err(CacheError::Conflict(format!(
                "duplicate key value violates unique constraint: symbol '{}'",
                record.symbol
            )));
        }
        rows.insert(record.symbol.clone(), record.clone());
        debug!(symbol = %record.symbol, "row created");
        Ok(())
    }

    async fn update(&self, record: &PriceRecord) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        record.validate()?;
        self.delay_write().await;
        self.check_available()?;

        let mut rows = self.rows.write().await;
        let Some(existing) = rows.get_mut(&record.symbol) else {
            return Err(CacheError::Store(format!(
                "no price row for symbol '{}'",
                record.symbol
            )));
        };
        if record.timestamp < existing.timestamp {
            return Err(CacheError::Conflict(format!(
                "timestamp for '{}' would move backwards",
                record.symbol
            )));
        }
        *existing = record.clone();
        debug!(symbol = %record.symbol, "row updated");
        Ok(())
    }

    async fn list_symbols(&self) -> Result<Vec<String>> {
        self.check_available()?;
        let mut symbols: Vec<String> = self.rows.read().await.keys().cloned().collect();
        symbols.sort();
        Ok(symbols)
    }
}
