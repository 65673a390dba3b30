//! Penetration-protected read and write paths
//!
//! Read: filter (once warmed) says absent -> not found; tombstone present ->
//! not found;
//! cache hit -> record; otherwise ask the backing store and either fill the
//! cache or leave a tombstone.
//!
//! Write: add to the filter, clear any tombstone, write the cache.
//!
//! Cache trouble on the read path is logged and the lookup falls through to
//! the backing store. Backing-store errors propagate.

use crate::cache::price::PriceCache;
use crate::error::Result;
use crate::protection::bloom::BloomFilter;
use crate::protection::null_value::NullValueCache;
use crate::repository::PriceRepository;
use crate::resilience::ResilientExecutor;
use crate::types::{validate_symbol, PriceRecord};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How a record fetched from the backing store reaches the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillMode {
    /// Write the cache before returning to the caller
    Inline,
    /// Return first; a detached task writes the cache
    Detached,
}

/// Bloom filter + tombstones in front of the price cache
#[derive(Clone)]
pub struct PenetrationGuard {
    cache: PriceCache,
    filter: Arc<BloomFilter>,
    nulls: NullValueCache,
    repository: Arc<dyn PriceRepository>,
    cache_exec: Arc<ResilientExecutor>,
    store_exec: Arc<ResilientExecutor>,
    // A cold filter would report every stored symbol absent.
    warmed: Arc<AtomicBool>,
}

impl PenetrationGuard {
    pub fn new(
        cache: PriceCache,
        filter: Arc<BloomFilter>,
        nulls: NullValueCache,
        repository: Arc<dyn PriceRepository>,
        cache_exec: Arc<ResilientExecutor>,
        store_exec: Arc<ResilientExecutor>,
    ) -> Self {
        Self {
            cache,
            filter,
            nulls,
            repository,
            cache_exec,
            store_exec,
            warmed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cache(&self) -> &PriceCache {
        &self.cache
    }

    pub fn filter(&self) -> &BloomFilter {
        &self.filter
    }

    pub fn nulls(&self) -> &NullValueCache {
        &self.nulls
    }

    /// Seed the filter with symbols known to exist.
    pub async fn preload<S: AsRef<str>>(&self, symbols: &[S]) -> Result<usize> {
        let mut added = 0;
        for symbol in symbols {
            let symbol = symbol.as_ref();
            if validate_symbol(symbol).is_err() {
                warn!(symbol, "Skipping invalid symbol during preload");
                continue;
            }
            self.filter.add(symbol).await?;
            added += 1;
        }
        debug!(added, "bloom filter preloaded");
        Ok(added)
    }

    /// Preload the full set of known symbols and start trusting the filter.
    pub async fn warm<S: AsRef<str>>(&self, symbols: &[S]) -> Result<usize> {
        let added = self.preload(symbols).await?;
        if !self.warmed.swap(true, Ordering::SeqCst) {
            info!(symbols = added, "bloom filter now gating reads");
        }
        Ok(added)
    }

    pub fn is_warmed(&self) -> bool {
        self.warmed.load(Ordering::SeqCst)
    }

    /// Record that `symbol` exists: add it to the filter and drop any
    /// tombstone so it becomes visible immediately.
    pub async fn mark_present(&self, symbol: &str) -> Result<()> {
        validate_symbol(symbol)?;
        self.filter.add(symbol).await?;
        self.cache_exec
            .execute("cache.clear_null_value", || self.nulls.clear_null_value(symbol))
            .await?;
        Ok(())
    }

    /// Protected write path.
    pub async fn write(&self, record: &PriceRecord) -> Result<()> {
        record.validate()?;
        self.mark_present(&record.symbol).await?;
        self.cache_exec
            .execute("cache.set_price", || self.cache.set_price(record))
            .await
    }

    /// Protected read path.
    pub async fn read(&self, symbol: &str, fill: FillMode) -> Result<Option<PriceRecord>> {
        validate_symbol(symbol)?;

        if self.is_warmed() && !self.filter.contains(symbol).await {
            debug!(symbol, "bloom filter: definitely absent");
            return Ok(None);
        }

        match self
            .cache_exec
            .execute("cache.is_null_value", || self.nulls.is_null_value(symbol))
            .await
        {
            Ok(true) => {
                debug!(symbol, "tombstone hit");
                return Ok(None);
            }
            Ok(false) => {}
            Err(e) => warn!(symbol, "Tombstone lookup failed, continuing: {}", e),
        }

        match self
            .cache_exec
            .execute("cache.get_price", || self.cache.get_price(symbol))
            .await
        {
            Ok(Some(record)) => return Ok(Some(record)),
            Ok(None) => {}
            Err(e) => warn!(symbol, "Cache read failed, falling back to store: {}", e),
        }

        let found = self
            .store_exec
            .execute("repository.get_latest", || self.repository.get_latest(symbol))
            .await?;

        match found {
            Some(record) => {
                self.fill(&record, fill).await;
                Ok(Some(record))
            }
            None => {
                if let Err(e) = self
                    .cache_exec
                    .execute("cache.set_null_value", || self.nulls.set_null_value(symbol))
                    .await
                {
                    warn!(symbol, "Failed to write tombstone: {}", e);
                }
                Ok(None)
            }
        }
    }

    async fn fill(&self, record: &PriceRecord, mode: FillMode) {
        match mode {
            FillMode::Inline => {
                if let Err(e) = self.fill_now(record).await {
                    warn!(symbol = %record.symbol, "Cache fill failed: {}", e);
                }
            }
            FillMode::Detached => {
                let guard = self.clone();
                let record = record.clone();
                tokio::spawn(async move {
                    if let Err(e) = guard.fill_now(&record).await {
                        warn!(symbol = %record.symbol, "Background cache fill failed: {}", e);
                    }
                });
            }
        }
    }

    async fn fill_now(&self, record: &PriceRecord) -> Result<()> {
        // The store has it, so the filter must too (covers records written
        // by other processes).
        self.filter.add(&record.symbol).await?;
        self.cache_exec
            .execute("cache.set_price", || self.cache.set_price(record))
            .await
    }
}
