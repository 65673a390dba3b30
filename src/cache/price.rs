//! Typed read/write API for market data over a [`CacheStore`]
//!
//! Every write validates first, so malformed records never reach the store.
//! Reads return `Ok(None)` for absent entries and record a hit, miss or error
//! with the monitor.

use crate::cache::keys::{KeyBuilder, KeyCategory, TtlPolicy};
use crate::cache::store::CacheStore;
use crate::error::{CacheError, Result};
use crate::monitor::CacheMonitor;
use crate::types::{validate_symbol, KlineRecord, MetricsRecord, PriceRecord};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Price, metrics, kline and active-symbol cache
#[derive(Clone)]
pub struct PriceCache {
    store: Arc<dyn CacheStore>,
    keys: KeyBuilder,
    ttl: TtlPolicy,
    monitor: Arc<CacheMonitor>,
}

impl PriceCache {
    pub fn new(
        store: Arc<dyn CacheStore>,
        keys: KeyBuilder,
        ttl: TtlPolicy,
        monitor: Arc<CacheMonitor>,
    ) -> Self {
        Self {
            store,
            keys,
            ttl,
            monitor,
        }
    }

    pub fn keys(&self) -> &KeyBuilder {
        &self.keys
    }

    pub fn ttl(&self) -> &TtlPolicy {
        &self.ttl
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn monitor(&self) -> &Arc<CacheMonitor> {
        &self.monitor
    }

    /// Count a failed store call before handing the result back.
    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.monitor.record_error();
        }
        result
    }

    async fn put<T: Serialize>(&self, key: &str, value: &T, category: KeyCategory) -> Result<()> {
        let payload = serde_json::to_string(value)?;
        let ttl = self.ttl.ttl_with_jitter(category);
        self.observe(self.store.set(key, &payload, ttl).await)?;
        debug!(key, ttl_ms = ttl.as_millis() as u64, "cache set");
        Ok(())
    }

    async fn fetch<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let raw = self.observe(self.store.get(key).await)?;

        match raw {
            None => {
                self.monitor.record_miss();
                debug!(key, "cache miss");
                Ok(None)
            }
            Some(payload) => match serde_json::from_str(&payload) {
                Ok(value) => {
                    self.monitor.record_hit();
                    debug!(key, "cache hit");
                    Ok(Some(value))
                }
                Err(e) => {
                    self.monitor.record_error();
                    warn!(key, "Undecodable cache entry: {}", e);
                    Err(CacheError::from(e))
                }
            },
        }
    }

    pub async fn set_price(&self, record: &PriceRecord) -> Result<()> {
        record.validate()?;
        let key = self.keys.latest_price(&record.symbol);
        self.put(&key, record, KeyCategory::LatestPrice).await
    }

    pub async fn get_price(&self, symbol: &str) -> Result<Option<PriceRecord>> {
        validate_symbol(symbol)?;
        self.fetch(&self.keys.latest_price(symbol)).await
    }

    /// Cached prices for `symbols` in one pipelined round trip.
    ///
    /// Symbols without a cache entry are omitted from the map; a partial miss
    /// is never an error. Entries that fail to decode are logged and omitted.
    pub async fn get_multiple_prices<S: AsRef<str>>(
        &self,
        symbols: &[S],
    ) -> Result<HashMap<String, PriceRecord>> {
        let mut unique = BTreeSet::new();
        for symbol in symbols {
            let symbol = symbol.as_ref();
            validate_symbol(symbol)?;
            unique.insert(symbol);
        }
        if unique.is_empty() {
            return Ok(HashMap::new());
        }

        let symbols: Vec<&str> = unique.into_iter().collect();
        let keys: Vec<String> = symbols.iter().map(|s| self.keys.latest_price(s)).collect();

        let values = self.observe(self.store.get_many(&keys).await)?;

        let mut prices = HashMap::with_capacity(symbols.len());
        for (symbol, value) in symbols.into_iter().zip(values) {
            let Some(payload) = value else {
                self.monitor.record_miss();
                continue;
            };
            match serde_json::from_str::<PriceRecord>(&payload) {
                Ok(record) => {
                    self.monitor.record_hit();
                    prices.insert(symbol.to_string(), record);
                }
                Err(e) => {
                    self.monitor.record_error();
                    warn!(symbol, "Skipping undecodable price entry: {}", e);
                }
            }
        }

        debug!(
            requested = keys.len(),
            found = prices.len(),
            "batch price lookup"
        );
        Ok(prices)
    }

    /// Returns whether an entry was removed.
    pub async fn delete_price(&self, symbol: &str) -> Result<bool> {
        validate_symbol(symbol)?;
        self.observe(self.store.delete(&self.keys.latest_price(symbol)).await)
    }

    pub async fn set_metrics(&self, metrics: &MetricsRecord) -> Result<()> {
        metrics.validate()?;
        let key = self.keys.metrics(&metrics.symbol);
        self.put(&key, metrics, KeyCategory::Metrics).await
    }

    pub async fn get_metrics(&self, symbol: &str) -> Result<Option<MetricsRecord>> {
        validate_symbol(symbol)?;
        self.fetch(&self.keys.metrics(symbol)).await
    }

    pub async fn set_kline_latest(&self, kline: &KlineRecord) -> Result<()> {
        kline.validate()?;
        let key = self.keys.kline_latest(&kline.symbol, &kline.interval);
        self.put(&key, kline, KeyCategory::KlineLatest).await
    }

    pub async fn get_kline_latest(
        &self,
        symbol: &str,
        interval: &str,
    ) -> Result<Option<KlineRecord>> {
        validate_symbol(symbol)?;
        if interval.is_empty() || interval.contains(':') {
            return Err(CacheError::Validation(format!(
                "invalid kline interval '{}'",
                interval
            )));
        }
        self.fetch(&self.keys.kline_latest(symbol, interval)).await
    }

    /// Replace the monitored symbol set wholesale.
    pub async fn set_active_symbols<S: AsRef<str>>(&self, symbols: &[S]) -> Result<()> {
        if symbols.is_empty() {
            return Err(CacheError::validation("active symbol list must not be empty"));
        }
        let mut members = BTreeSet::new();
        for symbol in symbols {
            let symbol = symbol.as_ref();
            validate_symbol(symbol)?;
            members.insert(symbol.to_string());
        }
        let members: Vec<String> = members.into_iter().collect();

        let key = self.keys.active_symbols();
        let ttl = self.ttl.ttl_for(KeyCategory::ActiveSymbols);
        self.observe(self.store.set_replace(&key, &members, ttl).await)?;
        debug!(count = members.len(), "active symbols replaced");
        Ok(())
    }

    /// Members of the active set, sorted; empty if the set expired or was
    /// never written.
    pub async fn get_active_symbols(&self) -> Result<Vec<String>> {
        let key = self.keys.active_symbols();
        let mut members = self.observe(self.store.set_members(&key).await)?;
        members.sort();
        Ok(members)
    }
}
