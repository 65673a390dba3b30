//! In-process store with TTL expiry
//!
//! `MemoryStore` implements [`CacheStore`] without a network hop. It backs the
//! test suite and local runs. Expiry uses `tokio::time::Instant`, so tests can
//! fast-forward TTLs with a paused tokio clock. It can also be switched offline
//! or made to fail for specific keys to exercise the failure paths.

use crate::cache::store::{CacheStore, StoreInfo};
use crate::error::{CacheError, Result};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone)]
enum StoredValue {
    Text(String),
    Set(BTreeSet<String>),
    Bits(Vec<u8>),
}

impl StoredValue {
    fn size_bytes(&self) -> usize {
        match self {
            StoredValue::Text(s) => s.len(),
            StoredValue::Set(members) => members.iter().map(|m| m.len()).sum(),
            StoredValue::Bits(bytes) => bytes.len(),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: StoredValue,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn new(value: StoredValue, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }
}

/// In-process [`CacheStore`]
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, StoredEntry>>,
    round_trips: AtomicU64,
    offline: AtomicBool,
    failing_keys: Mutex<HashSet<String>>,
    max_memory_bytes: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report a memory ceiling from `info()`.
    pub fn with_max_memory(mut self, bytes: u64) -> Self {
        self.max_memory_bytes = bytes;
        self
    }

    /// Simulate the whole store being unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make every operation touching `key` fail with a connection error.
    pub fn fail_key(&self, key: impl Into<String>) {
        self.lock_failing().insert(key.into());
    }

    pub fn clear_failures(&self) {
        self.lock_failing().clear();
    }

    /// Number of calls made against the store, one per network round trip.
    pub fn round_trips(&self) -> u64 {
        self.round_trips.load(Ordering::SeqCst)
    }

    /// Number of live (non-expired) keys.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.read().await;
        entries.values().filter(|e| !e.is_expired(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remaining TTL of a key, `None` if absent or without expiry.
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Remove all expired entries, returning how many were dropped.
    pub async fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - entries.len();
        if removed > 0 {
            debug!("Cleaned up {} expired entries", removed);
        }
        removed
    }

    /// Spawn a background task that periodically drops expired entries.
    pub fn start_auto_cleanup(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        info!("Starting memory store cleanup task (interval: {:?})", interval);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.cleanup_expired().await;
            }
        })
    }

    fn lock_failing(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        match self.failing_keys.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Count the round trip and apply any simulated failure.
    fn begin(&self, keys: &[&str]) -> Result<()> {
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(CacheError::Connection(
                "connection refused (memory store offline)".to_string(),
            ));
        }
        let failing = self.lock_failing();
        if let Some(key) = keys.iter().find(|k| failing.contains(**k)) {
            return Err(CacheError::Connection(format!(
                "connection reset while accessing {}",
                key
            )));
        }
        Ok(())
    }

    fn live<'a>(
        entries: &'a HashMap<String, StoredEntry>,
        key: &str,
        now: Instant,
    ) -> Option<&'a StoredEntry> {
        entries.get(key).filter(|e| !e.is_expired(now))
    }

    fn wrong_type(key: &str) -> CacheError {
        CacheError::Store(format!(
            "WRONGTYPE Operation against a key holding the wrong kind of value: {}",
            key
        ))
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.begin(&[key])?;
        let entries = self.entries.read().await;
        match Self::live(&entries, key, Instant::now()) {
            None => Ok(None),
            Some(StoredEntry {
                value: StoredValue::Text(text),
                ..
            }) => Ok(Some(text.clone())),
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.begin(&[key])?;
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            StoredEntry::new(StoredValue::Text(value.to_string()), Some(ttl)),
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.begin(&[key])?;
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        Ok(entries
            .remove(key)
            .map_or(false, |entry| !entry.is_expired(now)))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.begin(&[key])?;
        let entries = self.entries.read().await;
        Ok(Self::live(&entries, key, Instant::now()).is_some())
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        self.begin(&refs)?;
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(keys
            .iter()
            .map(|key| match Self::live(&entries, key, now) {
                Some(StoredEntry {
                    value: StoredValue::Text(text),
                    ..
                }) => Some(text.clone()),
                _ => None,
            })
            .collect())
    }

    async fn set_many(&self, items: &[(String, String)], ttl: Duration) -> Result<()> {
        let refs: Vec<&str> = items.iter().map(|(k, _)| k.as_str()).collect();
        self.begin(&refs)?;
        let mut entries = self.entries.write().await;
        for (key, value) in items {
            entries.insert(
                key.clone(),
                StoredEntry::new(StoredValue::Text(value.clone()), Some(ttl)),
            );
        }
        Ok(())
    }

    async fn set_add(&self, key: &str, members: &[String], ttl: Duration) -> Result<()> {
        self.begin(&[key])?;
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let mut current = match Self::live(&entries, key, now) {
            None => BTreeSet::new(),
            Some(StoredEntry {
                value: StoredValue::Set(set),
                ..
            }) => set.clone(),
            Some(_) => return Err(Self::wrong_type(key)),
        };
        current.extend(members.iter().cloned());
        entries.insert(
            key.to_string(),
            StoredEntry::new(StoredValue::Set(current), Some(ttl)),
        );
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        self.begin(&[key])?;
        let entries = self.entries.read().await;
        match Self::live(&entries, key, Instant::now()) {
            None => Ok(Vec::new()),
            Some(StoredEntry {
                value: StoredValue::Set(set),
                ..
            }) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn set_replace(&self, key: &str, members: &[String], ttl: Duration) -> Result<()> {
        self.begin(&[key])?;
        let mut entries = self.entries.write().await;
        if members.is_empty() {
            entries.remove(key);
            return Ok(());
        }
        entries.insert(
            key.to_string(),
            StoredEntry::new(
                StoredValue::Set(members.iter().cloned().collect()),
                Some(ttl),
            ),
        );
        Ok(())
    }

    async fn set_bits(&self, key: &str, offsets: &[u64]) -> Result<()> {
        self.begin(&[key])?;
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let mut bytes = match Self::live(&entries, key, now) {
            None => Vec::new(),
            Some(StoredEntry {
                value: StoredValue::Bits(bytes),
                ..
            }) => bytes.clone(),
            Some(_) => return Err(Self::wrong_type(key)),
        };
        for &offset in offsets {
            let byte = (offset / 8) as usize;
            if bytes.len() <= byte {
                bytes.resize(byte + 1, 0);
            }
            // Redis bit order: offset 0 is the most significant bit.
            bytes[byte] |= 0x80 >> (offset % 8);
        }
        let expires_at = entries.get(key).and_then(|e| e.expires_at);
        entries.insert(
            key.to_string(),
            StoredEntry {
                value: StoredValue::Bits(bytes),
                expires_at,
            },
        );
        Ok(())
    }

    async fn get_bits(&self, key: &str, offsets: &[u64]) -> Result<Vec<bool>> {
        self.begin(&[key])?;
        let entries = self.entries.read().await;
        let bytes: &[u8] = match Self::live(&entries, key, Instant::now()) {
            None => &[],
            Some(StoredEntry {
                value: StoredValue::Bits(bytes),
                ..
            }) => bytes,
            Some(_) => return Err(Self::wrong_type(key)),
        };
        Ok(offsets
            .iter()
            .map(|&offset| {
                bytes
                    .get((offset / 8) as usize)
                    .map_or(false, |byte| byte & (0x80 >> (offset % 8)) != 0)
            })
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        self.begin(&[])
    }

    async fn info(&self) -> Result<StoreInfo> {
        self.begin(&[])?;
        let now = Instant::now();
        let entries = self.entries.read().await;
        let live: Vec<(&String, &StoredEntry)> =
            entries.iter().filter(|(_, e)| !e.is_expired(now)).collect();
        Ok(StoreInfo {
            used_memory_bytes: live
                .iter()
                .map(|(k, e)| (k.len() + e.value.size_bytes()) as u64)
                .sum(),
            max_memory_bytes: self.max_memory_bytes,
            keys: live.len() as u64,
        })
    }
}
