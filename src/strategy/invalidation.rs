//! Explicit cache invalidation
//!
//! Single-symbol invalidation removes one price entry. Bulk invalidation walks
//! the active-symbol set and keeps going past symbols whose delete fails; the
//! failures are logged and listed on the returned event.

use crate::cache::price::PriceCache;
use crate::error::Result;
use crate::resilience::ResilientExecutor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Reason for cache invalidation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvalidationReason {
    /// Manual invalidation of one symbol
    Manual,
    /// Every price in the active set
    ActiveSet,
    /// Backing store was written; the cached copy is stale
    StoreWrite,
}

impl fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidationReason::Manual => write!(f, "manual invalidation"),
            InvalidationReason::ActiveSet => write!(f, "active set invalidation"),
            InvalidationReason::StoreWrite => write!(f, "backing store write"),
        }
    }
}

/// Event for cache invalidation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationEvent {
    pub reason: InvalidationReason,
    /// When the invalidation occurred
    pub timestamp: DateTime<Utc>,
    /// Keys that held an entry and were removed
    pub keys: Vec<String>,
    /// Symbols whose delete failed
    pub failed: Vec<String>,
}

impl InvalidationEvent {
    pub fn new(reason: InvalidationReason) -> Self {
        Self {
            reason,
            timestamp: Utc::now(),
            keys: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Removes cached prices on demand
#[derive(Clone)]
pub struct Invalidator {
    cache: PriceCache,
    cache_exec: Arc<ResilientExecutor>,
}

impl Invalidator {
    pub fn new(cache: PriceCache, cache_exec: Arc<ResilientExecutor>) -> Self {
        Self { cache, cache_exec }
    }

    async fn delete(&self, symbol: &str, event: &mut InvalidationEvent) -> Result<()> {
        let removed = self
            .cache_exec
            .execute("cache.delete_price", || self.cache.delete_price(symbol))
            .await?;
        if removed {
            event.keys.push(self.cache.keys().latest_price(symbol));
        }
        Ok(())
    }

    /// Remove one cached price; the error of a failed delete is returned.
    pub async fn invalidate_price(
        &self,
        symbol: &str,
        reason: InvalidationReason,
    ) -> Result<InvalidationEvent> {
        let mut event = InvalidationEvent::new(reason);
        self.delete(symbol, &mut event).await?;
        info!(symbol, reason = %event.reason, removed = event.keys.len(), "price invalidated");
        Ok(event)
    }

    /// Remove the cached price of every active symbol.
    ///
    /// Fails only when the active set itself cannot be read.
    pub async fn invalidate_all(&self) -> Result<InvalidationEvent> {
        let symbols = self
            .cache_exec
            .execute("cache.get_active_symbols", || self.cache.get_active_symbols())
            .await?;

        let mut event = InvalidationEvent::new(InvalidationReason::ActiveSet);
        for symbol in &symbols {
            if let Err(e) = self.delete(symbol, &mut event).await {
                warn!(symbol = %symbol, "Failed to invalidate price: {}", e);
                event.failed.push(symbol.clone());
            }
        }

        info!(
            symbols = symbols.len(),
            removed = event.keys.len(),
            failed = event.failed.len(),
            "active set invalidated"
        );
        Ok(event)
    }
}
