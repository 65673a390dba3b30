//! Cache key construction and the TTL table per data category
//!
//! Keys have the shape `<namespace>:<category>:<part1>:<part2>...`. Parts are
//! joined in call order and the `:` delimiter is never escaped, which is why
//! symbols are validated to be colon-free before they reach this module.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Category of cached data; determines the key segment and the TTL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyCategory {
    /// Latest price tick per symbol
    LatestPrice,
    /// Derived metrics per symbol
    Metrics,
    /// Latest candle per symbol and interval
    KlineLatest,
    /// The monitored symbol set
    ActiveSymbols,
    /// Session-like data
    Session,
    /// Tombstone for a symbol confirmed absent from the backing store
    NullMarker,
    /// Shared bloom filter bits
    Bloom,
}

impl KeyCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyCategory::LatestPrice => "latest_price",
            KeyCategory::Metrics => "metrics",
            KeyCategory::KlineLatest => "kline_latest",
            KeyCategory::ActiveSymbols => "active_symbols",
            KeyCategory::Session => "session",
            KeyCategory::NullMarker => "null",
            KeyCategory::Bloom => "bloom",
        }
    }
}

impl fmt::Display for KeyCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic, namespaced key construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBuilder {
    namespace: String,
}

impl KeyBuilder {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Build `<namespace>:<category>[:part]...`
    pub fn build(&self, category: KeyCategory, parts: &[&str]) -> String {
        let capacity = self.namespace.len()
            + category.as_str().len()
            + 1
            + parts.iter().map(|p| p.len() + 1).sum::<usize>();
        let mut key = String::with_capacity(capacity);
        key.push_str(&self.namespace);
        key.push(':');
        key.push_str(category.as_str());
        for part in parts {
            key.push(':');
            key.push_str(part);
        }
        key
    }

    pub fn latest_price(&self, symbol: &str) -> String {
        self.build(KeyCategory::LatestPrice, &[symbol])
    }

    pub fn metrics(&self, symbol: &str) -> String {
        self.build(KeyCategory::Metrics, &[symbol])
    }

    pub fn kline_latest(&self, symbol: &str, interval: &str) -> String {
        self.build(KeyCategory::KlineLatest, &[symbol, interval])
    }

    pub fn active_symbols(&self) -> String {
        self.build(KeyCategory::ActiveSymbols, &[])
    }

    pub fn session(&self, session_id: &str) -> String {
        self.build(KeyCategory::Session, &[session_id])
    }

    pub fn null_marker(&self, symbol: &str) -> String {
        self.build(KeyCategory::NullMarker, &[symbol])
    }

    pub fn bloom(&self, filter_name: &str) -> String {
        self.build(KeyCategory::Bloom, &[filter_name])
    }
}

impl Default for KeyBuilder {
    fn default() -> Self {
        Self::new("app")
    }
}

/// TTL per data category
///
/// Real-time categories get `jitter` applied so entries written in the same
/// burst do not all expire in the same instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtlPolicy {
    /// Prices, metrics and klines
    pub realtime: Duration,
    /// Active-symbol set
    pub symbol_list: Duration,
    /// Session-like data
    pub session: Duration,
    /// Null-value tombstones
    pub null_marker: Duration,
    /// Jitter fraction (0.0 - 1.0) applied to real-time TTLs
    pub jitter: f64,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            realtime: Duration::from_secs(60),
            symbol_list: Duration::from_secs(300),
            session: Duration::from_secs(90),
            null_marker: Duration::from_secs(30),
            jitter: 0.10,
        }
    }
}

impl TtlPolicy {
    /// Policy without jitter; expiry happens exactly at the configured TTL.
    pub fn exact() -> Self {
        Self {
            jitter: 0.0,
            ..Self::default()
        }
    }

    /// Base TTL for a category.
    ///
    /// The bloom category has no TTL of its own; the shared filter lives as
    /// long as the longest-lived data it describes.
    pub fn ttl_for(&self, category: KeyCategory) -> Duration {
        match category {
            KeyCategory::LatestPrice | KeyCategory::Metrics | KeyCategory::KlineLatest => {
                self.realtime
            }
            KeyCategory::ActiveSymbols | KeyCategory::Bloom => self.symbol_list,
            KeyCategory::Session => self.session,
            KeyCategory::NullMarker => self.null_marker,
        }
    }

    /// TTL to use for a write, with jitter applied to real-time categories.
    pub fn ttl_with_jitter(&self, category: KeyCategory) -> Duration {
        let base = self.ttl_for(category);
        let jittered = matches!(
            category,
            KeyCategory::LatestPrice | KeyCategory::Metrics | KeyCategory::KlineLatest
        );
        if !jittered || self.jitter == 0.0 {
            return base;
        }

        let base_secs = base.as_secs_f64();
        let jitter_range = base_secs * self.jitter;
        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter_range;
        let final_secs = (base_secs + jitter).max(1.0);

        Duration::from_secs_f64(final_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        for (name, ttl) in [
            ("realtime", self.realtime),
            ("symbol_list", self.symbol_list),
            ("session", self.session),
            ("null_marker", self.null_marker),
        ] {
            if ttl.is_zero() {
                return Err(format!("{} TTL must be greater than 0", name));
            }
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err("ttl jitter must be between 0.0 and 1.0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_format() {
        let keys = KeyBuilder::new("app");
        assert_eq!(keys.latest_price("BTCUSDT"), "app:latest_price:BTCUSDT");
        assert_eq!(keys.kline_latest("BTCUSDT", "1m"), "app:kline_latest:BTCUSDT:1m");
        assert_eq!(keys.active_symbols(), "app:active_symbols");
        assert_eq!(keys.null_marker("FOO"), "app:null:FOO");
        assert_eq!(keys.metrics("ETHUSDT"), "app:metrics:ETHUSDT");
    }

    #[test]
    fn test_parts_joined_in_call_order() {
        let keys = KeyBuilder::new("mkt");
        assert_eq!(
            keys.build(KeyCategory::Session, &["b", "a", "c"]),
            "mkt:session:b:a:c"
        );
    }

    #[test]
    fn test_ttl_table() {
        let ttl = TtlPolicy::default();
        assert_eq!(ttl.ttl_for(KeyCategory::LatestPrice), Duration::from_secs(60));
        assert_eq!(ttl.ttl_for(KeyCategory::Metrics), Duration::from_secs(60));
        assert_eq!(ttl.ttl_for(KeyCategory::ActiveSymbols), Duration::from_secs(300));
        assert_eq!(ttl.ttl_for(KeyCategory::Session), Duration::from_secs(90));
        assert_eq!(ttl.ttl_for(KeyCategory::NullMarker), Duration::from_secs(30));
    }

    #[test]
    fn test_ttl_with_jitter_bounds() {
        let ttl = TtlPolicy {
            jitter: 0.1,
            ..TtlPolicy::default()
        };
        for _ in 0..100 {
            let value = ttl.ttl_with_jitter(KeyCategory::LatestPrice).as_secs_f64();
            assert!((54.0..=66.0).contains(&value));
        }
        // Symbol lists are never jittered.
        assert_eq!(
            ttl.ttl_with_jitter(KeyCategory::ActiveSymbols),
            Duration::from_secs(300)
        );
    }

    #[test]
    fn test_policy_validation() {
        assert!(TtlPolicy::default().validate().is_ok());
        let zero = TtlPolicy {
            realtime: Duration::ZERO,
            ..TtlPolicy::default()
        };
        assert!(zero.validate().is_err());
        let jitter = TtlPolicy {
            jitter: 1.5,
            ..TtlPolicy::default()
        };
        assert!(jitter.validate().is_err());
    }
}
