//! Market data records held in the cache
//!
//! Records serialize to JSON for storage. The symbol is the identity of a
//! record and also a key segment, so it must be non-empty and free of the
//! `:` key delimiter.

use crate::error::{CacheError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Check that a symbol can be used as a record identity and key segment.
pub fn validate_symbol(symbol: &str) -> Result<()> {
    if symbol.trim().is_empty() {
        return Err(CacheError::validation("symbol must not be empty"));
    }
    if symbol.contains(':') {
        return Err(CacheError::Validation(format!(
            "symbol '{}' must not contain ':'",
            symbol
        )));
    }
    Ok(())
}

fn validate_finite(field: &str, value: f64) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(CacheError::Validation(format!("{} must be a finite number", field)))
    }
}

/// Latest price tick for one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub symbol: String,
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_24h: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_24h: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_24h: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_base: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_quote: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl PriceRecord {
    /// Create a record with only the last price set, stamped now.
    pub fn new(symbol: impl Into<String>, price: f64) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            bid: None,
            ask: None,
            high_24h: None,
            low_24h: None,
            change_24h: None,
            volume_base: None,
            volume_quote: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_quote(mut self, bid: f64, ask: f64) -> Self {
        self.bid = Some(bid);
        self.ask = Some(ask);
        self
    }

    pub fn with_24h(mut self, high: f64, low: f64, change: f64) -> Self {
        self.high_24h = Some(high);
        self.low_24h = Some(low);
        self.change_24h = Some(change);
        self
    }

    pub fn with_volume(mut self, base: f64, quote: f64) -> Self {
        self.volume_base = Some(base);
        self.volume_quote = Some(quote);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Validate before the record is sent anywhere.
    pub fn validate(&self) -> Result<()> {
        validate_symbol(&self.symbol)?;
        validate_finite("price", self.price)?;
        for (field, value) in [
            ("bid", self.bid),
            ("ask", self.ask),
            ("high_24h", self.high_24h),
            ("low_24h", self.low_24h),
            ("change_24h", self.change_24h),
            ("volume_base", self.volume_base),
            ("volume_quote", self.volume_quote),
        ] {
            if let Some(value) = value {
                validate_finite(field, value)?;
            }
        }
        Ok(())
    }
}

/// Derived metrics for one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub symbol: String,
    pub price_change_pct: f64,
    pub volume_24h: f64,
    pub volatility: f64,
    pub turnover: f64,
    pub updated_at: DateTime<Utc>,
}

impl MetricsRecord {
    pub fn validate(&self) -> Result<()> {
        validate_symbol(&self.symbol)?;
        validate_finite("price_change_pct", self.price_change_pct)?;
        validate_finite("volume_24h", self.volume_24h)?;
        validate_finite("volatility", self.volatility)?;
        validate_finite("turnover", self.turnover)
    }
}

/// Most recent candle for a symbol and interval (e.g. `1m`, `1h`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KlineRecord {
    pub symbol: String,
    pub interval: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
}

impl KlineRecord {
    pub fn validate(&self) -> Result<()> {
        validate_symbol(&self.symbol)?;
        if self.interval.is_empty() || self.interval.contains(':') {
            return Err(CacheError::Validation(format!(
                "invalid kline interval '{}'",
                self.interval
            )));
        }
        for (field, value) in [
            ("open", self.open),
            ("high", self.high),
            ("low", self.low),
            ("close", self.close),
            ("volume", self.volume),
        ] {
            validate_finite(field, value)?;
        }
        if self.close_time < self.open_time {
            return Err(CacheError::validation("kline close_time precedes open_time"));
        }
        Ok(())
    }
}
