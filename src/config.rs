//! Configuration for the cache layer
//!
//! Cache-store operations and backing-store operations get separate retry and
//! circuit-breaker settings, so a failing cache never trips protection for the
//! store and vice versa.

use crate::cache::keys::TtlPolicy;
use crate::error::{CacheError, Result};
use crate::strategy::StrategyKind;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

const ENV_PREFIX: &str = "MARKET_CACHE_";

/// Connection settings for the Redis-compatible store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    /// Upper bound for any single command or pipeline
    pub op_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            op_timeout: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Retry policy with exponential backoff
///
/// The delay before retry `n` (0-based) is
/// `initial_delay * backoff_factor^n`, capped at `max_delay`, then spread by
/// ±25% when `jitter` is on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Settings for cache-store calls: fail fast, the cache is best effort.
    pub fn for_cache() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.backoff_factor < 1.0 || !self.backoff_factor.is_finite() {
            return Err("backoff_factor must be a finite number >= 1.0".to_string());
        }
        if self.initial_delay > self.max_delay {
            return Err("initial_delay must not exceed max_delay".to_string());
        }
        Ok(())
    }
}

/// Circuit breaker thresholds for one dependency
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time the circuit stays open before a probe is let through
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn for_cache() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be greater than 0".to_string());
        }
        if self.reset_timeout.is_zero() {
            return Err("reset_timeout must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Bloom filter sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloomConfig {
    pub expected_items: u64,
    pub false_positive_rate: f64,
    /// Keep the bits in the cache store instead of process memory
    pub shared: bool,
}

impl Default for BloomConfig {
    fn default() -> Self {
        Self {
            expected_items: 100_000,
            false_positive_rate: 0.01,
            shared: false,
        }
    }
}

impl BloomConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.expected_items == 0 {
            return Err("expected_items must be greater than 0".to_string());
        }
        if !(self.false_positive_rate > 0.0 && self.false_positive_rate < 1.0) {
            return Err("false_positive_rate must be between 0.0 and 1.0 (exclusive)".to_string());
        }
        Ok(())
    }
}

/// Cadences and thresholds for the cache monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub stats_interval: Duration,
    pub health_interval: Duration,
    /// Hit rate (0.0 - 1.0) below which a warning is logged
    pub hit_rate_floor: f64,
    /// Operations required before the hit rate is judged
    pub min_samples: u64,
    /// Store round-trip latency above which health is reported as degraded
    pub degraded_latency: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            stats_interval: Duration::from_secs(60),
            health_interval: Duration::from_secs(300),
            hit_rate_floor: 0.70,
            min_samples: 100,
            degraded_latency: Duration::from_millis(100),
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.stats_interval.is_zero() || self.health_interval.is_zero() {
            return Err("monitor intervals must be greater than 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.hit_rate_floor) {
            return Err("hit_rate_floor must be between 0.0 and 1.0".to_string());
        }
        Ok(())
    }
}

/// Limits for detached write-behind persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteBehindConfig {
    /// Persists allowed in flight at once; submissions beyond are dropped
    pub max_in_flight: usize,
    /// Upper bound for a single persist, retries included
    pub persist_timeout: Duration,
}

impl Default for WriteBehindConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 64,
            persist_timeout: Duration::from_secs(5),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// First key segment, e.g. `app` in `app:latest_price:BTCUSDT`
    pub namespace: String,
    pub redis: RedisConfig,
    pub ttl: TtlPolicy,
    pub cache_retry: RetryConfig,
    pub store_retry: RetryConfig,
    pub cache_breaker: CircuitBreakerConfig,
    pub store_breaker: CircuitBreakerConfig,
    pub bloom: BloomConfig,
    pub monitor: MonitorConfig,
    pub write_behind: WriteBehindConfig,
    pub strategy: StrategyKind,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            namespace: "app".to_string(),
            redis: RedisConfig::default(),
            ttl: TtlPolicy::default(),
            cache_retry: RetryConfig::for_cache(),
            store_retry: RetryConfig::default(),
            cache_breaker: CircuitBreakerConfig::for_cache(),
            store_breaker: CircuitBreakerConfig::default(),
            bloom: BloomConfig::default(),
            monitor: MonitorConfig::default(),
            write_behind: WriteBehindConfig::default(),
            strategy: StrategyKind::WriteThrough,
        }
    }
}

impl AppConfig {
    /// Create a new builder for the configuration
    pub fn builder() -> AppConfigBuilder {
        AppConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let check = |section: &str, result: std::result::Result<(), String>| {
            result.map_err(|e| CacheError::Config(format!("{}: {}", section, e)))
        };

        if self.namespace.is_empty() || self.namespace.contains(':') {
            return Err(CacheError::Config(
                "namespace must be non-empty and must not contain ':'".to_string(),
            ));
        }
        if self.redis.op_timeout.is_zero() || self.redis.connect_timeout.is_zero() {
            return Err(CacheError::Config(
                "redis timeouts must be greater than 0".to_string(),
            ));
        }
        check("ttl", self.ttl.validate())?;
        check("cache_retry", self.cache_retry.validate())?;
        check("store_retry", self.store_retry.validate())?;
        check("cache_breaker", self.cache_breaker.validate())?;
        check("store_breaker", self.store_breaker.validate())?;
        check("bloom", self.bloom.validate())?;
        check("monitor", self.monitor.validate())?;
        if self.write_behind.max_in_flight == 0 || self.write_behind.persist_timeout.is_zero() {
            return Err(CacheError::Config(
                "write_behind: max_in_flight and persist_timeout must be greater than 0"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Load from a `.env` file (if present) and `MARKET_CACHE_*` variables.
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = dotenv::dotenv() {
            debug!("Loaded environment from {}", path.display());
        }
        let config = Self::default().with_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup; split out so it can be tested
    /// without touching the process environment.
    fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| lookup(&format!("{}{}", ENV_PREFIX, suffix));

        if let Some(namespace) = var("NAMESPACE") {
            self.namespace = namespace;
        }
        if let Some(url) = var("REDIS_URL") {
            self.redis.url = url;
        }
        if let Some(ms) = var("REDIS_TIMEOUT_MS") {
            self.redis.op_timeout = Duration::from_millis(parse_env("REDIS_TIMEOUT_MS", &ms)?);
        }
        if let Some(strategy) = var("STRATEGY") {
            self.strategy = parse_env("STRATEGY", &strategy)?;
        }
        if let Some(secs) = var("PRICE_TTL_SECS") {
            self.ttl.realtime = Duration::from_secs(parse_env("PRICE_TTL_SECS", &secs)?);
        }
        if let Some(secs) = var("SYMBOL_LIST_TTL_SECS") {
            self.ttl.symbol_list = Duration::from_secs(parse_env("SYMBOL_LIST_TTL_SECS", &secs)?);
        }
        if let Some(floor) = var("HIT_RATE_FLOOR") {
            self.monitor.hit_rate_floor = parse_env("HIT_RATE_FLOOR", &floor)?;
        }
        if let Some(limit) = var("WRITE_BEHIND_MAX_IN_FLIGHT") {
            self.write_behind.max_in_flight = parse_env("WRITE_BEHIND_MAX_IN_FLIGHT", &limit)?;
        }
        Ok(self)
    }
}

fn parse_env<T>(name: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| {
        CacheError::Config(format!("invalid {}{}='{}': {}", ENV_PREFIX, name, raw, e))
    })
}

/// Builder for the configuration
#[derive(Debug, Default)]
pub struct AppConfigBuilder {
    namespace: Option<String>,
    redis_url: Option<String>,
    ttl: Option<TtlPolicy>,
    cache_retry: Option<RetryConfig>,
    store_retry: Option<RetryConfig>,
    cache_breaker: Option<CircuitBreakerConfig>,
    store_breaker: Option<CircuitBreakerConfig>,
    bloom: Option<BloomConfig>,
    monitor: Option<MonitorConfig>,
    write_behind: Option<WriteBehindConfig>,
    strategy: Option<StrategyKind>,
}

impl AppConfigBuilder {
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    pub fn ttl(mut self, ttl: TtlPolicy) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn cache_retry(mut self, retry: RetryConfig) -> Self {
        self.cache_retry = Some(retry);
        self
    }

    pub fn store_retry(mut self, retry: RetryConfig) -> Self {
        self.store_retry = Some(retry);
        self
    }

    pub fn cache_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.cache_breaker = Some(breaker);
        self
    }

    pub fn store_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.store_breaker = Some(breaker);
        self
    }

    pub fn bloom(mut self, bloom: BloomConfig) -> Self {
        self.bloom = Some(bloom);
        self
    }

    pub fn monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn write_behind(mut self, write_behind: WriteBehindConfig) -> Self {
        self.write_behind = Some(write_behind);
        self
    }

    pub fn strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn build(self) -> AppConfig {
        let defaults = AppConfig::default();

        AppConfig {
            namespace: self.namespace.unwrap_or(defaults.namespace),
            redis: RedisConfig {
                url: self.redis_url.unwrap_or(defaults.redis.url),
                ..defaults.redis
            },
            ttl: self.ttl.unwrap_or(defaults.ttl),
            cache_retry: self.cache_retry.unwrap_or(defaults.cache_retry),
            store_retry: self.store_retry.unwrap_or(defaults.store_retry),
            cache_breaker: self.cache_breaker.unwrap_or(defaults.cache_breaker),
            store_breaker: self.store_breaker.unwrap_or(defaults.store_breaker),
            bloom: self.bloom.unwrap_or(defaults.bloom),
            monitor: self.monitor.unwrap_or(defaults.monitor),
            write_behind: self.write_behind.unwrap_or(defaults.write_behind),
            strategy: self.strategy.unwrap_or(defaults.strategy),
        }
    }
}

/// Preset configurations
impl AppConfig {
    /// Short TTLs and quick-tripping breakers for latency-sensitive feeds
    pub fn realtime() -> Self {
        Self {
            ttl: TtlPolicy {
                realtime: Duration::from_secs(15),
                symbol_list: Duration::from_secs(120),
                ..TtlPolicy::default()
            },
            cache_breaker: CircuitBreakerConfig {
                failure_threshold: 3,
                reset_timeout: Duration::from_secs(10),
            },
            store_breaker: CircuitBreakerConfig {
                failure_threshold: 2,
                reset_timeout: Duration::from_secs(30),
            },
            ..Default::default()
        }
    }

    /// Longer TTLs and a larger retry budget for slow-moving data
    pub fn conservative() -> Self {
        Self {
            ttl: TtlPolicy {
                realtime: Duration::from_secs(300),
                symbol_list: Duration::from_secs(1800),
                ..TtlPolicy::default()
            },
            store_retry: RetryConfig {
                max_retries: 5,
                max_delay: Duration::from_secs(10),
                ..RetryConfig::default()
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.namespace, "app");
        assert_eq!(config.ttl.realtime, Duration::from_secs(60));
        assert_eq!(config.ttl.symbol_list, Duration::from_secs(300));
        assert_eq!(config.strategy, StrategyKind::WriteThrough);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cache_and_store_settings_differ() {
        let config = AppConfig::default();
        assert_ne!(
            config.cache_breaker.failure_threshold,
            config.store_breaker.failure_threshold
        );
        assert!(config.cache_retry.max_retries < config.store_retry.max_retries);
    }

    #[test]
    fn test_config_validation() {
        let mut invalid = AppConfig::default();
        invalid.namespace = "a:b".to_string();
        assert!(invalid.validate().is_err());

        let mut invalid = AppConfig::default();
        invalid.bloom.false_positive_rate = 1.0;
        assert!(invalid.validate().is_err());

        let mut invalid = AppConfig::default();
        invalid.store_breaker.failure_threshold = 0;
        assert!(invalid.validate().is_err());

        let mut invalid = AppConfig::default();
        invalid.cache_retry.backoff_factor = 0.5;
        assert!(invalid.validate().is_err());

        let mut invalid = AppConfig::default();
        invalid.write_behind.max_in_flight = 0;
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_config_builder() {
        let config = AppConfig::builder()
            .namespace("mkt")
            .redis_url("redis://cache:6379")
            .strategy(StrategyKind::CacheAside)
            .ttl(TtlPolicy::exact())
            .build();

        assert_eq!(config.namespace, "mkt");
        assert_eq!(config.redis.url, "redis://cache:6379");
        assert_eq!(config.strategy, StrategyKind::CacheAside);
        assert_eq!(config.ttl.jitter, 0.0);
        assert_eq!(config.redis.op_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("MARKET_CACHE_NAMESPACE", "prod"),
            ("MARKET_CACHE_STRATEGY", "write-behind"),
            ("MARKET_CACHE_PRICE_TTL_SECS", "30"),
            ("MARKET_CACHE_HIT_RATE_FLOOR", "0.8"),
        ]
        .into_iter()
        .collect();

        let config = AppConfig::default()
            .with_env_overrides(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.namespace, "prod");
        assert_eq!(config.strategy, StrategyKind::WriteBehind);
        assert_eq!(config.ttl.realtime, Duration::from_secs(30));
        assert_eq!(config.monitor.hit_rate_floor, 0.8);
    }

    #[test]
    fn test_env_override_parse_error() {
        let result = AppConfig::default().with_env_overrides(|name| {
            (name == "MARKET_CACHE_REDIS_TIMEOUT_MS").then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(CacheError::Config(_))));
    }

    #[test]
    fn test_preset_configs() {
        let realtime = AppConfig::realtime();
        assert_eq!(realtime.ttl.realtime, Duration::from_secs(15));
        assert!(realtime.validate().is_ok());

        let conservative = AppConfig::conservative();
        assert_eq!(conservative.store_retry.max_retries, 5);
        assert!(conservative.validate().is_ok());
    }
}
