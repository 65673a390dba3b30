//! Cache monitor: hit/miss/error counters and periodic health signals
//!
//! One monitor is constructed per process and passed down to whatever records
//! cache outcomes. Counters are plain atomics; a snapshot reads each one once,
//! so concurrent increments are never lost but a snapshot taken under load may
//! straddle an in-progress operation.

use crate::cache::store::CacheStore;
use crate::config::MonitorConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Memory utilization above which the health poll logs a warning
const MEMORY_WARN_UTILIZATION: f64 = 0.90;

/// Point-in-time counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    /// hits + misses + errors
    pub total_operations: u64,
    /// hits / (hits + misses), 0.0 when nothing was looked up yet
    pub hit_rate: f64,
}

impl CacheStats {
    /// Lookups that produced an answer (hits + misses).
    pub fn lookups(&self) -> u64 {
        self.hits + self.misses
    }

    pub fn miss_rate(&self) -> f64 {
        if self.lookups() == 0 {
            0.0
        } else {
            1.0 - self.hit_rate
        }
    }
}

/// Report produced on every stats tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorReport {
    pub stats: CacheStats,
    /// Hit rate is below the floor with enough samples to judge
    pub hit_rate_degraded: bool,
    pub timestamp: DateTime<Utc>,
}

/// Health status of the cache store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// PING answered within the latency threshold
    Healthy,
    /// PING answered, but slower than `degraded_latency`
    Degraded,
    /// PING failed or timed out
    Unhealthy,
}

impl HealthStatus {
    /// Status code a readiness endpoint would report for the cache store
    pub fn to_http_status_code(&self) -> u16 {
        match self {
            HealthStatus::Healthy | HealthStatus::Degraded => 200,
            HealthStatus::Unhealthy => 503,
        }
    }

    /// Whether the store still serves traffic, even if slowly
    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

/// Detailed health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    /// PING round trip in milliseconds
    pub response_time_ms: u64,
    pub used_memory_bytes: Option<u64>,
    pub max_memory_bytes: Option<u64>,
    pub keys: Option<u64>,
    pub timestamp: DateTime<Utc>,
    /// Error message (if unhealthy)
    pub error: Option<String>,
    /// Attempts made before this result, 0 on the first try
    pub retry_count: u32,
}

impl HealthCheckResult {
    fn unhealthy(response_time: Duration, error: String) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            response_time_ms: response_time.as_millis() as u64,
            used_memory_bytes: None,
            max_memory_bytes: None,
            keys: None,
            timestamp: Utc::now(),
            error: Some(error),
            retry_count: 0,
        }
    }

    /// Fraction of the store's memory ceiling in use, when both are known.
    pub fn memory_utilization(&self) -> Option<f64> {
        match (self.used_memory_bytes, self.max_memory_bytes) {
            (Some(used), Some(max)) if max > 0 => Some(used as f64 / max as f64),
            _ => None,
        }
    }
}

/// PING the store, then read its memory figures.
///
/// Never fails; errors are captured in an `Unhealthy` result. A PING slower
/// than `degraded_threshold` yields `Degraded`.
pub async fn check_store_health(
    store: &dyn CacheStore,
    degraded_threshold: Duration,
) -> HealthCheckResult {
    let start = Instant::now();
    if let Err(e) = store.ping().await {
        let elapsed = start.elapsed();
        error!("Cache store health check failed: {}", e);
        return HealthCheckResult::unhealthy(elapsed, format!("PING failed: {}", e));
    }
    let elapsed = start.elapsed();

    let status = if elapsed > degraded_threshold {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };

    let mut result = HealthCheckResult {
        status,
        response_time_ms: elapsed.as_millis() as u64,
        used_memory_bytes: None,
        max_memory_bytes: None,
        keys: None,
        timestamp: Utc::now(),
        error: None,
        retry_count: 0,
    };

    match store.info().await {
        Ok(info) => {
            result.used_memory_bytes = Some(info.used_memory_bytes);
            result.max_memory_bytes = Some(info.max_memory_bytes);
            result.keys = Some(info.keys);
        }
        Err(e) => {
            // PING answered, so the store is up; only the figures are missing.
            warn!("Cache store INFO failed: {}", e);
            result.status = HealthStatus::Degraded;
            result.error = Some(format!("INFO failed: {}", e));
        }
    }

    debug!(
        status = ?result.status,
        response_time_ms = result.response_time_ms,
        "Cache store health check finished"
    );
    result
}

/// Health check with retries on `Unhealthy` results.
pub async fn check_store_health_with_retry(
    store: &dyn CacheStore,
    degraded_threshold: Duration,
    max_retries: u32,
    retry_delay: Duration,
) -> HealthCheckResult {
    let mut attempt = 0;
    loop {
        let mut result = check_store_health(store, degraded_threshold).await;
        result.retry_count = attempt;
        if result.status.is_operational() || attempt >= max_retries {
            return result;
        }
        attempt += 1;
        warn!(
            "Cache store unhealthy, retrying health check ({}/{})",
            attempt, max_retries
        );
        tokio::time::sleep(retry_delay).await;
    }
}

/// Thread-safe cache outcome counters plus the periodic monitor loop
pub struct CacheMonitor {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    config: MonitorConfig,
    last_health: Mutex<Option<HealthCheckResult>>,
    last_report: Mutex<Option<MonitorReport>>,
}

impl Default for CacheMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl CacheMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            config,
            last_health: Mutex::new(None),
            last_report: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            hits,
            misses,
            errors,
            total_operations: lookups + errors,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }

    /// Zero all counters.
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        info!("Cache monitor counters reset");
    }

    /// Below the floor once the minimum sample size is reached.
    pub fn is_hit_rate_degraded(&self, stats: &CacheStats) -> bool {
        stats.lookups() >= self.config.min_samples && stats.hit_rate < self.config.hit_rate_floor
    }

    /// Snapshot the counters, log them, and keep the report.
    pub fn report(&self) -> MonitorReport {
        let stats = self.stats();
        let hit_rate_degraded = self.is_hit_rate_degraded(&stats);

        info!(
            hits = stats.hits,
            misses = stats.misses,
            errors = stats.errors,
            total = stats.total_operations,
            hit_rate = %format!("{:.2}%", stats.hit_rate * 100.0),
            "Cache stats"
        );
        if hit_rate_degraded {
            warn!(
                hit_rate = %format!("{:.2}%", stats.hit_rate * 100.0),
                floor = %format!("{:.2}%", self.config.hit_rate_floor * 100.0),
                samples = stats.lookups(),
                "Cache hit rate below floor"
            );
        }

        let report = MonitorReport {
            stats,
            hit_rate_degraded,
            timestamp: Utc::now(),
        };
        *lock(&self.last_report) = Some(report.clone());
        report
    }

    pub fn last_report(&self) -> Option<MonitorReport> {
        lock(&self.last_report).clone()
    }

    pub fn last_health(&self) -> Option<HealthCheckResult> {
        lock(&self.last_health).clone()
    }

    /// Poll store health once and keep the result.
    pub async fn poll_health(&self, store: &dyn CacheStore) -> HealthCheckResult {
        let result = check_store_health(store, self.config.degraded_latency).await;
        match result.status {
            HealthStatus::Healthy => debug!("Cache store healthy"),
            HealthStatus::Degraded => warn!(
                response_time_ms = result.response_time_ms,
                "Cache store degraded"
            ),
            HealthStatus::Unhealthy => warn!(
                error = result.error.as_deref().unwrap_or("unknown"),
                "Cache store unhealthy"
            ),
        }
        if let Some(utilization) = result.memory_utilization() {
            if utilization > MEMORY_WARN_UTILIZATION {
                warn!(
                    utilization = %format!("{:.1}%", utilization * 100.0),
                    "Cache store memory nearly full"
                );
            }
        }
        *lock(&self.last_health) = Some(result.clone());
        result
    }

    /// Emit stats and poll health on two independent cadences until cancelled.
    pub async fn run(&self, store: Arc<dyn CacheStore>, cancel: CancellationToken) {
        info!(
            "Starting cache monitor (stats: {:?}, health: {:?})",
            self.config.stats_interval, self.config.health_interval
        );
        let mut stats_ticker = tokio::time::interval(self.config.stats_interval);
        let mut health_ticker = tokio::time::interval(self.config.health_interval);
        stats_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        health_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Cache monitor stopped");
                    return;
                }
                _ = stats_ticker.tick() => {
                    self.report();
                }
                _ = health_ticker.tick() => {
                    self.poll_health(store.as_ref()).await;
                }
            }
        }
    }

    /// Spawn [`CacheMonitor::run`] on the runtime.
    pub fn spawn(
        self: Arc<Self>,
        store: Arc<dyn CacheStore>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(store, cancel).await })
    }
}
