//! Circuit breaker: Closed -> Open -> HalfOpen -> Closed

use crate::config::CircuitBreakerConfig;
use crate::error::{CacheError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Calls pass through; failures are counted
    Closed,
    /// Calls are rejected until the reset timeout elapses
    Open,
    /// One probe call decides whether to close or reopen
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Point-in-time view of a breaker for stats and health output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    /// Consecutive failures in the current closed period
    pub failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    probe_started: Option<Instant>,
}

/// Failure isolation for one dependency
///
/// Only errors for which [`CacheError::is_dependency_failure`] holds count as
/// failures; any other outcome proves the dependency answered.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                opened_at: None,
                opened_at_wall: None,
                last_failure_at: None,
                probe_started: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn rejected(&self) -> CacheError {
        CacheError::CircuitOpen {
            name: self.name.clone(),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failures(&self) -> u32 {
        self.lock().failures
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failures: inner.failures,
            opened_at: inner.opened_at_wall,
            last_failure_at: inner.last_failure_at,
        }
    }

    /// Ask permission for one call.
    ///
    /// In `Open`, the first call after `reset_timeout` becomes the probe and
    /// moves the breaker to `HalfOpen`; every other call is rejected until the
    /// probe reports back. A probe that never reports back (its future was
    /// dropped) is replaced after another `reset_timeout`.
    pub fn try_acquire(&self) -> Result<()> {
        let mut inner = self.lock();
        let now = Instant::now();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map_or(self.config.reset_timeout, |at| now.duration_since(at));
                if elapsed >= self.config.reset_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_started = Some(now);
                    info!(breaker = %self.name, "Circuit half-open, allowing probe call");
                    Ok(())
                } else {
                    Err(self.rejected())
                }
            }
            CircuitState::HalfOpen => {
                let stale = inner
                    .probe_started
                    .map_or(true, |at| now.duration_since(at) >= self.config.reset_timeout);
                if stale {
                    inner.probe_started = Some(now);
                    Ok(())
                } else {
                    Err(self.rejected())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            info!(breaker = %self.name, "Probe succeeded, circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.opened_at = None;
        inner.opened_at_wall = None;
        inner.probe_started = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.last_failure_at = Some(Utc::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    self.trip(&mut inner);
                    warn!(
                        breaker = %self.name,
                        failures = inner.failures,
                        reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                        "Circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.trip(&mut inner);
                warn!(breaker = %self.name, "Probe failed, circuit reopened");
            }
            // A call admitted before the trip finished late; the timer stands.
            CircuitState::Open => {}
        }
    }

    fn trip(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.opened_at_wall = Some(Utc::now());
        inner.probe_started = None;
    }

    /// Report the outcome of an admitted call.
    pub fn record<T>(&self, outcome: &Result<T>) {
        match outcome {
            Err(e) if e.is_dependency_failure() => self.record_failure(),
            _ => self.record_success(),
        }
    }

    /// Run `f` if the breaker admits it; `f` is not invoked when rejected.
    pub async fn call<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.try_acquire()?;
        let outcome = f().await;
        self.record(&outcome);
        outcome
    }

    /// Force the breaker back to `Closed`.
    pub fn reset(&self) {
        self.record_success();
        info!(breaker = %self.name, "Circuit manually reset");
    }
}
