//! Failure handling shared by cache and backing-store access
//!
//! A [`ResilientExecutor`] pairs one [`CircuitBreaker`] with one
//! [`RetryManager`]. Each attempt of the retry loop asks the breaker first, so
//! an attempt that trips the breaker ends the loop with `CircuitOpen` instead
//! of sleeping and trying again. Cache operations and store operations each
//! get their own executor.

pub mod breaker;
pub mod retry;

pub use breaker::{BreakerSnapshot, CircuitBreaker, CircuitState};
pub use retry::RetryManager;

use crate::config::{CircuitBreakerConfig, RetryConfig};
use crate::error::Result;
use std::future::Future;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Breaker-gated retries for one class of operations
#[derive(Debug)]
pub struct ResilientExecutor {
    breaker: CircuitBreaker,
    retry: RetryManager,
}

impl ResilientExecutor {
    pub fn new(
        name: impl Into<String>,
        retry: RetryConfig,
        breaker: CircuitBreakerConfig,
    ) -> Self {
        Self {
            breaker: CircuitBreaker::new(name, breaker),
            retry: RetryManager::new(retry),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn retry(&self) -> &RetryManager {
        &self.retry
    }

    /// Run `f` with retries; every attempt must be admitted by the breaker.
    pub async fn execute<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = &self.breaker;
        self.retry
            .execute(operation, move || {
                let attempt = breaker.try_acquire().map(|()| f());
                gate(breaker, attempt)
            })
            .await
    }

    pub async fn execute_with_cancel<T, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
        mut f: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = &self.breaker;
        self.retry
            .execute_with_cancel(operation, cancel, deadline, move || {
                let attempt = breaker.try_acquire().map(|()| f());
                gate(breaker, attempt)
            })
            .await
    }
}

/// Await an admitted attempt and report its outcome. A rejected attempt
/// carries the `CircuitOpen` error and never created the inner future.
async fn gate<T, Fut>(breaker: &CircuitBreaker, attempt: Result<Fut>) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    let outcome = attempt?.await;
    breaker.record(&outcome);
    outcome
}
