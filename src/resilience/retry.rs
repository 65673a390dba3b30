//! Retry with exponential backoff, jitter, cancellation and deadlines

use crate::config::RetryConfig;
use crate::error::{CacheError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Fraction by which a jittered delay may deviate from the computed backoff
const JITTER_FRACTION: f64 = 0.25;

/// Retries retryable failures of an async operation
#[derive(Debug, Clone)]
pub struct RetryManager {
    config: RetryConfig,
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryManager {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Backoff before retry number `attempt` (0-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.config.initial_delay.as_secs_f64() * self.config.backoff_factor.powi(exponent);
        let capped = secs.min(self.config.max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.config.max_delay
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        if !self.config.jitter {
            return base;
        }
        let spread = rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
        Duration::from_secs_f64((base.as_secs_f64() * (1.0 + spread)).max(0.0))
    }

    /// Run `operation`, retrying retryable errors with backoff.
    ///
    /// Fatal errors return on the first failure. When the retry budget runs
    /// out the last error is wrapped in [`CacheError::RetriesExhausted`].
    pub async fn execute<T, F, Fut>(&self, operation: &str, f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(operation, None, None, f).await
    }

    /// Like [`RetryManager::execute`], but stops with `Cancelled` or
    /// `DeadlineExceeded` when the token fires or the deadline passes.
    ///
    /// Both are checked before every attempt and before every sleep, and a
    /// sleep in progress is cut short by cancellation. A sleep that would end
    /// past the deadline is not started.
    pub async fn execute_with_cancel<T, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
        f: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(operation, Some(cancel), deadline, f).await
    }

    async fn run<T, F, Fut>(
        &self,
        operation: &str,
        cancel: Option<&CancellationToken>,
        deadline: Option<Instant>,
        mut f: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            check_interrupted(operation, cancel, deadline)?;

            let error = match f().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(operation, attempts = attempt + 1, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !error.is_retryable() {
                debug!(operation, "non-retryable error: {}", error);
                return Err(error);
            }

            if attempt >= self.config.max_retries {
                warn!(
                    operation,
                    attempts = attempt + 1,
                    "retries exhausted: {}",
                    error
                );
                return Err(CacheError::RetriesExhausted {
                    operation: operation.to_string(),
                    attempts: attempt + 1,
                    source: Box::new(error),
                });
            }

            let delay = self.delay_for(attempt);
            warn!(
                operation,
                attempt = attempt + 1,
                max_retries = self.config.max_retries,
                delay_ms = delay.as_millis() as u64,
                "retrying after error: {}",
                error
            );

            check_interrupted(operation, cancel, deadline)?;
            if let Some(deadline) = deadline {
                if Instant::now() + delay >= deadline {
                    return Err(CacheError::DeadlineExceeded(operation.to_string()));
                }
            }

            match cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => {
                            return Err(CacheError::Cancelled(operation.to_string()));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }

            attempt += 1;
        }
    }
}

fn check_interrupted(
    operation: &str,
    cancel: Option<&CancellationToken>,
    deadline: Option<Instant>,
) -> Result<()> {
    if cancel.map_or(false, CancellationToken::is_cancelled) {
        return Err(CacheError::Cancelled(operation.to_string()));
    }
    if deadline.map_or(false, |d| Instant::now() >= d) {
        return Err(CacheError::DeadlineExceeded(operation.to_string()));
    }
    Ok(())
}
