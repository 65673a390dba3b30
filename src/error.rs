//! Error types for cache and backing-store operations
//!
//! A single error enum covers the whole layer. Each variant falls into one of
//! four classes: validation (never retried), transient infrastructure (retried
//! with backoff), circuit-open (returned immediately), and cancellation.
//! Absence of a record is not an error; reads return `Ok(None)`.

use thiserror::Error;

/// Message fragments that identify transient infrastructure failures when the
/// underlying error only carries text (e.g. a database driver message).
const TRANSIENT_PATTERNS: &[&str] = &[
    "connection refused",
    "connection reset",
    "broken pipe",
    "timeout",
    "timed out",
    "deadline exceeded",
    "network is unreachable",
    "network unreachable",
    "temporarily unavailable",
];

/// Main error type for the cache layer
#[derive(Error, Debug)]
pub enum CacheError {
    /// Malformed input: empty symbol, empty required list, bad numeric field
    #[error("Validation error: {0}")]
    Validation(String),

    /// Network or connection-level failure reaching a dependency
    #[error("Connection error: {0}")]
    Connection(String),

    /// Operation timeout
    #[error("Operation timed out after {timeout_ms}ms: {context}")]
    Timeout { timeout_ms: u64, context: String },

    /// Generic downstream failure carrying only a message
    #[error("Store error: {0}")]
    Store(String),

    /// Uniqueness or ordering conflict reported by the backing store
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Serialization/Deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The circuit protecting a dependency is open
    #[error("Circuit breaker '{name}' is open")]
    CircuitOpen { name: String },

    /// A retryable operation kept failing until the retry budget ran out
    #[error("Operation '{operation}' failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<CacheError>,
    },

    /// The caller cancelled the operation
    #[error("Operation '{0}' was cancelled")]
    Cancelled(String),

    /// The caller's deadline passed before the operation could complete
    #[error("Deadline exceeded for operation '{0}'")]
    DeadlineExceeded(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Redis driver error (wrapper)
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

impl CacheError {
    /// Whether retrying the failed operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            CacheError::Connection(_) | CacheError::Timeout { .. } => true,
            CacheError::Redis(err) => {
                err.is_timeout()
                    || err.is_connection_refusal()
                    || err.is_connection_dropped()
                    || err.is_io_error()
            }
            CacheError::Store(message) => is_transient_message(message),
            CacheError::Validation(_)
            | CacheError::Conflict(_)
            | CacheError::Serialization(_)
            | CacheError::CircuitOpen { .. }
            | CacheError::RetriesExhausted { .. }
            | CacheError::Cancelled(_)
            | CacheError::DeadlineExceeded(_)
            | CacheError::Config(_) => false,
        }
    }

    /// Whether the error says something about the health of the dependency.
    ///
    /// Caller mistakes (validation, conflicts, bad payloads) prove the
    /// dependency answered, so they do not count against a circuit breaker.
    pub fn is_dependency_failure(&self) -> bool {
        match self {
            CacheError::Validation(_)
            | CacheError::Conflict(_)
            | CacheError::Serialization(_)
            | CacheError::Cancelled(_)
            | CacheError::DeadlineExceeded(_)
            | CacheError::Config(_) => false,
            CacheError::CircuitOpen { .. } => false,
            CacheError::RetriesExhausted { source, .. } => source.is_dependency_failure(),
            CacheError::Store(message) => is_transient_message(message),
            CacheError::Connection(_) | CacheError::Timeout { .. } | CacheError::Redis(_) => true,
        }
    }

    /// Shorthand for validation errors.
    pub fn validation(message: impl Into<String>) -> Self {
        CacheError::Validation(message.into())
    }
}

/// Case-insensitive match against the known transient failure messages.
pub fn is_transient_message(message: &str) -> bool {
    let lowered = message.to_lowercase();
    TRANSIENT_PATTERNS
        .iter()
        .any(|pattern| lowered.contains(pattern))
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

impl From<String> for CacheError {
    fn from(s: String) -> Self {
        CacheError::Store(s)
    }
}

impl From<&str> for CacheError {
    fn from(s: &str) -> Self {
        CacheError::Store(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CacheError::Connection("Failed to connect".to_string());
        assert_eq!(error.to_string(), "Connection error: Failed to connect");

        let timeout_error = CacheError::Timeout {
            timeout_ms: 500,
            context: "GET app:latest_price:BTCUSDT".to_string(),
        };
        assert!(timeout_error.to_string().contains("timed out after 500ms"));

        let open = CacheError::CircuitOpen {
            name: "store".to_string(),
        };
        assert_eq!(open.to_string(), "Circuit breaker 'store' is open");
    }

    #[test]
    fn test_retries_exhausted_wraps_source() {
        let error = CacheError::RetriesExhausted {
            operation: "repository.get_latest".to_string(),
            attempts: 4,
            source: Box::new(CacheError::Connection("connection reset by peer".to_string())),
        };
        let text = error.to_string();
        assert!(text.contains("failed after 4 attempts"));
        assert!(text.contains("connection reset by peer"));
        assert!(std::error::Error::source(&error).is_some());
    }

    #[test]
    fn test_transient_classification() {
        assert!(CacheError::Connection("down".into()).is_retryable());
        assert!(CacheError::Timeout {
            timeout_ms: 10,
            context: "get".into()
        }
        .is_retryable());
        assert!(CacheError::Store("pq: Connection Refused".into()).is_retryable());
        assert!(CacheError::Store("context deadline exceeded".into()).is_retryable());
        assert!(CacheError::Store("dial tcp: network is unreachable".into()).is_retryable());

        assert!(!CacheError::Store("duplicate key value violates unique constraint".into())
            .is_retryable());
        assert!(!CacheError::validation("symbol must not be empty").is_retryable());
        assert!(!CacheError::Conflict("exists".into()).is_retryable());
        assert!(!CacheError::CircuitOpen { name: "x".into() }.is_retryable());
    }

    #[test]
    fn test_redis_io_error_is_retryable() {
        let err = CacheError::from(redis::RedisError::from((
            redis::ErrorKind::IoError,
            "Connection refused",
        )));
        assert!(err.is_retryable());
        assert!(err.is_dependency_failure());
    }

    #[test]
    fn test_dependency_failure_classification() {
        assert!(!CacheError::validation("bad").is_dependency_failure());
        assert!(!CacheError::Conflict("dup".into()).is_dependency_failure());
        assert!(CacheError::Connection("reset".into()).is_dependency_failure());

        let exhausted = CacheError::RetriesExhausted {
            operation: "op".into(),
            attempts: 3,
            source: Box::new(CacheError::Connection("reset".into())),
        };
        assert!(exhausted.is_dependency_failure());
        assert!(!exhausted.is_retryable());
    }

    #[test]
    fn test_error_conversion() {
        let error: CacheError = "test error".into();
        assert!(matches!(error, CacheError::Store(_)));

        let error: CacheError = "test error".to_string().into();
        assert!(matches!(error, CacheError::Store(_)));

        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(CacheError::from(json_err), CacheError::Serialization(_)));
    }
}
