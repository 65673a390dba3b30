//! Tracing subscriber setup for binaries and local runs

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_DIRECTIVE: &str = "market_cache=info";

/// Install a global subscriber: `EnvFilter` from `RUST_LOG` (falling back to
/// `default_directive`) plus a `fmt` layer.
///
/// Fails if a global subscriber is already set.
pub fn init_tracing(default_directive: &str) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_directive.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
}
