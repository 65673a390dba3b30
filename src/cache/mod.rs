//! Cache store access and typed market-data caching
//!
//! - [`keys`]: key construction and the TTL table
//! - [`store`]: the `CacheStore` trait every backend implements
//! - [`redis`]: Redis backend with per-call timeouts and pipelines
//! - [`memory`]: in-process backend for tests and local runs
//! - [`price`]: typed API for prices, metrics, klines and the active set

pub mod keys;
pub mod memory;
pub mod price;
pub mod redis;
pub mod store;

pub use keys::{KeyBuilder, KeyCategory, TtlPolicy};
pub use memory::MemoryStore;
pub use price::PriceCache;
pub use self::redis::RedisStore;
pub use store::{CacheStore, StoreInfo};
