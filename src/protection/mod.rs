//! Cache penetration protection
//!
//! A bloom filter answers "definitely absent" for symbols never seen, and
//! tombstones remember recent confirmed misses. Together they keep lookups for
//! nonexistent symbols off the backing store.

pub mod bloom;
pub mod guard;
pub mod null_value;

pub use bloom::{BloomFilter, BloomParams};
pub use guard::{FillMode, PenetrationGuard};
pub use null_value::NullValueCache;
