//! Bloom filter for symbols known to exist
//!
//! Sizing follows the standard formulas for `n` expected items and target
//! false-positive rate `p`:
//!
//! - bits `m = ceil(-n * ln(p) / ln(2)^2)`
//! - hash functions `k = round(m / n * ln(2))`, at least 1
//!
//! Bit positions come from double hashing over one 128-bit SipHash-1-3 digest
//! with fixed keys, so a process and the shared bit array in the cache store
//! always agree on where an item lives.

use crate::cache::keys::KeyBuilder;
use crate::cache::store::CacheStore;
use crate::config::BloomConfig;
use crate::error::{CacheError, Result};
use siphasher::sip128::{Hasher128, SipHasher13};
use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

const HASH_KEY_0: u64 = 0x6d61_726b_6574_2d63;
const HASH_KEY_1: u64 = 0x6163_6865_2d62_6c6d;

/// Largest bit offset Redis accepts for SETBIT/GETBIT
const MAX_SHARED_BITS: u64 = 1 << 32;

/// Filter name used in the shared bloom key
pub const PRICE_FILTER_NAME: &str = "prices";

/// Bit count and hash count derived from capacity and error rate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BloomParams {
    pub num_bits: u64,
    pub num_hashes: u32,
}

impl BloomParams {
    pub fn optimal(expected_items: u64, false_positive_rate: f64) -> Result<Self> {
        if expected_items == 0 {
            return Err(CacheError::Config(
                "bloom expected_items must be greater than 0".to_string(),
            ));
        }
        if !(false_positive_rate > 0.0 && false_positive_rate < 1.0) {
            return Err(CacheError::Config(format!(
                "bloom false_positive_rate must be in (0, 1), got {}",
                false_positive_rate
            )));
        }

        let n = expected_items as f64;
        let ln2 = std::f64::consts::LN_2;
        let num_bits = (-n * false_positive_rate.ln() / (ln2 * ln2)).ceil().max(1.0) as u64;
        let num_hashes = ((num_bits as f64 / n) * ln2).round().max(1.0) as u32;

        Ok(Self {
            num_bits,
            num_hashes,
        })
    }

    /// Bit offsets for `item`, one per hash function.
    pub fn positions(&self, item: &str) -> Vec<u64> {
        let mut hasher = SipHasher13::new_with_keys(HASH_KEY_0, HASH_KEY_1);
        hasher.write(item.as_bytes());
        let digest = hasher.finish128();
        let h1 = digest.h1;
        // An even step could cycle through a subset of positions.
        let h2 = digest.h2 | 1;

        (0..u64::from(self.num_hashes))
            .map(|i| h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits)
            .collect()
    }
}

/// Bit array in process memory
#[derive(Debug)]
pub struct LocalBloom {
    params: BloomParams,
    words: Vec<AtomicU64>,
}

impl LocalBloom {
    pub fn new(params: BloomParams) -> Self {
        let words = params.num_bits.div_ceil(64) as usize;
        Self {
            params,
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn add(&self, item: &str) {
        for bit in self.params.positions(item) {
            let mask = 1u64 << (bit % 64);
            self.words[(bit / 64) as usize].fetch_or(mask, Ordering::Relaxed);
        }
    }

    pub fn contains(&self, item: &str) -> bool {
        self.params.positions(item).into_iter().all(|bit| {
            let mask = 1u64 << (bit % 64);
            self.words[(bit / 64) as usize].load(Ordering::Relaxed) & mask != 0
        })
    }

    /// Bits currently set, for diagnostics.
    pub fn bits_set(&self) -> u64 {
        self.words
            .iter()
            .map(|w| u64::from(w.load(Ordering::Relaxed).count_ones()))
            .sum()
    }
}

/// Bit array held in the cache store, shared by every process using it
pub struct SharedBloom {
    params: BloomParams,
    store: Arc<dyn CacheStore>,
    key: String,
}

impl SharedBloom {
    pub fn new(params: BloomParams, store: Arc<dyn CacheStore>, key: String) -> Result<Self> {
        if params.num_bits > MAX_SHARED_BITS {
            return Err(CacheError::Config(format!(
                "shared bloom filter needs {} bits, store limit is {}",
                params.num_bits, MAX_SHARED_BITS
            )));
        }
        Ok(Self { params, store, key })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn add(&self, item: &str) -> Result<()> {
        self.store
            .set_bits(&self.key, &self.params.positions(item))
            .await
    }

    /// Store errors answer "maybe present" so lookups fall through rather
    /// than hiding data.
    pub async fn contains(&self, item: &str) -> bool {
        match self
            .store
            .get_bits(&self.key, &self.params.positions(item))
            .await
        {
            Ok(bits) => bits.into_iter().all(|bit| bit),
            Err(e) => {
                warn!(key = %self.key, "Bloom filter read failed, assuming present: {}", e);
                true
            }
        }
    }
}

/// Membership filter for symbols known to exist
pub enum BloomFilter {
    Local(LocalBloom),
    Shared(SharedBloom),
}

impl BloomFilter {
    pub fn local(config: &BloomConfig) -> Result<Self> {
        let params = BloomParams::optimal(config.expected_items, config.false_positive_rate)?;
        Ok(BloomFilter::Local(LocalBloom::new(params)))
    }

    /// Build the filter `config` asks for.
    pub fn from_config(
        config: &BloomConfig,
        store: Arc<dyn CacheStore>,
        keys: &KeyBuilder,
    ) -> Result<Self> {
        let params = BloomParams::optimal(config.expected_items, config.false_positive_rate)?;
        debug!(
            bits = params.num_bits,
            hashes = params.num_hashes,
            shared = config.shared,
            "bloom filter sized"
        );
        if config.shared {
            let shared = SharedBloom::new(params, store, keys.bloom(PRICE_FILTER_NAME))?;
            Ok(BloomFilter::Shared(shared))
        } else {
            Ok(BloomFilter::Local(LocalBloom::new(params)))
        }
    }

    pub fn params(&self) -> BloomParams {
        match self {
            BloomFilter::Local(filter) => filter.params,
            BloomFilter::Shared(filter) => filter.params,
        }
    }

    pub async fn add(&self, item: &str) -> Result<()> {
        match self {
            BloomFilter::Local(filter) => {
                filter.add(item);
                Ok(())
            }
            BloomFilter::Shared(filter) => filter.add(item).await,
        }
    }

    /// `false` means definitely absent; `true` means maybe present.
    pub async fn contains(&self, item: &str) -> bool {
        match self {
            BloomFilter::Local(filter) => filter.contains(item),
            BloomFilter::Shared(filter) => filter.contains(item).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryStore;

    #[test]
    fn test_optimal_params() {
        let params = BloomParams::optimal(100_000, 0.01).unwrap();
        assert_eq!(params.num_bits, 958_506);
        assert_eq!(params.num_hashes, 7);

        assert!(BloomParams::optimal(0, 0.01).is_err());
        assert!(BloomParams::optimal(10, 0.0).is_err());
        assert!(BloomParams::optimal(10, 1.0).is_err());
    }

    #[test]
    fn test_positions_are_stable_and_in_range() {
        let params = BloomParams::optimal(1_000, 0.01).unwrap();
        let first = params.positions("BTCUSDT");
        assert_eq!(first, params.positions("BTCUSDT"));
        assert_eq!(first.len(), params.num_hashes as usize);
        assert!(first.iter().all(|&bit| bit < params.num_bits));
    }

    #[test]
    fn test_no_false_negatives() {
        let bloom = LocalBloom::new(BloomParams::optimal(1_000, 0.01).unwrap());
        let items: Vec<String> = (0..1_000).map(|i| format!("SYM{}USDT", i)).collect();
        for item in &items {
            bloom.add(item);
        }
        for _ in 0..3 {
            assert!(items.iter().all(|item| bloom.contains(item)));
        }
    }

    #[test]
    fn test_false_positive_rate_bounded() {
        let bloom = LocalBloom::new(BloomParams::optimal(1_000, 0.01).unwrap());
        for i in 0..1_000 {
            bloom.add(&format!("PRESENT{}", i));
        }
        let false_positives = (0..10_000)
            .filter(|i| bloom.contains(&format!("ABSENT{}", i)))
            .count();
        // Expected around 100; allow generous slack.
        assert!(false_positives < 300, "false positives: {}", false_positives);
    }

    #[tokio::test]
    async fn test_shared_filter_uses_store_bits() {
        let store = Arc::new(MemoryStore::new());
        let config = BloomConfig {
            expected_items: 100,
            false_positive_rate: 0.01,
            shared: true,
        };
        let filter = BloomFilter::from_config(&config, store.clone(), &KeyBuilder::default()).unwrap();
        assert!(!filter.contains("BTCUSDT").await);

        filter.add("BTCUSDT").await.unwrap();
        assert!(filter.contains("BTCUSDT").await);

        // A second handle over the same store sees the same bits.
        let other = BloomFilter::from_config(&config, store.clone(), &KeyBuilder::default()).unwrap();
        assert!(other.contains("BTCUSDT").await);
        assert!(store.exists("app:bloom:prices").await.unwrap());
    }

    #[tokio::test]
    async fn test_shared_filter_fails_open() {
        let store = Arc::new(MemoryStore::new());
        let config = BloomConfig {
            shared: true,
            ..BloomConfig::default()
        };
        let filter = BloomFilter::from_config(&config, store.clone(), &KeyBuilder::default()).unwrap();
        store.set_offline(true);
        assert!(filter.contains("NEVERADDED").await);
        assert!(filter.add("BTCUSDT").await.is_err());
    }
}
