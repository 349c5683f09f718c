use gxc_core::{BlockHeader, Hash32};
use gxc_crypto::{keccak256, keccak512};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

pub const EPOCH_LENGTH: u64 = 30_000;
pub const HASH_BYTES: usize = 64;
pub const MIX_BYTES: usize = 128;
pub const DATASET_PARENTS: u32 = 256;
pub const CACHE_ROUNDS: usize = 3;
pub const ACCESSES: usize = 64;
/// Epoch caches kept resident before LRU eviction.
pub const CACHE_KEEP: usize = 2;

const FNV_PRIME: u32 = 0x0100_0193;
const CACHE_INIT_BYTES: u64 = 16 * 1024 * 1024;
const CACHE_GROWTH_BYTES: u64 = 128 * 1024;
const DATASET_INIT_BYTES: u64 = 1024 * 1024 * 1024;
const DATASET_GROWTH_BYTES: u64 = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum EthashError {
    #[error("epoch {0} cache is still generating")]
    CachePending(u64),
    #[error("dataset generation cancelled")]
    DatasetCancelled,
}

#[inline]
fn fnv(a: u32, b: u32) -> u32 {
    a.wrapping_mul(FNV_PRIME) ^ b
}

fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    let mut i = 2;
    while i * i <= n {
        if n % i == 0 {
            return false;
        }
        i += 1;
    }
    true
}

pub fn epoch_for_block(block_number: u64) -> u64 {
    block_number / EPOCH_LENGTH
}

/// Cache size walks down from the epoch's initial size until the item count
/// is prime.
pub fn cache_size(epoch: u64) -> u64 {
    let mut sz = CACHE_INIT_BYTES + CACHE_GROWTH_BYTES * epoch - HASH_BYTES as u64;
    while !is_prime(sz / HASH_BYTES as u64) {
        sz -= 2 * HASH_BYTES as u64;
    }
    sz
}

/// Dataset size, prime in mix-sized units.
pub fn dataset_size(epoch: u64) -> u64 {
    let mut sz = DATASET_INIT_BYTES + DATASET_GROWTH_BYTES * epoch - MIX_BYTES as u64;
    while !is_prime(sz / MIX_BYTES as u64) {
        sz -= 2 * MIX_BYTES as u64;
    }
    sz
}

/// Header preimage for the Ethash seed: Keccak-256 over the nonce-free
/// canonical header bytes.
pub fn header_pow_hash(header: &BlockHeader) -> Hash32 {
    keccak256(&header.pow_bytes())
}

fn item_words(item: &[u8]) -> [u32; 16] {
    let mut words = [0u32; 16];
    for (i, w) in words.iter_mut().enumerate() {
        *w = u32::from_le_bytes(item[i * 4..i * 4 + 4].try_into().unwrap());
    }
    words
}

/// Per-epoch light-client cache. 64-byte items are hashed with Keccak-512,
/// 32-byte seeds and results with Keccak-256.
pub struct EthashCache {
    pub epoch: u64,
    items: Vec<u8>,
    item_count: usize,
    dataset_items: usize,
}

impl EthashCache {
    pub fn generate(epoch: u64) -> Self {
        let size = cache_size(epoch);
        let item_count = (size / HASH_BYTES as u64) as usize;
        let dataset_items = (dataset_size(epoch) / HASH_BYTES as u64) as usize;
        info!(epoch, size, "generating ethash cache");

        let mut items = vec![0u8; item_count * HASH_BYTES];
        let seed = keccak256(&epoch.to_le_bytes());
        items[..HASH_BYTES].copy_from_slice(&keccak512(&seed));
        for i in 1..item_count {
            let prev = items[(i - 1) * HASH_BYTES..i * HASH_BYTES].to_vec();
            items[i * HASH_BYTES..(i + 1) * HASH_BYTES].copy_from_slice(&keccak512(&prev));
        }

        // RandMemoHash rounds.
        for _ in 0..CACHE_ROUNDS {
            for i in 0..item_count {
                let first_word = u32::from_le_bytes(
                    items[i * HASH_BYTES..i * HASH_BYTES + 4].try_into().unwrap(),
                );
                let v = first_word as usize % item_count;
                let prev = (i + item_count - 1) % item_count;
                let mut temp = [0u8; HASH_BYTES];
                for j in 0..HASH_BYTES {
                    temp[j] = items[prev * HASH_BYTES + j] ^ items[v * HASH_BYTES + j];
                }
                items[i * HASH_BYTES..(i + 1) * HASH_BYTES].copy_from_slice(&keccak512(&temp));
            }
        }

        debug!(epoch, item_count, "ethash cache ready");
        Self {
            epoch,
            items,
            item_count,
            dataset_items,
        }
    }

    fn cache_item(&self, index: usize) -> &[u8] {
        &self.items[index * HASH_BYTES..(index + 1) * HASH_BYTES]
    }

    pub fn dataset_item_count(&self) -> usize {
        self.dataset_items
    }

    /// One 64-byte dataset item computed on demand from the cache.
    pub fn dataset_item(&self, index: u32) -> [u8; HASH_BYTES] {
        let n = self.item_count;
        let mut item = [0u8; HASH_BYTES];
        item.copy_from_slice(self.cache_item(index as usize % n));
        let mut first = u32::from_le_bytes(item[..4].try_into().unwrap());
        first ^= index;
        item[..4].copy_from_slice(&first.to_le_bytes());
        item = keccak512(&item);

        let mut words = item_words(&item);
        for r in 0..DATASET_PARENTS {
            let parent = fnv(index ^ r, words[r as usize % 16]) as usize % n;
            let parent_words = item_words(self.cache_item(parent));
            for j in 0..16 {
                words[j] = fnv(words[j], parent_words[j]);
            }
        }
        for (j, w) in words.iter().enumerate() {
            item[j * 4..j * 4 + 4].copy_from_slice(&w.to_le_bytes());
        }
        keccak512(&item)
    }

    /// Full dataset for mining. Memory-heavy; cancellable through `stop`.
    pub fn generate_dataset(&self, stop: &AtomicBool) -> Result<Vec<u8>, EthashError> {
        let mut dataset = vec![0u8; self.dataset_items * HASH_BYTES];
        for i in 0..self.dataset_items {
            if i % 16_384 == 0 && stop.load(Ordering::Relaxed) {
                return Err(EthashError::DatasetCancelled);
            }
            let item = self.dataset_item(i as u32);
            dataset[i * HASH_BYTES..(i + 1) * HASH_BYTES].copy_from_slice(&item);
        }
        Ok(dataset)
    }
}

/// The hashimoto loop: 128-byte mix seeded from Keccak(header || nonce),
/// 64 FNV-driven dataset accesses, grouped FNV fold to 32 bytes.
fn hashimoto<F>(header_hash: &Hash32, nonce: u64, dataset_items: usize, lookup: F) -> (Hash32, Hash32)
where
    F: Fn(u32) -> [u8; HASH_BYTES],
{
    let mut seed_input = [0u8; 40];
    seed_input[..32].copy_from_slice(header_hash);
    seed_input[32..].copy_from_slice(&nonce.to_le_bytes());
    let seed_hash = keccak256(&seed_input);
    let seed_words: Vec<u32> = (0..8)
        .map(|i| u32::from_le_bytes(seed_hash[i * 4..i * 4 + 4].try_into().unwrap()))
        .collect();

    let mix_words = MIX_BYTES / 4;
    let mut mix = vec![0u32; mix_words];
    for (i, m) in mix.iter_mut().enumerate() {
        *m = seed_words[i % 8];
    }

    for i in 0..ACCESSES {
        let p = fnv(i as u32 ^ seed_words[0], mix[i % mix_words]) as usize % dataset_items;
        let item = item_words(&lookup(p as u32));
        for j in 0..mix_words {
            mix[j] = fnv(mix[j], item[j % 16]);
        }
    }

    let mut compressed = [0u8; 32];
    for i in 0..mix_words / 4 {
        let c = fnv(fnv(fnv(mix[i * 4], mix[i * 4 + 1]), mix[i * 4 + 2]), mix[i * 4 + 3]);
        compressed[i * 4..i * 4 + 4].copy_from_slice(&c.to_le_bytes());
    }

    let mut final_input = [0u8; 64];
    final_input[..32].copy_from_slice(&seed_hash);
    final_input[32..].copy_from_slice(&compressed);
    (keccak256(&final_input), compressed)
}

/// Epoch cache manager. Caches are immutable once built; at most one
/// generator runs per epoch (callers serialize on the inner lock) and the
/// oldest epochs are evicted past [`CACHE_KEEP`].
pub struct EthashEngine {
    caches: Mutex<CacheMap>,
    dataset: Mutex<Option<(u64, Arc<Vec<u8>>)>>,
    stop: AtomicBool,
}

struct CacheMap {
    by_epoch: HashMap<u64, Arc<EthashCache>>,
    order: Vec<u64>,
}

impl Default for EthashEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl EthashEngine {
    pub fn new() -> Self {
        Self {
            caches: Mutex::new(CacheMap {
                by_epoch: HashMap::new(),
                order: Vec::new(),
            }),
            dataset: Mutex::new(None),
            stop: AtomicBool::new(false),
        }
    }

    pub fn cache_for_block(&self, block_number: u64) -> Arc<EthashCache> {
        let epoch = epoch_for_block(block_number);
        let mut guard = self.caches.lock();
        let map = &mut *guard;
        if let Some(cache) = map.by_epoch.get(&epoch) {
            map.order.retain(|e| *e != epoch);
            map.order.push(epoch);
            return cache.clone();
        }
        let cache = Arc::new(EthashCache::generate(epoch));
        map.by_epoch.insert(epoch, cache.clone());
        map.order.push(epoch);
        while map.order.len() > CACHE_KEEP {
            let evicted = map.order.remove(0);
            map.by_epoch.remove(&evicted);
            debug!(epoch = evicted, "evicted ethash cache");
        }
        cache
    }

    /// Non-blocking cache lookup.
    pub fn try_cache_for_block(&self, block_number: u64) -> Result<Arc<EthashCache>, EthashError> {
        let epoch = epoch_for_block(block_number);
        self.caches
            .lock()
            .by_epoch
            .get(&epoch)
            .cloned()
            .ok_or(EthashError::CachePending(epoch))
    }

    /// Light hash, dataset items computed on demand.
    pub fn hash_light(&self, header_hash: &Hash32, nonce: u64, block_number: u64) -> (Hash32, Hash32) {
        let cache = self.cache_for_block(block_number);
        hashimoto(header_hash, nonce, cache.dataset_item_count(), |i| {
            cache.dataset_item(i)
        })
    }

    /// Full hash against a pre-generated dataset; falls back to light mode
    /// when the dataset for this epoch is absent.
    pub fn hash_full(&self, header_hash: &Hash32, nonce: u64, block_number: u64) -> (Hash32, Hash32) {
        let epoch = epoch_for_block(block_number);
        let dataset = {
            let guard = self.dataset.lock();
            match guard.as_ref() {
                Some((e, data)) if *e == epoch => Some(data.clone()),
                _ => None,
            }
        };
        match dataset {
            Some(data) => {
                let items = data.len() / HASH_BYTES;
                hashimoto(header_hash, nonce, items, |i| {
                    let i = i as usize;
                    data[i * HASH_BYTES..(i + 1) * HASH_BYTES].try_into().unwrap()
                })
            }
            None => self.hash_light(header_hash, nonce, block_number),
        }
    }

    pub fn generate_dataset(&self, block_number: u64) -> Result<(), EthashError> {
        let epoch = epoch_for_block(block_number);
        {
            let guard = self.dataset.lock();
            if matches!(guard.as_ref(), Some((e, _)) if *e == epoch) {
                return Ok(());
            }
        }
        self.stop.store(false, Ordering::Relaxed);
        let cache = self.cache_for_block(block_number);
        let data = cache.generate_dataset(&self.stop)?;
        *self.dataset.lock() = Some((epoch, Arc::new(data)));
        Ok(())
    }

    pub fn cancel_dataset_generation(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Recompute with the recorded nonce and compare result and mix.
    pub fn verify(
        &self,
        header_hash: &Hash32,
        nonce: u64,
        block_number: u64,
        expected_result: &Hash32,
        expected_mix: &Hash32,
    ) -> bool {
        let (result, mix) = self.hash_light(header_hash, nonce, block_number);
        result == *expected_result && mix == *expected_mix
    }
}
