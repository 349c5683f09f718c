use gxc_core::{Block, Hash32};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

/// Persisted namespaces. Keys inside a namespace are free-form strings;
/// block hashes and tx hashes are hex-encoded.
pub const NS_BLOCKS: &str = "blocks";
pub const NS_BLOCKS_BY_HEIGHT: &str = "blocks_by_height";
pub const NS_UTXO: &str = "utxo";
pub const NS_TX: &str = "tx";
pub const NS_VALIDATOR: &str = "validator";
pub const NS_STAKE: &str = "stake";
pub const NS_TAINT: &str = "taint";
pub const NS_FRAUD: &str = "fraud";
pub const NS_REVERSED: &str = "reversed";
pub const NS_REGISTRY: &str = "registry";
pub const NS_POOL: &str = "pool";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Abstract namespaced key-value store. Values are canonical JSON so
/// everything that is hashed round-trips byte-stable.
pub trait KvStore: Send + Sync {
    fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StorageError>;
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn delete(&self, namespace: &str, key: &str) -> Result<(), StorageError>;
    /// All pairs of a namespace in key order.
    fn scan(&self, namespace: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError>;

    fn put_json<T: Serialize>(&self, namespace: &str, key: &str, value: &T) -> Result<(), StorageError>
    where
        Self: Sized,
    {
        self.put(namespace, key, &serde_json::to_vec(value)?)
    }

    fn get_json<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> Result<Option<T>, StorageError>
    where
        Self: Sized,
    {
        match self.get(namespace, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

type NamespaceMap = BTreeMap<String, BTreeMap<String, Vec<u8>>>;

/// In-memory store, used by tests and as the cache of the file store.
#[derive(Default)]
pub struct MemStore {
    data: RwLock<NamespaceMap>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemStore {
    fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.data
            .write()
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .data
            .read()
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .cloned())
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<(), StorageError> {
        if let Some(ns) = self.data.write().get_mut(namespace) {
            ns.remove(key);
        }
        Ok(())
    }

    fn scan(&self, namespace: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        Ok(self
            .data
            .read()
            .get(namespace)
            .map(|ns| ns.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }
}

/// One JSON file per namespace under a data directory. Writes go through
/// the in-memory map and are flushed per operation; good enough for a node
/// whose hot state lives in the ledger anyway.
pub struct JsonFileStore {
    root: PathBuf,
    cache: MemStore,
}

impl JsonFileStore {
    pub fn open(root: PathBuf) -> Result<Self, StorageError> {
        fs::create_dir_all(&root)?;
        let store = Self {
            root,
            cache: MemStore::new(),
        };
        store.load_all()?;
        Ok(store)
    }

    fn namespace_path(&self, namespace: &str) -> PathBuf {
        self.root.join(format!("{namespace}.json"))
    }

    fn load_all(&self) -> Result<(), StorageError> {
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                let Some(namespace) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let bytes = fs::read(&path)?;
                let map: BTreeMap<String, String> = serde_json::from_slice(&bytes)?;
                for (key, value) in map {
                    let decoded = hex::decode(&value).unwrap_or_default();
                    self.cache.put(namespace, &key, &decoded)?;
                }
            }
        }
        Ok(())
    }

    fn flush(&self, namespace: &str) -> Result<(), StorageError> {
        let pairs = self.cache.scan(namespace)?;
        let map: BTreeMap<String, String> =
            pairs.into_iter().map(|(k, v)| (k, hex::encode(v))).collect();
        fs::write(self.namespace_path(namespace), serde_json::to_vec_pretty(&map)?)?;
        Ok(())
    }
}

impl KvStore for JsonFileStore {
    fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.cache.put(namespace, key, value)?;
        self.flush(namespace)
    }

    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.cache.get(namespace, key)
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<(), StorageError> {
        self.cache.delete(namespace, key)?;
        self.flush(namespace)
    }

    fn scan(&self, namespace: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        self.cache.scan(namespace)
    }
}

// ----- chain snapshot helpers -----

pub fn save_block<S: KvStore>(store: &S, block: &Block) -> Result<(), StorageError> {
    let hash = hex::encode(block.hash);
    store.put_json(NS_BLOCKS, &hash, block)?;
    store.put(
        NS_BLOCKS_BY_HEIGHT,
        &format!("{:010}", block.header.height),
        hash.as_bytes(),
    )
}

pub fn load_block<S: KvStore>(store: &S, hash: &Hash32) -> Result<Option<Block>, StorageError> {
    store.get_json(NS_BLOCKS, &hex::encode(hash))
}

/// All persisted blocks in height order.
pub fn load_chain<S: KvStore>(store: &S) -> Result<Vec<Block>, StorageError> {
    let mut blocks = Vec::new();
    for (_, hash_bytes) in store.scan(NS_BLOCKS_BY_HEIGHT)? {
        let hash = String::from_utf8(hash_bytes).unwrap_or_default();
        if let Some(block) = store.get_json::<Block>(NS_BLOCKS, &hash)? {
            blocks.push(block);
        }
    }
    info!(blocks = blocks.len(), "chain loaded from store");
    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gxc_core::{BlockHeader, BlockKind, Transaction};

    fn sample_block(height: u32) -> Block {
        let header = BlockHeader {
            height,
            prev_hash: [height as u8; 32],
            merkle_root: gxc_core::ZERO_HASH,
            timestamp: 1_700_000_000 + height as u64,
            nonce: 7,
            difficulty: 0.1,
            kind: BlockKind::PowSha256,
            miner: "tGXCminer".into(),
            reward: 50.0,
            validator_signature: None,
            mix_hash: None,
        };
        Block::new(header, vec![Transaction::coinbase("tGXCminer".into(), 50.0, height)])
    }

    #[test]
    fn mem_store_roundtrip() {
        let store = MemStore::new();
        store.put(NS_TX, "abc", b"value").unwrap();
        assert_eq!(store.get(NS_TX, "abc").unwrap().unwrap(), b"value");
        store.delete(NS_TX, "abc").unwrap();
        assert!(store.get(NS_TX, "abc").unwrap().is_none());
    }

    #[test]
    fn scan_is_key_ordered() {
        let store = MemStore::new();
        store.put(NS_BLOCKS_BY_HEIGHT, "0000000002", b"b").unwrap();
        store.put(NS_BLOCKS_BY_HEIGHT, "0000000001", b"a").unwrap();
        let keys: Vec<String> = store
            .scan(NS_BLOCKS_BY_HEIGHT)
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["0000000001", "0000000002"]);
    }

    #[test]
    fn blocks_roundtrip_through_file_store() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JsonFileStore::open(dir.path().to_path_buf()).unwrap();
            save_block(&store, &sample_block(1)).unwrap();
            save_block(&store, &sample_block(2)).unwrap();
        }
        // Reopen from disk.
        let store = JsonFileStore::open(dir.path().to_path_buf()).unwrap();
        let chain = load_chain(&store).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].header.height, 1);
        assert_eq!(chain[1].header.height, 2);
        assert_eq!(chain[0].compute_hash(), Some(chain[0].hash));
    }
}
