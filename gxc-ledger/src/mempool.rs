use crate::LedgerError;
use gxc_consensus::{validate_transaction, ChainView, ConsensusError, ValidationContext};
use gxc_core::{Block, Hash32, Transaction, UtxoKey};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Deduplicated set of admitted transactions keyed by hash. Admission
/// verifies signatures, traceability, input availability (against the UTXO
/// set and every other mempool transaction) and the taint gate.
#[derive(Default)]
pub struct Mempool {
    txs: HashMap<Hash32, Transaction>,
    order: Vec<Hash32>,
    /// Inputs reserved by admitted transactions.
    reserved: HashMap<UtxoKey, Hash32>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit<V: ChainView>(
        &mut self,
        tx: Transaction,
        view: &V,
        ctx: &ValidationContext<'_>,
    ) -> Result<Hash32, LedgerError> {
        if self.txs.contains_key(&tx.hash) {
            return Err(LedgerError::MempoolDuplicate(tx.hash));
        }
        // Coinbases are only ever constructed by block assembly.
        if tx.is_coinbase() {
            return Err(ConsensusError::CoinbaseValueTooHigh.into());
        }
        for input in &tx.inputs {
            let key = UtxoKey::new(input.prev_tx_hash, input.output_index);
            if self.reserved.contains_key(&key) {
                return Err(LedgerError::MempoolConflict(tx.hash));
            }
        }

        let mut spent = HashSet::new();
        let mut created = HashMap::new();
        validate_transaction(&tx, view, ctx, &mut spent, &mut created)?;
        if view.is_taint_blocked(&tx) {
            return Err(ConsensusError::TaintBlocked(tx.hash).into());
        }

        for input in &tx.inputs {
            self.reserved
                .insert(UtxoKey::new(input.prev_tx_hash, input.output_index), tx.hash);
        }
        let hash = tx.hash;
        self.order.push(hash);
        self.txs.insert(hash, tx);
        debug!(tx = %hex::encode(&hash[..8]), "transaction admitted to mempool");
        Ok(hash)
    }

    pub fn contains(&self, hash: &Hash32) -> bool {
        self.txs.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash32) -> Option<&Transaction> {
        self.txs.get(hash)
    }

    /// Admission-ordered selection for a block template.
    pub fn select(&self, max: usize) -> Vec<Transaction> {
        self.order
            .iter()
            .filter_map(|h| self.txs.get(h))
            .take(max)
            .cloned()
            .collect()
    }

    /// Drop everything committed by a block, plus anything now conflicting
    /// with its spends.
    pub fn remove_committed(&mut self, block: &Block) {
        let mut evicted: HashSet<Hash32> = HashSet::new();
        for tx in &block.transactions {
            evicted.insert(tx.hash);
            for input in &tx.inputs {
                let key = UtxoKey::new(input.prev_tx_hash, input.output_index);
                if let Some(owner) = self.reserved.get(&key) {
                    evicted.insert(*owner);
                }
            }
        }
        self.evict(&evicted);
    }

    /// Drop a set of transactions and release their reservations.
    pub fn evict(&mut self, hashes: &HashSet<Hash32>) {
        if hashes.is_empty() {
            return;
        }
        self.txs.retain(|h, _| !hashes.contains(h));
        self.order.retain(|h| !hashes.contains(h));
        self.reserved.retain(|_, owner| !hashes.contains(owner));
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transaction> {
        self.order.iter().filter_map(|h| self.txs.get(h))
    }
}
