use crate::LedgerError;
use gxc_consensus::ConsensusError;
use gxc_core::{amounts_equal, Coin, Transaction, TxOutput, UtxoKey};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtxoEntry {
    pub output: TxOutput,
    /// Block that created the output.
    pub height: u32,
    pub coinbase: bool,
}

/// Authoritative mapping `(tx_hash, index) -> output`, plus tombstones for
/// everything ever spent. Pure values, keyed access only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UtxoSet {
    live: HashMap<UtxoKey, UtxoEntry>,
    spent: HashSet<UtxoKey>,
}

impl UtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &UtxoKey) -> Option<&UtxoEntry> {
        self.live.get(key)
    }

    pub fn contains(&self, key: &UtxoKey) -> bool {
        self.live.contains_key(key)
    }

    pub fn was_spent(&self, key: &UtxoKey) -> bool {
        self.spent.contains(key)
    }

    pub fn insert(&mut self, key: UtxoKey, entry: UtxoEntry) {
        self.live.insert(key, entry);
    }

    /// Remove a live output, leaving a tombstone.
    pub fn spend(&mut self, key: &UtxoKey, tx: &Transaction) -> Result<UtxoEntry, LedgerError> {
        let entry = self
            .live
            .remove(key)
            .ok_or(ConsensusError::UnknownUtxo(tx.hash))?;
        self.spent.insert(*key);
        Ok(entry)
    }

    /// Spend every input of `tx` and insert every output. The caller has
    /// already validated; an unknown input or amount mismatch here aborts
    /// with the set unchanged except for prior transactions.
    pub fn spend_and_apply(&mut self, tx: &Transaction, height: u32) -> Result<(), LedgerError> {
        for input in &tx.inputs {
            let key = UtxoKey::new(input.prev_tx_hash, input.output_index);
            let entry = self
                .live
                .get(&key)
                .ok_or(ConsensusError::UnknownUtxo(tx.hash))?;
            if !amounts_equal(entry.output.amount, input.amount) {
                return Err(ConsensusError::InputAmountMismatch(tx.hash).into());
            }
        }
        for input in &tx.inputs {
            let key = UtxoKey::new(input.prev_tx_hash, input.output_index);
            self.spend(&key, tx)?;
        }
        for (index, output) in tx.outputs.iter().enumerate() {
            self.insert(
                UtxoKey::new(tx.hash, index as u32),
                UtxoEntry {
                    output: output.clone(),
                    height,
                    coinbase: tx.is_coinbase(),
                },
            );
        }
        Ok(())
    }

    pub fn balance_of(&self, address: &str) -> Coin {
        self.live
            .values()
            .filter(|e| e.output.address == address)
            .map(|e| e.output.amount)
            .sum()
    }

    pub fn utxos_of(&self, address: &str) -> Vec<(UtxoKey, UtxoEntry)> {
        let mut found: Vec<(UtxoKey, UtxoEntry)> = self
            .live
            .iter()
            .filter(|(_, e)| e.output.address == address)
            .map(|(k, e)| (*k, e.clone()))
            .collect();
        // Deterministic order for selection and RPC listings.
        found.sort_by_key(|(k, _)| (k.tx_hash, k.index));
        found
    }

    /// Smallest prefix of the address's outputs covering `amount`.
    pub fn select_for_amount(
        &self,
        address: &str,
        amount: Coin,
    ) -> Result<Vec<(UtxoKey, UtxoEntry)>, LedgerError> {
        let mut selected = Vec::new();
        let mut total = 0.0;
        for (key, entry) in self.utxos_of(address) {
            total += entry.output.amount;
            selected.push((key, entry));
            if total + gxc_core::AMOUNT_EPSILON >= amount {
                return Ok(selected);
            }
        }
        Err(LedgerError::InsufficientFunds(address.to_string()))
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Sum of all live outputs.
    pub fn total_value(&self) -> Coin {
        self.live.values().map(|e| e.output.amount).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&UtxoKey, &UtxoEntry)> {
        self.live.iter()
    }
}
