use crate::utxo::UtxoSet;
use crate::LedgerError;
use gxc_consensus::{
    block_work, retarget, ChainWork, ConsensusError, MonetaryPolicy, RetargetParams, StakeRecord,
    ValidatorSet,
};
use gxc_core::{
    floor_to_satoshi, Address, Block, BlockHeader, BlockKind, Coin, Hash32, Transaction,
    TransactionKind, ZERO_HASH,
};
use gxc_crypto::{address_from_public_key, Network};
use gxc_fraud::{ReversalFeePool, TaintChainView};
use primitive_types::U256;
use std::collections::HashMap;
use tracing::{debug, info};

/// Blocks mined per year at the ten-minute target, used to annualize the
/// observed inflation.
const BLOCKS_PER_YEAR: f64 = 52_560.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxLocation {
    Block { height: u32, index: u32 },
    /// Reversal transactions are recorded directly against the chain at the
    /// height they executed.
    Reversal { seq: u32 },
}

/// Chain tip, block store, UTXO set, stake records, supply counters and
/// reversal bookkeeping. One linearizable unit behind the ledger's chain
/// lock.
pub struct ChainState {
    pub network: Network,
    blocks: Vec<Block>,
    by_hash: HashMap<Hash32, u32>,
    tx_index: HashMap<Hash32, TxLocation>,
    /// Forward spend edges: tx -> committed transactions spending it.
    spenders: HashMap<Hash32, Vec<Hash32>>,
    reversal_txs: Vec<(Transaction, u32)>,
    /// stolen tx -> reversal tx, the double-reversal guard.
    reversed: HashMap<Hash32, Hash32>,
    pub utxo: UtxoSet,
    pub validators: ValidatorSet,
    pub total_issued: Coin,
    pub total_burned: Coin,
    pub locked_stake: Coin,
    pub difficulty: f64,
    chain_work: ChainWork,
    /// Cumulative supply after each block, for inflation measurement.
    supply_history: Vec<Coin>,
    retarget_params: RetargetParams,
}

impl ChainState {
    pub fn genesis(network: Network, initial_difficulty: f64, retarget_params: RetargetParams) -> Self {
        let header = BlockHeader {
            height: 0,
            prev_hash: ZERO_HASH,
            merkle_root: ZERO_HASH,
            timestamp: 1_735_689_600, // 2025-01-01, the chain epoch
            nonce: 0,
            difficulty: initial_difficulty,
            kind: BlockKind::PowSha256,
            miner: "genesis".to_string(),
            reward: 0.0,
            validator_signature: None,
            mix_hash: None,
        };
        let genesis = Block::new(header, Vec::new());
        let mut state = Self {
            network,
            blocks: Vec::new(),
            by_hash: HashMap::new(),
            tx_index: HashMap::new(),
            spenders: HashMap::new(),
            reversal_txs: Vec::new(),
            reversed: HashMap::new(),
            utxo: UtxoSet::new(),
            validators: ValidatorSet::new(),
            total_issued: 0.0,
            total_burned: 0.0,
            locked_stake: 0.0,
            difficulty: initial_difficulty,
            chain_work: U256::zero(),
            supply_history: Vec::new(),
            retarget_params,
        };
        state.index_block(&genesis);
        state.blocks.push(genesis);
        state.supply_history.push(0.0);
        state
    }

    // ----- tip accessors -----

    pub fn tip(&self) -> &Block {
        self.blocks.last().expect("genesis always present")
    }

    pub fn tip_hash(&self) -> Hash32 {
        self.tip().hash
    }

    pub fn height(&self) -> u32 {
        self.tip().header.height
    }

    pub fn chain_work(&self) -> ChainWork {
        self.chain_work
    }

    pub fn retarget_params(&self) -> &RetargetParams {
        &self.retarget_params
    }

    /// Median of the last eleven block timestamps.
    pub fn median_time_past(&self) -> u64 {
        let mut recent: Vec<u64> = self
            .blocks
            .iter()
            .rev()
            .take(11)
            .map(|b| b.header.timestamp)
            .collect();
        recent.sort_unstable();
        recent[recent.len() / 2]
    }

    /// Annualized issuance growth over the policy's measurement window.
    /// Assumed on-target (2%) until a usable window of history exists.
    pub fn observed_inflation(&self, window: u32) -> f64 {
        let len = self.supply_history.len();
        if len < 2 {
            return 0.02;
        }
        let span = (window as usize).min(len - 1);
        let now = self.supply_history[len - 1];
        let then = self.supply_history[len - 1 - span];
        if then <= 0.0 {
            return 0.02;
        }
        (now - then) / then * (BLOCKS_PER_YEAR / span as f64)
    }

    // ----- block application -----

    /// Apply an already-validated block: UTXO updates in list order with the
    /// coinbase first, stake mutations, fee burn and pool split, supply
    /// accounting, then retargeting.
    pub fn apply_block(
        &mut self,
        block: Block,
        policy: &MonetaryPolicy,
        burn_rate: f64,
        pool: &mut ReversalFeePool,
    ) -> Result<(), LedgerError> {
        let height = block.header.height;
        let mut producer_fee_share = 0.0;
        let mut coinbase_total = 0.0;

        for tx in &block.transactions {
            self.utxo.spend_and_apply(tx, height)?;
            match tx.kind {
                TransactionKind::Coinbase => {
                    coinbase_total += tx.total_output();
                }
                TransactionKind::Stake => self.apply_stake(tx, height),
                TransactionKind::Unstake => self.apply_unstake(tx),
                TransactionKind::Normal | TransactionKind::Reversal => {}
            }
            if !tx.is_coinbase() && tx.fee > 0.0 {
                let burned = floor_to_satoshi(tx.fee * burn_rate);
                let unburned = tx.fee - burned;
                let split = pool.deposit_tx_fee_split(tx.hash, unburned, policy.pool_split());
                self.total_burned = floor_to_satoshi(self.total_burned + burned);
                producer_fee_share += unburned - split;
            }
        }

        // New coins are the coinbase value minus the recycled fee share.
        let minted = (coinbase_total - producer_fee_share).max(0.0);
        if self.total_issued + minted > gxc_core::MAX_SUPPLY + gxc_core::AMOUNT_EPSILON {
            return Err(ConsensusError::SupplyCapExceeded.into());
        }
        self.total_issued = floor_to_satoshi(self.total_issued + minted);

        self.chain_work += block_work(block.header.difficulty);
        self.index_block(&block);
        self.blocks.push(block);
        self.supply_history.push(self.total_issued);
        self.maybe_retarget();

        debug!(
            height,
            supply = self.total_issued,
            difficulty = self.difficulty,
            "block applied"
        );
        Ok(())
    }

    fn apply_stake(&mut self, tx: &Transaction, height: u32) {
        let staked = tx.staked_delta();
        let Some(input) = tx.inputs.first() else {
            return;
        };
        let address = address_from_public_key(&input.public_key, self.network);
        let days = tx.stake_duration_days.unwrap_or(0);
        self.validators.stake(StakeRecord {
            address,
            public_key: input.public_key.clone(),
            amount: staked,
            staked_at_height: height,
            duration_days: days,
            active: true,
        });
        self.locked_stake = floor_to_satoshi(self.locked_stake + staked);
    }

    fn apply_unstake(&mut self, tx: &Transaction) {
        let Some(staker) = tx.recipient().cloned() else {
            return;
        };
        let released = self.validators.unstake(&staker, tx.total_output() + tx.fee);
        self.locked_stake = floor_to_satoshi((self.locked_stake - released).max(0.0));
    }

    fn index_block(&mut self, block: &Block) {
        self.by_hash.insert(block.hash, block.header.height);
        for (index, tx) in block.transactions.iter().enumerate() {
            self.tx_index.insert(
                tx.hash,
                TxLocation::Block {
                    height: block.header.height,
                    index: index as u32,
                },
            );
            for input in &tx.inputs {
                self.spenders.entry(input.prev_tx_hash).or_default().push(tx.hash);
            }
        }
    }

    fn maybe_retarget(&mut self) {
        let interval = self.retarget_params.interval;
        let height = self.height();
        if height == 0 || height % interval != 0 {
            return;
        }
        let first = &self.blocks[(height - interval) as usize];
        let actual = self.tip().header.timestamp.saturating_sub(first.header.timestamp);
        let new = retarget(self.difficulty, actual, &self.retarget_params);
        if (new - self.difficulty).abs() > f64::EPSILON {
            info!(height, old = self.difficulty, new, "difficulty retarget");
        }
        self.difficulty = new;
    }

    // ----- reversal bookkeeping -----

    /// Record an executed reversal transaction directly against the chain
    /// and apply its UTXO effects. Called under the chain lock only.
    pub fn record_reversal(&mut self, tx: Transaction, stolen_tx: Hash32) -> Result<(), LedgerError> {
        let height = self.height();
        self.utxo.spend_and_apply(&tx, height)?;
        for input in &tx.inputs {
            self.spenders.entry(input.prev_tx_hash).or_default().push(tx.hash);
        }
        self.tx_index.insert(
            tx.hash,
            TxLocation::Reversal {
                seq: self.reversal_txs.len() as u32,
            },
        );
        self.reversed.insert(stolen_tx, tx.hash);
        self.reversal_txs.push((tx, height));
        Ok(())
    }

    /// Executed reversals in execution order: (stolen tx, reversal tx,
    /// execution height). Used for persistence and restart replay.
    pub fn reversal_records(&self) -> Vec<(Hash32, Transaction, u32)> {
        let by_rtx: HashMap<Hash32, Hash32> =
            self.reversed.iter().map(|(stolen, rtx)| (*rtx, *stolen)).collect();
        self.reversal_txs
            .iter()
            .filter_map(|(tx, height)| by_rtx.get(&tx.hash).map(|stolen| (*stolen, tx.clone(), *height)))
            .collect()
    }

    pub fn is_reversed(&self, stolen_tx: &Hash32) -> bool {
        self.reversed.contains_key(stolen_tx)
    }

    pub fn reversal_of(&self, stolen_tx: &Hash32) -> Option<Hash32> {
        self.reversed.get(stolen_tx).copied()
    }

    // ----- queries -----

    pub fn block_by_height(&self, height: u32) -> Option<&Block> {
        self.blocks.get(height as usize)
    }

    pub fn block_by_hash(&self, hash: &Hash32) -> Option<&Block> {
        self.by_hash.get(hash).and_then(|h| self.blocks.get(*h as usize))
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn get_transaction(&self, hash: &Hash32) -> Option<Transaction> {
        match self.tx_index.get(hash)? {
            TxLocation::Block { height, index } => Some(
                self.blocks
                    .get(*height as usize)?
                    .transactions
                    .get(*index as usize)?
                    .clone(),
            ),
            TxLocation::Reversal { seq } => {
                self.reversal_txs.get(*seq as usize).map(|(tx, _)| tx.clone())
            }
        }
    }

    pub fn transaction_height(&self, hash: &Hash32) -> Option<u32> {
        match self.tx_index.get(hash)? {
            TxLocation::Block { height, .. } => Some(*height),
            TxLocation::Reversal { seq } => self.reversal_txs.get(*seq as usize).map(|(_, h)| *h),
        }
    }

    pub fn transaction_timestamp(&self, hash: &Hash32) -> Option<u64> {
        match self.tx_index.get(hash)? {
            TxLocation::Block { height, .. } => {
                self.blocks.get(*height as usize).map(|b| b.header.timestamp)
            }
            TxLocation::Reversal { seq } => {
                self.reversal_txs.get(*seq as usize).map(|(tx, _)| tx.timestamp)
            }
        }
    }

    pub fn balance(&self, address: &str) -> Coin {
        self.utxo.balance_of(address)
    }

    /// Walk `prev_tx_hash` references back toward genesis.
    pub fn trace_lineage(&self, start: &Hash32) -> Vec<Hash32> {
        let mut lineage = Vec::new();
        let mut current = *start;
        while current != ZERO_HASH && lineage.len() < gxc_core::MAX_LINEAGE_DEPTH {
            let Some(tx) = self.get_transaction(&current) else {
                break;
            };
            lineage.push(current);
            if tx.is_coinbase() || tx.prev_tx_hash == ZERO_HASH {
                break;
            }
            current = tx.prev_tx_hash;
        }
        lineage
    }

    /// Check the traceability formula and the referenced output of a
    /// committed transaction.
    pub fn verify_lineage(&self, hash: &Hash32) -> bool {
        let Some(tx) = self.get_transaction(hash) else {
            return false;
        };
        if !tx.verify_traceability() {
            return false;
        }
        if tx.is_traceability_exempt() {
            return true;
        }
        let Some(first) = tx.inputs.first() else {
            return false;
        };
        match self.get_transaction(&tx.prev_tx_hash) {
            Some(prev) => prev
                .outputs
                .get(first.output_index as usize)
                .map(|o| gxc_core::amounts_equal(o.amount, first.amount))
                .unwrap_or(false),
            None => false,
        }
    }

    /// Committed transactions touching an address, newest first, capped at
    /// `depth`.
    pub fn transaction_chain(&self, address: &str, depth: usize) -> Vec<Hash32> {
        let mut found = Vec::new();
        'outer: for block in self.blocks.iter().rev() {
            for tx in block.transactions.iter().rev() {
                let involved = tx.outputs.iter().any(|o| o.address == address)
                    || tx.inputs.iter().any(|i| {
                        address_from_public_key(&i.public_key, self.network) == address
                    });
                if involved {
                    found.push(tx.hash);
                    if found.len() >= depth {
                        break 'outer;
                    }
                }
            }
        }
        found
    }

    pub fn spenders_of(&self, hash: &Hash32) -> Vec<Hash32> {
        self.spenders.get(hash).cloned().unwrap_or_default()
    }

    pub fn address_of(&self, public_key: &[u8]) -> Address {
        address_from_public_key(public_key, self.network)
    }
}

impl TaintChainView for ChainState {
    fn transaction(&self, hash: &Hash32) -> Option<Transaction> {
        self.get_transaction(hash)
    }

    fn spenders(&self, hash: &Hash32) -> Vec<Hash32> {
        self.spenders_of(hash)
    }

    fn tx_block_timestamp(&self, hash: &Hash32) -> Option<u64> {
        self.transaction_timestamp(hash)
    }

    fn tx_block_height(&self, hash: &Hash32) -> Option<u32> {
        self.transaction_height(hash)
    }

    fn balance(&self, address: &str) -> Coin {
        self.balance(address)
    }

    fn chain_height(&self) -> u32 {
        self.height()
    }

    fn reversed_as(&self, stolen: &Hash32) -> Option<Hash32> {
        self.reversal_of(stolen)
    }
}
