use crate::chain::ChainState;
use crate::mempool::Mempool;
use crate::utxo::UtxoEntry;
use crate::LedgerError;
use gxc_consensus::{
    compact_from_target, target_for_difficulty, validate_block, ChainView, ConsensusError,
    MonetaryPolicy, PriceOracle, RetargetParams, StakeRecord, ValidationContext, ValidatorSet,
};
use gxc_core::{
    floor_to_satoshi, now_ts, Address, Block, BlockHeader, BlockKind, Coin, Hash32, Transaction,
    TransactionKind, TxInput, TxOutput, UtxoKey,
};
use gxc_crypto::{ecdsa_sign, Network};
use gxc_ethash::EthashEngine;
use gxc_fraud::{
    generate_proof, validate_proof, AddressRegistry, AlertLevel, EntityKind, FlowPath, FraudAlert,
    FraudStats, PoolStats, ProofOfFeasibility, ReversalError, ReversalFeePool, TaintEngine,
    TaintInfo,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Standard reversal fee, satoshi-denominated like the pool's minimum.
pub use gxc_fraud::pool::STANDARD_FEE;

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub network: Network,
    pub initial_difficulty: f64,
    pub retarget: RetargetParams,
    pub policy: MonetaryPolicy,
    /// Key whose signature approves reversal proofs.
    pub admin_public_key: Vec<u8>,
    pub pool_address: Address,
    pub validation_timeout: Duration,
    pub max_block_txs: usize,
}

impl LedgerConfig {
    pub fn testnet(admin_public_key: Vec<u8>) -> Self {
        Self {
            network: Network::Testnet,
            initial_difficulty: 0.1,
            retarget: RetargetParams::testing(),
            policy: MonetaryPolicy::default(),
            admin_public_key,
            pool_address: "tGXC0000000000000000000000000000feepool".to_string(),
            validation_timeout: Duration::from_secs(5),
            max_block_txs: 2000,
        }
    }

    pub fn mainnet(admin_public_key: Vec<u8>) -> Self {
        Self {
            network: Network::Mainnet,
            initial_difficulty: 4.0,
            retarget: RetargetParams::mainnet(),
            policy: MonetaryPolicy::default(),
            admin_public_key,
            pool_address: "GXC00000000000000000000000000000feepool".to_string(),
            validation_timeout: Duration::from_secs(5),
            max_block_txs: 2000,
        }
    }
}

struct LedgerInner {
    chain: ChainState,
    taint: TaintEngine,
    registry: AddressRegistry,
    pool: ReversalFeePool,
    mempool: Mempool,
    oracle: PriceOracle,
}

/// Chain view that closes over the taint engine for the consensus gate.
struct TaintedView<'a> {
    chain: &'a ChainState,
    taint: &'a TaintEngine,
}

impl ChainView for TaintedView<'_> {
    fn tip_hash(&self) -> Hash32 {
        self.chain.tip_hash()
    }

    fn tip_height(&self) -> u32 {
        self.chain.height()
    }

    fn current_difficulty(&self) -> f64 {
        self.chain.difficulty
    }

    fn median_time_past(&self) -> u64 {
        self.chain.median_time_past()
    }

    fn utxo(&self, key: &UtxoKey) -> Option<TxOutput> {
        self.chain.utxo.get(key).map(|e| e.output.clone())
    }

    fn validators(&self) -> &ValidatorSet {
        &self.chain.validators
    }

    fn is_taint_blocked(&self, tx: &Transaction) -> bool {
        self.taint.should_block_transaction(tx)
    }
}

/// Mining template served by `getblocktemplate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockTemplate {
    pub previous_block_hash: String,
    pub height: u32,
    pub difficulty: f64,
    pub target: String,
    pub bits: u32,
    pub merkle_root: String,
    pub coinbase_value: Coin,
    pub curtime: u64,
    pub coinbase: Transaction,
    pub transactions: Vec<Transaction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainInfo {
    pub chain: String,
    pub blocks: u32,
    pub best_block_hash: String,
    pub difficulty: f64,
    pub chain_work: String,
    pub total_issued: Coin,
    pub total_burned: Coin,
    pub locked_stake: Coin,
    pub mempool_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StakingInfo {
    pub validator_count: usize,
    pub active_validators: usize,
    pub total_weighted_stake: f64,
    pub locked_stake: Coin,
}

/// The ledger-consensus core. Owns chain state, the taint engine, the fee
/// pool and the address registry as siblings behind one chain lock; block
/// apply, taint update and alert emission happen inside a single write
/// critical section.
pub struct LedgerCore {
    config: LedgerConfig,
    ethash: EthashEngine,
    inner: RwLock<LedgerInner>,
}

impl LedgerCore {
    pub fn new(config: LedgerConfig) -> Self {
        let chain = ChainState::genesis(
            config.network,
            config.initial_difficulty,
            config.retarget.clone(),
        );
        let pool = ReversalFeePool::new(config.pool_address.clone());
        Self {
            config,
            ethash: EthashEngine::new(),
            inner: RwLock::new(LedgerInner {
                chain,
                taint: TaintEngine::new(),
                registry: AddressRegistry::new(),
                pool,
                mempool: Mempool::new(),
                oracle: PriceOracle::new(),
            }),
        }
    }

    pub fn network(&self) -> Network {
        self.config.network
    }

    pub fn ethash(&self) -> &EthashEngine {
        &self.ethash
    }

    fn context(&self) -> ValidationContext<'_> {
        let mut ctx = ValidationContext::new(&self.ethash, self.config.network, now_ts());
        ctx.timeout = self.config.validation_timeout;
        ctx
    }

    // ----- mempool -----

    pub fn submit_transaction(&self, tx: Transaction) -> Result<Hash32, LedgerError> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        if inner.chain.get_transaction(&tx.hash).is_some() {
            return Err(LedgerError::MempoolDuplicate(tx.hash));
        }
        let ctx = self.context();
        let view = TaintedView {
            chain: &inner.chain,
            taint: &inner.taint,
        };
        inner.mempool.admit(tx, &view, &ctx)
    }

    pub fn mempool_size(&self) -> usize {
        self.inner.read().mempool.len()
    }

    // ----- block assembly -----

    /// Producer-facing template: reward and fee economics resolved, coinbase
    /// constructed, merkle root over `[coinbase || selected]`.
    pub fn block_template(&self, miner: &str) -> BlockTemplate {
        let guard = self.inner.read();
        let inner = &*guard;
        let chain = &inner.chain;
        let height = chain.height() + 1;
        let difficulty = chain.difficulty;

        let inflation = chain.observed_inflation(self.config.policy.measurement_window);
        let ratio = inner.oracle.price_ratio();
        let reward = self.config.policy.capped_mint(
            chain.total_issued,
            self.config.policy.effective_reward(height, inflation, ratio),
        );
        let burn_rate = self.config.policy.fee_burn_rate(inflation);

        let transactions = inner.mempool.select(self.config.max_block_txs);
        let mut producer_share = 0.0;
        for tx in &transactions {
            let burned = floor_to_satoshi(tx.fee * burn_rate);
            let unburned = tx.fee - burned;
            let split = floor_to_satoshi(unburned * self.config.policy.pool_split());
            producer_share += unburned - split;
        }
        let coinbase_value = floor_to_satoshi(reward + producer_share);
        let coinbase = Transaction::coinbase(miner.to_string(), coinbase_value, height);

        let mut all = Vec::with_capacity(transactions.len() + 1);
        all.push(coinbase.clone());
        all.extend(transactions.iter().cloned());
        let merkle = gxc_core::merkle_root(&all);
        let target = target_for_difficulty(difficulty);

        BlockTemplate {
            previous_block_hash: hex::encode(chain.tip_hash()),
            height,
            difficulty,
            target: format!("{target:064x}"),
            bits: compact_from_target(target),
            merkle_root: hex::encode(merkle),
            coinbase_value,
            curtime: now_ts(),
            coinbase,
            transactions,
        }
    }

    /// Assemble an unmined candidate block from the current template. PoW
    /// callers search the nonce; PoS callers sign with
    /// [`sign_pos_block`].
    pub fn propose_block(&self, miner: &str, kind: BlockKind) -> Block {
        let template = self.block_template(miner);
        let mut txs = Vec::with_capacity(template.transactions.len() + 1);
        txs.push(template.coinbase.clone());
        txs.extend(template.transactions.iter().cloned());
        let header = BlockHeader {
            height: template.height,
            prev_hash: gxc_core::hash_from_hex(&template.previous_block_hash).expect("own encoding"),
            merkle_root: gxc_core::ZERO_HASH, // set by Block::new
            timestamp: template.curtime,
            nonce: 0,
            difficulty: template.difficulty,
            kind,
            miner: miner.to_string(),
            reward: template.coinbase_value,
            validator_signature: None,
            mix_hash: None,
        };
        Block::new(header, txs)
    }

    /// Validate and commit a block. UTXO update, taint propagation and alert
    /// emission all happen before the chain lock releases; on any failure
    /// the state is rolled back to the pre-block checkpoint.
    pub fn submit_block(&self, block: Block) -> Result<Hash32, LedgerError> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let ctx = self.context();

        let inflation = inner
            .chain
            .observed_inflation(self.config.policy.measurement_window);
        let ratio = inner.oracle.price_ratio();
        let expected_reward = self.config.policy.capped_mint(
            inner.chain.total_issued,
            self.config
                .policy
                .effective_reward(block.header.height, inflation, ratio),
        );
        if block.header.reward > expected_reward + block.total_fees() + gxc_core::AMOUNT_EPSILON {
            return Err(ConsensusError::CoinbaseValueTooHigh.into());
        }

        {
            let view = TaintedView {
                chain: &inner.chain,
                taint: &inner.taint,
            };
            validate_block(&block, &view, &ctx)?;
        }

        let burn_rate = self.config.policy.fee_burn_rate(inflation);
        let checkpoint = (
            inner.chain.utxo.clone(),
            inner.chain.validators.clone(),
            inner.pool.clone(),
            inner.chain.total_issued,
            inner.chain.total_burned,
            inner.chain.locked_stake,
        );
        if let Err(err) = inner.chain.apply_block(
            block.clone(),
            &self.config.policy,
            burn_rate,
            &mut inner.pool,
        ) {
            // Roll the whole block back; commits are all-or-nothing.
            inner.chain.utxo = checkpoint.0;
            inner.chain.validators = checkpoint.1;
            inner.pool = checkpoint.2;
            inner.chain.total_issued = checkpoint.3;
            inner.chain.total_burned = checkpoint.4;
            inner.chain.locked_stake = checkpoint.5;
            warn!(%err, "block apply failed, state restored");
            return Err(err);
        }

        // Incremental taint pass and alert emission, still inside the lock:
        // a reader never sees a committed tx without its taint.
        inner
            .taint
            .on_block_committed(&block, &inner.chain, &inner.registry);
        inner.mempool.remove_committed(&block);

        info!(
            height = block.header.height,
            hash = %hex::encode(&block.hash[..8]),
            txs = block.transactions.len(),
            "block committed"
        );
        Ok(block.hash)
    }

    // ----- fraud / taint -----

    pub fn mark_stolen(&self, tx_hash: Hash32) {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        inner.taint.mark_stolen(tx_hash, &inner.chain, &inner.registry);
    }

    pub fn taint_score(&self, tx_hash: &Hash32) -> f64 {
        self.inner.read().taint.taint_score(tx_hash)
    }

    pub fn taint_info(&self, tx_hash: &Hash32) -> Option<TaintInfo> {
        self.inner.read().taint.taint_info(tx_hash).cloned()
    }

    pub fn alerts(&self, min_level: AlertLevel) -> Vec<FraudAlert> {
        self.inner
            .read()
            .taint
            .alerts(min_level)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<FraudAlert> {
        self.inner.read().taint.subscribe()
    }

    pub fn fraud_stats(&self) -> FraudStats {
        self.inner.read().taint.statistics()
    }

    pub fn trace_taint(&self, start: &Hash32, max_hops: u32) -> Vec<FlowPath> {
        let guard = self.inner.read();
        guard
            .taint
            .trace_tainted_flow(start, max_hops, &guard.chain, &guard.registry)
    }

    pub fn flag_address(&self, address: &str, reason: &str) {
        self.inner.write().taint.flag_address(address, reason);
    }

    // ----- clean-zone registry -----

    pub fn register_clean_zone(&self, address: &str, kind: EntityKind, name: &str, website: &str, verifier: &str) {
        self.inner
            .write()
            .registry
            .register(address, kind, name, website, verifier);
    }

    pub fn unregister_clean_zone(&self, address: &str) -> bool {
        self.inner.write().registry.unregister(address)
    }

    pub fn is_clean_zone(&self, address: &str) -> bool {
        self.inner.read().registry.is_registered(address)
    }

    pub fn export_registry(&self) -> String {
        self.inner.read().registry.export_lines()
    }

    pub fn import_registry(&self, data: &str) -> usize {
        self.inner.write().registry.import_lines(data)
    }

    // ----- reversal pipeline -----

    /// Flat fee every reversal pays from the pool.
    pub fn calculate_fee(_amount: Coin) -> Coin {
        STANDARD_FEE
    }

    pub fn generate_reversal_proof(
        &self,
        stolen_tx: Hash32,
        current_holder: &str,
        admin_id: &str,
        admin_secret: &[u8],
    ) -> Result<ProofOfFeasibility, LedgerError> {
        let guard = self.inner.read();
        generate_proof(
            &guard.chain,
            &guard.taint,
            &guard.registry,
            self.config.network,
            stolen_tx,
            current_holder,
            admin_id,
            admin_secret,
        )
        .map_err(Into::into)
    }

    pub fn validate_reversal_proof(&self, proof: &ProofOfFeasibility) -> Result<(), LedgerError> {
        let guard = self.inner.read();
        if guard.chain.is_reversed(&proof.stolen_tx) {
            return Err(ReversalError::AlreadyReversed.into());
        }
        validate_proof(proof, &guard.chain, &guard.taint, &self.config.admin_public_key)
            .map_err(Into::into)
    }

    /// Execute an approved reversal under one critical section: debit the
    /// holder, credit the victim, pay the fee from the pool, mark the stolen
    /// transaction reversed and deposit the execution-fee split. All checks
    /// run before the first write, so a failure leaves nothing applied.
    pub fn execute_reversal(&self, proof: &ProofOfFeasibility) -> Result<Hash32, LedgerError> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        // Feasibility gate.
        if inner.chain.is_reversed(&proof.stolen_tx) {
            return Err(ReversalError::AlreadyReversed.into());
        }
        validate_proof(proof, &inner.chain, &inner.taint, &self.config.admin_public_key)?;
        let fee = Self::calculate_fee(proof.recoverable_amount);
        if !inner.pool.has_sufficient_funds(fee) {
            return Err(ReversalError::InsufficientPoolBalance.into());
        }

        // Construct the reversal transaction from the holder's outputs.
        let selected = inner
            .chain
            .utxo
            .select_for_amount(&proof.current_holder, proof.recoverable_amount)?;
        let selected_total: Coin = selected.iter().map(|(_, e)| e.output.amount).sum();
        let inputs: Vec<TxInput> = selected
            .iter()
            .map(|(key, entry)| TxInput {
                prev_tx_hash: key.tx_hash,
                output_index: key.index,
                amount: entry.output.amount,
                signature: Vec::new(),
                public_key: Vec::new(),
            })
            .collect();
        let mut outputs = vec![TxOutput::new(proof.origin_owner.clone(), proof.recoverable_amount)];
        let change = floor_to_satoshi(selected_total - proof.recoverable_amount);
        if change > 0.0 {
            outputs.push(TxOutput::new(proof.current_holder.clone(), change));
        }
        let mut rtx = Transaction::new(TransactionKind::Reversal, inputs, outputs, fee);
        rtx.proof_hash = Some(proof.proof_hash);
        rtx.hash = rtx.compute_hash();

        // Commit: every remaining step is infallible after the checks above.
        inner
            .pool
            .deduct_fee(rtx.hash, fee, &proof.origin_owner, &proof.approved_by)?;
        inner.chain.record_reversal(rtx.clone(), proof.stolen_tx)?;
        inner.pool.deposit_reversal_exec_fee(
            rtx.hash,
            proof.recoverable_amount,
            gxc_fraud::pool::DEFAULT_EXEC_FEE,
        );

        info!(
            reversal = %hex::encode(&rtx.hash[..8]),
            stolen = %hex::encode(&proof.stolen_tx[..8]),
            victim = %proof.origin_owner,
            amount = proof.recoverable_amount,
            "reversal executed"
        );
        Ok(rtx.hash)
    }

    // ----- fee pool -----

    pub fn pool_balance(&self) -> Coin {
        self.inner.read().pool.balance()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.read().pool.statistics()
    }

    pub fn fund_pool(&self, tx_hash: Hash32, from: &str, amount: Coin, note: &str) {
        self.inner
            .write()
            .pool
            .record_manual_funding(tx_hash, from, amount, note);
    }

    // ----- oracle -----

    pub fn submit_price(&self, oracle_id: &str, gold_price: f64, gxc_price: f64) {
        self.inner
            .write()
            .oracle
            .submit(oracle_id, gold_price, gxc_price, now_ts());
    }

    // ----- queries -----

    pub fn chain_info(&self) -> ChainInfo {
        let guard = self.inner.read();
        ChainInfo {
            chain: match self.config.network {
                Network::Mainnet => "main".to_string(),
                Network::Testnet => "test".to_string(),
                Network::Regtest => "regtest".to_string(),
            },
            blocks: guard.chain.height(),
            best_block_hash: hex::encode(guard.chain.tip_hash()),
            difficulty: guard.chain.difficulty,
            chain_work: format!("{:064x}", guard.chain.chain_work()),
            total_issued: guard.chain.total_issued,
            total_burned: guard.chain.total_burned,
            locked_stake: guard.chain.locked_stake,
            mempool_size: guard.mempool.len(),
        }
    }

    pub fn staking_info(&self) -> StakingInfo {
        let guard = self.inner.read();
        StakingInfo {
            validator_count: guard.chain.validators.len(),
            active_validators: guard.chain.validators.active_validators().len(),
            total_weighted_stake: guard.chain.validators.total_weighted_stake(),
            locked_stake: guard.chain.locked_stake,
        }
    }

    pub fn validators(&self) -> Vec<StakeRecord> {
        self.inner.read().chain.validators.iter().cloned().collect()
    }

    pub fn validator(&self, address: &str) -> Option<StakeRecord> {
        self.inner.read().chain.validators.get(address).cloned()
    }

    pub fn height(&self) -> u32 {
        self.inner.read().chain.height()
    }

    pub fn tip_hash(&self) -> Hash32 {
        self.inner.read().chain.tip_hash()
    }

    pub fn difficulty(&self) -> f64 {
        self.inner.read().chain.difficulty
    }

    pub fn balance(&self, address: &str) -> Coin {
        self.inner.read().chain.balance(address)
    }

    pub fn utxos_of(&self, address: &str) -> Vec<(UtxoKey, UtxoEntry)> {
        self.inner.read().chain.utxo.utxos_of(address)
    }

    pub fn block_by_height(&self, height: u32) -> Option<Block> {
        self.inner.read().chain.block_by_height(height).cloned()
    }

    pub fn block_by_hash(&self, hash: &Hash32) -> Option<Block> {
        self.inner.read().chain.block_by_hash(hash).cloned()
    }

    pub fn transaction(&self, hash: &Hash32) -> Option<Transaction> {
        let guard = self.inner.read();
        guard
            .chain
            .get_transaction(hash)
            .or_else(|| guard.mempool.get(hash).cloned())
    }

    pub fn transaction_height(&self, hash: &Hash32) -> Option<u32> {
        self.inner.read().chain.transaction_height(hash)
    }

    pub fn trace_lineage(&self, start: &Hash32) -> Vec<Hash32> {
        self.inner.read().chain.trace_lineage(start)
    }

    pub fn verify_lineage(&self, hash: &Hash32) -> bool {
        self.inner.read().chain.verify_lineage(hash)
    }

    pub fn transaction_chain(&self, address: &str, depth: usize) -> Vec<Hash32> {
        self.inner.read().chain.transaction_chain(address, depth)
    }

    pub fn reversal_of(&self, stolen: &Hash32) -> Option<Hash32> {
        self.inner.read().chain.reversal_of(stolen)
    }

    pub fn total_issued(&self) -> Coin {
        self.inner.read().chain.total_issued
    }

    /// Rebuild in-memory state at startup by replaying persisted blocks and
    /// executed reversals in height order. Blocks are trusted (they were
    /// validated when first committed). The pool and taint snapshots are
    /// imported separately afterwards, as the authoritative state.
    pub fn restore(
        &self,
        blocks: Vec<Block>,
        reversals: Vec<(Hash32, Transaction, u32)>,
    ) -> Result<(), LedgerError> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let mut pending = reversals.into_iter().peekable();
        for block in blocks {
            if block.header.height == 0 {
                continue;
            }
            let inflation = inner
                .chain
                .observed_inflation(self.config.policy.measurement_window);
            let burn_rate = self.config.policy.fee_burn_rate(inflation);
            inner
                .chain
                .apply_block(block, &self.config.policy, burn_rate, &mut inner.pool)?;
            // Reversals interleave with blocks at their execution height.
            while pending
                .peek()
                .map(|(_, _, height)| *height <= inner.chain.height())
                .unwrap_or(false)
            {
                let (stolen, rtx, _) = pending.next().expect("peeked");
                inner.chain.record_reversal(rtx, stolen)?;
            }
        }
        for (stolen, rtx, _) in pending {
            inner.chain.record_reversal(rtx, stolen)?;
        }
        Ok(())
    }

    pub fn export_reversals(&self) -> Vec<(Hash32, Transaction, u32)> {
        self.inner.read().chain.reversal_records()
    }

    pub fn export_taint_snapshot(&self) -> gxc_fraud::taint::TaintSnapshot {
        self.inner.read().taint.export_snapshot()
    }

    pub fn import_taint_snapshot(&self, snapshot: gxc_fraud::taint::TaintSnapshot) {
        self.inner.write().taint.import_snapshot(snapshot);
    }

    pub fn export_pool_lines(&self) -> String {
        self.inner.read().pool.export_lines()
    }

    /// Replace the pool with its persisted state; the snapshot wins over
    /// whatever replay re-accumulated.
    pub fn import_pool_lines(&self, lines: &str) -> bool {
        match ReversalFeePool::import_lines(lines) {
            Some(pool) => {
                self.inner.write().pool = pool;
                true
            }
            None => false,
        }
    }
}

/// Grind nonces until a SHA-256d block meets its difficulty target.
pub fn mine_sha256(block: &mut Block) {
    loop {
        block.hash = block.compute_hash().expect("sha256 kind");
        if gxc_consensus::difficulty::meets_target(&block.hash, block.header.difficulty) {
            return;
        }
        block.header.nonce += 1;
    }
}

/// Grind nonces for an Ethash block; stores the winning result and mix.
pub fn mine_ethash(block: &mut Block, engine: &EthashEngine) {
    let pow_hash = gxc_ethash::header_pow_hash(&block.header);
    loop {
        let (result, mix) = engine.hash_light(
            &pow_hash,
            block.header.nonce,
            block.header.height as u64,
        );
        if gxc_consensus::difficulty::meets_target(&result, block.header.difficulty) {
            block.hash = result;
            block.header.mix_hash = Some(mix);
            return;
        }
        block.header.nonce += 1;
    }
}

/// Sign a PoS candidate with the slot leader's key.
pub fn sign_pos_block(block: &mut Block, secret: &[u8]) -> Result<(), gxc_crypto::CryptoError> {
    block.hash = block.compute_hash().expect("pos kind");
    let signature = ecdsa_sign(&block.hash, secret)?;
    block.header.validator_signature = Some(signature);
    Ok(())
}
