use crate::difficulty::{block_work, meets_target, ChainWork};
use crate::validators::{StakeRecord, ValidatorSet, MIN_STAKE};
use crate::ConsensusError;
use gxc_core::{
    amounts_equal, merkle_root, Block, BlockKind, Hash32, Transaction, TransactionKind, TxOutput,
    UtxoKey,
};
use gxc_crypto::{address_from_public_key, ecdsa_verify, Network};
use gxc_ethash::{header_pow_hash, EthashEngine};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::warn;

/// Two hours of allowed clock drift into the future.
const MAX_FUTURE_DRIFT: u64 = 2 * 60 * 60;

/// Read-only view of the chain a block is validated against. The ledger
/// implements this; entities never hold pointers into it, only keys.
pub trait ChainView {
    fn tip_hash(&self) -> Hash32;
    fn tip_height(&self) -> u32;
    /// Difficulty the next block must carry.
    fn current_difficulty(&self) -> f64;
    /// Median timestamp of the recent past blocks.
    fn median_time_past(&self) -> u64;
    fn utxo(&self, key: &UtxoKey) -> Option<TxOutput>;
    fn validators(&self) -> &ValidatorSet;
    /// Taint gate, evaluated last.
    fn is_taint_blocked(&self, tx: &Transaction) -> bool;
}

pub struct ValidationContext<'a> {
    pub ethash: &'a EthashEngine,
    pub network: Network,
    pub now: u64,
    /// Soft deadline; expiry aborts with a transient error.
    pub timeout: Duration,
}

impl<'a> ValidationContext<'a> {
    pub fn new(ethash: &'a EthashEngine, network: Network, now: u64) -> Self {
        Self {
            ethash,
            network,
            now,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Outcome of a successful validation, fed into fork choice and the apply
/// pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockSummary {
    pub work: ChainWork,
    pub total_fees: f64,
}

/// Full block validation, in order: header linkage, merkle root, block
/// hash, proof of work/stake, per-transaction checks, taint gate. Rejects
/// on the first violation; never applies anything.
pub fn validate_block<V: ChainView>(
    block: &Block,
    view: &V,
    ctx: &ValidationContext<'_>,
) -> Result<BlockSummary, ConsensusError> {
    let started = Instant::now();
    let header = &block.header;

    // 1. Header well-formedness.
    if header.prev_hash != view.tip_hash() {
        return reject(block, ConsensusError::PrevHashMismatch);
    }
    let tip = view.tip_height();
    if header.height != tip + 1 {
        return reject(block, ConsensusError::HeightMismatch { got: header.height, tip });
    }
    if header.timestamp < view.median_time_past() || header.timestamp > ctx.now + MAX_FUTURE_DRIFT {
        return reject(block, ConsensusError::TimestampOutOfRange);
    }
    if (header.difficulty - view.current_difficulty()).abs() > 1e-9 {
        return reject(block, ConsensusError::ProofOfWorkInsufficient);
    }

    // 2. Merkle root.
    if header.merkle_root != merkle_root(&block.transactions) {
        return reject(block, ConsensusError::MerkleMismatch(block.hash));
    }

    // 3 + 4. Block hash and proof, per kind.
    match header.kind {
        BlockKind::PowSha256 => {
            if block.compute_hash() != Some(block.hash) {
                return reject(block, ConsensusError::HashMismatch);
            }
            if !meets_target(&block.hash, header.difficulty) {
                return reject(block, ConsensusError::ProofOfWorkInsufficient);
            }
        }
        BlockKind::PowEthash => {
            let Some(mix) = header.mix_hash else {
                return reject(block, ConsensusError::HashMismatch);
            };
            let pow_hash = header_pow_hash(header);
            if !ctx.ethash.verify(
                &pow_hash,
                header.nonce,
                header.height as u64,
                &block.hash,
                &mix,
            ) {
                return reject(block, ConsensusError::HashMismatch);
            }
            if !meets_target(&block.hash, header.difficulty) {
                return reject(block, ConsensusError::ProofOfWorkInsufficient);
            }
        }
        BlockKind::Pos => {
            if block.compute_hash() != Some(block.hash) {
                return reject(block, ConsensusError::HashMismatch);
            }
            let leader = view
                .validators()
                .select_leader(&header.prev_hash, header.height)
                .ok_or(ConsensusError::ProofOfStakeLeaderWrong)?;
            if leader.address != header.miner {
                return reject(block, ConsensusError::ProofOfStakeLeaderWrong);
            }
            if !leader.is_eligible() {
                return reject(block, ConsensusError::ProofOfStakeLeaderWrong);
            }
            let Some(signature) = header.validator_signature.as_deref() else {
                return reject(block, ConsensusError::SignatureInvalid);
            };
            if !ecdsa_verify(&block.hash, signature, &leader.public_key) {
                return reject(block, ConsensusError::SignatureInvalid);
            }
        }
    }

    // 5. Transactions.
    let mut spent: HashSet<UtxoKey> = HashSet::new();
    let mut created: HashMap<UtxoKey, TxOutput> = HashMap::new();
    let mut total_fees = 0.0;
    for (index, tx) in block.transactions.iter().enumerate() {
        if started.elapsed() > ctx.timeout {
            return reject(block, ConsensusError::ValidationTimeout);
        }
        if tx.is_coinbase() != (index == 0) {
            return reject(block, ConsensusError::CoinbaseValueTooHigh);
        }
        validate_transaction(tx, view, ctx, &mut spent, &mut created)?;
        total_fees += tx.fee;
    }

    // Coinbase pays at most reward + fees.
    if let Some(coinbase) = block.transactions.first().filter(|tx| tx.is_coinbase()) {
        if coinbase.total_output() > header.reward + total_fees + gxc_core::AMOUNT_EPSILON {
            return reject(block, ConsensusError::CoinbaseValueTooHigh);
        }
    }

    // 6. Taint gate.
    for tx in &block.transactions {
        if view.is_taint_blocked(tx) {
            return reject(block, ConsensusError::TaintBlocked(tx.hash));
        }
    }

    Ok(BlockSummary {
        work: block_work(header.difficulty),
        total_fees,
    })
}

/// Per-transaction checks shared between block validation and mempool
/// admission: integrity, traceability, signatures, input existence and
/// conservation.
pub fn validate_transaction<V: ChainView>(
    tx: &Transaction,
    view: &V,
    ctx: &ValidationContext<'_>,
    spent: &mut HashSet<UtxoKey>,
    created: &mut HashMap<UtxoKey, TxOutput>,
) -> Result<(), ConsensusError> {
    if !tx.verify_integrity() {
        return Err(ConsensusError::TxHashMismatch(tx.hash));
    }
    if !tx.verify_traceability() {
        return Err(ConsensusError::TraceabilityViolation(tx.hash));
    }
    if !tx.verify_conservation() {
        return Err(ConsensusError::ConservationViolation(tx.hash));
    }

    match tx.kind {
        TransactionKind::Coinbase => {}
        TransactionKind::Unstake => {
            // Funds come out of the locked stake, not the UTXO set.
            let Some(staker) = tx.recipient() else {
                return Err(ConsensusError::ConservationViolation(tx.hash));
            };
            let record = view
                .validators()
                .get(staker)
                .ok_or(ConsensusError::StakeBelowMinimum)?;
            if record.amount + gxc_core::AMOUNT_EPSILON < tx.total_output() + tx.fee {
                return Err(ConsensusError::StakeBelowMinimum);
            }
        }
        TransactionKind::Stake => {
            let days = tx.stake_duration_days.ok_or(ConsensusError::StakingPeriodInvalid)?;
            let probe = StakeRecord {
                address: String::new(),
                public_key: Vec::new(),
                amount: tx.staked_delta(),
                staked_at_height: 0,
                duration_days: days,
                active: true,
            };
            if !probe.is_staking_period_valid() {
                return Err(ConsensusError::StakingPeriodInvalid);
            }
            if probe.amount < MIN_STAKE {
                return Err(ConsensusError::StakeBelowMinimum);
            }
            check_inputs(tx, view, ctx, spent, created, true)?;
        }
        TransactionKind::Normal => {
            check_inputs(tx, view, ctx, spent, created, true)?;
        }
        TransactionKind::Reversal => {
            // Reversal spends are authorized by the proof of feasibility
            // recorded in the transaction, not by holder signatures.
            if tx.proof_hash.is_none() {
                return Err(ConsensusError::InputSignatureInvalid(tx.hash));
            }
            check_inputs(tx, view, ctx, spent, created, false)?;
        }
    }

    for (i, output) in tx.outputs.iter().enumerate() {
        created.insert(UtxoKey::new(tx.hash, i as u32), output.clone());
    }
    Ok(())
}

fn check_inputs<V: ChainView>(
    tx: &Transaction,
    view: &V,
    ctx: &ValidationContext<'_>,
    spent: &mut HashSet<UtxoKey>,
    created: &HashMap<UtxoKey, TxOutput>,
    require_signatures: bool,
) -> Result<(), ConsensusError> {
    for (index, input) in tx.inputs.iter().enumerate() {
        let key = UtxoKey::new(input.prev_tx_hash, input.output_index);
        if !spent.insert(key) {
            return Err(ConsensusError::DoubleSpend(tx.hash));
        }
        let output = view
            .utxo(&key)
            .or_else(|| created.get(&key).cloned())
            .ok_or(ConsensusError::UnknownUtxo(tx.hash))?;
        if !amounts_equal(output.amount, input.amount) {
            return Err(ConsensusError::InputAmountMismatch(tx.hash));
        }
        if require_signatures {
            let owner = address_from_public_key(&input.public_key, ctx.network);
            if owner != output.address {
                return Err(ConsensusError::InputSignatureInvalid(tx.hash));
            }
            let digest = tx.signing_payload(index as u32);
            if !ecdsa_verify(&digest, &input.signature, &input.public_key) {
                return Err(ConsensusError::InputSignatureInvalid(tx.hash));
            }
        }
    }
    Ok(())
}

fn reject(block: &Block, err: ConsensusError) -> Result<BlockSummary, ConsensusError> {
    warn!(block = %hex::encode(&block.hash[..8]), height = block.header.height, %err, "block rejected");
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::difficulty::block_work;
    use gxc_core::{now_ts, BlockHeader, TxInput};
    use gxc_crypto::generate_keypair;

    struct TestView {
        tip: Hash32,
        height: u32,
        difficulty: f64,
        utxos: HashMap<UtxoKey, TxOutput>,
        validators: ValidatorSet,
    }

    impl TestView {
        fn new() -> Self {
            Self {
                tip: [7u8; 32],
                height: 3,
                difficulty: 0.1,
                utxos: HashMap::new(),
                validators: ValidatorSet::new(),
            }
        }
    }

    impl ChainView for TestView {
        fn tip_hash(&self) -> Hash32 {
            self.tip
        }

        fn tip_height(&self) -> u32 {
            self.height
        }

        fn current_difficulty(&self) -> f64 {
            self.difficulty
        }

        fn median_time_past(&self) -> u64 {
            1_700_000_000
        }

        fn utxo(&self, key: &UtxoKey) -> Option<TxOutput> {
            self.utxos.get(key).cloned()
        }

        fn validators(&self) -> &ValidatorSet {
            &self.validators
        }

        fn is_taint_blocked(&self, _tx: &Transaction) -> bool {
            false
        }
    }

    fn mined_block(view: &TestView) -> Block {
        let coinbase = Transaction::coinbase("tGXCminer".into(), 50.0, view.height + 1);
        let header = BlockHeader {
            height: view.height + 1,
            prev_hash: view.tip,
            merkle_root: gxc_core::ZERO_HASH,
            timestamp: now_ts(),
            nonce: 0,
            difficulty: view.difficulty,
            kind: BlockKind::PowSha256,
            miner: "tGXCminer".into(),
            reward: 50.0,
            validator_signature: None,
            mix_hash: None,
        };
        let mut block = Block::new(header, vec![coinbase]);
        while !meets_target(&block.hash, block.header.difficulty) {
            block.header.nonce += 1;
            block.hash = block.compute_hash().unwrap();
        }
        block
    }

    fn ctx(engine: &gxc_ethash::EthashEngine) -> ValidationContext<'_> {
        ValidationContext::new(engine, Network::Testnet, now_ts())
    }

    #[test]
    fn accepts_a_well_formed_block() {
        let view = TestView::new();
        let engine = gxc_ethash::EthashEngine::new();
        let block = mined_block(&view);
        let summary = validate_block(&block, &view, &ctx(&engine)).unwrap();
        assert_eq!(summary.work, block_work(0.1));
        assert_eq!(summary.total_fees, 0.0);
    }

    #[test]
    fn rejects_bad_linkage_and_timestamps() {
        let view = TestView::new();
        let engine = gxc_ethash::EthashEngine::new();

        let mut wrong_prev = mined_block(&view);
        wrong_prev.header.prev_hash = [1u8; 32];
        assert_eq!(
            validate_block(&wrong_prev, &view, &ctx(&engine)).unwrap_err(),
            ConsensusError::PrevHashMismatch
        );

        let mut wrong_height = mined_block(&view);
        wrong_height.header.height += 1;
        assert!(matches!(
            validate_block(&wrong_height, &view, &ctx(&engine)).unwrap_err(),
            ConsensusError::HeightMismatch { .. }
        ));

        let mut from_the_future = mined_block(&view);
        from_the_future.header.timestamp = now_ts() + 3 * 60 * 60;
        assert_eq!(
            validate_block(&from_the_future, &view, &ctx(&engine)).unwrap_err(),
            ConsensusError::TimestampOutOfRange
        );
    }

    #[test]
    fn rejects_tampered_merkle_and_hash() {
        let view = TestView::new();
        let engine = gxc_ethash::EthashEngine::new();

        let mut bad_merkle = mined_block(&view);
        bad_merkle.header.merkle_root = [2u8; 32];
        assert!(matches!(
            validate_block(&bad_merkle, &view, &ctx(&engine)).unwrap_err(),
            ConsensusError::MerkleMismatch(_)
        ));

        // A nonce change without rehashing invalidates the stored hash.
        let mut stale_hash = mined_block(&view);
        stale_hash.header.nonce += 1;
        assert_eq!(
            validate_block(&stale_hash, &view, &ctx(&engine)).unwrap_err(),
            ConsensusError::HashMismatch
        );
    }

    #[test]
    fn rejects_double_spends_within_a_block() {
        let mut view = TestView::new();
        let engine = gxc_ethash::EthashEngine::new();
        let kp = generate_keypair();
        let owner = gxc_crypto::address_from_public_key(&kp.public_key, Network::Testnet);
        let prev = [9u8; 32];
        view.utxos
            .insert(UtxoKey::new(prev, 0), TxOutput::new(owner.clone(), 10.0));

        let spend = |fee: f64| {
            let mut tx = Transaction::new(
                TransactionKind::Normal,
                vec![TxInput {
                    prev_tx_hash: prev,
                    output_index: 0,
                    amount: 10.0,
                    signature: Vec::new(),
                    public_key: kp.public_key.clone(),
                }],
                vec![TxOutput::new(owner.clone(), 10.0 - fee)],
                fee,
            );
            let digest = tx.signing_payload(0);
            tx.inputs[0].signature = gxc_crypto::ecdsa_sign(&digest, &kp.secret_key).unwrap();
            tx.hash = tx.compute_hash();
            tx
        };

        let coinbase = Transaction::coinbase("tGXCminer".into(), 50.0, view.height + 1);
        let header = BlockHeader {
            height: view.height + 1,
            prev_hash: view.tip,
            merkle_root: gxc_core::ZERO_HASH,
            timestamp: now_ts(),
            nonce: 0,
            difficulty: view.difficulty,
            kind: BlockKind::PowSha256,
            miner: "tGXCminer".into(),
            reward: 50.0,
            validator_signature: None,
            mix_hash: None,
        };
        let mut block = Block::new(header, vec![coinbase, spend(0.0), spend(0.1)]);
        while !meets_target(&block.hash, block.header.difficulty) {
            block.header.nonce += 1;
            block.hash = block.compute_hash().unwrap();
        }
        assert!(matches!(
            validate_block(&block, &view, &ctx(&engine)).unwrap_err(),
            ConsensusError::DoubleSpend(_)
        ));
    }

    #[test]
    fn rejects_unsigned_spends() {
        let mut view = TestView::new();
        let engine = gxc_ethash::EthashEngine::new();
        let kp = generate_keypair();
        let owner = gxc_crypto::address_from_public_key(&kp.public_key, Network::Testnet);
        let prev = [9u8; 32];
        view.utxos
            .insert(UtxoKey::new(prev, 0), TxOutput::new(owner.clone(), 10.0));

        let tx = Transaction::new(
            TransactionKind::Normal,
            vec![TxInput {
                prev_tx_hash: prev,
                output_index: 0,
                amount: 10.0,
                signature: vec![0xde, 0xad],
                public_key: kp.public_key.clone(),
            }],
            vec![TxOutput::new(owner, 10.0)],
            0.0,
        );
        let mut spent = HashSet::new();
        let mut created = HashMap::new();
        assert!(matches!(
            validate_transaction(&tx, &view, &ctx(&engine), &mut spent, &mut created).unwrap_err(),
            ConsensusError::InputSignatureInvalid(_)
        ));
    }
}
