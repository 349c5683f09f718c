use gxc_consensus::{better_tip, block_work, MonetaryPolicy};
use gxc_core::{
    amounts_equal, now_ts, Hash32, Transaction, TransactionKind, TxInput, TxOutput, UtxoKey,
};
use gxc_crypto::{address_from_public_key, ecdsa_sign, generate_keypair, KeyPair, Network};
use gxc_fraud::{AlertLevel, AlertRule, EntityKind, ReversalError};
use gxc_ledger::core::{mine_sha256, sign_pos_block};
use gxc_ledger::{LedgerConfig, LedgerCore, LedgerError};

fn addr(kp: &KeyPair) -> String {
    address_from_public_key(&kp.public_key, Network::Testnet)
}

fn testnet_core() -> (LedgerCore, KeyPair) {
    let admin = generate_keypair();
    let core = LedgerCore::new(LedgerConfig::testnet(admin.public_key.clone()));
    (core, admin)
}

/// Build a signed transaction spending the given outputs of their owner.
fn signed_tx(
    kind: TransactionKind,
    spends: &[(Hash32, u32, f64, &KeyPair)],
    outputs: Vec<TxOutput>,
    fee: f64,
) -> Transaction {
    let inputs = spends
        .iter()
        .map(|(prev, index, amount, kp)| TxInput {
            prev_tx_hash: *prev,
            output_index: *index,
            amount: *amount,
            signature: Vec::new(),
            public_key: kp.public_key.clone(),
        })
        .collect();
    let mut tx = Transaction::new(kind, inputs, outputs, fee);
    for (i, (_, _, _, kp)) in spends.iter().enumerate() {
        let digest = tx.signing_payload(i as u32);
        tx.inputs[i].signature = ecdsa_sign(&digest, &kp.secret_key).unwrap();
    }
    tx.hash = tx.compute_hash();
    tx
}

/// Mine a SHA-256d block at the next height, with a controlled timestamp
/// offset so velocity alerts only fire when a test wants them to.
fn mine_next(core: &LedgerCore, miner: &str, ts_offset: u64) -> Hash32 {
    let mut block = core.propose_block(miner, gxc_core::BlockKind::PowSha256);
    block.header.timestamp = now_ts() + ts_offset;
    mine_sha256(&mut block);
    core.submit_block(block).unwrap()
}

#[test]
fn genesis_and_first_block_pay_the_base_reward() {
    let (core, _) = testnet_core();
    let miner = generate_keypair();
    let miner_addr = addr(&miner);
    assert_eq!(core.height(), 0);
    assert!(amounts_equal(core.total_issued(), 0.0));

    mine_next(&core, &miner_addr, 0);

    assert_eq!(core.height(), 1);
    assert!(amounts_equal(core.balance(&miner_addr), 50.0));
    assert!(amounts_equal(core.total_issued(), 50.0));
}

#[test]
fn halving_math() {
    let policy = MonetaryPolicy::default();
    assert!(amounts_equal(policy.base_reward(1_051_200), 25.0));
}

#[test]
fn traceability_violation_is_rejected() {
    let (core, _) = testnet_core();
    let owner = generate_keypair();
    let owner_addr = addr(&owner);
    mine_next(&core, &owner_addr, 0);
    let coinbase = core.block_by_height(1).unwrap().transactions[0].clone();

    let mut tx = signed_tx(
        TransactionKind::Normal,
        &[(coinbase.hash, 0, 50.0, &owner)],
        vec![TxOutput::new(owner_addr.clone(), 50.0)],
        0.0,
    );
    // Break the redundant reference: the amount no longer matches the
    // first input.
    tx.referenced_amount = 49.99;
    tx.hash = tx.compute_hash();

    let err = core.submit_transaction(tx).unwrap_err();
    assert!(matches!(
        err,
        LedgerError::Consensus(gxc_consensus::ConsensusError::TraceabilityViolation(_))
    ));
}

#[test]
fn block_hashes_are_stable_over_the_chain() {
    let (core, _) = testnet_core();
    let miner = generate_keypair();
    let miner_addr = addr(&miner);
    for _ in 0..3 {
        mine_next(&core, &miner_addr, 0);
    }
    for height in 1..=3 {
        let block = core.block_by_height(height).unwrap();
        assert_eq!(block.compute_hash(), Some(block.hash));
        for tx in &block.transactions {
            assert!(tx.verify_integrity());
        }
    }
}

#[test]
fn fork_choice_prefers_work_then_lower_hash() {
    let work = block_work(4.0);
    let a = {
        let mut h = [0u8; 32];
        h[0] = 0x0a;
        h
    };
    let b = {
        let mut h = [0u8; 32];
        h[0] = 0x0b;
        h
    };
    assert!(better_tip(work, &a, work, &b));
    assert!(better_tip(work + block_work(1.0), &b, work, &a));
}

/// The full fraud scenario: theft, propagation with conservation weights,
/// clean-zone absorption, proof of feasibility, reversal, idempotence.
#[test]
fn taint_propagation_and_reversal() {
    let (core, admin) = testnet_core();
    let victim = generate_keypair();
    let thief = generate_keypair();
    let holder = generate_keypair();
    let victim_addr = addr(&victim);
    let thief_addr = addr(&thief);
    let holder_addr = addr(&holder);
    let exchange_addr = "tGXCffffffffffffffffffffffffffexchange".to_string();
    core.register_clean_zone(&exchange_addr, EntityKind::Exchange, "BigExchange", "", "audit");

    // Four coinbases to the victim.
    let mut coinbases = Vec::new();
    for i in 0..4u64 {
        mine_next(&core, &victim_addr, i * 400);
        let block = core.block_by_height(core.height()).unwrap();
        coinbases.push(block.transactions[0].clone());
    }

    // Clean funding F: victim pays the thief 40 + 60.
    let funding = signed_tx(
        TransactionKind::Normal,
        &[
            (coinbases[0].hash, 0, 50.0, &victim),
            (coinbases[1].hash, 0, 50.0, &victim),
        ],
        vec![
            TxOutput::new(thief_addr.clone(), 40.0),
            TxOutput::new(thief_addr.clone(), 60.0),
        ],
        0.0,
    );
    // The theft A: 100 coins of the victim's, as 60 + 40 to the thief.
    let theft = signed_tx(
        TransactionKind::Normal,
        &[
            (coinbases[2].hash, 0, 50.0, &victim),
            (coinbases[3].hash, 0, 50.0, &victim),
        ],
        vec![
            TxOutput::new(thief_addr.clone(), 60.0),
            TxOutput::new(thief_addr.clone(), 40.0),
        ],
        0.0,
    );
    core.submit_transaction(funding.clone()).unwrap();
    core.submit_transaction(theft.clone()).unwrap();
    mine_next(&core, &victim_addr, 4 * 400);
    assert_eq!(core.height(), 5);

    core.mark_stolen(theft.hash);
    assert!(amounts_equal(core.taint_score(&theft.hash), 1.0));

    // B: 60 tainted + 40 clean into the exchange. tau = 60/100.
    let to_exchange = signed_tx(
        TransactionKind::Normal,
        &[
            (theft.hash, 0, 60.0, &thief),
            (funding.hash, 0, 40.0, &thief),
        ],
        vec![TxOutput::new(exchange_addr.clone(), 99.99)],
        0.01,
    );
    core.submit_transaction(to_exchange.clone()).unwrap();
    mine_next(&core, &victim_addr, 5 * 400);

    // C: 40 tainted + 60 clean, 40 of it parked with the holder. tau = 40/100.
    let to_holder = signed_tx(
        TransactionKind::Normal,
        &[
            (theft.hash, 1, 40.0, &thief),
            (funding.hash, 1, 60.0, &thief),
        ],
        vec![
            TxOutput::new(holder_addr.clone(), 40.0),
            TxOutput::new(thief_addr.clone(), 59.98),
        ],
        0.02,
    );
    core.submit_transaction(to_holder.clone()).unwrap();
    mine_next(&core, &victim_addr, 6 * 400);

    // Taint conservation.
    assert!((core.taint_score(&to_exchange.hash) - 0.6).abs() < 1e-9);
    assert!((core.taint_score(&to_holder.hash) - 0.4).abs() < 1e-9);

    // One clean-zone-entry alert, for the exchange deposit.
    let alerts = core.alerts(AlertLevel::Low);
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].rule, AlertRule::CleanZoneEntry);
    assert_eq!(alerts[0].transaction_hash, to_exchange.hash);
    assert_eq!(alerts[0].address, exchange_addr);

    // The pool funded itself from the two transaction fees.
    let pool_before = core.pool_balance();
    assert!(pool_before > 0.00001);

    // Proof of feasibility against the holder: recoverable = floor(0.4 * 40).
    let proof = core
        .generate_reversal_proof(theft.hash, &holder_addr, "admin-1", &admin.secret_key)
        .unwrap();
    assert!((proof.taint_score - 0.4).abs() < 1e-9);
    assert!(amounts_equal(proof.recoverable_amount, 16.0));
    assert_eq!(proof.origin_owner, victim_addr);
    core.validate_reversal_proof(&proof).unwrap();

    let victim_before = core.balance(&victim_addr);
    let rtx_hash = core.execute_reversal(&proof).unwrap();

    assert!(amounts_equal(core.balance(&holder_addr), 24.0));
    assert!(amounts_equal(core.balance(&victim_addr), victim_before + 16.0));
    assert_eq!(core.reversal_of(&theft.hash), Some(rtx_hash));

    // Pool paid the standard fee and earned the 0.2% execution split.
    let stats = core.pool_stats();
    assert!(amounts_equal(stats.total_spent, 0.00001));
    assert!(amounts_equal(core.pool_balance(), pool_before - 0.00001 + 0.032));

    // Reversal transactions are traceable and conserved.
    let rtx = core.transaction(&rtx_hash).unwrap();
    assert_eq!(rtx.kind, TransactionKind::Reversal);
    assert_eq!(rtx.proof_hash, Some(proof.proof_hash));
    assert!(rtx.verify_conservation());

    // Double reversal is rejected.
    let err = core.execute_reversal(&proof).unwrap_err();
    assert!(matches!(err, LedgerError::Reversal(ReversalError::AlreadyReversed)));

    // A fresh core restored from the persisted blocks and reversal log
    // agrees on balances and keeps the double-reversal guard.
    let restored = LedgerCore::new(LedgerConfig::testnet(admin.public_key.clone()));
    let blocks = (1..=core.height())
        .map(|h| core.block_by_height(h).unwrap())
        .collect();
    restored.restore(blocks, core.export_reversals()).unwrap();
    assert!(amounts_equal(restored.balance(&holder_addr), 24.0));
    assert!(amounts_equal(restored.balance(&victim_addr), core.balance(&victim_addr)));
    assert_eq!(restored.reversal_of(&theft.hash), Some(rtx_hash));
}

#[test]
fn critically_tainted_spends_are_blocked() {
    let (core, _) = testnet_core();
    let victim = generate_keypair();
    let thief = generate_keypair();
    let victim_addr = addr(&victim);
    let thief_addr = addr(&thief);

    mine_next(&core, &victim_addr, 0);
    let coinbase = core.block_by_height(1).unwrap().transactions[0].clone();
    let theft = signed_tx(
        TransactionKind::Normal,
        &[(coinbase.hash, 0, 50.0, &victim)],
        vec![TxOutput::new(thief_addr.clone(), 50.0)],
        0.0,
    );
    core.submit_transaction(theft.clone()).unwrap();
    mine_next(&core, &victim_addr, 400);
    core.mark_stolen(theft.hash);

    // Spending fully tainted funds is gated by the taint engine.
    let launder = signed_tx(
        TransactionKind::Normal,
        &[(theft.hash, 0, 50.0, &thief)],
        vec![TxOutput::new(thief_addr.clone(), 50.0)],
        0.0,
    );
    let err = core.submit_transaction(launder).unwrap_err();
    assert!(matches!(
        err,
        LedgerError::Consensus(gxc_consensus::ConsensusError::TaintBlocked(_))
    ));
}

#[test]
fn stake_unstake_and_pos_block() {
    let (core, _) = testnet_core();
    let staker = generate_keypair();
    let staker_addr = addr(&staker);

    mine_next(&core, &staker_addr, 0);
    mine_next(&core, &staker_addr, 400);
    let cb1 = core.block_by_height(1).unwrap().transactions[0].clone();
    let cb2 = core.block_by_height(2).unwrap().transactions[0].clone();

    // Lock 100 coins for 90 days.
    let mut stake = signed_tx(
        TransactionKind::Stake,
        &[
            (cb1.hash, 0, 50.0, &staker),
            (cb2.hash, 0, 50.0, &staker),
        ],
        Vec::new(),
        0.0,
    );
    stake.stake_duration_days = Some(90);
    stake.hash = stake.compute_hash();
    for i in 0..2u32 {
        let digest = stake.signing_payload(i);
        stake.inputs[i as usize].signature = ecdsa_sign(&digest, &staker.secret_key).unwrap();
    }
    stake.hash = stake.compute_hash();
    core.submit_transaction(stake).unwrap();
    mine_next(&core, &staker_addr, 800);

    // 150 mined so far, 100 locked.
    assert!(amounts_equal(core.balance(&staker_addr), 50.0));
    let info = core.staking_info();
    assert_eq!(info.active_validators, 1);
    assert!(amounts_equal(info.locked_stake, 100.0));
    let record = core.validator(&staker_addr).unwrap();
    assert!(record.is_eligible());

    // The staker is the only eligible validator, so it leads the next slot.
    let mut pos = core.propose_block(&staker_addr, gxc_core::BlockKind::Pos);
    pos.header.timestamp = now_ts() + 1200;
    sign_pos_block(&mut pos, &staker.secret_key).unwrap();
    core.submit_block(pos).unwrap();
    assert_eq!(core.height(), 4);

    // Unstake releases the locked amount back into the UTXO set.
    let unstake = Transaction::new(
        TransactionKind::Unstake,
        Vec::new(),
        vec![TxOutput::new(staker_addr.clone(), 100.0)],
        0.0,
    );
    core.submit_transaction(unstake).unwrap();
    mine_next(&core, &staker_addr, 1600);
    // 50 (stake-block coinbase) + 50 (PoS coinbase) + 50 (this coinbase)
    // + 100 released.
    assert!(amounts_equal(core.balance(&staker_addr), 250.0));
    assert!(amounts_equal(core.staking_info().locked_stake, 0.0));
}

#[test]
fn supply_and_utxo_invariants_hold_after_blocks() {
    let (core, _) = testnet_core();
    let a = generate_keypair();
    let b = generate_keypair();
    let a_addr = addr(&a);
    let b_addr = addr(&b);

    mine_next(&core, &a_addr, 0);
    mine_next(&core, &a_addr, 400);
    let cb1 = core.block_by_height(1).unwrap().transactions[0].clone();
    let pay = signed_tx(
        TransactionKind::Normal,
        &[(cb1.hash, 0, 50.0, &a)],
        vec![
            TxOutput::new(b_addr.clone(), 30.0),
            TxOutput::new(a_addr.clone(), 19.9),
        ],
        0.1,
    );
    core.submit_transaction(pay.clone()).unwrap();
    mine_next(&core, &a_addr, 800);

    let info = core.chain_info();
    assert!(info.total_issued <= gxc_core::MAX_SUPPLY);
    // Live UTXO value = issued - burned - locked stake - pool holdings
    // (the pool's fee split is tracked off-UTXO at its own address).
    let utxo_total: f64 = core.utxos_of(&a_addr).iter().map(|(_, e)| e.output.amount).sum::<f64>()
        + core.utxos_of(&b_addr).iter().map(|(_, e)| e.output.amount).sum::<f64>();
    let expected =
        info.total_issued - info.total_burned - info.locked_stake - core.pool_balance();
    assert!((utxo_total - expected).abs() < 1e-6);

    // Lineage queries see the committed payment.
    assert!(core.verify_lineage(&pay.hash));
    let lineage = core.trace_lineage(&pay.hash);
    assert_eq!(lineage.first(), Some(&pay.hash));
    assert!(lineage.contains(&cb1.hash));
    let chain_txs = core.transaction_chain(&b_addr, 10);
    assert!(chain_txs.contains(&pay.hash));

    // The spent coinbase key is tombstoned, the new outputs are live.
    assert!(core.utxos_of(&b_addr).iter().any(|(k, _)| *k == UtxoKey::new(pay.hash, 0)));
}

#[test]
fn ethash_block_roundtrip() {
    let (core, _) = testnet_core();
    let miner = generate_keypair();
    let miner_addr = addr(&miner);

    let mut block = core.propose_block(&miner_addr, gxc_core::BlockKind::PowEthash);
    gxc_ledger::core::mine_ethash(&mut block, core.ethash());
    core.submit_block(block.clone()).unwrap();
    assert_eq!(core.height(), 1);
    assert_eq!(core.block_by_height(1).unwrap().hash, block.hash);
}
