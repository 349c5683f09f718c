use crate::registry::AddressRegistry;
use crate::taint::TaintEngine;
use crate::{ReversalError, TaintChainView};
use gxc_core::{floor_to_satoshi, now_ts, sha256, to_satoshis, Address, Coin, Hash32};
use gxc_crypto::{address_from_public_key, ecdsa_verify, Network};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Blocks within which a stolen transaction can still be reversed.
pub const REVERSAL_WINDOW: u32 = 20_000;
/// Minimum taint that justifies a reversal.
pub const MIN_TAINT_THRESHOLD: f64 = 0.1;
/// Hop bound for proof trace paths.
pub const MAX_TRACE_HOPS: u32 = 20;

/// Cryptographically justified reversal record: the stolen transaction, the
/// traced flow to the current holder, the recoverable amount and the admin
/// approval, all bound together by `proof_hash`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofOfFeasibility {
    pub proof_type: String,
    pub stolen_tx: Hash32,
    pub current_tx: Hash32,
    pub trace_path: Vec<Hash32>,
    pub taint_score: f64,
    pub recoverable_amount: Coin,
    pub origin_owner: Address,
    pub current_holder: Address,
    pub approved_by: String,
    pub approval_signature: Vec<u8>,
    pub timestamp: u64,
    pub block_height: u32,
    pub proof_hash: Hash32,
}

impl ProofOfFeasibility {
    /// Canonical serialization, `|`-joined so the encoding is stable across
    /// round-trips. The approval signature is excluded: it is produced over
    /// `proof_hash` and so cannot be part of its preimage.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let path: Vec<String> = self.trace_path.iter().map(hex::encode).collect();
        let line = format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.proof_type,
            hex::encode(self.stolen_tx),
            hex::encode(self.current_tx),
            path.join(","),
            self.taint_score,
            to_satoshis(self.recoverable_amount),
            self.origin_owner,
            self.current_holder,
            self.approved_by,
            self.timestamp,
            self.block_height
        );
        line.into_bytes()
    }

    pub fn compute_hash(&self) -> Hash32 {
        sha256(&self.canonical_bytes())
    }
}

/// Generate a proof of feasibility for reversing `stolen_tx` against
/// `current_holder`. Fails on the first unmet condition.
pub fn generate_proof<V: TaintChainView>(
    view: &V,
    taint: &TaintEngine,
    registry: &AddressRegistry,
    network: Network,
    stolen_tx: Hash32,
    current_holder: &str,
    admin_id: &str,
    admin_secret: &[u8],
) -> Result<ProofOfFeasibility, ReversalError> {
    // 1. Stolen and not already reversed.
    if !taint.is_stolen(&stolen_tx) {
        return Err(ReversalError::NotMarkedStolen);
    }
    if view.reversed_as(&stolen_tx).is_some() {
        return Err(ReversalError::AlreadyReversed);
    }

    // 2. Within the reversal window.
    check_window(view, &stolen_tx)?;

    let stolen = view
        .transaction(&stolen_tx)
        .ok_or(ReversalError::StolenTxNotFound)?;
    let origin_owner = stolen
        .inputs
        .first()
        .map(|i| address_from_public_key(&i.public_key, network))
        .or_else(|| stolen.recipient().cloned())
        .ok_or(ReversalError::StolenTxNotFound)?;

    // 3. Tainted flow to the holder: shortest path first, highest final
    // taint breaking ties.
    let mut paths = taint.trace_tainted_flow(&stolen_tx, MAX_TRACE_HOPS, view, registry);
    paths.retain(|p| p.addresses.last().map(|a| a == current_holder).unwrap_or(false));
    paths.sort_by(|a, b| {
        a.hops
            .cmp(&b.hops)
            .then(b.final_taint.partial_cmp(&a.final_taint).unwrap_or(std::cmp::Ordering::Equal))
    });
    let path = paths.into_iter().next().ok_or(ReversalError::NoPathToHolder)?;

    // 4. Final taint above threshold.
    let taint_score = path.final_taint;
    if taint_score < MIN_TAINT_THRESHOLD {
        return Err(ReversalError::TaintTooLow(taint_score));
    }

    // 5. Recoverable amount from the holder's live balance.
    let balance = view.balance(current_holder);
    let recoverable = floor_to_satoshi(taint_score * balance);
    if recoverable <= 0.0 {
        return Err(ReversalError::RecoverableZero);
    }

    // 6. Assemble and hash.
    let current_tx = *path.transactions.last().expect("non-empty path");
    let mut proof = ProofOfFeasibility {
        proof_type: "REVERSAL_PROOF".to_string(),
        stolen_tx,
        current_tx,
        trace_path: path.transactions,
        taint_score,
        recoverable_amount: recoverable,
        origin_owner,
        current_holder: current_holder.to_string(),
        approved_by: admin_id.to_string(),
        approval_signature: Vec::new(),
        timestamp: now_ts(),
        block_height: view.chain_height(),
        proof_hash: gxc_core::ZERO_HASH,
    };
    proof.proof_hash = proof.compute_hash();
    proof.approval_signature = gxc_crypto::ecdsa_sign(&proof.proof_hash, admin_secret)
        .map_err(|_| ReversalError::InvalidAdminSignature)?;

    info!(
        stolen = %hex::encode(&stolen_tx[..8]),
        holder = current_holder,
        taint = taint_score,
        recoverable,
        "proof of feasibility generated"
    );
    Ok(proof)
}

/// Re-run every generation check against current state, recompute the proof
/// hash and verify the admin signature over it.
pub fn validate_proof<V: TaintChainView>(
    proof: &ProofOfFeasibility,
    view: &V,
    taint: &TaintEngine,
    admin_public_key: &[u8],
) -> Result<(), ReversalError> {
    if proof.proof_type != "REVERSAL_PROOF" {
        return Err(ReversalError::ProofHashMismatch);
    }
    if !taint.is_stolen(&proof.stolen_tx) {
        return Err(ReversalError::NotMarkedStolen);
    }
    check_window(view, &proof.stolen_tx)?;

    if proof.trace_path.is_empty() || proof.trace_path.len() as u32 > MAX_TRACE_HOPS + 1 {
        return Err(ReversalError::InvalidTracePath);
    }
    for hash in &proof.trace_path {
        if view.transaction(hash).is_none() {
            return Err(ReversalError::InvalidTracePath);
        }
    }

    if proof.taint_score < MIN_TAINT_THRESHOLD || proof.taint_score > 1.0 {
        return Err(ReversalError::TaintTooLow(proof.taint_score));
    }
    if proof.recoverable_amount <= 0.0 {
        return Err(ReversalError::RecoverableZero);
    }
    // Balance at validation time, not generation time.
    if proof.recoverable_amount > view.balance(&proof.current_holder) + gxc_core::AMOUNT_EPSILON {
        return Err(ReversalError::InsufficientHolderBalance);
    }

    if proof.compute_hash() != proof.proof_hash {
        warn!(proof = %hex::encode(&proof.proof_hash[..8]), "proof hash mismatch");
        return Err(ReversalError::ProofHashMismatch);
    }
    if !ecdsa_verify(&proof.proof_hash, &proof.approval_signature, admin_public_key) {
        return Err(ReversalError::InvalidAdminSignature);
    }
    Ok(())
}

fn check_window<V: TaintChainView>(view: &V, stolen_tx: &Hash32) -> Result<(), ReversalError> {
    let stolen_height = view
        .tx_block_height(stolen_tx)
        .ok_or(ReversalError::StolenTxNotFound)?;
    let age = view.chain_height().saturating_sub(stolen_height);
    if age > REVERSAL_WINDOW {
        return Err(ReversalError::OutsideReversalWindow);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_proof() -> ProofOfFeasibility {
        let mut proof = ProofOfFeasibility {
            proof_type: "REVERSAL_PROOF".to_string(),
            stolen_tx: [1u8; 32],
            current_tx: [2u8; 32],
            trace_path: vec![[1u8; 32], [2u8; 32]],
            taint_score: 0.4,
            recoverable_amount: 16.0,
            origin_owner: "GXCvictim".to_string(),
            current_holder: "GXCholder".to_string(),
            approved_by: "admin-1".to_string(),
            approval_signature: vec![0xde, 0xad],
            timestamp: 1_700_000_000,
            block_height: 120,
            proof_hash: gxc_core::ZERO_HASH,
        };
        proof.proof_hash = proof.compute_hash();
        proof
    }

    #[test]
    fn proof_hash_is_reproducible() {
        let proof = sample_proof();
        assert_eq!(proof.proof_hash, proof.compute_hash());
        let json = serde_json::to_string(&proof).unwrap();
        let back: ProofOfFeasibility = serde_json::from_str(&json).unwrap();
        assert_eq!(back.compute_hash(), proof.proof_hash);
    }

    #[test]
    fn tampering_changes_the_hash() {
        let proof = sample_proof();
        let mut forged = proof.clone();
        forged.recoverable_amount = 30.0;
        assert_ne!(forged.compute_hash(), proof.proof_hash);
        let mut forged_holder = proof.clone();
        forged_holder.current_holder = "GXCother".to_string();
        assert_ne!(forged_holder.compute_hash(), proof.proof_hash);
    }
}
