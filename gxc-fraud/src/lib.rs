pub mod pool;
pub mod proof;
pub mod registry;
pub mod taint;

use gxc_core::{Coin, Hash32, Transaction};
use thiserror::Error;

pub use pool::{FeeRecord, FundingRecord, PoolStats, ReversalFeePool};
pub use proof::{generate_proof, validate_proof, ProofOfFeasibility, MIN_TAINT_THRESHOLD, REVERSAL_WINDOW};
pub use registry::{AddressRegistry, EntityInfo, EntityKind};
pub use taint::{AlertLevel, AlertRule, FlowPath, FraudAlert, FraudStats, TaintEngine, TaintInfo};

/// Read-only chain access for taint propagation and proof generation. The
/// ledger implements this; the fraud components hold no chain references,
/// only keys passed through this view.
pub trait TaintChainView {
    fn transaction(&self, hash: &Hash32) -> Option<Transaction>;
    /// Committed transactions that spend outputs of `hash`.
    fn spenders(&self, hash: &Hash32) -> Vec<Hash32>;
    /// Timestamp of the block that committed the transaction.
    fn tx_block_timestamp(&self, hash: &Hash32) -> Option<u64>;
    /// Height of the block that committed the transaction.
    fn tx_block_height(&self, hash: &Hash32) -> Option<u32>;
    fn balance(&self, address: &str) -> Coin;
    fn chain_height(&self) -> u32;
    /// Reversal transaction hash recorded for a stolen transaction, if any.
    fn reversed_as(&self, stolen: &Hash32) -> Option<Hash32>;
}

/// Failure kinds of the proof-of-feasibility and reversal pipeline.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ReversalError {
    #[error("transaction is not marked as stolen")]
    NotMarkedStolen,
    #[error("stolen transaction not found on chain")]
    StolenTxNotFound,
    #[error("stolen transaction already reversed")]
    AlreadyReversed,
    #[error("stolen transaction outside the reversal window")]
    OutsideReversalWindow,
    #[error("no tainted path from the stolen transaction to the holder")]
    NoPathToHolder,
    #[error("taint score {0} below the reversal threshold")]
    TaintTooLow(f64),
    #[error("recoverable amount is zero")]
    RecoverableZero,
    #[error("holder balance does not cover the recoverable amount")]
    InsufficientHolderBalance,
    #[error("fee pool balance does not cover the reversal fee")]
    InsufficientPoolBalance,
    #[error("reversal fee below the pool minimum")]
    FeeBelowMinimum,
    #[error("admin signature over the proof hash is invalid")]
    InvalidAdminSignature,
    #[error("recorded proof hash does not match the recomputation")]
    ProofHashMismatch,
    #[error("proof trace path is malformed")]
    InvalidTracePath,
}
