pub mod difficulty;
pub mod monetary;
pub mod validate;
pub mod validators;

use gxc_core::Hash32;
use thiserror::Error;

pub use difficulty::{
    better_tip, block_work, compact_from_target, meets_target, retarget, target_for_difficulty,
    target_from_compact, ChainWork, RetargetParams,
};
pub use monetary::{MonetaryPolicy, PriceOracle};
pub use validate::{validate_block, validate_transaction, BlockSummary, ChainView, ValidationContext};
pub use validators::{StakeRecord, ValidatorSet};

fn short(hash: &Hash32) -> String {
    hex::encode(&hash[..8])
}

/// First violation found while validating a block or one of its
/// transactions. Validation never partially applies.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConsensusError {
    #[error("previous hash does not match chain tip")]
    PrevHashMismatch,
    #[error("block height {got} does not follow tip height {tip}")]
    HeightMismatch { got: u32, tip: u32 },
    #[error("block timestamp out of range")]
    TimestampOutOfRange,
    #[error("merkle root mismatch in block {}", short(.0))]
    MerkleMismatch(Hash32),
    #[error("stored hash does not match recomputed header hash")]
    HashMismatch,
    #[error("proof of work below target")]
    ProofOfWorkInsufficient,
    #[error("block miner is not the slot leader")]
    ProofOfStakeLeaderWrong,
    #[error("validator signature missing or invalid")]
    SignatureInvalid,
    #[error("transaction {} violates the traceability invariant", short(.0))]
    TraceabilityViolation(Hash32),
    #[error("transaction {} input amount does not match referenced output", short(.0))]
    InputAmountMismatch(Hash32),
    #[error("transaction {} double-spends an input", short(.0))]
    DoubleSpend(Hash32),
    #[error("transaction {} spends an unknown utxo", short(.0))]
    UnknownUtxo(Hash32),
    #[error("transaction {} carries an invalid input signature", short(.0))]
    InputSignatureInvalid(Hash32),
    #[error("transaction {} does not conserve value", short(.0))]
    ConservationViolation(Hash32),
    #[error("transaction {} hash does not match its contents", short(.0))]
    TxHashMismatch(Hash32),
    #[error("coinbase pays more than reward plus fees")]
    CoinbaseValueTooHigh,
    #[error("mint would exceed the supply cap")]
    SupplyCapExceeded,
    #[error("stake below the minimum")]
    StakeBelowMinimum,
    #[error("staking period outside the allowed range")]
    StakingPeriodInvalid,
    #[error("transaction {} blocked by the taint engine", short(.0))]
    TaintBlocked(Hash32),
    #[error("block validation exceeded its deadline")]
    ValidationTimeout,
    #[error("ethash cache for the block's epoch is still generating")]
    EthashCachePending,
}
