pub mod chain;
pub mod core;
pub mod mempool;
pub mod utxo;

use gxc_consensus::ConsensusError;
use gxc_core::Hash32;
use gxc_fraud::ReversalError;
use thiserror::Error;

pub use crate::core::{BlockTemplate, LedgerConfig, LedgerCore};
pub use chain::ChainState;
pub use mempool::Mempool;
pub use utxo::{UtxoEntry, UtxoSet};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LedgerError {
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
    #[error(transparent)]
    Reversal(#[from] ReversalError),
    #[error("transaction {} not found", hex::encode(&.0[..8]))]
    UnknownTransaction(Hash32),
    #[error("block not found")]
    UnknownBlock,
    #[error("transaction {} already in the mempool", hex::encode(&.0[..8]))]
    MempoolDuplicate(Hash32),
    #[error("transaction {} conflicts with a mempool spend", hex::encode(&.0[..8]))]
    MempoolConflict(Hash32),
    #[error("address {0} has insufficient spendable funds")]
    InsufficientFunds(String),
}
