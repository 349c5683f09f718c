use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

/// 32-byte hash, the identity of transactions, blocks and proofs.
pub type Hash32 = [u8; 32];
/// Chain address: `GXC`/`tGXC` prefix plus 34 hex chars of the pubkey hash.
pub type Address = String;
/// Amounts in whole coins. All floors and comparisons happen at satoshi
/// precision, see [`floor_to_satoshi`] and [`AMOUNT_EPSILON`].
pub type Coin = f64;

pub const ZERO_HASH: Hash32 = [0u8; 32];
/// Satoshis per coin.
pub const COIN: u64 = 100_000_000;
/// Tolerance for amount comparisons between referenced and actual values.
pub const AMOUNT_EPSILON: f64 = 1e-8;
/// Hard supply cap. No mint may push total issuance past this.
pub const MAX_SUPPLY: Coin = 31_000_000.0;
/// Reward of the first halving epoch.
pub const INITIAL_BLOCK_REWARD: Coin = 50.0;
/// Blocks per halving, roughly four years.
pub const HALVING_INTERVAL: u32 = 1_051_200;
/// Lineage walks stop after this many hops.
pub const MAX_LINEAGE_DEPTH: usize = 10_000;

pub fn sha256(data: &[u8]) -> Hash32 {
    let mut h = Sha256::new();
    h.update(data);
    h.finalize().into()
}

pub fn sha256d(data: &[u8]) -> Hash32 {
    sha256(&sha256(data))
}

pub fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_secs()
}

/// Quantize a coin amount down to its satoshi grid.
pub fn floor_to_satoshi(amount: Coin) -> Coin {
    (amount * COIN as f64).floor() / COIN as f64
}

/// Amount in satoshis, rounded to the grid.
pub fn to_satoshis(amount: Coin) -> u64 {
    (amount * COIN as f64).round() as u64
}

pub fn from_satoshis(sats: u64) -> Coin {
    sats as f64 / COIN as f64
}

pub fn amounts_equal(a: Coin, b: Coin) -> bool {
    (a - b).abs() < AMOUNT_EPSILON
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    Normal,
    Coinbase,
    Stake,
    Unstake,
    Reversal,
}

impl TransactionKind {
    fn tag(self) -> u8 {
        match self {
            TransactionKind::Normal => 0,
            TransactionKind::Coinbase => 1,
            TransactionKind::Stake => 2,
            TransactionKind::Unstake => 3,
            TransactionKind::Reversal => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxInput {
    pub prev_tx_hash: Hash32,
    pub output_index: u32,
    pub amount: Coin,
    pub signature: Vec<u8>,
    pub public_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxOutput {
    pub address: Address,
    pub amount: Coin,
    pub script: Vec<u8>,
}

impl TxOutput {
    pub fn new(address: Address, amount: Coin) -> Self {
        Self {
            address,
            amount,
            script: Vec::new(),
        }
    }
}

/// A transaction with linear traceability: besides its inputs it carries a
/// redundant `(prev_tx_hash, referenced_amount)` pair that must match the
/// first input. Taint propagation is built on that redundancy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub kind: TransactionKind,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub prev_tx_hash: Hash32,
    pub referenced_amount: Coin,
    pub fee: Coin,
    pub timestamp: u64,
    /// Staking period, set only for `Stake` transactions.
    pub stake_duration_days: Option<u16>,
    /// Proof-of-feasibility hash, set only for `Reversal` transactions.
    pub proof_hash: Option<Hash32>,
    pub hash: Hash32,
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_amount(buf: &mut Vec<u8>, v: Coin) {
    put_u64(buf, to_satoshis(v));
}

fn put_bytes(buf: &mut Vec<u8>, v: &[u8]) {
    put_u32(buf, v.len() as u32);
    buf.extend_from_slice(v);
}

impl Transaction {
    pub fn new(
        kind: TransactionKind,
        inputs: Vec<TxInput>,
        outputs: Vec<TxOutput>,
        fee: Coin,
    ) -> Self {
        let (prev_tx_hash, referenced_amount) = inputs
            .first()
            .map(|i| (i.prev_tx_hash, i.amount))
            .unwrap_or((ZERO_HASH, 0.0));
        let mut tx = Self {
            kind,
            inputs,
            outputs,
            prev_tx_hash,
            referenced_amount,
            fee,
            timestamp: now_ts(),
            stake_duration_days: None,
            proof_hash: None,
            hash: ZERO_HASH,
        };
        tx.hash = tx.compute_hash();
        tx
    }

    /// Block reward payout. No inputs, no traceability reference.
    pub fn coinbase(miner: Address, amount: Coin, height: u32) -> Self {
        let mut output = TxOutput::new(miner, amount);
        // Height in the script keeps coinbase hashes unique per block.
        output.script = height.to_le_bytes().to_vec();
        Self::new(TransactionKind::Coinbase, Vec::new(), vec![output], 0.0)
    }

    /// Canonical bytes, everything except `hash` itself. Integers are
    /// little-endian, amounts are satoshi-quantized u64.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        self.encode(true)
    }

    /// Bytes signed by each input: the canonical form with signatures
    /// blanked, suffixed with the input index.
    pub fn signing_payload(&self, input_index: u32) -> Hash32 {
        let mut buf = self.encode(false);
        put_u32(&mut buf, input_index);
        sha256(&buf)
    }

    fn encode(&self, with_signatures: bool) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);
        buf.push(self.kind.tag());
        put_u32(&mut buf, self.inputs.len() as u32);
        for input in &self.inputs {
            buf.extend_from_slice(&input.prev_tx_hash);
            put_u32(&mut buf, input.output_index);
            put_amount(&mut buf, input.amount);
            if with_signatures {
                put_bytes(&mut buf, &input.signature);
            }
            put_bytes(&mut buf, &input.public_key);
        }
        put_u32(&mut buf, self.outputs.len() as u32);
        for output in &self.outputs {
            put_bytes(&mut buf, output.address.as_bytes());
            put_amount(&mut buf, output.amount);
            put_bytes(&mut buf, &output.script);
        }
        buf.extend_from_slice(&self.prev_tx_hash);
        put_amount(&mut buf, self.referenced_amount);
        put_amount(&mut buf, self.fee);
        put_u64(&mut buf, self.timestamp);
        put_u16(&mut buf, self.stake_duration_days.unwrap_or(0));
        buf.extend_from_slice(&self.proof_hash.unwrap_or(ZERO_HASH));
        buf
    }

    pub fn compute_hash(&self) -> Hash32 {
        sha256(&self.canonical_bytes())
    }

    /// Stored hash matches the canonical recomputation.
    pub fn verify_integrity(&self) -> bool {
        self.hash == self.compute_hash()
    }

    pub fn is_coinbase(&self) -> bool {
        self.kind == TransactionKind::Coinbase
    }

    /// Kinds exempt from the traceability invariant.
    pub fn is_traceability_exempt(&self) -> bool {
        matches!(
            self.kind,
            TransactionKind::Coinbase | TransactionKind::Unstake | TransactionKind::Reversal
        ) || (self.inputs.is_empty() && self.prev_tx_hash == ZERO_HASH)
    }

    /// `inputs[0].prev_tx_hash == prev_tx_hash` and the referenced amount
    /// matches the first input within epsilon.
    pub fn verify_traceability(&self) -> bool {
        if self.is_traceability_exempt() {
            return true;
        }
        match self.inputs.first() {
            Some(first) => {
                first.prev_tx_hash == self.prev_tx_hash
                    && amounts_equal(first.amount, self.referenced_amount)
            }
            None => false,
        }
    }

    pub fn total_input(&self) -> Coin {
        self.inputs.iter().map(|i| i.amount).sum()
    }

    pub fn total_output(&self) -> Coin {
        self.outputs.iter().map(|o| o.amount).sum()
    }

    /// Amount moved out of the spendable set by a Stake, or back in by an
    /// Unstake. Zero for every other kind.
    pub fn staked_delta(&self) -> Coin {
        match self.kind {
            TransactionKind::Stake => self.total_input() - self.total_output() - self.fee,
            TransactionKind::Unstake => -(self.total_output() + self.fee),
            _ => 0.0,
        }
    }

    /// Value conservation: `outputs + fee + staked_delta == inputs`.
    pub fn verify_conservation(&self) -> bool {
        match self.kind {
            // Checked against reward + fees at the block level.
            TransactionKind::Coinbase => self.inputs.is_empty(),
            // The reversal fee is paid from the fee pool, never from the
            // holder's inputs.
            TransactionKind::Reversal => {
                (self.total_output() - self.total_input()).abs() < AMOUNT_EPSILON
            }
            _ => {
                let balance =
                    self.total_output() + self.fee + self.staked_delta() - self.total_input();
                balance.abs() < AMOUNT_EPSILON
            }
        }
    }

    /// First output address, the recipient in the common single-payment case.
    pub fn recipient(&self) -> Option<&Address> {
        self.outputs.first().map(|o| &o.address)
    }
}

/// Identity of a live or spent output: the owning transaction plus the
/// output position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UtxoKey {
    pub tx_hash: Hash32,
    pub index: u32,
}

impl UtxoKey {
    pub fn new(tx_hash: Hash32, index: u32) -> Self {
        Self { tx_hash, index }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockKind {
    PowSha256,
    PowEthash,
    Pos,
}

impl BlockKind {
    fn tag(self) -> u8 {
        match self {
            BlockKind::PowSha256 => 0,
            BlockKind::PowEthash => 1,
            BlockKind::Pos => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: u32,
    pub prev_hash: Hash32,
    pub merkle_root: Hash32,
    pub timestamp: u64,
    pub nonce: u64,
    pub difficulty: f64,
    pub kind: BlockKind,
    pub miner: Address,
    pub reward: Coin,
    /// PoS blocks only, signs the block hash.
    pub validator_signature: Option<Vec<u8>>,
    /// Ethash blocks only, the compressed mix of the winning nonce.
    pub mix_hash: Option<Hash32>,
}

impl BlockHeader {
    /// Canonical header bytes. The validator signature and mix are excluded:
    /// the signature is over the hash and the mix is an output of it.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        put_u32(&mut buf, self.height);
        buf.extend_from_slice(&self.prev_hash);
        buf.extend_from_slice(&self.merkle_root);
        put_u64(&mut buf, self.timestamp);
        put_u64(&mut buf, self.nonce);
        buf.extend_from_slice(&self.difficulty.to_le_bytes());
        buf.push(self.kind.tag());
        put_bytes(&mut buf, self.miner.as_bytes());
        put_amount(&mut buf, self.reward);
        buf
    }

    /// Header bytes without the nonce, the preimage Ethash mixes the nonce
    /// into separately.
    pub fn pow_bytes(&self) -> Vec<u8> {
        let mut stripped = self.clone();
        stripped.nonce = 0;
        stripped.canonical_bytes()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub hash: Hash32,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        let mut block = Self {
            header,
            transactions,
            hash: ZERO_HASH,
        };
        block.header.merkle_root = merkle_root(&block.transactions);
        if block.header.kind != BlockKind::PowEthash {
            block.hash = block.compute_hash().unwrap_or(ZERO_HASH);
        }
        block
    }

    /// Hash for the SHA-256d and PoS kinds. Ethash block hashes are produced
    /// by the ethash engine and stored; `None` here.
    pub fn compute_hash(&self) -> Option<Hash32> {
        let bytes = self.header.canonical_bytes();
        match self.header.kind {
            BlockKind::PowSha256 => Some(sha256d(&bytes)),
            BlockKind::Pos => Some(sha256(&bytes)),
            BlockKind::PowEthash => None,
        }
    }

    pub fn total_fees(&self) -> Coin {
        self.transactions.iter().map(|tx| tx.fee).sum()
    }
}

/// Binary merkle tree over transaction hashes: pairwise SHA-256d, odd leaf
/// duplicated, empty tree hashes to zero.
pub fn merkle_root(transactions: &[Transaction]) -> Hash32 {
    merkle_root_of_hashes(transactions.iter().map(|tx| tx.hash).collect())
}

pub fn merkle_root_of_hashes(mut hashes: Vec<Hash32>) -> Hash32 {
    if hashes.is_empty() {
        return ZERO_HASH;
    }
    while hashes.len() > 1 {
        let mut next = Vec::with_capacity((hashes.len() + 1) / 2);
        for pair in hashes.chunks(2) {
            let mut buf = [0u8; 64];
            buf[..32].copy_from_slice(&pair[0]);
            buf[32..].copy_from_slice(if pair.len() == 2 { &pair[1] } else { &pair[0] });
            next.push(sha256d(&buf));
        }
        hashes = next;
    }
    hashes[0]
}

pub fn hash_to_hex(hash: &Hash32) -> String {
    hex::encode(hash)
}

pub fn hash_from_hex(s: &str) -> Result<Hash32, hex::FromHexError> {
    let bytes = hex::decode(s)?;
    let mut out = ZERO_HASH;
    if bytes.len() != 32 {
        return Err(hex::FromHexError::InvalidStringLength);
    }
    out.copy_from_slice(&bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_input(prev: Hash32, amount: Coin) -> TxInput {
        TxInput {
            prev_tx_hash: prev,
            output_index: 0,
            amount,
            signature: vec![1, 2, 3],
            public_key: vec![4, 5, 6],
        }
    }

    #[test]
    fn tx_hash_is_stable() {
        let tx = Transaction::new(
            TransactionKind::Normal,
            vec![sample_input([7u8; 32], 10.0)],
            vec![TxOutput::new("GXCabc".into(), 9.5)],
            0.5,
        );
        assert!(tx.verify_integrity());
        assert_eq!(tx.hash, tx.compute_hash());
    }

    #[test]
    fn mutation_invalidates_hash() {
        let mut tx = Transaction::new(
            TransactionKind::Normal,
            vec![sample_input([7u8; 32], 10.0)],
            vec![TxOutput::new("GXCabc".into(), 9.5)],
            0.5,
        );
        tx.outputs[0].amount = 9.6;
        assert!(!tx.verify_integrity());
    }

    #[test]
    fn traceability_reference_follows_first_input() {
        let tx = Transaction::new(
            TransactionKind::Normal,
            vec![sample_input([9u8; 32], 3.25)],
            vec![TxOutput::new("GXCabc".into(), 3.0)],
            0.25,
        );
        assert_eq!(tx.prev_tx_hash, [9u8; 32]);
        assert!(amounts_equal(tx.referenced_amount, 3.25));
        assert!(tx.verify_traceability());
    }

    #[test]
    fn traceability_rejects_mismatched_reference() {
        let mut tx = Transaction::new(
            TransactionKind::Normal,
            vec![sample_input([9u8; 32], 10.0)],
            vec![TxOutput::new("GXCabc".into(), 10.0)],
            0.0,
        );
        tx.referenced_amount = 9.99;
        assert!(!tx.verify_traceability());
    }

    #[test]
    fn coinbase_is_exempt_and_conserved() {
        let tx = Transaction::coinbase("GXCminer".into(), 50.0, 1);
        assert!(tx.is_coinbase());
        assert!(tx.verify_traceability());
        assert!(tx.verify_conservation());
    }

    #[test]
    fn stake_delta_balances_conservation() {
        let mut tx = Transaction::new(
            TransactionKind::Stake,
            vec![sample_input([2u8; 32], 150.0)],
            vec![TxOutput::new("GXCstaker".into(), 40.0)],
            0.001,
        );
        tx.stake_duration_days = Some(90);
        // 150 in, 40 change, 0.001 fee: 109.999 locked.
        assert!(amounts_equal(tx.staked_delta(), 109.999));
        assert!(tx.verify_conservation());
    }

    #[test]
    fn merkle_empty_and_odd() {
        assert_eq!(merkle_root(&[]), ZERO_HASH);
        let a = Transaction::coinbase("GXCm".into(), 50.0, 1);
        let single = merkle_root(std::slice::from_ref(&a));
        assert_eq!(single, a.hash);

        let b = Transaction::coinbase("GXCm".into(), 50.0, 2);
        let c = Transaction::coinbase("GXCm".into(), 50.0, 3);
        let odd = merkle_root(&[a.clone(), b.clone(), c.clone()]);
        // Odd leaf duplicated: same as [a, b, c, c].
        let even = merkle_root(&[a, b, c.clone(), c]);
        assert_eq!(odd, even);
    }

    #[test]
    fn block_hash_per_kind() {
        let coinbase = Transaction::coinbase("GXCm".into(), 50.0, 1);
        let header = BlockHeader {
            height: 1,
            prev_hash: [1u8; 32],
            merkle_root: ZERO_HASH,
            timestamp: 1_700_000_000,
            nonce: 42,
            difficulty: 0.1,
            kind: BlockKind::PowSha256,
            miner: "GXCm".into(),
            reward: 50.0,
            validator_signature: None,
            mix_hash: None,
        };
        let block = Block::new(header.clone(), vec![coinbase.clone()]);
        assert_eq!(block.hash, sha256d(&block.header.canonical_bytes()));

        let mut pos_header = header;
        pos_header.kind = BlockKind::Pos;
        let pos_block = Block::new(pos_header, vec![coinbase]);
        assert_eq!(pos_block.hash, sha256(&pos_block.header.canonical_bytes()));
        assert_ne!(block.hash, pos_block.hash);
    }

    #[test]
    fn serde_roundtrip() {
        let tx = Transaction::new(
            TransactionKind::Normal,
            vec![sample_input([7u8; 32], 10.0)],
            vec![TxOutput::new("GXCabc".into(), 10.0)],
            0.0,
        );
        let json = serde_json::to_string(&tx).unwrap();
        let back: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(tx, back);
    }

    #[test]
    fn satoshi_floor() {
        assert_eq!(floor_to_satoshi(0.123456789), 0.12345678);
        assert_eq!(to_satoshis(0.00001), 1000);
        assert!(amounts_equal(from_satoshis(to_satoshis(16.0 * 0.002)), 0.032));
    }
}
