use blake2::digest::{Mac, Update, VariableOutput};
use blake2::{Blake2bMac512, Blake2bVar};
use gxc_core::{Address, Hash32};
use ripemd::Ripemd160;
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use sha2::Digest;
use sha3::{Keccak256, Keccak512};
use thiserror::Error;

pub use gxc_core::{sha256, sha256d};

/// Wire protocol version advertised on the network.
pub const PROTOCOL_VERSION: u32 = 70015;
/// Hex chars of the pubkey hash kept in an address, after the prefix.
pub const ADDRESS_BODY_LEN: usize = 34;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid secret key")]
    InvalidSecretKey,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid signature encoding")]
    InvalidSignature,
    #[error("argon2 parameters rejected: {0}")]
    Argon2Params(String),
    #[error("blake2 output length {0} out of range")]
    Blake2OutputLen(usize),
}

pub fn ripemd160(data: &[u8]) -> [u8; 20] {
    let mut h = Ripemd160::new();
    Digest::update(&mut h, data);
    h.finalize().into()
}

/// Real Keccak-256 (0x01 domain padding), not NIST SHA-3.
pub fn keccak256(data: &[u8]) -> Hash32 {
    let mut h = Keccak256::new();
    Digest::update(&mut h, data);
    h.finalize().into()
}

pub fn keccak512(data: &[u8]) -> [u8; 64] {
    let mut h = Keccak512::new();
    Digest::update(&mut h, data);
    h.finalize().into()
}

/// Variable-length Blake2b per RFC 7693, 1..=64 byte digests.
pub fn blake2b(data: &[u8], out_len: usize) -> Result<Vec<u8>, CryptoError> {
    let mut h = Blake2bVar::new(out_len).map_err(|_| CryptoError::Blake2OutputLen(out_len))?;
    h.update(data);
    let mut out = vec![0u8; out_len];
    h.finalize_variable(&mut out)
        .map_err(|_| CryptoError::Blake2OutputLen(out_len))?;
    Ok(out)
}

/// Keyed Blake2b, full 64-byte digest.
pub fn blake2b_keyed(key: &[u8], data: &[u8]) -> Result<[u8; 64], CryptoError> {
    let mut mac =
        Blake2bMac512::new_from_slice(key).map_err(|_| CryptoError::Blake2OutputLen(64))?;
    Mac::update(&mut mac, data);
    let out = mac.finalize().into_bytes();
    Ok(out.into())
}

/// Argon2id (RFC 9106). Rejects memory below the single-lane safety bound
/// `m >= 8p`.
pub fn argon2id(
    password: &[u8],
    salt: &[u8],
    t_cost: u32,
    m_cost: u32,
    parallelism: u32,
    out_len: usize,
) -> Result<Vec<u8>, CryptoError> {
    if m_cost < 8 * parallelism {
        return Err(CryptoError::Argon2Params(format!(
            "memory {m_cost} KiB below 8 x {parallelism} lanes"
        )));
    }
    let params = argon2::Params::new(m_cost, t_cost, parallelism, Some(out_len))
        .map_err(|e| CryptoError::Argon2Params(e.to_string()))?;
    let ctx = argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);
    let mut out = vec![0u8; out_len];
    ctx.hash_password_into(password, salt, &mut out)
        .map_err(|e| CryptoError::Argon2Params(e.to_string()))?;
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub secret_key: [u8; 32],
    /// Compressed SEC1 encoding, 33 bytes.
    pub public_key: Vec<u8>,
}

pub fn generate_keypair() -> KeyPair {
    let secp = Secp256k1::new();
    let (sk, pk) = secp.generate_keypair(&mut rand::thread_rng());
    KeyPair {
        secret_key: sk.secret_bytes(),
        public_key: pk.serialize().to_vec(),
    }
}

/// Compressed public key for a 32-byte secret.
pub fn derive_public_key(secret: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(secret).map_err(|_| CryptoError::InvalidSecretKey)?;
    Ok(PublicKey::from_secret_key(&secp, &sk).serialize().to_vec())
}

/// ECDSA over a 32-byte digest, DER-encoded signature.
pub fn ecdsa_sign(digest: &Hash32, secret: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(secret).map_err(|_| CryptoError::InvalidSecretKey)?;
    let msg = Message::from_digest(*digest);
    Ok(secp.sign_ecdsa(&msg, &sk).serialize_der().to_vec())
}

pub fn ecdsa_verify(digest: &Hash32, signature: &[u8], public_key: &[u8]) -> bool {
    let secp = Secp256k1::new();
    let Ok(pk) = PublicKey::from_slice(public_key) else {
        return false;
    };
    let Ok(sig) = Signature::from_der(signature) else {
        return false;
    };
    let msg = Message::from_digest(*digest);
    secp.verify_ecdsa(&msg, &sig, &pk).is_ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn address_prefix(self) -> &'static str {
        match self {
            Network::Mainnet => "GXC",
            Network::Testnet | Network::Regtest => "tGXC",
        }
    }

    pub fn magic(self) -> [u8; 4] {
        match self {
            Network::Mainnet => *b"GXC\x01",
            Network::Testnet | Network::Regtest => *b"GXCT",
        }
    }

    pub fn p2p_port(self) -> u16 {
        match self {
            Network::Mainnet => 8333,
            Network::Testnet | Network::Regtest => 18333,
        }
    }

    pub fn rpc_port(self) -> u16 {
        match self {
            Network::Mainnet => 8332,
            Network::Testnet | Network::Regtest => 18332,
        }
    }
}

/// `prefix + hex(ripemd160(sha256(pubkey)))[..34]`.
pub fn address_from_public_key(public_key: &[u8], network: Network) -> Address {
    let digest = ripemd160(&sha256(public_key));
    let body = hex::encode(digest);
    format!("{}{}", network.address_prefix(), &body[..ADDRESS_BODY_LEN])
}

pub fn is_valid_address(addr: &str, network: Network) -> bool {
    let prefix = network.address_prefix();
    addr.len() == prefix.len() + ADDRESS_BODY_LEN
        && addr.starts_with(prefix)
        && addr[prefix.len()..].chars().all(|c| c.is_ascii_hexdigit())
}
