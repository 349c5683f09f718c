use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{anyhow, Result};
use gxc_core::{
    floor_to_satoshi, Address, Coin, Transaction, TransactionKind, TxInput, TxOutput, UtxoKey,
};
use gxc_crypto::{address_from_public_key, ecdsa_sign, generate_keypair, Network};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub name: String,
    pub address: Address,
    pub public_key: Vec<u8>,
    pub encrypted_secret: Vec<u8>,
    pub nonce: [u8; 12],
}

pub struct WalletStore {
    root: PathBuf,
    network: Network,
}

impl WalletStore {
    pub fn new(root: PathBuf, network: Network) -> Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(Self { root, network })
    }

    pub fn create(&self, name: &str, password: &str) -> Result<Wallet> {
        let kp = generate_keypair();
        let address = address_from_public_key(&kp.public_key, self.network);
        let (encrypted_secret, nonce) = encrypt_secret(&kp.secret_key, password)?;
        let wallet = Wallet {
            name: name.to_string(),
            address,
            public_key: kp.public_key,
            encrypted_secret,
            nonce,
        };
        let path = self.root.join(format!("{name}.json"));
        fs::write(path, serde_json::to_vec_pretty(&wallet)?)?;
        Ok(wallet)
    }

    pub fn list(&self) -> Result<Vec<Wallet>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                let bytes = fs::read(entry.path())?;
                let wallet: Wallet = serde_json::from_slice(&bytes)?;
                out.push(wallet);
            }
        }
        Ok(out)
    }

    pub fn load(&self, name: &str) -> Result<Wallet> {
        let path = self.root.join(format!("{name}.json"));
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn unlock_secret(&self, wallet: &Wallet, password: &str) -> Result<Vec<u8>> {
        decrypt_secret(&wallet.encrypted_secret, &wallet.nonce, password)
    }
}

fn encrypt_secret(secret: &[u8], password: &str) -> Result<(Vec<u8>, [u8; 12])> {
    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);
    let mut key = [0u8; 32];
    pbkdf2_hmac::<sha2::Sha256>(password.as_bytes(), &salt, 10_000, &mut key);
    let cipher = Aes256Gcm::new_from_slice(&key)?;
    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, secret)
        .map_err(|e| anyhow!("encrypt failed: {e}"))?;
    let mut out = salt.to_vec();
    out.extend_from_slice(&ciphertext);
    Ok((out, nonce_bytes))
}

fn decrypt_secret(ciphertext: &[u8], nonce: &[u8; 12], password: &str) -> Result<Vec<u8>> {
    if ciphertext.len() < 16 {
        return Err(anyhow!("ciphertext too short"));
    }
    let (salt, ct) = ciphertext.split_at(16);
    let mut key = [0u8; 32];
    pbkdf2_hmac::<sha2::Sha256>(password.as_bytes(), salt, 10_000, &mut key);
    let cipher = Aes256Gcm::new_from_slice(&key)?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ct)
        .map_err(|e| anyhow!("decrypt failed: {e}"))?;
    Ok(plaintext)
}

/// Build and sign a payment from a set of owned outputs. The first input
/// supplies the transaction's redundant traceability reference; change goes
/// back to the owner.
pub fn build_payment(
    spends: &[(UtxoKey, Coin)],
    public_key: &[u8],
    secret: &[u8],
    network: Network,
    to: &str,
    amount: Coin,
    fee: Coin,
) -> Result<Transaction> {
    let total: Coin = spends.iter().map(|(_, a)| a).sum();
    if total + gxc_core::AMOUNT_EPSILON < amount + fee {
        return Err(anyhow!("selected inputs below amount plus fee"));
    }
    let inputs: Vec<TxInput> = spends
        .iter()
        .map(|(key, value)| TxInput {
            prev_tx_hash: key.tx_hash,
            output_index: key.index,
            amount: *value,
            signature: Vec::new(),
            public_key: public_key.to_vec(),
        })
        .collect();
    let mut outputs = vec![TxOutput::new(to.to_string(), amount)];
    let change = floor_to_satoshi(total - amount - fee);
    if change > 0.0 {
        let owner = address_from_public_key(public_key, network);
        outputs.push(TxOutput::new(owner, change));
    }
    let mut tx = Transaction::new(TransactionKind::Normal, inputs, outputs, fee);
    for i in 0..tx.inputs.len() {
        let digest = tx.signing_payload(i as u32);
        tx.inputs[i].signature = ecdsa_sign(&digest, secret)?;
    }
    tx.hash = tx.compute_hash();
    Ok(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gxc_crypto::ecdsa_verify;

    #[test]
    fn wallet_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = WalletStore::new(dir.path().to_path_buf(), Network::Testnet).unwrap();
        let wallet = store.create("test", "pass").unwrap();
        assert!(wallet.address.starts_with("tGXC"));
        let secret = store.unlock_secret(&wallet, "pass").unwrap();
        assert_eq!(secret.len(), 32);
        assert!(store.unlock_secret(&wallet, "wrong").is_err());
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn payment_is_signed_and_traceable() {
        let kp = generate_keypair();
        let prev = UtxoKey::new([5u8; 32], 1);
        let tx = build_payment(
            &[(prev, 10.0)],
            &kp.public_key,
            &kp.secret_key,
            Network::Testnet,
            "tGXCreceiver",
            7.0,
            0.001,
        )
        .unwrap();
        assert!(tx.verify_traceability());
        assert!(tx.verify_conservation());
        assert!(tx.verify_integrity());
        assert_eq!(tx.prev_tx_hash, [5u8; 32]);
        // Change output back to the owner.
        assert_eq!(tx.outputs.len(), 2);
        let digest = tx.signing_payload(0);
        assert!(ecdsa_verify(&digest, &tx.inputs[0].signature, &kp.public_key));
    }

    #[test]
    fn underfunded_payment_is_refused() {
        let kp = generate_keypair();
        let prev = UtxoKey::new([5u8; 32], 1);
        assert!(build_payment(
            &[(prev, 1.0)],
            &kp.public_key,
            &kp.secret_key,
            Network::Testnet,
            "tGXCreceiver",
            7.0,
            0.001,
        )
        .is_err());
    }
}
