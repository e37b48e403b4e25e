//! Signing side of the crypto contract. Validation never signs.

use crate::crypto::{SECP, address_from_key};
use crate::error::{ChainError, Result};
use crate::transaction::Transaction;
use secp256k1::{Message, PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub struct Wallet {
    secret_key: SecretKey,
    public_key: PublicKey,
    address: String,
}

/// On-disk wallet file.
#[derive(Serialize, Deserialize)]
struct WalletFile {
    secret_key: String,
    public_key: String,
    address: String,
}

impl Wallet {
    pub fn generate() -> Self {
        let (secret_key, public_key) = SECP.generate_keypair(&mut secp256k1::rand::thread_rng());
        Self::from_parts(secret_key, public_key)
    }

    pub fn from_secret_hex(secret_hex: &str) -> Result<Self> {
        let bytes = hex::decode(secret_hex.trim())
            .map_err(|e| ChainError::Crypto(format!("secret key is not hex: {}", e)))?;
        let secret_key = SecretKey::from_slice(&bytes)
            .map_err(|e| ChainError::Crypto(format!("invalid secret key: {}", e)))?;
        let public_key = PublicKey::from_secret_key(&SECP, &secret_key);
        Ok(Self::from_parts(secret_key, public_key))
    }

    fn from_parts(secret_key: SecretKey, public_key: PublicKey) -> Self {
        let address = address_from_key(&public_key);
        Wallet {
            secret_key,
            public_key,
            address,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.serialize())
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret_key.secret_bytes())
    }

    /// Compact ECDSA signature over a 32 byte digest, hex encoded.
    pub fn sign(&self, digest: &[u8; 32]) -> String {
        let message = Message::from_digest(*digest);
        hex::encode(SECP.sign_ecdsa(&message, &self.secret_key).serialize_compact())
    }

    /// Stamp the transaction with this wallet's identity, then sign its txid.
    pub fn sign_transaction(&self, tx: &mut Transaction) -> Result<()> {
        tx.address = self.address.clone();
        tx.public_key = self.public_key_hex();
        tx.txid = tx.compute_txid()?;
        let digest = crate::crypto::decode_hash(&tx.txid)?;
        tx.signature = self.sign(&digest);
        Ok(())
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = fs::read_to_string(path)?;
        let file: WalletFile = serde_json::from_str(&data)?;
        let wallet = Self::from_secret_hex(&file.secret_key)?;
        if wallet.address != file.address {
            anyhow::bail!(
                "wallet file {:?} lists address {} but its key derives {}",
                path,
                file.address,
                wallet.address
            );
        }
        Ok(wallet)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = WalletFile {
            secret_key: self.secret_hex(),
            public_key: self.public_key_hex(),
            address: self.address.clone(),
        };
        fs::write(path, serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_round_trip_keeps_address() {
        let wallet = Wallet::generate();
        let restored = Wallet::from_secret_hex(&wallet.secret_hex()).unwrap();
        assert_eq!(restored.address(), wallet.address());
        assert_eq!(restored.public_key_hex(), wallet.public_key_hex());
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.json");
        let wallet = Wallet::generate();
        wallet.save(&path).unwrap();

        let loaded = Wallet::load(&path).unwrap();
        assert_eq!(loaded.address(), wallet.address());
    }

    #[test]
    fn rejects_garbage_secret() {
        assert!(Wallet::from_secret_hex("zz").is_err());
        assert!(Wallet::from_secret_hex(&"00".repeat(32)).is_err());
    }
}
