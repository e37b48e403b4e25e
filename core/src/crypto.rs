//! Hashing, address derivation and signature verification.
//!
//! Every hash on the chain is a "mill hash": SHA-256 over SHA-512 of the
//! input, rendered as lowercase hex.

use crate::error::{ChainError, Result};
use once_cell::sync::Lazy;
use secp256k1::{Message, PublicKey, Secp256k1, ecdsa::Signature};
use sha2::{Digest, Sha256, Sha512};

pub(crate) static SECP: Lazy<Secp256k1<secp256k1::All>> = Lazy::new(Secp256k1::new);

const ADDRESS_TAG: &str = "CC";
const ADDRESS_BODY_LEN: usize = 40;

pub fn mill_hash(data: &[u8]) -> [u8; 32] {
    let inner = Sha512::digest(data);
    let outer = Sha256::digest(inner);
    let mut out = [0u8; 32];
    out.copy_from_slice(&outer);
    out
}

pub fn mill_hash_hex(data: &[u8]) -> String {
    hex::encode(mill_hash(data))
}

/// Parse a 64 char hex hash into raw bytes.
pub fn decode_hash(hash_hex: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hash_hex)
        .map_err(|e| ChainError::Structural(format!("hash is not hex: {}", e)))?;
    if bytes.len() != 32 {
        return Err(ChainError::Structural(format!(
            "hash must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

pub fn parse_public_key(public_key_hex: &str) -> Result<PublicKey> {
    let bytes = hex::decode(public_key_hex)
        .map_err(|e| ChainError::Crypto(format!("public key is not hex: {}", e)))?;
    PublicKey::from_slice(&bytes)
        .map_err(|e| ChainError::Crypto(format!("invalid public key: {}", e)))
}

pub(crate) fn address_from_key(public_key: &PublicKey) -> String {
    let digest = mill_hash_hex(&public_key.serialize());
    format!("{ADDRESS_TAG}{}{ADDRESS_TAG}", &digest[..ADDRESS_BODY_LEN])
}

/// Derive the account address for a hex encoded compressed public key.
pub fn address_of(public_key_hex: &str) -> Result<String> {
    let key = parse_public_key(public_key_hex)?;
    Ok(address_from_key(&key))
}

pub fn is_address(candidate: &str) -> bool {
    let tag = ADDRESS_TAG.len();
    candidate.len() == ADDRESS_BODY_LEN + 2 * tag
        && candidate.starts_with(ADDRESS_TAG)
        && candidate.ends_with(ADDRESS_TAG)
        && candidate[tag..tag + ADDRESS_BODY_LEN]
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Verify a compact hex signature over a 32 byte digest.
pub fn verify_signature(public_key_hex: &str, digest: &[u8; 32], signature_hex: &str) -> Result<()> {
    let key = parse_public_key(public_key_hex)?;
    let sig_bytes = hex::decode(signature_hex)
        .map_err(|e| ChainError::Crypto(format!("signature is not hex: {}", e)))?;
    let signature = Signature::from_compact(&sig_bytes)
        .map_err(|e| ChainError::Crypto(format!("malformed signature: {}", e)))?;
    let message = Message::from_digest(*digest);
    SECP.verify_ecdsa(&message, &signature, &key)
        .map_err(|_| ChainError::Crypto("signature does not verify".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::Wallet;

    #[test]
    fn mill_hash_is_sha256_of_sha512() {
        let expected = Sha256::digest(Sha512::digest(b"GENESIS"));
        assert_eq!(mill_hash(b"GENESIS").as_slice(), expected.as_slice());
        assert_eq!(mill_hash_hex(b"").len(), 64);
    }

    #[test]
    fn address_shape() {
        let wallet = Wallet::generate();
        let addr = address_of(&wallet.public_key_hex()).unwrap();
        assert_eq!(addr, wallet.address());
        assert!(is_address(&addr));
        assert!(!is_address("CCnothexCC"));
        assert!(!is_address(&addr.to_uppercase()));
    }

    #[test]
    fn verify_rejects_other_key() {
        let alice = Wallet::generate();
        let bob = Wallet::generate();
        let digest = mill_hash(b"payload");
        let sig = alice.sign(&digest);

        assert!(verify_signature(&alice.public_key_hex(), &digest, &sig).is_ok());
        let err = verify_signature(&bob.public_key_hex(), &digest, &sig).unwrap_err();
        assert!(matches!(err, ChainError::Crypto(_)));
    }

    #[test]
    fn decode_hash_checks_length() {
        assert!(decode_hash(&"ab".repeat(32)).is_ok());
        assert!(matches!(decode_hash("abcd"), Err(ChainError::Structural(_))));
    }
}
