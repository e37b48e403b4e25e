use crate::config::{BLOCK_VERSION, GENESIS_SEED, GENESIS_TIMESTAMP};
use crate::crypto::{decode_hash, mill_hash, mill_hash_hex};
use crate::error::{ChainError, Result};
use crate::transaction::Transaction;
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// block header
#[derive(Encode, Decode, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub idx: u64,
    pub version: u32,
    pub timestamp: i64, // unix seconds
    pub prev_hash: String,   // hex
    pub merkle_root: String, // hex
    pub target: u32,         // compact target bits
    pub proof_of_work: u64,  // nonce
}

#[derive(Encode, Decode, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub block_hash: String, // hex, mill hash of the serialized header
    pub txns: Vec<Transaction>,
}

impl Block {
    /// Hard-coded block 0. Its hash is fixed, not derived from the header.
    pub fn genesis(max_bits: u32) -> Self {
        Block {
            header: BlockHeader {
                idx: 0,
                version: BLOCK_VERSION,
                timestamp: GENESIS_TIMESTAMP,
                prev_hash: "0".repeat(64),
                merkle_root: mill_hash_hex(&[]),
                target: max_bits,
                proof_of_work: 0,
            },
            block_hash: genesis_hash(),
            txns: vec![],
        }
    }

    pub fn txids(&self) -> Vec<String> {
        self.txns.iter().map(|t| t.txid.clone()).collect()
    }
}

pub fn genesis_hash() -> String {
    mill_hash_hex(GENESIS_SEED)
}

/// Deterministic serialization: use bincode (v2 Encode trait)
pub fn serialize_header(header: &BlockHeader) -> Result<Vec<u8>> {
    let config = bincode::config::standard().with_fixed_int_encoding(); // u64 = 8 bytes
    Ok(bincode::encode_to_vec(header, config)?)
}

/// Compute hash from the header
pub fn compute_header_hash(header: &BlockHeader) -> Result<String> {
    Ok(mill_hash_hex(&serialize_header(header)?))
}

/// Compute merkle root over hex txids. Odd levels duplicate their last node.
pub fn compute_merkle_root(txids: &[String]) -> Result<String> {
    if txids.is_empty() {
        return Ok(mill_hash_hex(&[]));
    }

    let mut level: Vec<[u8; 32]> = txids
        .iter()
        .map(|h| decode_hash(h))
        .collect::<Result<_>>()?;

    while level.len() > 1 {
        if level.len() % 2 == 1 {
            if let Some(last) = level.last().copied() {
                level.push(last);
            }
        }

        level = level
            .chunks(2)
            .map(|pair| {
                let mut concat = Vec::with_capacity(64);
                concat.extend_from_slice(&pair[0]);
                concat.extend_from_slice(&pair[1]);
                mill_hash(&concat)
            })
            .collect();
    }

    Ok(hex::encode(level[0]))
}

/// Recompute the merkle root and compare it to the header.
pub fn check_merkle_root(block: &Block) -> Result<()> {
    let computed = compute_merkle_root(&block.txids())?;
    if computed != block.header.merkle_root {
        return Err(ChainError::Structural(format!(
            "merkle root mismatch: header {} computed {}",
            block.header.merkle_root, computed
        )));
    }
    Ok(())
}
