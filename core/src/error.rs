//! Rejection reasons for blocks and transactions.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChainError {
    /// Malformed field, oversized subject, bad flow layout.
    #[error("structural error: {0}")]
    Structural(String),

    /// Bad signature or address/public key mismatch.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Missing or spent inflow, balance mismatch, double spend.
    #[error("ledger error: {0}")]
    Ledger(String),

    /// Hash does not satisfy the target or does not recompute.
    #[error("proof-of-work error: {0}")]
    ProofOfWork(String),

    /// Unknown parent or height mismatch.
    #[error("linkage error: {0}")]
    Linkage(String),

    /// Wrong target for the epoch, bad timestamps, malformed peer data.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The store itself failed. The node cannot continue safely.
    #[error("storage failure: {0}")]
    Storage(String),
}

impl ChainError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChainError::Storage(_))
    }

    /// Short tag used in logs and API replies.
    pub fn kind(&self) -> &'static str {
        match self {
            ChainError::Structural(_) => "structural",
            ChainError::Crypto(_) => "crypto",
            ChainError::Ledger(_) => "ledger",
            ChainError::ProofOfWork(_) => "proof_of_work",
            ChainError::Linkage(_) => "linkage",
            ChainError::Protocol(_) => "protocol",
            ChainError::Storage(_) => "storage",
        }
    }
}

impl From<rocksdb::Error> for ChainError {
    fn from(e: rocksdb::Error) -> Self {
        ChainError::Storage(e.to_string())
    }
}

impl From<bincode::error::EncodeError> for ChainError {
    fn from(e: bincode::error::EncodeError) -> Self {
        ChainError::Storage(format!("encode: {}", e))
    }
}

impl From<bincode::error::DecodeError> for ChainError {
    fn from(e: bincode::error::DecodeError) -> Self {
        ChainError::Storage(format!("decode: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, ChainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_storage_is_fatal() {
        assert!(ChainError::Storage("disk gone".into()).is_fatal());
        assert!(!ChainError::Ledger("spent".into()).is_fatal());
        assert_eq!(ChainError::Linkage("x".into()).kind(), "linkage");
    }
}
