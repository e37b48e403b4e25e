pub mod block;
pub mod blockchain;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod db;
pub mod error;
pub mod export;
pub mod mempool;
pub mod transaction;
pub mod utxo;
pub mod wallet;

// Explicit re-exports to avoid ambiguous glob re-exports
pub use block::{Block, BlockHeader, compute_header_hash, compute_merkle_root};
pub use blockchain::{AcceptOutcome, BlockMeta, Blockchain, SubjectSummary};
pub use config::ConsensusParams;
pub use consensus::BlockTemplate;
pub use error::{ChainError, Result};
pub use mempool::Mempool;
pub use transaction::{Inflow, Outflow, Transaction};
pub use utxo::Utxo;
pub use wallet::Wallet;
