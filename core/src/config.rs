// Protocol constants for the cancelchain ledger

// ========== Token Definition ==========
/// Smallest unit per whole grumble.
pub const CURMUDGEONS_PER_GRUMBLE: u64 = 100;

/// Coinbase reward: 100 grumbles. Fixed for every block.
pub const BLOCK_REWARD: u64 = 100 * CURMUDGEONS_PER_GRUMBLE;

// ========== Subjects ==========
/// Subject/forgive/support tags must be shorter than this many UTF-8 bytes.
pub const MAX_SUBJECT_BYTES: usize = 80;

// ========== Block / Transaction Limits ==========
pub const BLOCK_VERSION: u32 = 1;
pub const TRANSACTION_VERSION: u32 = 1;

/// Coinbase included.
pub const MAX_TRANSACTIONS: usize = 100;

/// Per direction: at most this many inflows and this many outflows.
pub const MAX_FLOWS: usize = 50;

/// A transaction is only minable within this many seconds before the block timestamp.
pub const TXN_TIMEOUT: i64 = 4 * 60 * 60;

/// Clock drift tolerance for incoming blocks.
pub const MAX_FUTURE_BLOCK_SECONDS: i64 = 2 * 60 * 60;

// ========== Difficulty ==========
pub const EPOCH: u64 = 2016;
pub const TARGET_BLOCK_SECONDS: i64 = 600;

/// Easiest target on mainnet, compact form of 0x000000ffff00..00.
pub const MAINNET_MAX_BITS: u32 = 0x1e00ffff;

/// Easiest target on regtest, compact form of 0x7fffff00..00.
pub const REGTEST_MAX_BITS: u32 = 0x207fffff;

/// Genesis is hard-coded, never mined.
pub const GENESIS_TIMESTAMP: i64 = 1_640_995_200;
pub const GENESIS_SEED: &[u8] = b"GENESIS";

/// Chain parameters that differ between networks. Reward and subject
/// length are global constants above.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusParams {
    pub max_bits: u32,
    pub epoch: u64,
    pub target_block_seconds: i64,
}

impl ConsensusParams {
    pub fn mainnet() -> Self {
        Self {
            max_bits: MAINNET_MAX_BITS,
            epoch: EPOCH,
            target_block_seconds: TARGET_BLOCK_SECONDS,
        }
    }

    pub fn regtest() -> Self {
        Self {
            max_bits: REGTEST_MAX_BITS,
            epoch: EPOCH,
            target_block_seconds: TARGET_BLOCK_SECONDS,
        }
    }

    pub fn for_network(name: &str) -> Option<Self> {
        match name {
            "mainnet" => Some(Self::mainnet()),
            "regtest" => Some(Self::regtest()),
            _ => None,
        }
    }

    /// Expected wall time of one epoch in seconds.
    pub fn epoch_seconds(&self) -> i64 {
        self.epoch as i64 * self.target_block_seconds
    }
}

impl Default for ConsensusParams {
    fn default() -> Self {
        Self::mainnet()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reward_in_curmudgeons() {
        assert_eq!(BLOCK_REWARD, 10_000);
    }

    #[test]
    fn test_network_lookup() {
        assert_eq!(ConsensusParams::for_network("mainnet"), Some(ConsensusParams::mainnet()));
        assert_eq!(
            ConsensusParams::for_network("regtest").map(|p| p.max_bits),
            Some(REGTEST_MAX_BITS)
        );
        assert!(ConsensusParams::for_network("testnet").is_none());
    }

    #[test]
    fn test_epoch_seconds() {
        assert_eq!(ConsensusParams::mainnet().epoch_seconds(), 2016 * 600);
    }
}
