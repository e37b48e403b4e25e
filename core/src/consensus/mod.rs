// Proof-of-work search over a block template.
use crate::block::{Block, BlockHeader, compute_header_hash};
use crate::blockchain::difficulty::meets_target;
use crate::error::Result;
use crate::transaction::Transaction;
use chrono::Utc;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

/// Nonces tried between cancellation checks and clock refreshes.
pub const NONCE_BATCH: u64 = 100_000;

/// Everything needed to mine one block; the header's nonce is the only
/// thing the search changes, besides the timestamp.
#[derive(Debug, Clone)]
pub struct BlockTemplate {
    pub header: BlockHeader,
    pub txns: Vec<Transaction>,
}

/// Search nonces until the header hash meets its target.
/// Returns `Ok(None)` once `cancel_flag` is raised. Run it in spawn_blocking.
pub fn mine(
    template: BlockTemplate,
    cancel_flag: &AtomicBool,
    hashrate: Option<Arc<Mutex<f64>>>,
) -> Result<Option<Block>> {
    search(template, cancel_flag, hashrate, true)
}

/// Like `mine`, but never moves the header timestamp.
pub fn mine_at_fixed_time(template: BlockTemplate, cancel_flag: &AtomicBool) -> Result<Option<Block>> {
    search(template, cancel_flag, None, false)
}

fn search(
    template: BlockTemplate,
    cancel_flag: &AtomicBool,
    hashrate: Option<Arc<Mutex<f64>>>,
    refresh_clock: bool,
) -> Result<Option<Block>> {
    let BlockTemplate { mut header, txns } = template;
    let mining_start = std::time::Instant::now();
    let mut last_hashrate_update = mining_start;
    let mut hashes_since_update: u64 = 0;
    let mut tried: u64 = 0;

    // ⛏️ CPU mining loop
    loop {
        let hash = compute_header_hash(&header)?;
        if meets_target(&hash, header.target)? {
            log::debug!(
                "⛏️  Found nonce {} for height {} after {} hashes",
                header.proof_of_work,
                header.idx,
                tried + 1
            );
            return Ok(Some(Block {
                header,
                block_hash: hash,
                txns,
            }));
        }

        header.proof_of_work = header.proof_of_work.wrapping_add(1);
        tried += 1;
        hashes_since_update += 1;

        if tried % NONCE_BATCH == 0 {
            if cancel_flag.load(Ordering::Relaxed) {
                log::debug!("⛏️  Mining at height {} cancelled", header.idx);
                return Ok(None);
            }

            if refresh_clock {
                header.timestamp = header.timestamp.max(Utc::now().timestamp());
            }

            let elapsed = last_hashrate_update.elapsed();
            if elapsed.as_secs() >= 1 {
                let current_hashrate = hashes_since_update as f64 / elapsed.as_secs_f64();
                if let Some(ref hr) = hashrate {
                    if let Ok(mut hr_lock) = hr.try_lock() {
                        *hr_lock = current_hashrate;
                    }
                }
                log::debug!(
                    "⛏️  Current hashrate: {:.2} H/s (bits: 0x{:08x})",
                    current_hashrate,
                    header.target
                );
                hashes_since_update = 0;
                last_hashrate_update = std::time::Instant::now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::compute_merkle_root;
    use crate::config::{BLOCK_VERSION, REGTEST_MAX_BITS};
    use crate::wallet::Wallet;

    fn template(target: u32) -> BlockTemplate {
        let miner = Wallet::generate();
        let coinbase = Transaction::coinbase(miner.address(), 1_700_000_000).unwrap();
        BlockTemplate {
            header: BlockHeader {
                idx: 1,
                version: BLOCK_VERSION,
                timestamp: 1_700_000_000,
                prev_hash: "00".repeat(32),
                merkle_root: compute_merkle_root(&[coinbase.txid.clone()]).unwrap(),
                target,
                proof_of_work: 0,
            },
            txns: vec![coinbase],
        }
    }

    #[test]
    fn mined_block_meets_target() {
        let block = mine_at_fixed_time(template(0x1f7fffff), &AtomicBool::new(false))
            .unwrap()
            .unwrap();
        assert_eq!(block.block_hash, compute_header_hash(&block.header).unwrap());
        assert!(meets_target(&block.block_hash, 0x1f7fffff).unwrap());
        assert_eq!(block.header.timestamp, 1_700_000_000);
    }

    #[test]
    fn clock_only_moves_forward() {
        let hashrate = Arc::new(Mutex::new(0.0));
        let block = mine(template(REGTEST_MAX_BITS), &AtomicBool::new(false), Some(hashrate))
            .unwrap()
            .unwrap();
        assert!(block.header.timestamp >= 1_700_000_000);
    }

    #[test]
    fn cancel_returns_none() {
        // Practically unreachable target; only the flag ends the search.
        let cancelled = AtomicBool::new(true);
        assert!(mine(template(0x03000001), &cancelled, None).unwrap().is_none());
    }
}
