use crate::{BlockOrigin, NodeHandle};
use cancelchain_core::consensus;
use chrono::Utc;
use log::{error, info, warn};
use std::sync::atomic::Ordering;
use tokio::time::{Duration, sleep};

const IDLE_POLL: Duration = Duration::from_secs(2);
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Mine on the current head forever, paying coinbases to `miner_address`.
/// A new head from elsewhere raises the cancel flag and the search starts
/// over on top of it.
pub async fn run_miner(node: NodeHandle, miner_address: String) {
    info!("⛏️  Miner started, paying {}", miner_address);
    loop {
        if !node.mining.enabled.load(Ordering::SeqCst) {
            node.mining.active.store(false, Ordering::SeqCst);
            sleep(IDLE_POLL).await;
            continue;
        }
        node.mining.active.store(true, Ordering::SeqCst);
        node.mining.cancel_flag.store(false, Ordering::SeqCst);

        // Snapshot the head and pending txs while holding the locks briefly
        let template = {
            let chain = node.chain.read();
            let pending = node.mempool.lock().snapshot();
            chain.block_template(&miner_address, &pending, Utc::now().timestamp())
        };
        let template = match template {
            Ok(t) => t,
            Err(e) => {
                error!("⛏️  Could not build block template: {}", e);
                if e.is_fatal() {
                    node.shutdown.notify_one();
                    return;
                }
                sleep(RETRY_DELAY).await;
                continue;
            }
        };
        let height = template.header.idx;
        let tx_count = template.txns.len();

        // Run CPU-bound mining in a blocking task so we don't block the tokio runtime
        let cancel = node.mining.cancel_flag.clone();
        let hashrate = node.mining.current_hashrate.clone();
        let mined = tokio::task::spawn_blocking(move || {
            consensus::mine(template, &cancel, Some(hashrate))
        })
        .await;

        let block = match mined {
            Ok(Ok(Some(block))) => block,
            Ok(Ok(None)) => {
                info!("⛏️  Head moved, restarting search above it");
                continue;
            }
            Ok(Err(e)) => {
                error!("⛏️  Mining error: {}", e);
                sleep(RETRY_DELAY).await;
                continue;
            }
            Err(e) => {
                error!("⛏️  Mining task panicked: {}", e);
                sleep(RETRY_DELAY).await;
                continue;
            }
        };

        match node.submit_block(&block, BlockOrigin::Miner) {
            Ok(outcome) if outcome.head_changed() => {
                node.mining.blocks_mined.fetch_add(1, Ordering::SeqCst);
                info!(
                    "✅ Mined block {} at height {} with {} tx(s)",
                    block.block_hash, height, tx_count
                );
            }
            Ok(outcome) => {
                info!("⛏️  Mined block {} did not become head ({:?})", block.block_hash, outcome);
            }
            Err(e) => {
                warn!("⛏️  Own block {} rejected: {}", block.block_hash, e);
                if e.is_fatal() {
                    return;
                }
            }
        }
    }
}
