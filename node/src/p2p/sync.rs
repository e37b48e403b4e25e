//! Pull-based chain sync: ask each peer for its head, find where its
//! branch leaves ours, then fetch and submit the missing blocks.

use crate::p2p::client::PeerClient;
use crate::{BlockOrigin, NodeHandle, NodeHandles};
use anyhow::{Context, Result, anyhow, bail};
use cancelchain_core::{AcceptOutcome, Block};
use chrono::Utc;
use futures::future::join_all;
use log::{debug, info, warn};
use std::time::Duration;

/// Headers requested per step while looking for the fork point.
pub const HEADER_WINDOW: u64 = 64;
/// Blocks requested per step while catching up.
pub const BLOCK_BATCH: u64 = 32;

fn is_known(node: &NodeHandles, hash: &str) -> Result<bool> {
    Ok(node.chain.read().has_block(hash)?)
}

/// Height and hash of the highest block on the peer's branch that we
/// already store.
async fn find_fork_point<P: PeerClient + ?Sized>(
    node: &NodeHandles,
    peer: &P,
    top: u64,
) -> Result<(u64, String)> {
    let mut top = top;
    // prev_hash expected of the block just above the current window
    let mut expected_child_prev: Option<String> = None;
    loop {
        let from = top.saturating_sub(HEADER_WINDOW - 1);
        let headers = peer.headers(from, top - from + 1).await?;
        if headers.len() as u64 != top - from + 1 {
            bail!(
                "peer {} returned {} headers for {}..={}",
                peer.url(),
                headers.len(),
                from,
                top
            );
        }
        for pair in headers.windows(2) {
            if pair[1].prev_hash != pair[0].hash || pair[1].height != pair[0].height + 1 {
                bail!("peer {} sent unlinked headers at {}", peer.url(), pair[1].height);
            }
        }
        if let (Some(prev), Some(last)) = (&expected_child_prev, headers.last()) {
            if *prev != last.hash {
                bail!("peer {} changed branch during sync", peer.url());
            }
        }

        if headers[0].height != from {
            bail!("peer {} sent headers from {} instead of {}", peer.url(), headers[0].height, from);
        }

        for header in headers.iter().rev() {
            if is_known(node, &header.hash)? {
                return Ok((header.height, header.hash.clone()));
            }
        }
        if from == 0 {
            bail!("peer {} does not share our genesis block", peer.url());
        }
        expected_child_prev = headers.first().map(|h| h.prev_hash.clone());
        top = from - 1;
    }
}

fn check_batch(blocks: &[Block], mut height: u64, mut prev_hash: String) -> Result<String> {
    for block in blocks {
        if block.header.idx != height {
            bail!("expected block {} but got {}", height, block.header.idx);
        }
        if block.header.prev_hash != prev_hash {
            bail!("block {} does not link to {}", block.block_hash, prev_hash);
        }
        prev_hash = block.block_hash.clone();
        height += 1;
    }
    Ok(prev_hash)
}

/// Bring our block tree up to `peer`'s head. Returns how many new blocks
/// were stored.
pub async fn sync_with_peer<P: PeerClient + ?Sized>(node: &NodeHandles, peer: &P) -> Result<usize> {
    let head = peer.head().await?;
    node.peers.record_height(peer.url(), head.height);
    if is_known(node, &head.hash)? {
        return Ok(0);
    }

    let (fork_height, fork_hash) = find_fork_point(node, peer, head.height).await?;
    debug!(
        "Peer {} forks from us after height {} ({})",
        peer.url(),
        fork_height,
        fork_hash
    );

    let mut stored = 0usize;
    let mut next = fork_height + 1;
    let mut prev_hash = fork_hash;
    while next <= head.height {
        let count = BLOCK_BATCH.min(head.height - next + 1);
        let blocks = peer.blocks(next, count).await?;
        if blocks.is_empty() {
            bail!("peer {} returned no blocks from {}", peer.url(), next);
        }
        prev_hash = check_batch(&blocks, next, prev_hash)
            .with_context(|| format!("bad batch from peer {}", peer.url()))?;

        for block in &blocks {
            // Validation and storage block; keep them off the async workers.
            let outcome =
                tokio::task::block_in_place(|| node.submit_block(block, BlockOrigin::Sync))
                    .map_err(|e| {
                        anyhow!("block {} from {} rejected: {}", block.block_hash, peer.url(), e)
                    })?;
            if outcome != AcceptOutcome::AlreadyKnown {
                stored += 1;
            }
        }
        next += blocks.len() as u64;
    }

    if stored > 0 {
        info!("⬇️  Synced {} block(s) from {}", stored, peer.url());
    }
    Ok(stored)
}

/// One round against every configured peer.
pub async fn sync_all(node: &NodeHandle) -> usize {
    let peers = node.peers.peers().to_vec();
    let rounds = peers.iter().map(|peer| sync_with_peer(node, peer.as_ref()));
    let mut total = 0;
    for (peer, result) in peers.iter().zip(join_all(rounds).await) {
        match result {
            Ok(n) => total += n,
            Err(e) => warn!("Sync with {} failed: {:#}", peer.url(), e),
        }
    }
    total
}

/// Sync on startup, then every `interval` or whenever something pokes
/// `sync_trigger`. Also drops expired pending transactions each round.
pub async fn run_sync_loop(node: NodeHandle, interval: Duration) {
    loop {
        let expired = node.mempool.lock().expire(Utc::now().timestamp());
        if expired > 0 {
            debug!("Dropped {} expired pending transaction(s)", expired);
        }
        sync_all(&node).await;

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = node.sync_trigger.notified() => {
                debug!("Sync requested ahead of schedule");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::messages::{HeadInfo, HeaderSummary};
    use crate::tests::{memory_chain, next_block, test_node};
    use async_trait::async_trait;
    use cancelchain_core::Blockchain;
    use cancelchain_core::wallet::Wallet;
    use parking_lot::Mutex;

    struct MockPeer {
        chain: Mutex<Blockchain>,
    }

    impl MockPeer {
        fn with_blocks(n: usize, miner: &Wallet) -> Self {
            let mut chain = memory_chain();
            for _ in 0..n {
                let block = next_block(&chain, miner, &[]);
                chain.accept_block_at(&block, block.header.timestamp).unwrap();
            }
            MockPeer {
                chain: Mutex::new(chain),
            }
        }
    }

    #[async_trait]
    impl PeerClient for MockPeer {
        fn url(&self) -> &str {
            "mock://peer"
        }

        async fn head(&self) -> Result<HeadInfo> {
            Ok(HeadInfo::from(self.chain.lock().head()))
        }

        async fn headers(&self, from_height: u64, count: u64) -> Result<Vec<HeaderSummary>> {
            let metas = self.chain.lock().headers_range(from_height, count)?;
            Ok(metas.iter().map(HeaderSummary::from).collect())
        }

        async fn blocks(&self, from_height: u64, count: u64) -> Result<Vec<Block>> {
            Ok(self.chain.lock().blocks_range(from_height, count)?)
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn catches_up_from_genesis() {
        let miner = Wallet::generate();
        let peer = MockPeer::with_blocks(70, &miner);
        let node = test_node();

        let stored = sync_with_peer(&node, &peer).await.unwrap();
        assert_eq!(stored, 70);
        assert_eq!(node.chain.read().head().hash, peer.chain.lock().head().hash);
        assert_eq!(node.peers.get_peer_heights()["mock://peer"], 70);

        assert_eq!(sync_with_peer(&node, &peer).await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sync_loop_task_stores_blocks() {
        let miner = Wallet::generate();
        let peer = MockPeer::with_blocks(3, &miner);
        let expected = peer.chain.lock().head().hash.clone();
        let node = test_node();

        let task = {
            let node = node.clone();
            tokio::spawn(async move { sync_with_peer(&node, &peer).await })
        };
        assert_eq!(task.await.unwrap().unwrap(), 3);
        assert_eq!(node.chain.read().head().hash, expected);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn switches_to_heavier_peer_branch() {
        let node = test_node();
        let ours = Wallet::generate();
        for _ in 0..2 {
            let block = next_block(&node.chain.read(), &ours, &[]);
            node.submit_block(&block, BlockOrigin::Miner).unwrap();
        }

        let theirs = Wallet::generate();
        let peer = MockPeer::with_blocks(5, &theirs);
        let stored = sync_with_peer(&node, &peer).await.unwrap();
        assert_eq!(stored, 5);
        assert_eq!(node.chain.read().head().height, 5);
        assert_eq!(node.chain.read().balance(ours.address()).unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn foreign_genesis_is_an_error() {
        struct Stranger;

        #[async_trait]
        impl PeerClient for Stranger {
            fn url(&self) -> &str {
                "mock://stranger"
            }
            async fn head(&self) -> Result<HeadInfo> {
                Ok(HeadInfo {
                    height: 0,
                    hash: "ab".repeat(32),
                })
            }
            async fn headers(&self, _: u64, _: u64) -> Result<Vec<HeaderSummary>> {
                Ok(vec![HeaderSummary {
                    height: 0,
                    hash: "ab".repeat(32),
                    prev_hash: "00".repeat(32),
                }])
            }
            async fn blocks(&self, _: u64, _: u64) -> Result<Vec<Block>> {
                Ok(Vec::new())
            }
        }

        let node = test_node();
        let err = sync_with_peer(&node, &Stranger).await.unwrap_err();
        assert!(err.to_string().contains("genesis"));
    }
}
