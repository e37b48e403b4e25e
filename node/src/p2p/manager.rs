use crate::p2p::client::{HttpPeer, PeerClient};
use cancelchain_config::PeerConfig;
use cancelchain_core::block::Block;
use cancelchain_core::transaction::Transaction;
use log::warn;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

type Shared<T> = Arc<Mutex<T>>;

/// The configured peers plus what we last heard from them.
#[derive(Default)]
pub struct PeerManager {
    peers: Vec<Arc<HttpPeer>>,
    peer_heights: Shared<HashMap<String, u64>>,
}

impl PeerManager {
    pub fn from_config(configs: &[PeerConfig], timeout: Duration) -> anyhow::Result<Self> {
        let peers = configs
            .iter()
            .map(|c| HttpPeer::new(c, timeout).map(Arc::new))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self {
            peers,
            peer_heights: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn peers(&self) -> &[Arc<HttpPeer>] {
        &self.peers
    }

    pub fn record_height(&self, url: &str, height: u64) {
        self.peer_heights.lock().insert(url.to_string(), height);
    }

    pub fn get_peer_heights(&self) -> HashMap<String, u64> {
        self.peer_heights.lock().clone()
    }

    /// Post a block to all peers (fire-and-forget)
    pub fn broadcast_block(&self, block: &Block) {
        for peer in &self.peers {
            let peer = peer.clone();
            let block = block.clone();
            tokio::spawn(async move {
                if let Err(e) = peer.post_block(&block).await {
                    warn!("Broadcast of block {} to {} failed: {:#}", block.block_hash, peer.url(), e);
                }
            });
        }
    }

    /// Post a transaction to all peers (fire-and-forget)
    pub fn broadcast_transaction(&self, tx: &Transaction) {
        for peer in &self.peers {
            let peer = peer.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                if let Err(e) = peer.post_transaction(&tx).await {
                    warn!("Broadcast of tx {} to {} failed: {:#}", tx.txid, peer.url(), e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_one_client_per_peer() {
        let manager = PeerManager::from_config(
            &[
                PeerConfig {
                    url: "http://a:1".into(),
                    token: None,
                },
                PeerConfig {
                    url: "http://b:2".into(),
                    token: Some("x".into()),
                },
            ],
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(manager.peers().len(), 2);

        manager.record_height("http://a:1", 7);
        manager.record_height("http://a:1", 9);
        assert_eq!(manager.get_peer_heights()["http://a:1"], 9);
    }
}
