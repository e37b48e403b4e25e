pub mod miner;
pub mod p2p;
pub mod send;
pub mod server;

pub use crate::p2p::manager::PeerManager;
pub use server::run_server;

use cancelchain_core::{AcceptOutcome, Block, Blockchain, ChainError, Mempool, Transaction};
use chrono::Utc;
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use server::auth::RoleTable;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;

pub struct NodeHandles {
    pub chain: Arc<RwLock<Blockchain>>,
    pub mempool: Arc<Mutex<Mempool>>,
    pub mining: Arc<MiningState>,
    pub peers: Arc<PeerManager>,
    pub roles: Arc<RoleTable>,
    /// Wakes the sync loop ahead of its interval.
    pub sync_trigger: Arc<Notify>,
    /// Raised after a storage failure; the binary exits on it.
    pub shutdown: Arc<Notify>,
    pub node_start_time: std::time::Instant,
}

// Lock order (when nested): chain -> mempool.

pub type NodeHandle = Arc<NodeHandles>;

pub struct MiningState {
    /// Raised to abandon the current nonce search when the head moves
    pub cancel_flag: Arc<AtomicBool>,
    /// Admin switch; the miner idles while this is false
    pub enabled: Arc<AtomicBool>,
    pub active: Arc<AtomicBool>,
    pub current_hashrate: Arc<std::sync::Mutex<f64>>,
    pub blocks_mined: Arc<AtomicU64>,
}

impl MiningState {
    pub fn new(enabled: bool) -> Self {
        Self {
            cancel_flag: Arc::new(AtomicBool::new(false)),
            enabled: Arc::new(AtomicBool::new(enabled)),
            active: Arc::new(AtomicBool::new(false)),
            current_hashrate: Arc::new(std::sync::Mutex::new(0.0)),
            blocks_mined: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// Where a block came from; decides whether it is relayed and whether it
/// interrupts local mining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOrigin {
    Miner,
    Api,
    Sync,
}

impl NodeHandles {
    pub fn new(chain: Blockchain, peers: PeerManager, roles: RoleTable, mine: bool) -> NodeHandle {
        Arc::new(NodeHandles {
            chain: Arc::new(RwLock::new(chain)),
            mempool: Arc::new(Mutex::new(Mempool::default())),
            mining: Arc::new(MiningState::new(mine)),
            peers: Arc::new(peers),
            roles: Arc::new(roles),
            sync_trigger: Arc::new(Notify::new()),
            shutdown: Arc::new(Notify::new()),
            node_start_time: std::time::Instant::now(),
        })
    }

    /// Run `block` through the validator, then bring the pending pool and
    /// the miner in line with the result.
    pub fn submit_block(
        &self,
        block: &Block,
        origin: BlockOrigin,
    ) -> Result<AcceptOutcome, ChainError> {
        let now = Utc::now().timestamp();
        let result = {
            let mut chain = self.chain.write();
            match chain.accept_block(block) {
                Ok(outcome) => {
                    let chain = RwLockWriteGuard::downgrade(chain);
                    if outcome.head_changed() {
                        self.mempool
                            .lock()
                            .apply_outcome(&outcome, block, &chain, now);
                    }
                    Ok(outcome)
                }
                Err(err) => Err(err),
            }
        };

        match &result {
            Ok(outcome) => {
                if outcome.head_changed() && origin != BlockOrigin::Miner {
                    self.mining.cancel_flag.store(true, Ordering::SeqCst);
                }
                if *outcome != AcceptOutcome::AlreadyKnown && origin != BlockOrigin::Sync {
                    self.peers.broadcast_block(block);
                }
            }
            Err(ChainError::Linkage(_)) if origin == BlockOrigin::Api => {
                log::info!(
                    "Parent of {} unknown, requesting sync",
                    block.block_hash
                );
                self.sync_trigger.notify_one();
            }
            Err(err) if err.is_fatal() => {
                log::error!("💥 Storage failure, shutting down: {}", err);
                self.shutdown.notify_one();
            }
            Err(_) => {}
        }
        result
    }

    /// Admit a transaction to the pending pool and relay it. `Ok(false)`
    /// when it was already pending.
    pub fn submit_transaction(&self, tx: &Transaction) -> Result<bool, ChainError> {
        let now = Utc::now().timestamp();
        let added = {
            let chain = self.chain.read();
            self.mempool.lock().insert(tx.clone(), &chain, now)
        };
        match added {
            Ok(true) => {
                log::info!("Received transaction {}", tx.txid);
                self.peers.broadcast_transaction(tx);
                Ok(true)
            }
            Ok(false) => {
                log::debug!("Duplicate transaction {}", tx.txid);
                Ok(false)
            }
            Err(err) => {
                log::warn!(
                    "🚫 Transaction rejected [{}]: {} {}",
                    err.kind(),
                    tx.txid,
                    err
                );
                if err.is_fatal() {
                    self.shutdown.notify_one();
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use cancelchain_core::config::ConsensusParams;
    use cancelchain_core::consensus;
    use cancelchain_core::db::MemoryStore;
    use cancelchain_core::wallet::Wallet;
    use cancelchain_core::transaction::builder;

    pub fn memory_chain() -> Blockchain {
        Blockchain::open(Box::new(MemoryStore::new()), ConsensusParams::regtest()).unwrap()
    }

    pub fn test_node() -> NodeHandle {
        NodeHandles::new(memory_chain(), PeerManager::default(), RoleTable::default(), false)
    }

    /// Mine one block on `chain`'s head with a clock that never moves.
    pub fn next_block(chain: &Blockchain, miner: &Wallet, pending: &[Transaction]) -> Block {
        let template = chain
            .block_template(miner.address(), pending, chain.head().timestamp + 600)
            .unwrap();
        consensus::mine_at_fixed_time(template, &AtomicBool::new(false))
            .unwrap()
            .unwrap()
    }

    #[test]
    fn foreign_block_cancels_mining() {
        let node = test_node();
        let miner = Wallet::generate();
        let block = next_block(&node.chain.read(), &miner, &[]);

        let outcome = node.submit_block(&block, BlockOrigin::Sync).unwrap();
        assert_eq!(outcome, AcceptOutcome::Extended);
        assert!(node.mining.cancel_flag.load(Ordering::SeqCst));

        node.mining.cancel_flag.store(false, Ordering::SeqCst);
        let own = next_block(&node.chain.read(), &miner, &[]);
        node.submit_block(&own, BlockOrigin::Miner).unwrap();
        assert!(!node.mining.cancel_flag.load(Ordering::SeqCst));
    }

    #[test]
    fn accepted_block_clears_pending() {
        let node = test_node();
        let alice = Wallet::generate();
        let bob = Wallet::generate();
        let first = next_block(&node.chain.read(), &alice, &[]);
        node.submit_block(&first, BlockOrigin::Sync).unwrap();

        let tx = {
            let chain = node.chain.read();
            let utxos = chain.utxos_for(alice.address()).unwrap();
            builder::transfer(&alice, &utxos, bob.address(), 25, Utc::now().timestamp()).unwrap()
        };
        assert!(node.submit_transaction(&tx).unwrap());
        assert!(!node.submit_transaction(&tx).unwrap());
        assert_eq!(node.mempool.lock().len(), 1);

        // The block must be dated after the transaction.
        let block = {
            let chain = node.chain.read();
            let template = chain
                .block_template(alice.address(), &node.mempool.lock().snapshot(), tx.timestamp)
                .unwrap();
            consensus::mine_at_fixed_time(template, &AtomicBool::new(false))
                .unwrap()
                .unwrap()
        };
        assert_eq!(block.txns.len(), 2);
        node.submit_block(&block, BlockOrigin::Sync).unwrap();
        assert!(node.mempool.lock().is_empty());
        assert_eq!(node.chain.read().balance(bob.address()).unwrap(), 25);
    }

    #[test]
    fn rejected_block_leaves_head() {
        let node = test_node();
        let miner = Wallet::generate();
        let mut block = next_block(&node.chain.read(), &miner, &[]);
        block.header.prev_hash = "cd".repeat(32);
        assert!(matches!(
            node.submit_block(&block, BlockOrigin::Sync),
            Err(ChainError::Linkage(_))
        ));
        assert_eq!(node.chain.read().head().height, 0);
    }
}
