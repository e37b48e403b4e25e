// Pending transactions waiting for a block.
use crate::blockchain::{AcceptOutcome, Blockchain};
use crate::block::Block;
use crate::config::TXN_TIMEOUT;
use crate::error::{ChainError, Result};
use crate::transaction::{Inflow, Transaction};
use std::collections::{HashMap, HashSet};

pub const DEFAULT_MEMPOOL_LIMIT: usize = 5_000;

/// Transactions in first-seen order. Every entry is valid against the
/// current head and no two entries spend the same inflow.
pub struct Mempool {
    pending: Vec<Transaction>,
    claimed: HashMap<Inflow, String>,
    limit: usize,
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new(DEFAULT_MEMPOOL_LIMIT)
    }
}

impl Mempool {
    pub fn new(limit: usize) -> Self {
        Mempool {
            pending: Vec::new(),
            claimed: HashMap::new(),
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, txid: &str) -> bool {
        self.pending.iter().any(|t| t.txid == txid)
    }

    pub fn get(&self, txid: &str) -> Option<&Transaction> {
        self.pending.iter().find(|t| t.txid == txid)
    }

    pub fn snapshot(&self) -> Vec<Transaction> {
        self.pending.clone()
    }

    /// Admit `tx`. `Ok(false)` when it is already pending.
    pub fn insert(&mut self, tx: Transaction, chain: &Blockchain, now: i64) -> Result<bool> {
        if self.contains(&tx.txid) {
            return Ok(false);
        }
        if self.pending.len() >= self.limit {
            return Err(ChainError::Protocol(format!(
                "pending pool is full ({} transactions)",
                self.limit
            )));
        }

        chain.validate_pending(&tx, now)?;

        if let Some((inflow, other)) = tx
            .inflows
            .iter()
            .find_map(|i| self.claimed.get(i).map(|other| (i, other)))
        {
            return Err(ChainError::Ledger(format!(
                "inflow {}:{} already spent by pending {}",
                inflow.txid, inflow.index, other
            )));
        }

        for inflow in &tx.inflows {
            self.claimed.insert(inflow.clone(), tx.txid.clone());
        }
        log::debug!("Pending transaction {} admitted", tx.txid);
        self.pending.push(tx);
        Ok(true)
    }

    fn retain(&mut self, mut keep: impl FnMut(&Transaction) -> bool) -> usize {
        let before = self.pending.len();
        self.pending.retain(|t| keep(t));
        let live: HashSet<&str> = self.pending.iter().map(|t| t.txid.as_str()).collect();
        self.claimed.retain(|_, txid| live.contains(txid.as_str()));
        before - self.pending.len()
    }

    /// Drop entries that `blocks` confirmed or made unspendable.
    pub fn remove_confirmed(&mut self, blocks: &[Block]) -> usize {
        let mut txids = HashSet::new();
        let mut spent = HashSet::new();
        for tx in blocks.iter().flat_map(|b| b.txns.iter()) {
            txids.insert(tx.txid.clone());
            spent.extend(tx.inflows.iter().cloned());
        }
        self.retain(|t| !txids.contains(&t.txid) && !t.inflows.iter().any(|i| spent.contains(i)))
    }

    /// Drop entries too old to be mined.
    pub fn expire(&mut self, now: i64) -> usize {
        self.retain(|t| t.timestamp >= now - TXN_TIMEOUT)
    }

    /// Bring the pool in line with a head change. After a reorg the
    /// transactions of the abandoned blocks come back first, then the old
    /// pool; whatever no longer validates against the new head is dropped.
    pub fn apply_outcome(
        &mut self,
        outcome: &AcceptOutcome,
        accepted: &Block,
        chain: &Blockchain,
        now: i64,
    ) {
        match outcome {
            AcceptOutcome::Extended => {
                let removed = self.remove_confirmed(std::slice::from_ref(accepted));
                if removed > 0 {
                    log::debug!("{} pending transactions confirmed", removed);
                }
            }
            AcceptOutcome::Reorganized { disconnected, .. } => {
                let orphaned: Vec<Transaction> = disconnected
                    .iter()
                    .rev()
                    .flat_map(|b| b.txns.iter())
                    .filter(|t| !t.is_coinbase())
                    .cloned()
                    .collect();
                let previous = std::mem::take(&mut self.pending);
                self.claimed.clear();

                let mut dropped = 0;
                for tx in orphaned.into_iter().chain(previous) {
                    let txid = tx.txid.clone();
                    if let Err(err) = self.insert(tx, chain, now) {
                        log::debug!("Dropping {} after reorg [{}]: {}", txid, err.kind(), err);
                        dropped += 1;
                    }
                }
                log::info!(
                    "Pending pool rebuilt after reorg: {} kept, {} dropped",
                    self.pending.len(),
                    dropped
                );
            }
            AcceptOutcome::SideBranch | AcceptOutcome::AlreadyKnown => {}
        }
    }
}
