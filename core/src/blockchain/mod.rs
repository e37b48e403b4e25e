pub mod difficulty;

use crate::block::{
    Block, BlockHeader, check_merkle_root, compute_header_hash, compute_merkle_root,
};
use crate::config::{
    BLOCK_VERSION, ConsensusParams, MAX_FUTURE_BLOCK_SECONDS, MAX_TRANSACTIONS, TXN_TIMEOUT,
};
use crate::consensus::BlockTemplate;
use crate::db::{
    self, RocksStore, Store, StoreBatch, TIP_KEY, block_key, branch_tip_key, height_key, meta_key,
    tx_key,
};
use crate::error::{ChainError, Result};
use crate::transaction::Transaction;
use crate::utxo::{Ledger, LedgerOverlay, LedgerView, Utxo};
use bincode::{Decode, Encode};
use chrono::Utc;
use self::difficulty::{block_work, meets_target, retarget};
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Per-block bookkeeping kept next to every stored block, canonical or not.
#[derive(Encode, Decode, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BlockMeta {
    pub hash: String,
    pub prev_hash: String,
    pub height: u64,
    pub timestamp: i64,
    pub target: u32,
    pub work_raw: [u64; 4], // cumulative work, little-endian limbs
}

impl BlockMeta {
    fn of(block: &Block, work: U256) -> Self {
        BlockMeta {
            hash: block.block_hash.clone(),
            prev_hash: block.header.prev_hash.clone(),
            height: block.header.idx,
            timestamp: block.header.timestamp,
            target: block.header.target,
            work_raw: work.0,
        }
    }

    pub fn work(&self) -> U256 {
        U256(self.work_raw)
    }

    /// Head selection: more cumulative work wins, equal work goes to the
    /// numerically lower hash.
    pub fn beats(&self, other: &BlockMeta) -> bool {
        match self.work().cmp(&other.work()) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.hash < other.hash,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptOutcome {
    AlreadyKnown,
    /// New head on top of the old one.
    Extended,
    /// Head moved to another branch. `disconnected` runs from the old head
    /// down to the fork point, `connected` from the fork point up to the new
    /// head.
    Reorganized {
        disconnected: Vec<Block>,
        connected: Vec<Block>,
    },
    SideBranch,
}

impl AcceptOutcome {
    pub fn head_changed(&self) -> bool {
        matches!(
            self,
            AcceptOutcome::Extended | AcceptOutcome::Reorganized { .. }
        )
    }
}

/// Opposition, forgiveness and support currently recorded for a subject.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectSummary {
    pub subject: String,
    pub opposed: u64,
    pub forgiven: u64,
    pub supported: u64,
}

/// Block tree plus the ledger of its heaviest branch.
pub struct Blockchain {
    store: Box<dyn Store>,
    params: ConsensusParams,
    head: BlockMeta,
}

impl Blockchain {
    /// Open a chain over `store`, installing genesis on first use.
    pub fn open(mut store: Box<dyn Store>, params: ConsensusParams) -> Result<Self> {
        let head = match db::load::<String>(store.as_ref(), TIP_KEY)? {
            Some(tip) => db::load::<BlockMeta>(store.as_ref(), &meta_key(&tip))?.ok_or_else(
                || ChainError::Storage(format!("tip {} has no metadata", tip)),
            )?,
            None => {
                let genesis = Block::genesis(params.max_bits);
                let meta = BlockMeta::of(&genesis, U256::zero());
                let mut batch = StoreBatch::default();
                batch.put_encoded(block_key(&genesis.block_hash), &genesis)?;
                batch.put_encoded(meta_key(&genesis.block_hash), &meta)?;
                batch.put(branch_tip_key(&genesis.block_hash), b"");
                batch.put_encoded(height_key(0), &genesis.block_hash)?;
                batch.put_encoded(TIP_KEY, &genesis.block_hash)?;
                store.write(batch)?;
                log::info!("Installed genesis block {}", genesis.block_hash);
                meta
            }
        };

        log::info!(
            "Blockchain opened: height={} head={} max_bits=0x{:08x}",
            head.height,
            head.hash,
            params.max_bits
        );
        Ok(Blockchain {
            store,
            params,
            head,
        })
    }

    pub fn open_rocks(path: impl AsRef<Path>, params: ConsensusParams) -> Result<Self> {
        Self::open(Box::new(RocksStore::open(path)?), params)
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn head(&self) -> &BlockMeta {
        &self.head
    }

    pub fn has_block(&self, hash: &str) -> Result<bool> {
        self.store.exists(meta_key(hash).as_bytes())
    }

    pub fn load_block(&self, hash: &str) -> Result<Option<Block>> {
        db::load(self.store.as_ref(), &block_key(hash))
    }

    pub fn load_meta(&self, hash: &str) -> Result<Option<BlockMeta>> {
        db::load(self.store.as_ref(), &meta_key(hash))
    }

    pub fn load_tx(&self, txid: &str) -> Result<Option<Transaction>> {
        db::load(self.store.as_ref(), &tx_key(txid))
    }

    fn require_block(&self, hash: &str) -> Result<Block> {
        self.load_block(hash)?
            .ok_or_else(|| ChainError::Storage(format!("block {} is missing", hash)))
    }

    fn require_meta(&self, hash: &str) -> Result<BlockMeta> {
        self.load_meta(hash)?
            .ok_or_else(|| ChainError::Storage(format!("metadata for {} is missing", hash)))
    }

    /// Canonical block hash at `height`.
    pub fn hash_at_height(&self, height: u64) -> Result<Option<String>> {
        db::load(self.store.as_ref(), &height_key(height))
    }

    pub fn block_at_height(&self, height: u64) -> Result<Option<Block>> {
        match self.hash_at_height(height)? {
            Some(hash) => self.load_block(&hash),
            None => Ok(None),
        }
    }

    /// Up to `count` canonical blocks starting at `from_height`.
    pub fn blocks_range(&self, from_height: u64, count: u64) -> Result<Vec<Block>> {
        let mut out = Vec::new();
        for height in from_height..from_height.saturating_add(count) {
            match self.block_at_height(height)? {
                Some(block) => out.push(block),
                None => break,
            }
        }
        Ok(out)
    }

    pub fn headers_range(&self, from_height: u64, count: u64) -> Result<Vec<BlockMeta>> {
        let mut out = Vec::new();
        for height in from_height..from_height.saturating_add(count) {
            match self.hash_at_height(height)? {
                Some(hash) => out.push(self.require_meta(&hash)?),
                None => break,
            }
        }
        Ok(out)
    }

    /// Every block without a known child.
    pub fn branch_tips(&self) -> Result<Vec<BlockMeta>> {
        let mut tips = Vec::new();
        for (key, _) in self.store.scan_prefix(b"h:")? {
            let hash = String::from_utf8_lossy(&key[2..]).into_owned();
            tips.push(self.require_meta(&hash)?);
        }
        tips.sort_by(|a, b| b.work().cmp(&a.work()).then_with(|| a.hash.cmp(&b.hash)));
        Ok(tips)
    }

    fn is_canonical(&self, meta: &BlockMeta) -> Result<bool> {
        Ok(self.hash_at_height(meta.height)?.as_deref() == Some(meta.hash.as_str()))
    }

    /// Ancestor of `from` at `height` on the same branch.
    pub fn ancestor_at(&self, from: &BlockMeta, height: u64) -> Result<BlockMeta> {
        if height > from.height {
            return Err(ChainError::Linkage(format!(
                "no ancestor at height {} below {}",
                height, from.height
            )));
        }
        if self.is_canonical(from)? {
            let hash = self.hash_at_height(height)?.ok_or_else(|| {
                ChainError::Storage(format!("canonical index missing height {}", height))
            })?;
            return self.require_meta(&hash);
        }
        let mut cursor = from.clone();
        while cursor.height > height {
            cursor = self.require_meta(&cursor.prev_hash)?;
        }
        Ok(cursor)
    }

    /// Target a child of `parent` must carry.
    pub fn next_target(&self, parent: &BlockMeta) -> Result<u32> {
        let height = parent.height + 1;
        let epoch = self.params.epoch.max(1);
        if height % epoch != 0 {
            return Ok(parent.target);
        }
        let first = self.ancestor_at(parent, height - epoch)?;
        Ok(retarget(
            parent.target,
            parent.timestamp - first.timestamp,
            &self.params,
        ))
    }

    pub fn find_common_ancestor(&self, a: &BlockMeta, b: &BlockMeta) -> Result<BlockMeta> {
        let mut a = a.clone();
        let mut b = b.clone();
        while a.height > b.height {
            a = self.require_meta(&a.prev_hash)?;
        }
        while b.height > a.height {
            b = self.require_meta(&b.prev_hash)?;
        }
        while a.hash != b.hash {
            if a.height == 0 {
                return Err(ChainError::Storage(format!(
                    "branches {} and {} share no genesis",
                    a.hash, b.hash
                )));
            }
            a = self.require_meta(&a.prev_hash)?;
            b = self.require_meta(&b.prev_hash)?;
        }
        Ok(a)
    }

    fn undo_block(&self, view: &mut LedgerOverlay<'_>, block: &Block) -> Result<()> {
        for tx in block.txns.iter().rev() {
            let mut restored = Vec::with_capacity(tx.inflows.len());
            for inflow in &tx.inflows {
                let source = self.load_tx(&inflow.txid)?.ok_or_else(|| {
                    ChainError::Storage(format!("cannot find spent tx {}", inflow.txid))
                })?;
                let outflow = source.outflows.get(inflow.index as usize).ok_or_else(|| {
                    ChainError::Storage(format!(
                        "spent output {}:{} does not exist",
                        inflow.txid, inflow.index
                    ))
                })?;
                restored.push(Utxo::from_outflow(&source, inflow.index, outflow));
            }
            view.unapply(tx, restored);
        }
        Ok(())
    }

    fn redo_block(&self, view: &mut LedgerOverlay<'_>, block: &Block) -> Result<()> {
        for tx in &block.txns {
            let mut spent = Vec::with_capacity(tx.inflows.len());
            for inflow in &tx.inflows {
                spent.push(view.unspent(inflow)?.ok_or_else(|| {
                    ChainError::Storage(format!(
                        "replaying {}: inflow {}:{} not available",
                        block.block_hash, inflow.txid, inflow.index
                    ))
                })?);
            }
            view.apply(tx, spent);
        }
        Ok(())
    }

    /// Ledger as of `parent`, plus the blocks undone from the head and
    /// replayed onto the fork to get there.
    fn ledger_view_at(
        &self,
        parent: &BlockMeta,
    ) -> Result<(LedgerOverlay<'_>, Vec<Block>, Vec<Block>)> {
        let mut view = LedgerOverlay::new(self.store.as_ref());
        if parent.hash == self.head.hash {
            return Ok((view, vec![], vec![]));
        }

        let fork = self.find_common_ancestor(&self.head, parent)?;

        let mut disconnected = Vec::new();
        let mut cursor = self.head.clone();
        while cursor.hash != fork.hash {
            let block = self.require_block(&cursor.hash)?;
            self.undo_block(&mut view, &block)?;
            cursor = self.require_meta(&cursor.prev_hash)?;
            disconnected.push(block);
        }

        let mut connected = Vec::new();
        let mut cursor = parent.clone();
        while cursor.hash != fork.hash {
            connected.push(self.require_block(&cursor.hash)?);
            cursor = self.require_meta(&cursor.prev_hash)?;
        }
        connected.reverse();
        for block in &connected {
            self.redo_block(&mut view, block)?;
        }

        Ok((view, disconnected, connected))
    }

    fn check_block_structure(block: &Block) -> Result<()> {
        if block.txns.is_empty() {
            return Err(ChainError::Structural("block has no transactions".into()));
        }
        if block.txns.len() > MAX_TRANSACTIONS {
            return Err(ChainError::Structural(format!(
                "block carries {} transactions, limit {}",
                block.txns.len(),
                MAX_TRANSACTIONS
            )));
        }
        if block.header.version != BLOCK_VERSION {
            return Err(ChainError::Structural(format!(
                "unsupported block version {}",
                block.header.version
            )));
        }
        if !block.txns[0].is_coinbase() {
            return Err(ChainError::Structural(
                "first transaction must be the coinbase".into(),
            ));
        }
        if block.txns[1..].iter().any(|t| t.is_coinbase()) {
            return Err(ChainError::Structural(
                "only the first transaction may be a coinbase".into(),
            ));
        }
        let mut seen = HashSet::new();
        for tx in &block.txns {
            if !seen.insert(tx.txid.as_str()) {
                return Err(ChainError::Structural(format!(
                    "transaction {} appears twice",
                    tx.txid
                )));
            }
        }
        check_merkle_root(block)
    }

    fn check_header(&self, block: &Block, parent: &BlockMeta, now: i64) -> Result<()> {
        let header = &block.header;
        if header.idx != parent.height + 1 {
            return Err(ChainError::Linkage(format!(
                "block idx {} does not follow parent height {}",
                header.idx, parent.height
            )));
        }
        // Strictly increasing; a block sharing its parent's second is refused.
        if header.timestamp <= parent.timestamp {
            return Err(ChainError::Protocol(format!(
                "timestamp {} not after parent timestamp {}",
                header.timestamp, parent.timestamp
            )));
        }
        if header.timestamp > now + MAX_FUTURE_BLOCK_SECONDS {
            return Err(ChainError::Protocol(format!(
                "timestamp {} is more than {}s ahead of local clock",
                header.timestamp, MAX_FUTURE_BLOCK_SECONDS
            )));
        }

        let computed = compute_header_hash(header)?;
        if computed != block.block_hash {
            return Err(ChainError::ProofOfWork(format!(
                "header hash mismatch: computed {} != block hash {}",
                computed, block.block_hash
            )));
        }

        let expected = self.next_target(parent)?;
        if header.target != expected {
            return Err(ChainError::Protocol(format!(
                "target 0x{:08x} differs from prescribed 0x{:08x}",
                header.target, expected
            )));
        }
        if !meets_target(&block.block_hash, header.target)? {
            return Err(ChainError::ProofOfWork(format!(
                "hash {} is above target 0x{:08x}",
                block.block_hash, header.target
            )));
        }
        Ok(())
    }

    fn check_transactions(
        block: &Block,
        parent: &BlockMeta,
        view: &mut LedgerOverlay<'_>,
    ) -> Result<()> {
        let block_ts = block.header.timestamp;
        for tx in &block.txns {
            let spent = if tx.is_coinbase() {
                if tx.timestamp <= parent.timestamp || tx.timestamp > block_ts {
                    return Err(ChainError::Protocol(format!(
                        "coinbase timestamp {} outside ({}, {}]",
                        tx.timestamp, parent.timestamp, block_ts
                    )));
                }
                tx.validate(&*view)?
            } else {
                tx.check_timing(block_ts)?;
                tx.validate(&*view)?
            };
            view.apply(tx, spent);
        }
        Ok(())
    }

    /// Validate `block` and store it, moving the head when its branch wins.
    pub fn accept_block(&mut self, block: &Block) -> Result<AcceptOutcome> {
        self.accept_block_at(block, Utc::now().timestamp())
    }

    /// `accept_block` against an explicit local clock.
    pub fn accept_block_at(&mut self, block: &Block, now: i64) -> Result<AcceptOutcome> {
        match self.try_accept(block, now) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                if err.is_fatal() {
                    log::error!("💥 Storage failure accepting {}: {}", block.block_hash, err);
                } else {
                    log::warn!(
                        "🚫 Block rejected [{}]: height={} hash={} {}",
                        err.kind(),
                        block.header.idx,
                        block.block_hash,
                        err
                    );
                }
                Err(err)
            }
        }
    }

    fn try_accept(&mut self, block: &Block, now: i64) -> Result<AcceptOutcome> {
        if self.has_block(&block.block_hash)? {
            return Ok(AcceptOutcome::AlreadyKnown);
        }

        Self::check_block_structure(block)?;

        let parent = self.load_meta(&block.header.prev_hash)?.ok_or_else(|| {
            ChainError::Linkage(format!("unknown parent {}", block.header.prev_hash))
        })?;
        self.check_header(block, &parent, now)?;

        let (mut view, disconnected, mut connected) = self.ledger_view_at(&parent)?;
        Self::check_transactions(block, &parent, &mut view)?;

        let work = parent.work().saturating_add(block_work(block.header.target));
        let meta = BlockMeta::of(block, work);

        let mut batch = StoreBatch::default();
        batch.put_encoded(block_key(&block.block_hash), block)?;
        for tx in &block.txns {
            batch.put_encoded(tx_key(&tx.txid), tx)?;
        }
        batch.put_encoded(meta_key(&block.block_hash), &meta)?;
        batch.delete(branch_tip_key(&parent.hash));
        batch.put(branch_tip_key(&block.block_hash), b"");

        let extends_head = parent.hash == self.head.hash;
        let outcome = if extends_head || meta.beats(&self.head) {
            view.write_into(&mut batch)?;
            for height in (meta.height + 1)..=self.head.height {
                batch.delete(height_key(height));
            }
            connected.push(block.clone());
            for b in &connected {
                batch.put_encoded(height_key(b.header.idx), &b.block_hash)?;
            }
            batch.put_encoded(TIP_KEY, &block.block_hash)?;

            if extends_head {
                AcceptOutcome::Extended
            } else {
                AcceptOutcome::Reorganized {
                    disconnected,
                    connected,
                }
            }
        } else {
            drop(view);
            AcceptOutcome::SideBranch
        };

        self.store.write(batch)?;

        match &outcome {
            AcceptOutcome::Extended => {
                log::info!(
                    "✅ Block {} accepted at height {} ({} txs)",
                    meta.hash,
                    meta.height,
                    block.txns.len()
                );
                self.head = meta;
            }
            AcceptOutcome::Reorganized {
                disconnected,
                connected,
            } => {
                log::warn!(
                    "🔄 Reorganized to {} at height {}: {} blocks disconnected, {} connected",
                    meta.hash,
                    meta.height,
                    disconnected.len(),
                    connected.len()
                );
                self.head = meta;
            }
            _ => log::info!(
                "Stored side-branch block {} at height {}",
                meta.hash,
                meta.height
            ),
        }
        Ok(outcome)
    }

    /// Check a loose transaction against the head ledger and the local clock.
    pub fn validate_pending(&self, tx: &Transaction, now: i64) -> Result<Vec<Utxo>> {
        if tx.is_coinbase() {
            return Err(ChainError::Structural(
                "coinbase transactions are only valid inside blocks".into(),
            ));
        }
        if tx.timestamp > now + MAX_FUTURE_BLOCK_SECONDS {
            return Err(ChainError::Protocol(format!(
                "transaction {} is dated in the future",
                tx.txid
            )));
        }
        if tx.timestamp < now - TXN_TIMEOUT {
            return Err(ChainError::Protocol(format!(
                "transaction {} has expired",
                tx.txid
            )));
        }
        tx.validate(&Ledger::new(self.store.as_ref()))
    }

    /// Next block on top of the head: coinbase first, then the pending
    /// transactions that are still valid, in the order given.
    pub fn block_template(
        &self,
        miner_address: &str,
        pending: &[Transaction],
        timestamp: i64,
    ) -> Result<BlockTemplate> {
        let parent = &self.head;
        let timestamp = timestamp.max(parent.timestamp + 1);
        let coinbase = Transaction::coinbase(miner_address, timestamp)?;

        let mut view = LedgerOverlay::new(self.store.as_ref());
        let spent = coinbase.validate(&view)?;
        view.apply(&coinbase, spent);
        let mut txns = vec![coinbase];

        for tx in pending {
            if txns.len() >= MAX_TRANSACTIONS {
                break;
            }
            if tx.is_coinbase() {
                continue;
            }
            let checked = tx.check_timing(timestamp).and_then(|_| tx.validate(&view));
            match checked {
                Ok(spent) => {
                    view.apply(tx, spent);
                    txns.push(tx.clone());
                }
                Err(err) => {
                    log::debug!("Leaving {} out of template [{}]: {}", tx.txid, err.kind(), err)
                }
            }
        }

        let txids: Vec<String> = txns.iter().map(|t| t.txid.clone()).collect();
        let header = BlockHeader {
            idx: parent.height + 1,
            version: BLOCK_VERSION,
            timestamp,
            prev_hash: parent.hash.clone(),
            merkle_root: compute_merkle_root(&txids)?,
            target: self.next_target(parent)?,
            proof_of_work: 0,
        };
        Ok(BlockTemplate { header, txns })
    }

    pub fn utxos_for(&self, address: &str) -> Result<Vec<Utxo>> {
        Ledger::new(self.store.as_ref()).owned_by(address)
    }

    /// Spendable plain weight held by `address`.
    pub fn balance(&self, address: &str) -> Result<u64> {
        Ok(self
            .utxos_for(address)?
            .iter()
            .filter(|u| u.is_plain())
            .map(|u| u.amount)
            .sum())
    }

    /// Opposition to `subject` still held by `address`.
    pub fn unforgiven(&self, address: &str, subject: &str) -> Result<u64> {
        Ok(self
            .utxos_for(address)?
            .iter()
            .filter(|u| u.subject.as_deref() == Some(subject))
            .map(|u| u.amount)
            .sum())
    }

    pub fn subject_summary(&self, subject: &str) -> Result<SubjectSummary> {
        let mut summary = SubjectSummary {
            subject: subject.to_string(),
            ..Default::default()
        };
        for utxo in Ledger::new(self.store.as_ref()).all()? {
            if utxo.subject.as_deref() == Some(subject) {
                summary.opposed += utxo.amount;
            } else if utxo.forgive.as_deref() == Some(subject) {
                summary.forgiven += utxo.amount;
            } else if utxo.support.as_deref() == Some(subject) {
                summary.supported += utxo.amount;
            }
        }
        Ok(summary)
    }
}
