//! Key-addressable storage behind the chain.
//!
//! Layout:
//! - `b:{hash}` block, `m:{hash}` block metadata, `h:{hash}` branch tip
//! - `t:{txid}` transaction
//! - `i:{height}` canonical block hash (zero padded so prefix scans are ordered)
//! - `u:{txid}:{index}` unspent output, `a:{owner}:{txid}:{index}` owner index
//! - `tip` canonical head hash

use crate::error::{ChainError, Result};
use bincode::{Decode, Encode, config};
use once_cell::sync::Lazy;
use rocksdb::{DB, Direction, IteratorMode, Options, WriteBatch};
use std::collections::BTreeMap;
use std::path::Path;

pub static BINCODE_CONFIG: Lazy<config::Configuration> = Lazy::new(config::standard);

pub const TIP_KEY: &str = "tip";

pub fn block_key(hash: &str) -> String {
    format!("b:{}", hash)
}

pub fn meta_key(hash: &str) -> String {
    format!("m:{}", hash)
}

pub fn branch_tip_key(hash: &str) -> String {
    format!("h:{}", hash)
}

pub fn tx_key(txid: &str) -> String {
    format!("t:{}", txid)
}

pub fn height_key(height: u64) -> String {
    format!("i:{:020}", height)
}

pub fn utxo_key(txid: &str, index: u32) -> String {
    format!("u:{}:{}", txid, index)
}

pub fn owner_key(owner: &str, txid: &str, index: u32) -> String {
    format!("a:{}:{}:{}", owner, txid, index)
}

pub fn encode<T: Encode>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::encode_to_vec(value, *BINCODE_CONFIG)?)
}

pub fn decode<T: Decode<()>>(bytes: &[u8]) -> Result<T> {
    let (value, _) = bincode::decode_from_slice(bytes, *BINCODE_CONFIG)?;
    Ok(value)
}

#[derive(Debug, Clone)]
enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// Writes applied all-or-nothing by `Store::write`.
#[derive(Debug, Default)]
pub struct StoreBatch {
    ops: Vec<BatchOp>,
}

impl StoreBatch {
    pub fn put(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        self.ops
            .push(BatchOp::Put(key.as_ref().to_vec(), value.as_ref().to_vec()));
    }

    pub fn put_encoded<T: Encode>(&mut self, key: impl AsRef<[u8]>, value: &T) -> Result<()> {
        let bytes = encode(value)?;
        self.ops.push(BatchOp::Put(key.as_ref().to_vec(), bytes));
        Ok(())
    }

    pub fn delete(&mut self, key: impl AsRef<[u8]>) {
        self.ops.push(BatchOp::Delete(key.as_ref().to_vec()));
    }
}

pub trait Store: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn exists(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// All entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    fn write(&mut self, batch: StoreBatch) -> Result<()>;
}

/// Decode helper usable through `dyn Store`.
pub fn load<T: Decode<()>>(store: &dyn Store, key: &str) -> Result<Option<T>> {
    store.get(key.as_bytes())?.map(|b| decode(&b)).transpose()
}

pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        Ok(RocksStore { db })
    }
}

impl Store for RocksStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key)?)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        for item in self
            .db
            .iterator(IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    fn write(&mut self, batch: StoreBatch) -> Result<()> {
        let mut wb = WriteBatch::default();
        for op in batch.ops {
            match op {
                BatchOp::Put(k, v) => wb.put(k, v),
                BatchOp::Delete(k) => wb.delete(k),
            }
        }
        self.db
            .write(wb)
            .map_err(|e| ChainError::Storage(format!("batch commit failed: {}", e)))
    }
}

/// In-process store for tests and throwaway nodes.
#[derive(Default)]
pub struct MemoryStore {
    map: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .map
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write(&mut self, batch: StoreBatch) -> Result<()> {
        for op in batch.ops {
            match op {
                BatchOp::Put(k, v) => {
                    self.map.insert(k, v);
                }
                BatchOp::Delete(k) => {
                    self.map.remove(&k);
                }
            }
        }
        Ok(())
    }
}
