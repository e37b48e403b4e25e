use crate::db::{self, Store, StoreBatch, owner_key, utxo_key};
use crate::error::Result;
use crate::transaction::{Inflow, Outflow, Transaction};
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unspent output as stored in the ledger. `owner` may spend it;
/// `creator` is the account whose transaction made it.
#[derive(Encode, Decode, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub txid: String,
    pub index: u32,
    pub owner: String,
    pub creator: String,
    pub amount: u64,
    pub subject: Option<String>,
    pub forgive: Option<String>,
    pub support: Option<String>,
}

impl Utxo {
    pub fn from_outflow(tx: &Transaction, index: u32, outflow: &Outflow) -> Self {
        Utxo {
            txid: tx.txid.clone(),
            index,
            owner: outflow.address.clone().unwrap_or_else(|| tx.address.clone()),
            creator: tx.address.clone(),
            amount: outflow.amount,
            subject: outflow.subject.clone(),
            forgive: outflow.forgive.clone(),
            support: outflow.support.clone(),
        }
    }

    pub fn inflow(&self) -> Inflow {
        Inflow::new(self.txid.clone(), self.index)
    }

    pub fn is_plain(&self) -> bool {
        self.subject.is_none() && self.forgive.is_none() && self.support.is_none()
    }

    /// Forgive and support outputs are final.
    pub fn is_terminal(&self) -> bool {
        self.forgive.is_some() || self.support.is_some()
    }
}

/// Read access to unspent outputs.
pub trait LedgerView {
    fn unspent(&self, inflow: &Inflow) -> Result<Option<Utxo>>;
}

/// The committed ledger of the canonical head.
pub struct Ledger<'a> {
    store: &'a dyn Store,
}

impl<'a> Ledger<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Ledger { store }
    }

    pub fn owned_by(&self, owner: &str) -> Result<Vec<Utxo>> {
        let prefix = format!("a:{}:", owner);
        let mut out = Vec::new();
        for (key, _) in self.store.scan_prefix(prefix.as_bytes())? {
            let key = String::from_utf8_lossy(&key);
            let mut parts = key[prefix.len()..].splitn(2, ':');
            let (Some(txid), Some(index)) = (parts.next(), parts.next()) else {
                continue;
            };
            let Ok(index) = index.parse::<u32>() else {
                continue;
            };
            if let Some(utxo) = db::load::<Utxo>(self.store, &utxo_key(txid, index))? {
                out.push(utxo);
            }
        }
        Ok(out)
    }

    pub fn all(&self) -> Result<Vec<Utxo>> {
        self.store
            .scan_prefix(b"u:")?
            .iter()
            .map(|(_, v)| db::decode::<Utxo>(v))
            .collect()
    }
}

impl LedgerView for Ledger<'_> {
    fn unspent(&self, inflow: &Inflow) -> Result<Option<Utxo>> {
        db::load(self.store, &utxo_key(&inflow.txid, inflow.index))
    }
}

#[derive(Debug, Clone)]
enum Slot {
    Present(Utxo),
    Removed(Utxo),
}

/// Uncommitted changes layered over the committed ledger. Block validation,
/// reorg undo/redo and template building all work on one of these, and only
/// an accepted head change turns it into a store batch.
pub struct LedgerOverlay<'a> {
    base: Ledger<'a>,
    changes: HashMap<Inflow, Slot>,
}

impl<'a> LedgerOverlay<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        LedgerOverlay {
            base: Ledger::new(store),
            changes: HashMap::new(),
        }
    }

    pub fn insert(&mut self, utxo: Utxo) {
        self.changes.insert(utxo.inflow(), Slot::Present(utxo));
    }

    pub fn remove(&mut self, utxo: Utxo) {
        self.changes.insert(utxo.inflow(), Slot::Removed(utxo));
    }

    /// Consume `spent` and create the transaction's outputs.
    pub fn apply(&mut self, tx: &Transaction, spent: Vec<Utxo>) {
        for utxo in spent {
            self.remove(utxo);
        }
        for (i, outflow) in tx.outflows.iter().enumerate() {
            self.insert(Utxo::from_outflow(tx, i as u32, outflow));
        }
    }

    /// Reverse of `apply`: drop created outputs, restore `restored`.
    pub fn unapply(&mut self, tx: &Transaction, restored: Vec<Utxo>) {
        for (i, outflow) in tx.outflows.iter().enumerate() {
            self.remove(Utxo::from_outflow(tx, i as u32, outflow));
        }
        for utxo in restored {
            self.insert(utxo);
        }
    }

    pub fn write_into(self, batch: &mut StoreBatch) -> Result<()> {
        for (inflow, slot) in self.changes {
            match slot {
                Slot::Present(utxo) => {
                    batch.put_encoded(utxo_key(&inflow.txid, inflow.index), &utxo)?;
                    batch.put(owner_key(&utxo.owner, &inflow.txid, inflow.index), b"");
                }
                Slot::Removed(utxo) => {
                    batch.delete(utxo_key(&inflow.txid, inflow.index));
                    batch.delete(owner_key(&utxo.owner, &inflow.txid, inflow.index));
                }
            }
        }
        Ok(())
    }
}

impl LedgerView for LedgerOverlay<'_> {
    fn unspent(&self, inflow: &Inflow) -> Result<Option<Utxo>> {
        match self.changes.get(inflow) {
            Some(Slot::Present(utxo)) => Ok(Some(utxo.clone())),
            Some(Slot::Removed(_)) => Ok(None),
            None => self.base.unspent(inflow),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::wallet::Wallet;

    /// Fixed set of unspent outputs.
    #[derive(Default)]
    pub struct FixedView {
        utxos: HashMap<Inflow, Utxo>,
    }

    impl FixedView {
        pub fn with(utxos: Vec<Utxo>) -> Self {
            FixedView {
                utxos: utxos.into_iter().map(|u| (u.inflow(), u)).collect(),
            }
        }
    }

    impl LedgerView for FixedView {
        fn unspent(&self, inflow: &Inflow) -> Result<Option<Utxo>> {
            Ok(self.utxos.get(inflow).cloned())
        }
    }

    #[test]
    fn owner_defaults_to_sender() {
        let alice = Wallet::generate();
        let tx = Transaction::coinbase(alice.address(), 1_700_000_000).unwrap();
        let opposed = Utxo::from_outflow(&tx, 0, &Outflow::oppose("X", 3));
        assert_eq!(opposed.owner, alice.address());
        assert!(!opposed.is_plain());
        assert!(!opposed.is_terminal());
        assert!(Utxo::from_outflow(&tx, 0, &Outflow::forgive("X", 3)).is_terminal());
    }

    #[test]
    fn overlay_commits_through_batch() {
        let alice = Wallet::generate();
        let mut store = MemoryStore::new();
        let cb = Transaction::coinbase(alice.address(), 1_700_000_000).unwrap();
        let created = Utxo::from_outflow(&cb, 0, &cb.outflows[0]);

        let mut overlay = LedgerOverlay::new(&store);
        overlay.apply(&cb, vec![]);
        assert_eq!(overlay.unspent(&created.inflow()).unwrap(), Some(created.clone()));
        let mut batch = StoreBatch::default();
        overlay.write_into(&mut batch).unwrap();
        store.write(batch).unwrap();

        let ledger = Ledger::new(&store);
        assert_eq!(ledger.owned_by(alice.address()).unwrap(), vec![created.clone()]);
        assert_eq!(ledger.all().unwrap().len(), 1);

        let mut overlay = LedgerOverlay::new(&store);
        overlay.unapply(&cb, vec![]);
        assert!(overlay.unspent(&created.inflow()).unwrap().is_none());
        // Base is untouched until the batch is written.
        assert!(Ledger::new(&store).unspent(&created.inflow()).unwrap().is_some());

        let mut batch = StoreBatch::default();
        overlay.write_into(&mut batch).unwrap();
        store.write(batch).unwrap();
        assert!(Ledger::new(&store).owned_by(alice.address()).unwrap().is_empty());
    }
}
