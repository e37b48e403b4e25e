pub mod builder;

use crate::config::{BLOCK_REWARD, MAX_FLOWS, MAX_SUBJECT_BYTES, TRANSACTION_VERSION, TXN_TIMEOUT};
use crate::crypto::{address_of, decode_hash, is_address, mill_hash_hex, verify_signature};
use crate::db::BINCODE_CONFIG;
use crate::error::{ChainError, Result};
use crate::utxo::{LedgerView, Utxo};
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Reference to a prior output by (txid, index)
#[derive(Encode, Decode, Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Inflow {
    pub txid: String, // hex
    pub index: u32,
}

impl Inflow {
    pub fn new(txid: impl Into<String>, index: u32) -> Self {
        Inflow {
            txid: txid.into(),
            index,
        }
    }
}

/// New output. At most one sentiment tag; an untagged outflow must name an address.
/// Without an address the output stays with the sending account.
#[derive(Encode, Decode, Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Outflow {
    pub amount: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forgive: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub support: Option<String>,
}

impl Outflow {
    pub fn to_address(address: &str, amount: u64) -> Self {
        Outflow {
            amount,
            address: Some(address.to_string()),
            ..Default::default()
        }
    }

    pub fn oppose(subject: &str, amount: u64) -> Self {
        Outflow {
            amount,
            subject: Some(subject.to_string()),
            ..Default::default()
        }
    }

    pub fn forgive(subject: &str, amount: u64) -> Self {
        Outflow {
            amount,
            forgive: Some(subject.to_string()),
            ..Default::default()
        }
    }

    pub fn support(subject: &str, amount: u64) -> Self {
        Outflow {
            amount,
            support: Some(subject.to_string()),
            ..Default::default()
        }
    }

    fn tags(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            ("subject", self.subject.as_deref()),
            ("forgive", self.forgive.as_deref()),
            ("support", self.support.as_deref()),
        ]
        .into_iter()
        .filter_map(|(name, tag)| tag.map(|t| (name, t)))
    }

    fn check_structure(&self, position: usize) -> Result<()> {
        if self.amount == 0 {
            return Err(ChainError::Structural(format!(
                "outflow {} has zero amount",
                position
            )));
        }
        let tags: Vec<_> = self.tags().collect();
        if tags.len() > 1 {
            return Err(ChainError::Structural(format!(
                "outflow {} carries more than one sentiment tag",
                position
            )));
        }
        for (name, tag) in &tags {
            if tag.is_empty() || tag.len() >= MAX_SUBJECT_BYTES {
                return Err(ChainError::Structural(format!(
                    "outflow {} {} must be 1..{} bytes, got {}",
                    position,
                    name,
                    MAX_SUBJECT_BYTES,
                    tag.len()
                )));
            }
        }
        match &self.address {
            Some(addr) if !is_address(addr) => Err(ChainError::Structural(format!(
                "outflow {} address {} is malformed",
                position, addr
            ))),
            None if tags.is_empty() => Err(ChainError::Structural(format!(
                "outflow {} has neither address nor tag",
                position
            ))),
            _ => Ok(()),
        }
    }
}

/// Signed transfer of sentiment weight.
#[derive(Encode, Decode, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub timestamp: i64, // unix seconds
    pub address: String,
    pub public_key: String, // hex, compressed secp256k1
    pub signature: String,  // hex, compact ECDSA over txid
    pub inflows: Vec<Inflow>,
    pub outflows: Vec<Outflow>,
    pub txid: String, // mill hash of the body
}

impl Transaction {
    /// Unsigned body; sign with `Wallet::sign_transaction`.
    pub fn new(inflows: Vec<Inflow>, outflows: Vec<Outflow>, timestamp: i64) -> Self {
        Transaction {
            version: TRANSACTION_VERSION,
            timestamp,
            address: String::new(),
            public_key: String::new(),
            signature: String::new(),
            inflows,
            outflows,
            txid: String::new(),
        }
    }

    /// Reward transaction. The timestamp keeps coinbase ids unique along a chain.
    pub fn coinbase(miner_address: &str, timestamp: i64) -> Result<Self> {
        let mut tx = Transaction::new(
            vec![],
            vec![Outflow::to_address(miner_address, BLOCK_REWARD)],
            timestamp,
        );
        tx.address = miner_address.to_string();
        tx.with_txid()
    }

    pub fn is_coinbase(&self) -> bool {
        self.inflows.is_empty()
    }

    /// Canonical body: everything except signature and txid.
    pub fn serialize_for_hash(&self) -> Result<Vec<u8>> {
        Ok(bincode::encode_to_vec(
            &(
                self.version,
                self.timestamp,
                &self.address,
                &self.public_key,
                &self.inflows,
                &self.outflows,
            ),
            *BINCODE_CONFIG,
        )?)
    }

    pub fn compute_txid(&self) -> Result<String> {
        Ok(mill_hash_hex(&self.serialize_for_hash()?))
    }

    pub fn with_txid(mut self) -> Result<Self> {
        self.txid = self.compute_txid()?;
        Ok(self)
    }

    pub fn outflow_total(&self) -> Result<u64> {
        self.outflows.iter().try_fold(0u64, |acc, o| {
            acc.checked_add(o.amount)
                .ok_or_else(|| ChainError::Structural(format!("outflow total overflows in {}", self.txid)))
        })
    }

    /// Field-level checks that need no ledger.
    pub fn check_structure(&self) -> Result<()> {
        if self.version != TRANSACTION_VERSION {
            return Err(ChainError::Structural(format!(
                "unsupported transaction version {}",
                self.version
            )));
        }
        if self.txid != self.compute_txid()? {
            return Err(ChainError::Structural(format!(
                "txid {} does not match body",
                self.txid
            )));
        }
        if !is_address(&self.address) {
            return Err(ChainError::Structural(format!(
                "sender address {} is malformed",
                self.address
            )));
        }
        if self.outflows.is_empty() {
            return Err(ChainError::Structural("transaction has no outflows".into()));
        }
        if self.inflows.len() > MAX_FLOWS || self.outflows.len() > MAX_FLOWS {
            return Err(ChainError::Structural(format!(
                "transaction exceeds {} flows ({} in, {} out)",
                MAX_FLOWS,
                self.inflows.len(),
                self.outflows.len()
            )));
        }

        let mut seen = HashSet::new();
        for inflow in &self.inflows {
            decode_hash(&inflow.txid)?;
            if !seen.insert(inflow) {
                return Err(ChainError::Structural(format!(
                    "duplicate inflow {}:{}",
                    inflow.txid, inflow.index
                )));
            }
        }

        for (i, outflow) in self.outflows.iter().enumerate() {
            outflow.check_structure(i)?;
        }
        self.outflow_total()?;

        if self.is_coinbase() {
            let only = &self.outflows[0];
            if self.outflows.len() != 1 || only.address.is_none() || only.tags().next().is_some() {
                return Err(ChainError::Structural(
                    "coinbase must pay a single untagged outflow".into(),
                ));
            }
        }
        Ok(())
    }

    /// Signature verifies over the txid and the key derives `address`.
    pub fn verify_signature(&self) -> Result<()> {
        let derived = address_of(&self.public_key)?;
        if derived != self.address {
            return Err(ChainError::Crypto(format!(
                "public key derives {} but transaction claims {}",
                derived, self.address
            )));
        }
        let digest = decode_hash(&self.txid)?;
        verify_signature(&self.public_key, &digest, &self.signature)
    }

    /// Regular transactions must fall inside the block's time window.
    pub fn check_timing(&self, block_timestamp: i64) -> Result<()> {
        if self.timestamp > block_timestamp {
            return Err(ChainError::Protocol(format!(
                "transaction {} is newer than its block",
                self.txid
            )));
        }
        if self.timestamp < block_timestamp - TXN_TIMEOUT {
            return Err(ChainError::Protocol(format!(
                "transaction {} expired before its block",
                self.txid
            )));
        }
        Ok(())
    }

    /// Full validation against a ledger view. Pure: returns the outputs the
    /// transaction would consume, leaves the view untouched.
    pub fn validate(&self, view: &dyn LedgerView) -> Result<Vec<Utxo>> {
        self.check_structure()?;

        if self.is_coinbase() {
            let minted = self.outflow_total()?;
            if minted != BLOCK_REWARD {
                return Err(ChainError::Ledger(format!(
                    "coinbase mints {} instead of {}",
                    minted, BLOCK_REWARD
                )));
            }
            return Ok(vec![]);
        }

        self.verify_signature()?;

        let mut spent = Vec::with_capacity(self.inflows.len());
        for inflow in &self.inflows {
            let utxo = view.unspent(inflow)?.ok_or_else(|| {
                ChainError::Ledger(format!(
                    "inflow {}:{} is missing or already spent",
                    inflow.txid, inflow.index
                ))
            })?;
            if utxo.is_terminal() {
                return Err(ChainError::Ledger(format!(
                    "inflow {}:{} is a forgive/support output and cannot be spent",
                    inflow.txid, inflow.index
                )));
            }
            if utxo.owner != self.address {
                return Err(ChainError::Ledger(format!(
                    "inflow {}:{} belongs to {}, not {}",
                    inflow.txid, inflow.index, utxo.owner, self.address
                )));
            }
            spent.push(utxo);
        }

        self.check_balance(&spent)?;
        Ok(spent)
    }

    /// Totals must match, and opposition weight stays on its subject: it
    /// either remains opposed or is forgiven by the account that opposed.
    fn check_balance(&self, spent: &[Utxo]) -> Result<()> {
        let mut plain: u64 = 0;
        let mut opposed: BTreeMap<&str, u64> = BTreeMap::new();
        let mut forgivable: BTreeMap<&str, u64> = BTreeMap::new();
        let overflow = || ChainError::Ledger(format!("inflow total overflows in {}", self.txid));

        for utxo in spent {
            match utxo.subject.as_deref() {
                Some(subject) => {
                    let bucket = opposed.entry(subject).or_default();
                    *bucket = bucket.checked_add(utxo.amount).ok_or_else(overflow)?;
                    if utxo.creator == self.address {
                        let own = forgivable.entry(subject).or_default();
                        *own = own.checked_add(utxo.amount).ok_or_else(overflow)?;
                    }
                }
                None => plain = plain.checked_add(utxo.amount).ok_or_else(overflow)?,
            }
        }

        let total_in = opposed
            .values()
            .try_fold(plain, |acc, v| acc.checked_add(*v))
            .ok_or_else(overflow)?;
        let total_out = self.outflow_total()?;
        if total_in != total_out {
            return Err(ChainError::Ledger(format!(
                "transaction {} spends {} but creates {}",
                self.txid, total_in, total_out
            )));
        }

        for outflow in &self.outflows {
            if let Some(subject) = outflow.forgive.as_deref() {
                let own = forgivable.get(subject).copied().unwrap_or(0);
                if own < outflow.amount {
                    return Err(ChainError::Ledger(format!(
                        "{} has no un-forgiven opposition of {} to {:?}",
                        self.address, outflow.amount, subject
                    )));
                }
                forgivable.insert(subject, own - outflow.amount);
                if let Some(bucket) = opposed.get_mut(subject) {
                    *bucket -= outflow.amount;
                }
            }
        }

        let mut draw_plain = |amount: u64| -> Result<()> {
            plain = plain.checked_sub(amount).ok_or_else(|| {
                ChainError::Ledger(format!(
                    "transaction {} moves opposition weight off its subject",
                    self.txid
                ))
            })?;
            Ok(())
        };

        for outflow in &self.outflows {
            if outflow.forgive.is_some() {
                continue;
            }
            match outflow.subject.as_deref() {
                Some(subject) => {
                    let bucket = opposed.entry(subject).or_default();
                    let taken = (*bucket).min(outflow.amount);
                    *bucket -= taken;
                    draw_plain(outflow.amount - taken)?;
                }
                None => draw_plain(outflow.amount)?,
            }
        }

        if let Some((subject, left)) = opposed.iter().find(|(_, v)| **v > 0) {
            return Err(ChainError::Ledger(format!(
                "{} of opposition to {:?} must stay opposed or be forgiven",
                left, subject
            )));
        }
        Ok(())
    }
}
