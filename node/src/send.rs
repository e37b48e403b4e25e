//! Signing wallet transactions and handing them to a node.

use crate::p2p::client::HttpPeer;
use anyhow::{Context, Result};
use cancelchain_core::transaction::builder;
use cancelchain_core::{Transaction, Utxo, Wallet};
use chrono::Utc;

/// What the wallet wants to do with its weight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Transfer { to: String },
    Oppose { subject: String },
    Forgive { subject: String },
    Support { subject: String },
}

impl Intent {
    pub fn build(
        &self,
        wallet: &Wallet,
        utxos: &[Utxo],
        amount: u64,
        timestamp: i64,
    ) -> cancelchain_core::Result<Transaction> {
        match self {
            Intent::Transfer { to } => builder::transfer(wallet, utxos, to, amount, timestamp),
            Intent::Oppose { subject } => builder::oppose(wallet, utxos, subject, amount, timestamp),
            Intent::Forgive { subject } => {
                builder::forgive(wallet, utxos, subject, amount, timestamp)
            }
            Intent::Support { subject } => {
                builder::support(wallet, utxos, subject, amount, timestamp)
            }
        }
    }
}

/// Fetch the wallet's outputs from `node`, sign `intent` over them and
/// submit the result.
pub async fn send(
    node: &HttpPeer,
    wallet: &Wallet,
    intent: &Intent,
    amount: u64,
) -> Result<Transaction> {
    let utxos = node
        .utxos(wallet.address())
        .await
        .context("fetching wallet outputs")?;
    let tx = intent.build(wallet, &utxos, amount, Utc::now().timestamp())?;
    node.post_transaction(&tx)
        .await
        .with_context(|| format!("submitting transaction {}", tx.txid))?;
    log::info!("📤 Submitted {:?} transaction {}", intent, tx.txid);
    Ok(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BlockOrigin;
    use crate::tests::{next_block, test_node};
    use cancelchain_core::ChainError;

    #[test]
    fn each_intent_builds_its_outflow() {
        let node = test_node();
        let alice = Wallet::generate();
        let block = next_block(&node.chain.read(), &alice, &[]);
        node.submit_block(&block, BlockOrigin::Sync).unwrap();
        let utxos = node.chain.read().utxos_for(alice.address()).unwrap();
        let now = Utc::now().timestamp();

        let oppose = Intent::Oppose { subject: "X".into() }
            .build(&alice, &utxos, 30, now)
            .unwrap();
        assert_eq!(oppose.outflows[0].subject.as_deref(), Some("X"));

        let support = Intent::Support { subject: "Y".into() }
            .build(&alice, &utxos, 5, now)
            .unwrap();
        assert_eq!(support.outflows[0].support.as_deref(), Some("Y"));

        let bob = Wallet::generate();
        let transfer = Intent::Transfer { to: bob.address().to_string() }
            .build(&alice, &utxos, 12, now)
            .unwrap();
        assert_eq!(transfer.outflows[0].address.as_deref(), Some(bob.address()));

        assert!(node.submit_transaction(&oppose).unwrap());
    }

    #[test]
    fn forgive_without_opposition_is_refused() {
        let node = test_node();
        let alice = Wallet::generate();
        let block = next_block(&node.chain.read(), &alice, &[]);
        node.submit_block(&block, BlockOrigin::Sync).unwrap();
        let utxos = node.chain.read().utxos_for(alice.address()).unwrap();

        let err = Intent::Forgive { subject: "X".into() }
            .build(&alice, &utxos, 10, Utc::now().timestamp())
            .unwrap_err();
        assert!(matches!(err, ChainError::Ledger(_)));
    }
}
