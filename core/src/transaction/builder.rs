// Wallet-side construction of the four transaction kinds.
use super::{Inflow, Outflow, Transaction};
use crate::error::{ChainError, Result};
use crate::utxo::Utxo;
use crate::wallet::Wallet;

/// Pick outputs in the given order until `amount` is covered.
fn select(candidates: Vec<&Utxo>, amount: u64) -> Result<(Vec<Inflow>, u64)> {
    if amount == 0 {
        return Err(ChainError::Structural("amount must be positive".into()));
    }
    let mut picked = Vec::new();
    let mut total: u64 = 0;
    for utxo in candidates {
        if total >= amount {
            break;
        }
        picked.push(utxo.inflow());
        total = total.saturating_add(utxo.amount);
    }
    if total < amount {
        return Err(ChainError::Ledger(format!(
            "insufficient funds: need {}, have {}",
            amount, total
        )));
    }
    Ok((picked, total - amount))
}

fn plain_outputs<'a>(wallet: &Wallet, utxos: &'a [Utxo]) -> Vec<&'a Utxo> {
    utxos
        .iter()
        .filter(|u| u.owner == wallet.address() && u.is_plain())
        .collect()
}

fn finish(
    wallet: &Wallet,
    inflows: Vec<Inflow>,
    mut outflows: Vec<Outflow>,
    change: Option<Outflow>,
    timestamp: i64,
) -> Result<Transaction> {
    outflows.extend(change);
    let mut tx = Transaction::new(inflows, outflows, timestamp);
    wallet.sign_transaction(&mut tx)?;
    tx.check_structure()?;
    Ok(tx)
}

fn plain_change(wallet: &Wallet, change: u64) -> Option<Outflow> {
    (change > 0).then(|| Outflow::to_address(wallet.address(), change))
}

/// Move plain weight to another account.
pub fn transfer(
    wallet: &Wallet,
    utxos: &[Utxo],
    destination: &str,
    amount: u64,
    timestamp: i64,
) -> Result<Transaction> {
    let (inflows, change) = select(plain_outputs(wallet, utxos), amount)?;
    finish(
        wallet,
        inflows,
        vec![Outflow::to_address(destination, amount)],
        plain_change(wallet, change),
        timestamp,
    )
}

/// Oppose a subject. The opposition output stays with the sender.
pub fn oppose(
    wallet: &Wallet,
    utxos: &[Utxo],
    subject: &str,
    amount: u64,
    timestamp: i64,
) -> Result<Transaction> {
    let (inflows, change) = select(plain_outputs(wallet, utxos), amount)?;
    finish(
        wallet,
        inflows,
        vec![Outflow::oppose(subject, amount)],
        plain_change(wallet, change),
        timestamp,
    )
}

/// Rescind earlier opposition of `subject`; any excess remains opposed.
pub fn forgive(
    wallet: &Wallet,
    utxos: &[Utxo],
    subject: &str,
    amount: u64,
    timestamp: i64,
) -> Result<Transaction> {
    let opposition: Vec<&Utxo> = utxos
        .iter()
        .filter(|u| {
            u.owner == wallet.address()
                && u.creator == wallet.address()
                && u.subject.as_deref() == Some(subject)
        })
        .collect();
    let (inflows, change) = select(opposition, amount)?;
    let rest = (change > 0).then(|| Outflow::oppose(subject, change));
    finish(
        wallet,
        inflows,
        vec![Outflow::forgive(subject, amount)],
        rest,
        timestamp,
    )
}

/// Permanent support of a subject.
pub fn support(
    wallet: &Wallet,
    utxos: &[Utxo],
    subject: &str,
    amount: u64,
    timestamp: i64,
) -> Result<Transaction> {
    let (inflows, change) = select(plain_outputs(wallet, utxos), amount)?;
    finish(
        wallet,
        inflows,
        vec![Outflow::support(subject, amount)],
        plain_change(wallet, change),
        timestamp,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utxo::tests::FixedView;

    fn coins(wallet: &Wallet, amounts: &[u64]) -> Vec<Utxo> {
        amounts
            .iter()
            .enumerate()
            .map(|(i, amount)| {
                let cb = Transaction::coinbase(wallet.address(), 1_700_000_000 + i as i64).unwrap();
                Utxo::from_outflow(&cb, 0, &Outflow::to_address(wallet.address(), *amount))
            })
            .collect()
    }

    #[test]
    fn transfer_returns_change() {
        let alice = Wallet::generate();
        let bob = Wallet::generate();
        let utxos = coins(&alice, &[30, 30]);
        let tx = transfer(&alice, &utxos, bob.address(), 45, 1_700_000_100).unwrap();

        assert_eq!(tx.inflows.len(), 2);
        assert_eq!(tx.outflows[0], Outflow::to_address(bob.address(), 45));
        assert_eq!(tx.outflows[1], Outflow::to_address(alice.address(), 15));
        assert!(tx.validate(&FixedView::with(utxos)).is_ok());
    }

    #[test]
    fn insufficient_funds() {
        let alice = Wallet::generate();
        let utxos = coins(&alice, &[5]);
        let err = support(&alice, &utxos, "tea", 6, 1_700_000_100).unwrap_err();
        assert!(matches!(err, ChainError::Ledger(_)));
    }

    #[test]
    fn oppose_then_forgive() {
        let alice = Wallet::generate();
        let utxos = coins(&alice, &[20]);
        let opposed = oppose(&alice, &utxos, "pineapple pizza", 20, 1_700_000_100).unwrap();
        assert_eq!(opposed.outflows.len(), 1);

        let held = vec![Utxo::from_outflow(&opposed, 0, &opposed.outflows[0])];
        let forgiven = forgive(&alice, &held, "pineapple pizza", 5, 1_700_000_200).unwrap();
        assert_eq!(forgiven.outflows[0], Outflow::forgive("pineapple pizza", 5));
        assert_eq!(forgiven.outflows[1], Outflow::oppose("pineapple pizza", 15));
        assert!(forgiven.validate(&FixedView::with(held)).is_ok());
    }

    #[test]
    fn forgive_without_opposition_fails() {
        let alice = Wallet::generate();
        let utxos = coins(&alice, &[20]);
        assert!(forgive(&alice, &utxos, "anything", 1, 1_700_000_100).is_err());
    }
}
