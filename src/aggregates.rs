//! Delta updates of long-lived summary rows.
//!
//! Counters are cumulative and only ever change through signed deltas, so a
//! block's contribution can be subtracted again on rollback. Nonces are point
//! in time facts and are overwritten instead.
use itertools::Itertools;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::collections::HashSet;

use crate::types::Address;
use crate::types::AddressAction;
use crate::types::Balance;
use crate::types::BalanceUpdate;
use crate::types::Currency;
use crate::types::Id;
use crate::types::Nonce;
use crate::types::Rollup;
use crate::types::RollupAction;
use crate::types::Tx;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressUpdate {
    pub id: Id,
    /// Added to stored actions count
    pub actions_count: i64,
    /// Added to stored signed tx count
    pub signed_tx_count: i64,
    /// Overwrites stored nonce when set
    pub nonce: Option<Nonce>,
}

impl AddressUpdate {
    pub fn new(id: Id) -> Self {
        Self {
            id,
            actions_count: 0,
            signed_tx_count: 0,
            nonce: None,
        }
    }

    pub fn actions(self, delta: i64) -> Self {
        Self {
            actions_count: delta,
            ..self
        }
    }

    pub fn signed_txs(self, delta: i64) -> Self {
        Self {
            signed_tx_count: delta,
            ..self
        }
    }

    pub fn nonce(self, nonce: Nonce) -> Self {
        Self {
            nonce: Some(nonce),
            ..self
        }
    }

    pub fn apply(&self, address: &mut Address) {
        address.actions_count += self.actions_count;
        address.signed_tx_count += self.signed_tx_count;
        if let Some(nonce) = self.nonce {
            address.nonce = nonce;
        }
    }

    /// Update undoing this one, given the nonce held before it was applied.
    pub fn inverse(&self, prior_nonce: Nonce) -> Self {
        Self {
            id: self.id,
            actions_count: -self.actions_count,
            signed_tx_count: -self.signed_tx_count,
            nonce: self.nonce.map(|_| prior_nonce),
        }
    }

    /// Combines updates targeting the same address.
    ///
    /// Deltas are summed, the last nonce wins. Result is ordered by id.
    pub fn merge_all(updates: &[AddressUpdate]) -> Vec<AddressUpdate> {
        let mut merged: BTreeMap<Id, AddressUpdate> = BTreeMap::new();
        for u in updates {
            merged
                .entry(u.id)
                .and_modify(|m| {
                    m.actions_count += u.actions_count;
                    m.signed_tx_count += u.signed_tx_count;
                    if u.nonce.is_some() {
                        m.nonce = u.nonce;
                    }
                })
                .or_insert_with(|| u.clone());
        }
        merged.into_values().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupUpdate {
    pub id: Id,
    /// Added to stored actions count
    pub actions_count: i64,
    /// Added to stored size
    pub size: i64,
}

impl RollupUpdate {
    pub fn new(id: Id, actions_count: i64, size: i64) -> Self {
        Self {
            id,
            actions_count,
            size,
        }
    }

    pub fn apply(&self, rollup: &mut Rollup) {
        rollup.actions_count += self.actions_count;
        rollup.size += self.size;
    }

    pub fn inverse(&self) -> Self {
        Self::new(self.id, -self.actions_count, -self.size)
    }

    /// Sums updates targeting the same rollup. Result is ordered by id.
    pub fn merge_all(updates: &[RollupUpdate]) -> Vec<RollupUpdate> {
        let mut merged: BTreeMap<Id, RollupUpdate> = BTreeMap::new();
        for u in updates {
            merged
                .entry(u.id)
                .and_modify(|m| {
                    m.actions_count += u.actions_count;
                    m.size += u.size;
                })
                .or_insert_with(|| u.clone());
        }
        merged.into_values().collect()
    }
}

/// Sums balance deltas sharing an (address, currency) key.
pub fn merge_balances(balances: &[Balance]) -> Vec<Balance> {
    let mut merged: BTreeMap<(Id, Currency), Decimal> = BTreeMap::new();
    for b in balances {
        *merged
            .entry((b.id, b.currency.clone()))
            .or_insert(Decimal::ZERO) += b.total;
    }
    merged
        .into_iter()
        .map(|((id, currency), total)| Balance {
            id,
            currency,
            total,
        })
        .collect()
}

/// Address updates reverting removed links and transactions.
///
/// Nonces are left unset: they cannot be derived from removed rows and must
/// be read back from the remaining transactions. Addresses listed in
/// `removed` are skipped, they are gone already.
pub fn address_reversals(
    address_actions: &[AddressAction],
    txs: &[Tx],
    removed: &HashSet<Id>,
) -> Vec<AddressUpdate> {
    let actions = address_actions
        .iter()
        .map(|aa| AddressUpdate::new(aa.address_id).actions(-1));
    let signed = txs
        .iter()
        .map(|tx| AddressUpdate::new(tx.signer_id).signed_txs(-1));
    let updates: Vec<AddressUpdate> = actions
        .chain(signed)
        .filter(|u| !removed.contains(&u.id))
        .collect();
    AddressUpdate::merge_all(&updates)
}

/// Rollup updates reverting removed rollup-action links.
pub fn rollup_reversals(rollup_actions: &[RollupAction], removed: &HashSet<Id>) -> Vec<RollupUpdate> {
    rollup_actions
        .iter()
        .filter(|ra| !removed.contains(&ra.rollup_id))
        .into_group_map_by(|ra| ra.rollup_id)
        .into_iter()
        .map(|(id, links)| {
            let size: i64 = links.iter().map(|ra| ra.size).sum();
            RollupUpdate::new(id, -(links.len() as i64), -size)
        })
        .sorted_by_key(|u| u.id)
        .collect()
}

/// Additive balances reverting removed balance updates.
pub fn balance_reversals(updates: &[BalanceUpdate], removed: &HashSet<Id>) -> Vec<Balance> {
    let negated: Vec<Balance> = updates
        .iter()
        .filter(|u| !removed.contains(&u.address_id))
        .map(|u| Balance {
            id: u.address_id,
            currency: u.currency.clone(),
            total: -u.delta,
        })
        .collect();
    merge_balances(&negated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::testutils::time_at;
    use crate::types::ActionType;
    use pretty_assertions::assert_eq;
    use rust_decimal::Decimal;

    fn address(actions_count: i64, signed_tx_count: i64, nonce: Nonce) -> Address {
        Address {
            nonce,
            actions_count,
            signed_tx_count,
            ..Address::dummy()
        }
    }

    fn address_action(address_id: Id, action_id: Id) -> AddressAction {
        AddressAction {
            address_id,
            action_id,
            tx_id: 1,
            action_type: ActionType::Transfer,
            height: 10,
            time: time_at(10),
        }
    }

    fn rollup_action(rollup_id: Id, action_id: Id, size: i64) -> RollupAction {
        RollupAction {
            rollup_id,
            action_id,
            tx_id: 1,
            height: 10,
            time: time_at(10),
            action_type: ActionType::Sequence,
            size,
        }
    }

    #[test]
    fn test_address_update_semantics() {
        let mut a = address(1, 2, 3);
        AddressUpdate::new(a.id)
            .actions(1)
            .signed_txs(1)
            .nonce(10)
            .apply(&mut a);
        assert_eq!(a.actions_count, 2);
        assert_eq!(a.signed_tx_count, 3);
        assert_eq!(a.nonce, 10);
    }

    #[test]
    fn test_address_update_inverse_restores_row() {
        let before = address(7, 4, 21);
        let update = AddressUpdate::new(before.id)
            .actions(3)
            .signed_txs(2)
            .nonce(23);
        let mut a = before.clone();
        update.apply(&mut a);
        update.inverse(before.nonce).apply(&mut a);
        assert_eq!(a, before);
    }

    #[test]
    fn test_address_update_without_nonce_keeps_nonce() {
        let mut a = address(0, 0, 5);
        let update = AddressUpdate::new(a.id).actions(4);
        update.apply(&mut a);
        assert_eq!(update.inverse(99).nonce, None);
        update.inverse(99).apply(&mut a);
        assert_eq!(a.nonce, 5);
        assert_eq!(a.actions_count, 0);
    }

    #[test]
    fn test_rollup_update_inverse_restores_row() {
        let before = Rollup::dummy().totals(1, 112);
        let update = RollupUpdate::new(before.id, 1, 100);
        let mut r = before.clone();
        update.apply(&mut r);
        assert_eq!(r.actions_count, 2);
        assert_eq!(r.size, 212);
        update.inverse().apply(&mut r);
        assert_eq!(r, before);
    }

    #[test]
    fn test_merge_address_updates() {
        let merged = AddressUpdate::merge_all(&[
            AddressUpdate::new(2).actions(1),
            AddressUpdate::new(1).signed_txs(1).nonce(4),
            AddressUpdate::new(2).actions(2).nonce(9),
            AddressUpdate::new(1).signed_txs(1),
        ]);
        assert_eq!(
            merged,
            vec![
                AddressUpdate::new(1).signed_txs(2).nonce(4),
                AddressUpdate::new(2).actions(3).nonce(9),
            ]
        );
    }

    #[test]
    fn test_address_reversals() {
        let links = vec![
            address_action(1, 10),
            address_action(1, 11),
            address_action(2, 10),
            address_action(3, 12),
        ];
        let txs = vec![Tx::dummy().signer_id(1), Tx::dummy().signer_id(1).position(1)];
        let removed: HashSet<Id> = [3].into();
        let reversals = address_reversals(&links, &txs, &removed);
        assert_eq!(
            reversals,
            vec![
                AddressUpdate::new(1).actions(-2).signed_txs(-2),
                AddressUpdate::new(2).actions(-1),
            ]
        );
    }

    #[test]
    fn test_rollup_reversals() {
        let links = vec![
            rollup_action(1, 10, 100),
            rollup_action(1, 11, 50),
            rollup_action(2, 12, 7),
            rollup_action(3, 13, 1),
        ];
        let removed: HashSet<Id> = [3].into();
        assert_eq!(
            rollup_reversals(&links, &removed),
            vec![RollupUpdate::new(1, -2, -150), RollupUpdate::new(2, -1, -7)]
        );
    }

    #[test]
    fn test_balance_reversals() {
        let updates = vec![
            BalanceUpdate::new(1, 10, Decimal::new(1000, 0)),
            BalanceUpdate::new(1, 10, Decimal::new(-300, 0)),
            BalanceUpdate::new(2, 10, Decimal::new(5, 0)),
            BalanceUpdate::new(4, 10, Decimal::new(5, 0)),
        ];
        let removed: HashSet<Id> = [4].into();
        assert_eq!(
            balance_reversals(&updates, &removed),
            vec![
                Balance::native(1, Decimal::new(-700, 0)),
                Balance::native(2, Decimal::new(-5, 0)),
            ]
        );
    }
}
