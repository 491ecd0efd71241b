//! Unit of work scenarios run against every storage backend.
use pretty_assertions::assert_eq;
use rust_decimal::Decimal;

use seqidx::aggregates::AddressUpdate;
use seqidx::aggregates::RollupUpdate;
use seqidx::config::ValidatorBoundary;
use seqidx::error::StoreError;
use seqidx::store::Storage;
use seqidx::store::UnitOfWork;
use seqidx::types::testutils::time_at;
use seqidx::types::Action;
use seqidx::types::ActionType;
use seqidx::types::Address;
use seqidx::types::AddressAction;
use seqidx::types::Balance;
use seqidx::types::BalanceUpdate;
use seqidx::types::Block;
use seqidx::types::BlockStats;
use seqidx::types::ChainState;
use seqidx::types::Height;
use seqidx::types::Id;
use seqidx::types::Rollup;
use seqidx::types::Tx;
use seqidx::types::Validator;
use seqidx::types::NATIVE_CURRENCY;

fn address_action(address_id: Id, action_id: Id, height: Height) -> AddressAction {
    AddressAction {
        address_id,
        action_id,
        tx_id: 1,
        action_type: ActionType::Transfer,
        height,
        time: time_at(height),
    }
}

/// Saves a block at each height, with a fresh proposer.
async fn save_blocks<U: UnitOfWork>(uow: &mut U, heights: &[Height]) {
    for h in heights {
        let mut block = Block::dummy().height(*h).proposer_id(1);
        uow.save_block(&mut block).await.unwrap();
    }
}

pub async fn save_new_addresses<S: Storage>(storage: &S) {
    let mut uow = storage.begin().await.unwrap();
    let mut addresses: Vec<Address> = (0..5).map(|_| Address::dummy().height(100)).collect();
    let inserted = uow.save_addresses(&mut addresses).await.unwrap();
    assert_eq!(inserted, 5);
    let ids: Vec<Id> = addresses.iter().map(|a| a.id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    uow.flush().await.unwrap();
    uow.close().await.unwrap();

    let mut uow = storage.begin().await.unwrap();
    for a in &addresses {
        let stored = uow.get_address_by_hash(&a.hash).await.unwrap().unwrap();
        assert_eq!(&stored, a);
    }
    uow.close().await.unwrap();
}

pub async fn dedup_is_idempotent<S: Storage>(storage: &S) {
    let hash = Address::dummy().hash;
    let candidate = Address::dummy().hash(&hash).height(10);

    let mut uow = storage.begin().await.unwrap();
    let mut batch = vec![candidate.clone(), candidate.height(11), candidate.height(12)];
    assert_eq!(uow.save_addresses(&mut batch).await.unwrap(), 1);
    let id = batch[0].id;
    assert!(id > 0);
    assert!(batch.iter().all(|a| a.id == id));

    // Same unit of work, later call
    let mut again = vec![candidate.height(13)];
    assert_eq!(uow.save_addresses(&mut again).await.unwrap(), 0);
    assert_eq!(again[0].id, id);
    uow.flush().await.unwrap();
    uow.close().await.unwrap();

    // Separate unit of work, mixed with a new address
    let mut uow = storage.begin().await.unwrap();
    let other = Address::dummy().height(14);
    let mut mixed = vec![candidate.height(14), other.clone(), candidate.height(14)];
    assert_eq!(uow.save_addresses(&mut mixed).await.unwrap(), 1);
    assert_eq!(mixed[0].id, id);
    assert_eq!(mixed[2].id, id);
    assert_eq!(mixed[1].id, id + 1);
    let stored = uow.get_address_by_hash(&hash).await.unwrap().unwrap();
    assert_eq!(stored.height, 10);
    uow.flush().await.unwrap();
    uow.close().await.unwrap();
}

pub async fn first_seen_wins<S: Storage>(storage: &S) {
    let existing = Address::dummy().height(100).counts(3, 2);
    let mut uow = storage.begin().await.unwrap();
    let mut batch = vec![existing.clone()];
    uow.save_addresses(&mut batch).await.unwrap();
    let existing_id = batch[0].id;
    uow.flush().await.unwrap();
    uow.close().await.unwrap();

    let mut uow = storage.begin().await.unwrap();
    let mut later = vec![existing.height(200).counts(0, 0)];
    assert_eq!(uow.save_addresses(&mut later).await.unwrap(), 0);
    assert_eq!(later[0].id, existing_id);
    let stored = uow.get_address(existing_id).await.unwrap().unwrap();
    assert_eq!(stored.height, 100);
    assert_eq!(stored.actions_count, 3);
    assert_eq!(stored.signed_tx_count, 2);
    uow.close().await.unwrap();
}

pub async fn rollup_identity<S: Storage>(storage: &S) {
    let rollup = Rollup::dummy().first_height(50);
    let mut uow = storage.begin().await.unwrap();
    let mut batch = vec![rollup.clone(), rollup.bridge_address_id(9), Rollup::dummy()];
    assert_eq!(uow.save_rollups(&mut batch).await.unwrap(), 2);
    assert_eq!(batch[0].id, batch[1].id);
    assert_ne!(batch[0].id, batch[2].id);
    let stored = uow.get_rollup(batch[0].id).await.unwrap().unwrap();
    assert_eq!(stored.bridge_address_id, None);
    uow.flush().await.unwrap();
    uow.close().await.unwrap();

    let mut uow = storage.begin().await.unwrap();
    let mut later = vec![rollup.first_height(60)];
    assert_eq!(uow.save_rollups(&mut later).await.unwrap(), 0);
    assert_eq!(later[0].id, batch[0].id);
    uow.close().await.unwrap();
}

pub async fn update_addresses<S: Storage>(storage: &S) {
    let mut uow = storage.begin().await.unwrap();
    let mut batch = vec![Address::dummy().counts(1, 2)];
    uow.save_addresses(&mut batch).await.unwrap();
    let before = uow.get_address(batch[0].id).await.unwrap().unwrap();

    let update = AddressUpdate::new(before.id)
        .actions(1)
        .signed_txs(1)
        .nonce(10);
    uow.update_addresses(&[update.clone()]).await.unwrap();
    let after = uow.get_address(before.id).await.unwrap().unwrap();
    assert_eq!(after.actions_count, 2);
    assert_eq!(after.signed_tx_count, 3);
    assert_eq!(after.nonce, 10);

    uow.update_addresses(&[update.inverse(before.nonce)])
        .await
        .unwrap();
    assert_eq!(uow.get_address(before.id).await.unwrap().unwrap(), before);
    uow.close().await.unwrap();
}

pub async fn update_unknown_address<S: Storage>(storage: &S) {
    let mut uow = storage.begin().await.unwrap();
    let err = uow
        .update_addresses(&[AddressUpdate::new(42).actions(1)])
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
    assert!(matches!(uow.last_block().await, Err(StoreError::Aborted)));
    uow.close().await.unwrap();
}

pub async fn update_rollups<S: Storage>(storage: &S) {
    let mut uow = storage.begin().await.unwrap();
    let mut batch = vec![Rollup::dummy().totals(1, 112)];
    uow.save_rollups(&mut batch).await.unwrap();
    let id = batch[0].id;
    uow.flush().await.unwrap();

    uow.update_rollups(&[RollupUpdate::new(id, 1, 100)])
        .await
        .unwrap();
    uow.flush().await.unwrap();
    uow.close().await.unwrap();

    let mut uow = storage.begin().await.unwrap();
    let rollup = uow.get_rollup(id).await.unwrap().unwrap();
    assert_eq!(rollup.size, 212);
    assert_eq!(rollup.actions_count, 2);

    let err = uow
        .update_rollups(&[RollupUpdate::new(id + 1, 1, 1)])
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
    uow.close().await.unwrap();
}

pub async fn rollback_balance_updates<S: Storage>(storage: &S) {
    let mut uow = storage.begin().await.unwrap();
    let mut updates = vec![
        BalanceUpdate::new(1, 7964, Decimal::new(10, 0)),
        BalanceUpdate::new(1, 7965, Decimal::new(-3, 0)),
        BalanceUpdate::new(2, 7965, Decimal::new(3, 0)),
    ];
    uow.save_balance_updates(&mut updates).await.unwrap();
    uow.flush().await.unwrap();
    uow.close().await.unwrap();

    let mut uow = storage.begin().await.unwrap();
    let removed = uow.rollback_balance_updates(7965).await.unwrap();
    assert_eq!(removed, updates[1..].to_vec());
    assert_eq!(uow.rollback_balance_updates(7965).await.unwrap(), vec![]);
    uow.flush().await.unwrap();
    uow.close().await.unwrap();

    let mut uow = storage.begin().await.unwrap();
    assert_eq!(uow.rollback_balance_updates(7965).await.unwrap(), vec![]);
    assert_eq!(
        uow.rollback_balance_updates(7964).await.unwrap(),
        updates[..1].to_vec()
    );
    uow.close().await.unwrap();
}

pub async fn rollback_block<S: Storage>(storage: &S) {
    let mut uow = storage.begin().await.unwrap();
    save_blocks(&mut uow, &[7963, 7964, 7965]).await;
    let mut stats = BlockStats::dummy().height(7965).tx_count(2);
    uow.save_block_stats(&mut stats).await.unwrap();
    uow.flush().await.unwrap();
    uow.close().await.unwrap();

    let mut uow = storage.begin().await.unwrap();
    uow.rollback_block(7965).await.unwrap();
    assert_eq!(uow.rollback_block_stats(7965).await.unwrap(), Some(stats));
    assert_eq!(uow.rollback_block_stats(7965).await.unwrap(), None);
    let last = uow.last_block().await.unwrap().unwrap();
    assert_eq!(last.height, 7964);
    uow.flush().await.unwrap();
    uow.close().await.unwrap();
}

pub async fn rollback_links_are_symmetric<S: Storage>(storage: &S) {
    let at_h = vec![
        address_action(1, 10, 500),
        address_action(2, 10, 500),
        address_action(1, 11, 500),
    ];
    let before = vec![address_action(1, 9, 499)];

    let mut uow = storage.begin().await.unwrap();
    uow.save_address_actions(&before).await.unwrap();
    uow.save_address_actions(&at_h).await.unwrap();
    uow.flush().await.unwrap();

    let removed = uow.rollback_address_actions(500).await.unwrap();
    let mut expected = at_h.clone();
    expected.sort_by_key(|aa| (aa.address_id, aa.action_id));
    assert_eq!(removed, expected);

    // Re-ingesting gives back the same rows
    uow.save_address_actions(&removed).await.unwrap();
    assert_eq!(uow.rollback_address_actions(500).await.unwrap(), expected);
    assert_eq!(uow.rollback_address_actions(499).await.unwrap(), before);
    uow.close().await.unwrap();
}

pub async fn rollback_addresses_and_reuse_ids<S: Storage>(storage: &S) {
    let mut uow = storage.begin().await.unwrap();
    let mut old = vec![Address::dummy().height(1)];
    uow.save_addresses(&mut old).await.unwrap();
    let mut new = vec![Address::dummy().height(2), Address::dummy().height(2)];
    uow.save_addresses(&mut new).await.unwrap();
    let balances = vec![
        Balance::native(new[0].id, Decimal::new(5, 0)),
        Balance::native(old[0].id, Decimal::new(7, 0)),
    ];
    uow.save_balances(&balances).await.unwrap();
    uow.flush().await.unwrap();
    uow.close().await.unwrap();

    let mut uow = storage.begin().await.unwrap();
    let removed = uow.rollback_addresses(2).await.unwrap();
    assert_eq!(removed, new);
    let removed_ids: Vec<Id> = removed.iter().map(|a| a.id).collect();
    uow.rollback_balances(&removed_ids).await.unwrap();
    let native = String::from(NATIVE_CURRENCY);
    assert_eq!(uow.get_balance(new[0].id, &native).await.unwrap(), None);
    assert_eq!(
        uow.get_balance(old[0].id, &native).await.unwrap(),
        Some(balances[1].clone())
    );
    assert!(uow.get_address_by_hash(&new[0].hash).await.unwrap().is_none());

    // Re-ingesting reproduces ids
    let mut again = vec![new[0].clone(), new[1].clone()];
    again.iter_mut().for_each(|a| a.id = 0);
    assert_eq!(uow.save_addresses(&mut again).await.unwrap(), 2);
    assert_eq!(again, new);
    uow.flush().await.unwrap();
    uow.close().await.unwrap();
}

pub async fn rollback_rollups<S: Storage>(storage: &S) {
    let mut uow = storage.begin().await.unwrap();
    let mut rollups = vec![Rollup::dummy().first_height(3), Rollup::dummy().first_height(4)];
    uow.save_rollups(&mut rollups).await.unwrap();
    uow.flush().await.unwrap();

    assert_eq!(uow.rollback_rollups(4).await.unwrap(), rollups[1..].to_vec());
    assert_eq!(uow.rollback_rollups(4).await.unwrap(), vec![]);
    assert!(uow.get_rollup(rollups[1].id).await.unwrap().is_none());

    let mut again = vec![Rollup {
        id: 0,
        ..rollups[1].clone()
    }];
    assert_eq!(uow.save_rollups(&mut again).await.unwrap(), 1);
    assert_eq!(again[0].id, rollups[1].id);
    uow.flush().await.unwrap();
    uow.close().await.unwrap();
}

pub async fn rollback_txs_and_actions<S: Storage>(storage: &S) {
    let mut uow = storage.begin().await.unwrap();
    let mut txs = vec![
        Tx::dummy().height(20).signer_id(1).nonce(1),
        Tx::dummy().height(21).signer_id(1).nonce(2),
        Tx::dummy().height(21).position(1).signer_id(2).nonce(1),
    ];
    uow.save_transactions(&mut txs).await.unwrap();
    let mut actions = vec![
        Action::dummy().height(20).tx_id(txs[0].id),
        Action::dummy().height(21).tx_id(txs[1].id),
        Action::dummy()
            .height(21)
            .tx_id(txs[1].id)
            .position(1)
            .action_type(ActionType::Transfer)
            .data(serde_json::json!({"amount": "10"})),
    ];
    uow.save_actions(&mut actions).await.unwrap();
    uow.flush().await.unwrap();
    assert_eq!(uow.last_nonce(1).await.unwrap(), Some(2));

    assert_eq!(uow.rollback_txs(21).await.unwrap(), txs[1..].to_vec());
    assert_eq!(uow.rollback_actions(21).await.unwrap(), actions[1..].to_vec());
    assert_eq!(uow.last_nonce(1).await.unwrap(), Some(1));
    assert_eq!(uow.last_nonce(2).await.unwrap(), None);
    uow.close().await.unwrap();
}

pub async fn rollback_validators<S: Storage>(storage: &S) {
    let mut uow = storage.begin().await.unwrap();
    let mut validators = vec![
        Validator::dummy().height(0),
        Validator::dummy().height(5),
        Validator::dummy().height(6),
    ];
    uow.save_validators(&mut validators).await.unwrap();
    uow.flush().await.unwrap();

    uow.rollback_validators(5).await.unwrap();
    let remaining = uow.validators().await.unwrap();
    match storage.settings().validator_rollback {
        ValidatorBoundary::After => assert_eq!(remaining, validators[..2].to_vec()),
        ValidatorBoundary::AtOrAfter => assert_eq!(remaining, validators[..1].to_vec()),
    }

    // Nothing is ever past the last height
    uow.rollback_validators(100).await.unwrap();
    assert_eq!(uow.validators().await.unwrap(), remaining);
    uow.close().await.unwrap();
}

pub async fn proposer_lookup<S: Storage>(storage: &S) {
    let mut uow = storage.begin().await.unwrap();
    let mut validators = vec![Validator::dummy(), Validator::dummy()];
    uow.save_validators(&mut validators).await.unwrap();
    let id = uow.get_proposer_id(&validators[1].address).await.unwrap();
    assert_eq!(id, validators[1].id);

    let unknown = Validator::dummy().address;
    let err = uow.get_proposer_id(&unknown).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
    // A failed lookup is not fatal
    assert_eq!(uow.validators().await.unwrap(), validators);
    uow.close().await.unwrap();
}

pub async fn additive_balances<S: Storage>(storage: &S) {
    let native = String::from(NATIVE_CURRENCY);
    let mut other = Balance::native(1, Decimal::new(3, 0));
    other.currency = String::from("utia");

    let mut uow = storage.begin().await.unwrap();
    uow.save_balances(&[
        Balance::native(1, Decimal::new(100, 0)),
        Balance::native(1, Decimal::new(-30, 0)),
        other.clone(),
    ])
    .await
    .unwrap();
    uow.flush().await.unwrap();
    uow.save_balances(&[Balance::native(1, Decimal::new(5, 0))])
        .await
        .unwrap();
    let b = uow.get_balance(1, &native).await.unwrap().unwrap();
    assert_eq!(b.total, Decimal::new(75, 0));
    assert_eq!(uow.get_balance(1, &other.currency).await.unwrap(), Some(other));

    uow.rollback_balances(&[1]).await.unwrap();
    assert_eq!(uow.get_balance(1, &native).await.unwrap(), None);
    uow.close().await.unwrap();
}

pub async fn failed_batch_leaves_nothing<S: Storage>(storage: &S) {
    let mut uow = storage.begin().await.unwrap();
    let mut addresses = vec![Address::dummy()];
    uow.save_addresses(&mut addresses).await.unwrap();
    let tx = Tx::dummy().signer_id(addresses[0].id);
    let mut txs = vec![tx.clone(), tx.clone()];
    let err = uow.save_transactions(&mut txs).await.unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));
    assert!(matches!(
        uow.save_addresses(&mut vec![Address::dummy()]).await,
        Err(StoreError::Aborted)
    ));
    assert!(matches!(uow.flush().await, Err(StoreError::Aborted)));
    uow.close().await.unwrap();

    let mut uow = storage.begin().await.unwrap();
    assert!(uow
        .get_address_by_hash(&addresses[0].hash)
        .await
        .unwrap()
        .is_none());
    uow.close().await.unwrap();
}

pub async fn unique_constraints_span_units_of_work<S: Storage>(storage: &S) {
    let mut uow = storage.begin().await.unwrap();
    let mut validators = vec![Validator::dummy()];
    uow.save_validators(&mut validators).await.unwrap();
    uow.flush().await.unwrap();
    uow.close().await.unwrap();

    let mut uow = storage.begin().await.unwrap();
    let mut again = vec![validators[0].height(9)];
    again[0].id = 0;
    let err = uow.save_validators(&mut again).await.unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));
    uow.close().await.unwrap();
}

pub async fn reads_see_own_writes<S: Storage>(storage: &S) {
    let mut uow = storage.begin().await.unwrap();
    assert_eq!(uow.last_block().await.unwrap(), None);
    assert_eq!(uow.chain_state("test").await.unwrap(), None);

    save_blocks(&mut uow, &[1]).await;
    let mut state = ChainState::initial("test", 1, time_at(1));
    uow.save_state(&mut state).await.unwrap();
    assert_eq!(uow.last_block().await.unwrap().unwrap().height, 1);
    assert_eq!(uow.chain_state("test").await.unwrap(), Some(state.clone()));

    // Saving again overwrites
    state.last_height = 2;
    let id = state.id;
    uow.save_state(&mut state).await.unwrap();
    assert_eq!(state.id, id);
    assert_eq!(uow.chain_state("test").await.unwrap().unwrap().last_height, 2);
    uow.close().await.unwrap();

    // Never flushed
    let mut uow = storage.begin().await.unwrap();
    assert_eq!(uow.last_block().await.unwrap(), None);
    uow.close().await.unwrap();
}

pub async fn flush_is_a_checkpoint<S: Storage>(storage: &S) {
    let mut uow = storage.begin().await.unwrap();
    save_blocks(&mut uow, &[1]).await;
    uow.flush().await.unwrap();
    save_blocks(&mut uow, &[2]).await;
    uow.close().await.unwrap();

    let mut uow = storage.begin().await.unwrap();
    assert_eq!(uow.last_block().await.unwrap().unwrap().height, 1);
    uow.close().await.unwrap();
}

pub async fn dropped_unit_of_work_is_abandoned<S: Storage>(storage: &S) {
    let mut uow = storage.begin().await.unwrap();
    save_blocks(&mut uow, &[1]).await;
    drop(uow);

    let mut uow = storage.begin().await.unwrap();
    assert_eq!(uow.last_block().await.unwrap(), None);
    save_blocks(&mut uow, &[1]).await;
    uow.flush().await.unwrap();
    uow.close().await.unwrap();
}

pub async fn timed_out_unit_of_work_is_abandoned<S: Storage>(storage: &S) {
    let mut uow = storage.begin().await.unwrap();
    save_blocks(&mut uow, &[1]).await;
    // Waiting on a second unit of work while holding the first never completes
    let blocked = tokio::time::timeout(std::time::Duration::from_millis(50), storage.begin()).await;
    assert!(blocked.is_err());
    drop(uow);

    let mut uow = storage.begin().await.unwrap();
    assert_eq!(uow.last_block().await.unwrap(), None);
    uow.close().await.unwrap();
}

pub async fn untracked_balances_are_dropped<S: Storage>(storage: &S) {
    let native = String::from(NATIVE_CURRENCY);
    let other = String::from("utia");
    let mut new = BalanceUpdate::new(1, 6, Decimal::new(4, 0));
    new.currency = other.clone();
    let mut updates = vec![BalanceUpdate::new(1, 5, Decimal::new(3, 0)), new];

    let mut uow = storage.begin().await.unwrap();
    uow.save_balance_updates(&mut updates).await.unwrap();
    let (old, new) = (updates[0].clone(), updates[1].clone());
    let mut other_balance = Balance::native(1, new.delta);
    other_balance.currency = other.clone();
    uow.save_balances(&[Balance::native(1, old.delta), other_balance])
        .await
        .unwrap();
    uow.flush().await.unwrap();

    assert_eq!(uow.rollback_balance_updates(6).await.unwrap(), vec![new]);
    let mut reversal = Balance::native(1, Decimal::new(-4, 0));
    reversal.currency = other.clone();
    uow.save_balances(&[reversal]).await.unwrap();
    uow.rollback_untracked_balances(&[(1, other.clone()), (1, native.clone())])
        .await
        .unwrap();
    assert_eq!(uow.get_balance(1, &other).await.unwrap(), None);
    assert_eq!(
        uow.get_balance(1, &native).await.unwrap(),
        Some(Balance::native(1, Decimal::new(3, 0)))
    );
    uow.close().await.unwrap();
}
