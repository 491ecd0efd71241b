//! Drives one unit of work per height.
use itertools::Itertools;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::collections::HashSet;

use crate::aggregates::address_reversals;
use crate::aggregates::balance_reversals;
use crate::aggregates::rollup_reversals;
use crate::aggregates::AddressUpdate;
use crate::aggregates::RollupUpdate;
use crate::error::StoreError;
use crate::store::Storage;
use crate::store::UnitOfWork;
use crate::types::Action;
use crate::types::Address;
use crate::types::AddressAction;
use crate::types::AddressHash;
use crate::types::Balance;
use crate::types::BalanceUpdate;
use crate::types::Block;
use crate::types::BlockSignature;
use crate::types::BlockStats;
use crate::types::ChainID;
use crate::types::ChainState;
use crate::types::Constant;
use crate::types::Currency;
use crate::types::Height;
use crate::types::Id;
use crate::types::Rollup;
use crate::types::RollupAction;
use crate::types::RollupAddress;
use crate::types::Timestamp;
use crate::types::Tx;
use crate::types::Validator;

/// Genesis derived rows.
#[derive(Debug, Clone)]
pub struct GenesisData {
    pub time: Timestamp,
    pub constants: Vec<Constant>,
    pub validators: Vec<Validator>,
}

/// A block decomposed into candidate rows.
///
/// Ids and references to addresses, rollups and validators are resolved
/// during inclusion.
#[derive(Debug, Clone)]
pub struct BlockData {
    pub block: Block,
    /// Consensus address of the block proposer
    pub proposer_address: String,
    pub stats: BlockStats,
    pub txs: Vec<TxData>,
    /// Validators in the block's validator set, known ones are skipped
    pub validators: Vec<Validator>,
    /// Consensus addresses of validators that signed the block
    pub signatures: Vec<String>,
    pub balance_updates: Vec<BalanceData>,
}

#[derive(Debug, Clone)]
pub struct TxData {
    pub tx: Tx,
    pub signer: AddressHash,
    pub actions: Vec<ActionData>,
}

#[derive(Debug, Clone)]
pub struct ActionData {
    pub action: Action,
    /// Addresses involved in the action
    pub addresses: Vec<AddressHash>,
    pub rollup: Option<RollupData>,
}

/// Rollup data carried by an action.
#[derive(Debug, Clone)]
pub struct RollupData {
    pub chain_id: ChainID,
    pub size: i64,
}

#[derive(Debug, Clone)]
pub struct BalanceData {
    pub address: AddressHash,
    pub currency: Currency,
    pub delta: Decimal,
}

pub struct Indexer<S: Storage> {
    /// Name of the chain state owned by this indexer
    name: String,
    storage: S,
}

/// Flush and close `uow` if `result` is ok, discard it otherwise.
async fn finish<U: UnitOfWork, T>(mut uow: U, result: Result<T, StoreError>) -> Result<T, StoreError> {
    let result = match result {
        Ok(value) => uow.flush().await.map(|_| value),
        Err(e) => Err(e),
    };
    match (result, uow.close().await) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(close_err)) => {
            tracing::warn!("failed to close unit of work: {close_err}");
            Err(e)
        }
    }
}

impl<S: Storage> Indexer<S> {
    pub fn new(name: &str, storage: S) -> Self {
        Self {
            name: name.to_owned(),
            storage,
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Current chain state, if any block or genesis was included.
    pub async fn state(&self) -> Result<Option<ChainState>, StoreError> {
        let mut uow = self.storage.begin().await?;
        let result = uow.chain_state(&self.name).await;
        finish(uow, result).await
    }

    /// Store genesis constants and validators and start the chain state at height 0.
    pub async fn include_genesis(&self, genesis: &GenesisData) -> Result<(), StoreError> {
        tracing::info!("including genesis");
        let mut uow = self.storage.begin().await?;
        let result = self.include_genesis_with(&mut uow, genesis).await;
        finish(uow, result).await
    }

    async fn include_genesis_with<U: UnitOfWork>(
        &self,
        uow: &mut U,
        genesis: &GenesisData,
    ) -> Result<(), StoreError> {
        if uow.chain_state(&self.name).await?.is_some() {
            return Err(StoreError::Validation(format!(
                "chain state {} is already initialized",
                self.name
            )));
        }
        uow.save_constants(&genesis.constants).await?;
        let mut validators: Vec<Validator> = genesis
            .validators
            .iter()
            .map(|v| Validator {
                height: 0,
                ..v.clone()
            })
            .collect();
        uow.save_validators(&mut validators).await?;
        let mut state = ChainState::initial(&self.name, 0, genesis.time);
        uow.save_state(&mut state).await
    }

    /// Include next block.
    pub async fn include_block(&self, data: &BlockData) -> Result<(), StoreError> {
        tracing::info!("including block {}", data.block.height);
        let mut uow = self.storage.begin().await?;
        let result = self.include_block_with(&mut uow, data).await;
        finish(uow, result).await
    }

    async fn include_block_with<U: UnitOfWork>(
        &self,
        uow: &mut U,
        data: &BlockData,
    ) -> Result<(), StoreError> {
        let height = data.block.height;
        let time = data.block.time;
        let prev_state = uow.chain_state(&self.name).await?;
        if let Some(s) = &prev_state {
            if height != s.last_height + 1 {
                return Err(StoreError::Validation(format!(
                    "expected block {}, got {height}",
                    s.last_height + 1
                )));
            }
            if !s.last_hash.is_empty() && s.last_hash != data.block.parent_hash {
                return Err(StoreError::Validation(format!(
                    "block {height} is not a child of {}",
                    base16::encode_lower(&s.last_hash)
                )));
            }
        }

        // Identities
        let mut address_candidates: Vec<Address> = data
            .txs
            .iter()
            .flat_map(|t| {
                std::iter::once(&t.signer).chain(t.actions.iter().flat_map(|a| a.addresses.iter()))
            })
            .chain(data.balance_updates.iter().map(|b| &b.address))
            .map(|hash| Address::spotted(hash.clone(), height))
            .collect();
        let new_addresses = uow.save_addresses(&mut address_candidates).await?;
        let address_ids: HashMap<&AddressHash, Id> = address_candidates
            .iter()
            .map(|a| (&a.hash, a.id))
            .collect();

        let mut rollup_candidates: Vec<Rollup> = data
            .txs
            .iter()
            .flat_map(|t| t.actions.iter().filter_map(|a| a.rollup.as_ref()))
            .map(|r| Rollup::spotted(r.chain_id.clone(), height))
            .collect();
        let new_rollups = uow.save_rollups(&mut rollup_candidates).await?;
        let rollup_ids: HashMap<&ChainID, Id> = rollup_candidates
            .iter()
            .map(|r| (&r.chain_id, r.id))
            .collect();

        // Validators
        let known: HashSet<String> = uow
            .validators()
            .await?
            .into_iter()
            .map(|v| v.address)
            .collect();
        let mut validators: Vec<Validator> = data
            .validators
            .iter()
            .filter(|v| !known.contains(&v.address))
            .map(|v| Validator {
                height,
                ..v.clone()
            })
            .collect();
        uow.save_validators(&mut validators).await?;

        // Block
        let mut block = Block {
            proposer_id: uow.get_proposer_id(&data.proposer_address).await?,
            ..data.block.clone()
        };
        uow.save_block(&mut block).await?;
        let mut stats = data.stats.clone();
        uow.save_block_stats(&mut stats).await?;

        // Transactions and actions
        let mut txs: Vec<Tx> = data
            .txs
            .iter()
            .map(|t| Tx {
                signer_id: address_ids[&t.signer],
                actions_count: t.actions.len() as i64,
                ..t.tx.clone()
            })
            .collect();
        uow.save_transactions(&mut txs).await?;

        let mut actions: Vec<Action> = data
            .txs
            .iter()
            .zip(&txs)
            .flat_map(|(t, tx)| {
                t.actions.iter().map(|a| Action {
                    tx_id: tx.id,
                    ..a.action.clone()
                })
            })
            .collect();
        uow.save_actions(&mut actions).await?;

        // Links
        let action_data = data.txs.iter().flat_map(|t| t.actions.iter());
        let mut address_actions: Vec<AddressAction> = vec![];
        let mut rollup_actions: Vec<RollupAction> = vec![];
        let mut rollup_addresses: Vec<RollupAddress> = vec![];
        for (a, action) in action_data.zip(&actions) {
            for hash in a.addresses.iter().unique() {
                address_actions.push(AddressAction {
                    address_id: address_ids[hash],
                    action_id: action.id,
                    tx_id: action.tx_id,
                    action_type: action.action_type,
                    height,
                    time,
                });
            }
            if let Some(r) = &a.rollup {
                let rollup_id = rollup_ids[&r.chain_id];
                rollup_actions.push(RollupAction {
                    rollup_id,
                    action_id: action.id,
                    tx_id: action.tx_id,
                    height,
                    time,
                    action_type: action.action_type,
                    size: r.size,
                });
                let signer_id = txs
                    .iter()
                    .find(|tx| tx.id == action.tx_id)
                    .map(|tx| tx.signer_id)
                    .unwrap_or_default();
                rollup_addresses.push(RollupAddress {
                    rollup_id,
                    address_id: signer_id,
                    height,
                });
            }
        }
        uow.save_address_actions(&address_actions).await?;
        uow.save_rollup_actions(&rollup_actions).await?;
        uow.save_rollup_addresses(&rollup_addresses).await?;

        // Aggregates
        let address_updates: Vec<AddressUpdate> = address_actions
            .iter()
            .map(|aa| AddressUpdate::new(aa.address_id).actions(1))
            .chain(txs.iter().sorted_by_key(|tx| tx.position).map(|tx| {
                AddressUpdate::new(tx.signer_id)
                    .signed_txs(1)
                    .nonce(tx.nonce)
            }))
            .collect();
        uow.update_addresses(&address_updates).await?;
        let rollup_updates: Vec<RollupUpdate> = rollup_actions
            .iter()
            .map(|ra| RollupUpdate::new(ra.rollup_id, 1, ra.size))
            .collect();
        uow.update_rollups(&rollup_updates).await?;

        // Balances
        let mut balance_updates: Vec<BalanceUpdate> = data
            .balance_updates
            .iter()
            .map(|b| BalanceUpdate {
                id: 0,
                height,
                address_id: address_ids[&b.address],
                currency: b.currency.clone(),
                delta: b.delta,
            })
            .collect();
        uow.save_balance_updates(&mut balance_updates).await?;
        let balances: Vec<Balance> = balance_updates
            .iter()
            .map(|u| Balance {
                id: u.address_id,
                currency: u.currency.clone(),
                total: u.delta,
            })
            .collect();
        uow.save_balances(&balances).await?;

        // Signatures
        let mut signatures = vec![];
        for address in &data.signatures {
            signatures.push(BlockSignature {
                id: 0,
                validator_id: uow.get_proposer_id(address).await?,
                height,
                time,
            });
        }
        uow.save_block_signatures(&mut signatures).await?;

        // Chain state
        let mut state = match prev_state {
            Some(s) => s,
            None => ChainState::initial(&self.name, height, time),
        };
        state.last_height = height;
        state.last_hash = block.hash.clone();
        state.last_time = time;
        state.total_tx += txs.len() as i64;
        state.total_accounts += new_addresses as i64;
        state.total_rollups += new_rollups as i64;
        state.total_bytes += stats.bytes_in_block;
        state.total_supply += stats.supply_change;
        uow.save_state(&mut state).await
    }

    /// Roll back last included block at `height`.
    ///
    /// Returns the height of the new head.
    pub async fn roll_back(&self, height: Height) -> Result<Height, StoreError> {
        tracing::info!("rolling back block {height}");
        let mut uow = self.storage.begin().await?;
        let result = self.roll_back_with(&mut uow, height).await;
        finish(uow, result).await
    }

    async fn roll_back_with<U: UnitOfWork>(
        &self,
        uow: &mut U,
        height: Height,
    ) -> Result<Height, StoreError> {
        let mut state = uow
            .chain_state(&self.name)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("chain state {}", self.name)))?;
        match uow.last_block().await? {
            Some(b) if b.height == height => (),
            Some(b) => {
                return Err(StoreError::Validation(format!(
                    "can only roll back last block {}, got {height}",
                    b.height
                )))
            }
            None => return Err(StoreError::NotFound(format!("block {height}"))),
        }

        // Delete everything stamped with `height`
        uow.rollback_block(height).await?;
        let stats = uow.rollback_block_stats(height).await?;
        let removed_addresses = uow.rollback_addresses(height).await?;
        let removed_rollups = uow.rollback_rollups(height).await?;
        let txs = uow.rollback_txs(height).await?;
        uow.rollback_actions(height).await?;
        let address_actions = uow.rollback_address_actions(height).await?;
        let rollup_actions = uow.rollback_rollup_actions(height).await?;
        uow.rollback_rollup_addresses(height).await?;
        let boundary = self.storage.settings().validator_rollback;
        uow.rollback_validators(boundary.argument_for(height)).await?;
        uow.rollback_block_signatures(height).await?;
        let balance_updates = uow.rollback_balance_updates(height).await?;

        // Reverse aggregates of surviving rows
        let removed_address_ids: HashSet<Id> = removed_addresses.iter().map(|a| a.id).collect();
        let removed_rollup_ids: HashSet<Id> = removed_rollups.iter().map(|r| r.id).collect();

        let signers: HashSet<Id> = txs.iter().map(|tx| tx.signer_id).collect();
        let mut address_updates = address_reversals(&address_actions, &txs, &removed_address_ids);
        for u in address_updates.iter_mut().filter(|u| signers.contains(&u.id)) {
            u.nonce = Some(uow.last_nonce(u.id).await?.unwrap_or(0));
        }
        uow.update_addresses(&address_updates).await?;
        uow.update_rollups(&rollup_reversals(&rollup_actions, &removed_rollup_ids))
            .await?;
        uow.save_balances(&balance_reversals(&balance_updates, &removed_address_ids))
            .await?;
        let untracked: Vec<(Id, Currency)> = balance_updates
            .iter()
            .filter(|u| !removed_address_ids.contains(&u.address_id))
            .map(|u| (u.address_id, u.currency.clone()))
            .unique()
            .collect();
        let removed_ids: Vec<Id> = removed_address_ids.into_iter().sorted().collect();
        uow.rollback_balances(&removed_ids).await?;
        uow.rollback_untracked_balances(&untracked).await?;

        // Rewind chain state
        match uow.last_block().await? {
            Some(head) => {
                state.last_height = head.height;
                state.last_hash = head.hash;
                state.last_time = head.time;
            }
            None => {
                state.last_height = height - 1;
                state.last_hash = vec![];
                state.last_time = state.genesis_time;
            }
        }
        state.total_tx -= txs.len() as i64;
        state.total_accounts -= removed_addresses.len() as i64;
        state.total_rollups -= removed_rollups.len() as i64;
        if let Some(stats) = stats {
            state.total_bytes -= stats.bytes_in_block;
            state.total_supply -= stats.supply_change;
        }
        uow.save_state(&mut state).await?;
        Ok(state.last_height)
    }

    /// Prune block signatures out of the retention window ending at `boundary`.
    pub async fn prune(&self, boundary: Height) -> Result<(), StoreError> {
        tracing::debug!("pruning block signatures for boundary {boundary}");
        let mut uow = self.storage.begin().await?;
        let result = uow.retention_block_signatures(boundary).await;
        finish(uow, result).await
    }
}
