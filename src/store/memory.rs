//! In-process storage backend.
//!
//! Enforces the same identity, uniqueness and validation rules as the
//! PostgreSQL backend. Used by tests and by embedders that need no
//! persistence.
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::sync::OwnedMutexGuard;

use super::identity;
use super::identity::Identified;
use super::validation;
use super::Storage;
use super::UnitOfWork;
use crate::aggregates::merge_balances;
use crate::aggregates::AddressUpdate;
use crate::aggregates::RollupUpdate;
use crate::config::StoreSettings;
use crate::error::StoreError;
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
use crate::types::ModuleName;
use crate::types::Nonce;
use crate::types::Rollup;
use crate::types::RollupAction;
use crate::types::RollupAddress;
use crate::types::Tx;
use crate::types::Validator;

/// Full content of a memory store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryState {
    pub blocks: BTreeMap<Id, Block>,
    pub block_stats: BTreeMap<Id, BlockStats>,
    pub chain_states: BTreeMap<Id, ChainState>,
    pub addresses: BTreeMap<Id, Address>,
    pub txs: BTreeMap<Id, Tx>,
    pub actions: BTreeMap<Id, Action>,
    pub validators: BTreeMap<Id, Validator>,
    pub rollups: BTreeMap<Id, Rollup>,
    pub rollup_actions: BTreeMap<(Id, Id), RollupAction>,
    pub rollup_addresses: BTreeMap<(Id, Id), RollupAddress>,
    pub address_actions: BTreeMap<(Id, Id), AddressAction>,
    pub block_signatures: BTreeMap<Id, BlockSignature>,
    pub balances: BTreeMap<(Id, Currency), Balance>,
    pub balance_updates: BTreeMap<Id, BalanceUpdate>,
    pub constants: BTreeMap<(ModuleName, String), Constant>,
    address_ids: HashMap<AddressHash, Id>,
    rollup_ids: HashMap<ChainID, Id>,
}

#[derive(Debug, Clone)]
pub struct MemoryStorage {
    state: Arc<Mutex<MemoryState>>,
    settings: StoreSettings,
}

impl MemoryStorage {
    pub fn new(settings: StoreSettings) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            settings,
        }
    }

    /// Copy of the committed state.
    ///
    /// Waits for any open unit of work to be released.
    pub async fn snapshot(&self) -> MemoryState {
        self.state.lock().await.clone()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(StoreSettings::default())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    type Uow = MemoryUnitOfWork;

    async fn begin(&self) -> Result<Self::Uow, StoreError> {
        let committed = self.state.clone().lock_owned().await;
        tracing::debug!("beginning memory unit of work");
        Ok(MemoryUnitOfWork {
            staged: committed.clone(),
            committed,
            settings: self.settings,
            poisoned: false,
        })
    }

    fn settings(&self) -> &StoreSettings {
        &self.settings
    }
}

pub struct MemoryUnitOfWork {
    committed: OwnedMutexGuard<MemoryState>,
    staged: MemoryState,
    settings: StoreSettings,
    poisoned: bool,
}

impl MemoryUnitOfWork {
    fn write<T, F>(&mut self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut MemoryState, &StoreSettings) -> Result<T, StoreError>,
    {
        if self.poisoned {
            return Err(StoreError::Aborted);
        }
        let result = op(&mut self.staged, &self.settings);
        if let Err(e) = &result {
            tracing::warn!("aborting unit of work: {e}");
            self.poisoned = true;
        }
        result
    }

    fn read<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&MemoryState) -> Result<T, StoreError>,
    {
        if self.poisoned {
            return Err(StoreError::Aborted);
        }
        op(&self.staged)
    }
}

fn next_id<T>(rows: &BTreeMap<Id, T>) -> Id {
    rows.last_key_value().map(|(id, _)| id + 1).unwrap_or(1)
}

/// Gives unassigned ids the next free values and rejects taken ones.
fn assign_ids<'a, T: 'a>(
    table: &str,
    rows: &BTreeMap<Id, T>,
    ids: impl Iterator<Item = &'a mut Id>,
) -> Result<(), StoreError> {
    let mut next = next_id(rows);
    let mut seen = HashSet::new();
    for id in ids {
        if *id == 0 {
            *id = next;
            next += 1;
        }
        if rows.contains_key(&*id) || !seen.insert(*id) {
            return Err(StoreError::Conflict(format!("{table} id {id} is taken")));
        }
    }
    Ok(())
}

fn drain_where<K: Ord + Clone, T, F>(rows: &mut BTreeMap<K, T>, pred: F) -> Vec<T>
where
    F: Fn(&T) -> bool,
{
    let keys: Vec<K> = rows
        .iter()
        .filter(|(_, v)| pred(v))
        .map(|(k, _)| k.clone())
        .collect();
    keys.iter().filter_map(|k| rows.remove(k)).collect()
}

impl MemoryState {
    fn save_block(&mut self, block: &mut Block) -> Result<(), StoreError> {
        validation::block(block)?;
        if self.blocks.values().any(|b| b.height == block.height) {
            return Err(StoreError::Validation(format!(
                "block {} already exists",
                block.height
            )));
        }
        assign_ids("block", &self.blocks, std::iter::once(&mut block.id))?;
        self.blocks.insert(block.id, block.clone());
        Ok(())
    }

    fn save_block_stats(&mut self, stats: &mut BlockStats) -> Result<(), StoreError> {
        validation::block_stats(stats)?;
        if self.block_stats.values().any(|s| s.height == stats.height) {
            return Err(StoreError::Validation(format!(
                "block stats {} already exist",
                stats.height
            )));
        }
        assign_ids("block stats", &self.block_stats, std::iter::once(&mut stats.id))?;
        self.block_stats.insert(stats.id, stats.clone());
        Ok(())
    }

    fn save_state(&mut self, state: &mut ChainState) -> Result<(), StoreError> {
        validation::chain_state(state)?;
        state.id = match self.chain_states.values().find(|s| s.name == state.name) {
            Some(existing) => existing.id,
            None => next_id(&self.chain_states),
        };
        self.chain_states.insert(state.id, state.clone());
        Ok(())
    }

    fn save_transactions(&mut self, txs: &mut [Tx]) -> Result<(), StoreError> {
        validation::txs(txs)?;
        let taken: HashSet<(Height, i64)> =
            self.txs.values().map(|tx| (tx.height, tx.position)).collect();
        if let Some(tx) = txs.iter().find(|tx| taken.contains(&(tx.height, tx.position))) {
            return Err(StoreError::Validation(format!(
                "tx position {}/{} is taken",
                tx.height, tx.position
            )));
        }
        assign_ids("tx", &self.txs, txs.iter_mut().map(|tx| &mut tx.id))?;
        for tx in txs.iter() {
            self.txs.insert(tx.id, tx.clone());
        }
        Ok(())
    }

    fn save_actions(&mut self, actions: &mut [Action]) -> Result<(), StoreError> {
        validation::actions(actions)?;
        let taken: HashSet<(Id, i64)> =
            self.actions.values().map(|a| (a.tx_id, a.position)).collect();
        if let Some(a) = actions.iter().find(|a| taken.contains(&(a.tx_id, a.position))) {
            return Err(StoreError::Validation(format!(
                "action position {} of tx {} is taken",
                a.position, a.tx_id
            )));
        }
        assign_ids("action", &self.actions, actions.iter_mut().map(|a| &mut a.id))?;
        for a in actions.iter() {
            self.actions.insert(a.id, a.clone());
        }
        Ok(())
    }

    fn save_validators(&mut self, validators: &mut [Validator]) -> Result<(), StoreError> {
        validation::validators(validators)?;
        if let Some(v) = validators
            .iter()
            .find(|v| self.validators.values().any(|x| x.address == v.address))
        {
            return Err(StoreError::Validation(format!(
                "validator {} already exists",
                v.address
            )));
        }
        assign_ids(
            "validator",
            &self.validators,
            validators.iter_mut().map(|v| &mut v.id),
        )?;
        for v in validators.iter() {
            self.validators.insert(v.id, v.clone());
        }
        Ok(())
    }

    fn save_rollup_actions(&mut self, links: &[RollupAction]) -> Result<(), StoreError> {
        validation::rollup_actions(links)?;
        if let Some(ra) = links
            .iter()
            .find(|ra| self.rollup_actions.contains_key(&(ra.rollup_id, ra.action_id)))
        {
            return Err(StoreError::Validation(format!(
                "action {} already linked to rollup {}",
                ra.action_id, ra.rollup_id
            )));
        }
        for ra in links {
            self.rollup_actions
                .insert((ra.rollup_id, ra.action_id), ra.clone());
        }
        Ok(())
    }

    fn save_rollup_addresses(&mut self, links: &[RollupAddress]) -> Result<(), StoreError> {
        validation::rollup_addresses(links)?;
        for ra in links {
            self.rollup_addresses
                .entry((ra.rollup_id, ra.address_id))
                .or_insert_with(|| ra.clone());
        }
        Ok(())
    }

    fn save_address_actions(&mut self, links: &[AddressAction]) -> Result<(), StoreError> {
        validation::address_actions(links)?;
        if let Some(aa) = links
            .iter()
            .find(|aa| self.address_actions.contains_key(&(aa.address_id, aa.action_id)))
        {
            return Err(StoreError::Validation(format!(
                "action {} already linked to address {}",
                aa.action_id, aa.address_id
            )));
        }
        for aa in links {
            self.address_actions
                .insert((aa.address_id, aa.action_id), aa.clone());
        }
        Ok(())
    }

    fn save_block_signatures(&mut self, signatures: &mut [BlockSignature]) -> Result<(), StoreError> {
        validation::block_signatures(signatures)?;
        let taken: HashSet<(Id, Height)> = self
            .block_signatures
            .values()
            .map(|s| (s.validator_id, s.height))
            .collect();
        if let Some(s) = signatures
            .iter()
            .find(|s| taken.contains(&(s.validator_id, s.height)))
        {
            return Err(StoreError::Validation(format!(
                "validator {} already signed block {}",
                s.validator_id, s.height
            )));
        }
        assign_ids(
            "block signature",
            &self.block_signatures,
            signatures.iter_mut().map(|s| &mut s.id),
        )?;
        for s in signatures.iter() {
            self.block_signatures.insert(s.id, s.clone());
        }
        Ok(())
    }

    fn save_balances(&mut self, balances: &[Balance]) -> Result<(), StoreError> {
        validation::balances(balances)?;
        for b in merge_balances(balances) {
            self.balances
                .entry((b.id, b.currency.clone()))
                .and_modify(|stored| stored.total += b.total)
                .or_insert(b);
        }
        Ok(())
    }

    fn save_balance_updates(&mut self, updates: &mut [BalanceUpdate]) -> Result<(), StoreError> {
        validation::balance_updates(updates)?;
        assign_ids(
            "balance update",
            &self.balance_updates,
            updates.iter_mut().map(|u| &mut u.id),
        )?;
        for u in updates.iter() {
            self.balance_updates.insert(u.id, u.clone());
        }
        Ok(())
    }

    fn save_constants(&mut self, constants: &[Constant]) -> Result<(), StoreError> {
        validation::constants(constants)?;
        if let Some(c) = constants
            .iter()
            .find(|c| self.constants.contains_key(&(c.module, c.name.clone())))
        {
            return Err(StoreError::Validation(format!(
                "constant {}.{} already exists",
                c.module, c.name
            )));
        }
        for c in constants {
            self.constants
                .insert((c.module, c.name.clone()), c.clone());
        }
        Ok(())
    }

    fn save_addresses(&mut self, candidates: &mut [Address]) -> Result<u64, StoreError> {
        validation::addresses(candidates)?;
        let mut resolved: HashMap<Vec<u8>, Id> = HashMap::new();
        let mut next = next_id(&self.addresses);
        let mut inserted = 0;
        for i in identity::first_appearances(candidates) {
            let key = candidates[i].natural_key().to_vec();
            let id = match self.address_ids.get(&key) {
                Some(id) => *id,
                None => {
                    let id = next;
                    next += 1;
                    inserted += 1;
                    let row = Address {
                        id,
                        ..candidates[i].clone()
                    };
                    self.addresses.insert(id, row);
                    self.address_ids.insert(key.clone(), id);
                    id
                }
            };
            resolved.insert(key, id);
        }
        identity::backfill(candidates, &resolved)?;
        Ok(inserted)
    }

    fn save_rollups(&mut self, candidates: &mut [Rollup]) -> Result<u64, StoreError> {
        validation::rollups(candidates)?;
        let mut resolved: HashMap<Vec<u8>, Id> = HashMap::new();
        let mut next = next_id(&self.rollups);
        let mut inserted = 0;
        for i in identity::first_appearances(candidates) {
            let key = candidates[i].natural_key().to_vec();
            let id = match self.rollup_ids.get(&key) {
                Some(id) => *id,
                None => {
                    let id = next;
                    next += 1;
                    inserted += 1;
                    let row = Rollup {
                        id,
                        ..candidates[i].clone()
                    };
                    self.rollups.insert(id, row);
                    self.rollup_ids.insert(key.clone(), id);
                    id
                }
            };
            resolved.insert(key, id);
        }
        identity::backfill(candidates, &resolved)?;
        Ok(inserted)
    }

    fn update_addresses(&mut self, updates: &[AddressUpdate]) -> Result<(), StoreError> {
        let merged = AddressUpdate::merge_all(updates);
        if let Some(u) = merged.iter().find(|u| !self.addresses.contains_key(&u.id)) {
            return Err(StoreError::NotFound(format!("address {}", u.id)));
        }
        for u in &merged {
            if let Some(address) = self.addresses.get_mut(&u.id) {
                u.apply(address);
            }
        }
        Ok(())
    }

    fn update_rollups(&mut self, updates: &[RollupUpdate]) -> Result<(), StoreError> {
        let merged = RollupUpdate::merge_all(updates);
        if let Some(u) = merged.iter().find(|u| !self.rollups.contains_key(&u.id)) {
            return Err(StoreError::NotFound(format!("rollup {}", u.id)));
        }
        for u in &merged {
            if let Some(rollup) = self.rollups.get_mut(&u.id) {
                u.apply(rollup);
            }
        }
        Ok(())
    }

    fn rollback_addresses(&mut self, height: Height) -> Vec<Address> {
        let removed = drain_where(&mut self.addresses, |a| a.height == height);
        for a in &removed {
            self.address_ids.remove(&a.hash);
        }
        removed
    }

    fn rollback_rollups(&mut self, height: Height) -> Vec<Rollup> {
        let removed = drain_where(&mut self.rollups, |r| r.first_height == height);
        for r in &removed {
            self.rollup_ids.remove(&r.chain_id);
        }
        removed
    }

    fn last_nonce(&self, signer_id: Id) -> Option<Nonce> {
        self.txs
            .values()
            .filter(|tx| tx.signer_id == signer_id)
            .max_by_key(|tx| (tx.height, tx.position))
            .map(|tx| tx.nonce)
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn save_block(&mut self, block: &mut Block) -> Result<(), StoreError> {
        self.write(|s, _| s.save_block(block))
    }

    async fn save_block_stats(&mut self, stats: &mut BlockStats) -> Result<(), StoreError> {
        self.write(|s, _| s.save_block_stats(stats))
    }

    async fn save_state(&mut self, state: &mut ChainState) -> Result<(), StoreError> {
        self.write(|s, _| s.save_state(state))
    }

    async fn save_transactions(&mut self, txs: &mut [Tx]) -> Result<(), StoreError> {
        self.write(|s, _| s.save_transactions(txs))
    }

    async fn save_actions(&mut self, actions: &mut [Action]) -> Result<(), StoreError> {
        self.write(|s, _| s.save_actions(actions))
    }

    async fn save_validators(&mut self, validators: &mut [Validator]) -> Result<(), StoreError> {
        self.write(|s, _| s.save_validators(validators))
    }

    async fn save_rollup_actions(&mut self, links: &[RollupAction]) -> Result<(), StoreError> {
        self.write(|s, _| s.save_rollup_actions(links))
    }

    async fn save_rollup_addresses(&mut self, links: &[RollupAddress]) -> Result<(), StoreError> {
        self.write(|s, _| s.save_rollup_addresses(links))
    }

    async fn save_address_actions(&mut self, links: &[AddressAction]) -> Result<(), StoreError> {
        self.write(|s, _| s.save_address_actions(links))
    }

    async fn save_block_signatures(
        &mut self,
        signatures: &mut [BlockSignature],
    ) -> Result<(), StoreError> {
        self.write(|s, _| s.save_block_signatures(signatures))
    }

    async fn save_balances(&mut self, balances: &[Balance]) -> Result<(), StoreError> {
        self.write(|s, _| s.save_balances(balances))
    }

    async fn save_balance_updates(&mut self, updates: &mut [BalanceUpdate]) -> Result<(), StoreError> {
        self.write(|s, _| s.save_balance_updates(updates))
    }

    async fn save_constants(&mut self, constants: &[Constant]) -> Result<(), StoreError> {
        self.write(|s, _| s.save_constants(constants))
    }

    async fn save_addresses(&mut self, addresses: &mut [Address]) -> Result<u64, StoreError> {
        self.write(|s, _| s.save_addresses(addresses))
    }

    async fn save_rollups(&mut self, rollups: &mut [Rollup]) -> Result<u64, StoreError> {
        self.write(|s, _| s.save_rollups(rollups))
    }

    async fn update_addresses(&mut self, updates: &[AddressUpdate]) -> Result<(), StoreError> {
        self.write(|s, _| s.update_addresses(updates))
    }

    async fn update_rollups(&mut self, updates: &[RollupUpdate]) -> Result<(), StoreError> {
        self.write(|s, _| s.update_rollups(updates))
    }

    async fn rollback_block(&mut self, height: Height) -> Result<(), StoreError> {
        self.write(|s, _| {
            drain_where(&mut s.blocks, |b| b.height == height);
            Ok(())
        })
    }

    async fn rollback_block_stats(
        &mut self,
        height: Height,
    ) -> Result<Option<BlockStats>, StoreError> {
        self.write(|s, _| Ok(drain_where(&mut s.block_stats, |bs| bs.height == height).pop()))
    }

    async fn rollback_addresses(&mut self, height: Height) -> Result<Vec<Address>, StoreError> {
        self.write(|s, _| Ok(s.rollback_addresses(height)))
    }

    async fn rollback_txs(&mut self, height: Height) -> Result<Vec<Tx>, StoreError> {
        self.write(|s, _| Ok(drain_where(&mut s.txs, |tx| tx.height == height)))
    }

    async fn rollback_actions(&mut self, height: Height) -> Result<Vec<Action>, StoreError> {
        self.write(|s, _| Ok(drain_where(&mut s.actions, |a| a.height == height)))
    }

    async fn rollback_validators(&mut self, height: Height) -> Result<(), StoreError> {
        self.write(|s, settings| {
            let boundary = settings.validator_rollback;
            drain_where(&mut s.validators, |v| boundary.removes(v.height, height));
            Ok(())
        })
    }

    async fn rollback_block_signatures(&mut self, height: Height) -> Result<(), StoreError> {
        self.write(|s, _| {
            drain_where(&mut s.block_signatures, |bs| bs.height == height);
            Ok(())
        })
    }

    async fn rollback_balance_updates(
        &mut self,
        height: Height,
    ) -> Result<Vec<BalanceUpdate>, StoreError> {
        self.write(|s, _| Ok(drain_where(&mut s.balance_updates, |u| u.height == height)))
    }

    async fn rollback_address_actions(
        &mut self,
        height: Height,
    ) -> Result<Vec<AddressAction>, StoreError> {
        self.write(|s, _| Ok(drain_where(&mut s.address_actions, |aa| aa.height == height)))
    }

    async fn rollback_rollup_actions(
        &mut self,
        height: Height,
    ) -> Result<Vec<RollupAction>, StoreError> {
        self.write(|s, _| Ok(drain_where(&mut s.rollup_actions, |ra| ra.height == height)))
    }

    async fn rollback_rollup_addresses(&mut self, height: Height) -> Result<(), StoreError> {
        self.write(|s, _| {
            drain_where(&mut s.rollup_addresses, |ra| ra.height == height);
            Ok(())
        })
    }

    async fn rollback_rollups(&mut self, height: Height) -> Result<Vec<Rollup>, StoreError> {
        self.write(|s, _| Ok(s.rollback_rollups(height)))
    }

    async fn rollback_balances(&mut self, address_ids: &[Id]) -> Result<(), StoreError> {
        self.write(|s, _| {
            let ids: HashSet<Id> = address_ids.iter().copied().collect();
            drain_where(&mut s.balances, |b| ids.contains(&b.id));
            Ok(())
        })
    }

    async fn rollback_untracked_balances(
        &mut self,
        keys: &[(Id, Currency)],
    ) -> Result<(), StoreError> {
        self.write(|s, _| {
            for (id, currency) in keys {
                let tracked = s
                    .balance_updates
                    .values()
                    .any(|u| u.address_id == *id && &u.currency == currency);
                if !tracked {
                    s.balances.remove(&(*id, currency.clone()));
                }
            }
            Ok(())
        })
    }

    async fn retention_block_signatures(&mut self, boundary: Height) -> Result<(), StoreError> {
        self.write(|s, settings| {
            let cutoff = boundary - Height::from(settings.signature_retention);
            let removed = drain_where(&mut s.block_signatures, |bs| bs.height < cutoff);
            tracing::debug!("pruned {} block signatures below {cutoff}", removed.len());
            Ok(())
        })
    }

    async fn last_block(&mut self) -> Result<Option<Block>, StoreError> {
        self.read(|s| Ok(s.blocks.values().max_by_key(|b| b.height).cloned()))
    }

    async fn chain_state(&mut self, name: &str) -> Result<Option<ChainState>, StoreError> {
        self.read(|s| Ok(s.chain_states.values().find(|cs| cs.name == name).cloned()))
    }

    async fn last_nonce(&mut self, signer_id: Id) -> Result<Option<Nonce>, StoreError> {
        self.read(|s| Ok(s.last_nonce(signer_id)))
    }

    async fn validators(&mut self) -> Result<Vec<Validator>, StoreError> {
        self.read(|s| Ok(s.validators.values().cloned().collect()))
    }

    async fn get_proposer_id(&mut self, address: &str) -> Result<Id, StoreError> {
        self.read(|s| {
            s.validators
                .values()
                .find(|v| v.address == address)
                .map(|v| v.id)
                .ok_or_else(|| StoreError::NotFound(format!("validator {address}")))
        })
    }

    async fn get_address(&mut self, id: Id) -> Result<Option<Address>, StoreError> {
        self.read(|s| Ok(s.addresses.get(&id).cloned()))
    }

    async fn get_address_by_hash(
        &mut self,
        hash: &AddressHash,
    ) -> Result<Option<Address>, StoreError> {
        self.read(|s| {
            Ok(s.address_ids
                .get(hash)
                .and_then(|id| s.addresses.get(id))
                .cloned())
        })
    }

    async fn get_rollup(&mut self, id: Id) -> Result<Option<Rollup>, StoreError> {
        self.read(|s| Ok(s.rollups.get(&id).cloned()))
    }

    async fn get_balance(
        &mut self,
        address_id: Id,
        currency: &Currency,
    ) -> Result<Option<Balance>, StoreError> {
        self.read(|s| Ok(s.balances.get(&(address_id, currency.clone())).cloned()))
    }

    async fn flush(&mut self) -> Result<(), StoreError> {
        if self.poisoned {
            return Err(StoreError::Aborted);
        }
        tracing::trace!("flushing memory unit of work");
        *self.committed = self.staged.clone();
        Ok(())
    }

    async fn close(self) -> Result<(), StoreError> {
        tracing::trace!("closing memory unit of work");
        Ok(())
    }
}
