//! PostgreSQL storage backend.
//!
//! A single session is shared by all units of work of a storage. A unit of
//! work holds the session for its whole lifetime and drives the transaction
//! with plain `begin`/`commit`/`rollback` statements, so that flushing does
//! not end it.
mod actions;
mod addresses;
mod balances;
mod blocks;
mod constants;
mod links;
mod rollups;
mod schema;
mod signatures;
mod state;
mod txs;
mod validators;

use async_trait::async_trait;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::sync::OwnedMutexGuard;
use tokio_postgres::Client;
use tokio_postgres::NoTls;

use super::identity;
use super::validation;
use super::Storage;
use super::UnitOfWork;
use crate::aggregates::merge_balances;
use crate::aggregates::AddressUpdate;
use crate::aggregates::RollupUpdate;
use crate::config::PostgresConfig;
use crate::config::StoreSettings;
use crate::constants::SCHEMA_NAME;
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
use crate::types::Nonce;
use crate::types::Rollup;
use crate::types::RollupAction;
use crate::types::RollupAddress;
use crate::types::Tx;
use crate::types::Validator;
use schema::Schema;

pub use schema::Revision;
pub use schema::CURRENT_REVISION;

const SCHEMA: Schema = Schema::new(SCHEMA_NAME, include_str!("pg/schema.sql"));

#[derive(Debug)]
/// Cached ids of committed addresses or rollups, keyed by natural identity.
struct IdentityCache {
    lru: LruCache<Vec<u8>, Id>,
}

impl IdentityCache {
    pub fn new(size: NonZeroUsize) -> Self {
        Self {
            lru: LruCache::new(size),
        }
    }

    pub fn get(&mut self, key: &[u8]) -> Option<Id> {
        self.lru.get(key).copied()
    }

    pub fn extend(&mut self, entries: impl IntoIterator<Item = (Vec<u8>, Id)>) {
        for (key, id) in entries {
            self.lru.put(key, id);
        }
    }

    pub fn reset(&mut self) {
        self.lru.clear();
    }
}

struct PgSession {
    client: Client,
    /// A transaction was opened and neither committed nor rolled back yet
    in_transaction: bool,
    address_cache: IdentityCache,
    rollup_cache: IdentityCache,
}

pub struct PgStorage {
    session: Arc<Mutex<PgSession>>,
    settings: StoreSettings,
}

impl PgStorage {
    /// Connects to the database and loads the schema if needed.
    pub async fn connect(pgconf: &PostgresConfig, settings: StoreSettings) -> Result<Self, StoreError> {
        tracing::debug!("initializing postgres storage");
        let (mut client, connection) =
            tokio_postgres::connect(&pgconf.connection_uri, NoTls).await?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("connection error: {}", e);
            }
        });

        if let Some(timeout) = pgconf.statement_timeout {
            let stmt = format!("set statement_timeout = {};", timeout.as_millis());
            client.batch_execute(&stmt).await?;
        }

        SCHEMA.init(&mut client).await?;

        Ok(Self {
            session: Arc::new(Mutex::new(PgSession {
                client,
                in_transaction: false,
                address_cache: IdentityCache::new(settings.identity_cache_size),
                rollup_cache: IdentityCache::new(settings.identity_cache_size),
            })),
            settings,
        })
    }
}

#[async_trait]
impl Storage for PgStorage {
    type Uow = PgUnitOfWork;

    async fn begin(&self) -> Result<Self::Uow, StoreError> {
        let mut session = self.session.clone().lock_owned().await;
        if session.client.is_closed() {
            return Err(StoreError::Unavailable(String::from(
                "postgres connection is closed",
            )));
        }
        if session.in_transaction {
            tracing::warn!("rolling back abandoned unit of work");
            session.client.batch_execute("rollback;").await?;
            session.in_transaction = false;
        }
        session.client.batch_execute("begin;").await?;
        session.in_transaction = true;
        tracing::debug!("began unit of work");
        Ok(PgUnitOfWork {
            session,
            settings: self.settings,
            poisoned: false,
            pending_addresses: vec![],
            pending_rollups: vec![],
            identities_removed: false,
        })
    }

    fn settings(&self) -> &StoreSettings {
        &self.settings
    }
}

pub struct PgUnitOfWork {
    session: OwnedMutexGuard<PgSession>,
    settings: StoreSettings,
    poisoned: bool,
    /// Identities resolved since last flush, cached once committed
    pending_addresses: Vec<(AddressHash, Id)>,
    pending_rollups: Vec<(ChainID, Id)>,
    /// Addresses or rollups got deleted, cached identities can't be trusted
    identities_removed: bool,
}

impl PgUnitOfWork {
    fn guard(&self) -> Result<(), StoreError> {
        match self.poisoned {
            true => Err(StoreError::Aborted),
            false => Ok(()),
        }
    }

    fn track<T>(&mut self, result: Result<T, StoreError>) -> Result<T, StoreError> {
        if let Err(e) = &result {
            tracing::warn!("aborting unit of work: {e}");
            self.poisoned = true;
        }
        result
    }
}

/// Retrieve highest id of given table, 0 if empty.
async fn get_max_id(client: &Client, table: &str) -> Result<Id, StoreError> {
    let qry = format!("select max(id) from {SCHEMA_NAME}.{table};");
    let max: Option<Id> = client.query_one(&qry, &[]).await?.get(0);
    Ok(max.unwrap_or(0))
}

/// Gives unassigned (zero) ids the next free values of `table`.
async fn assign_ids(client: &Client, table: &str, ids: Vec<&mut Id>) -> Result<(), StoreError> {
    let mut unassigned: Vec<&mut Id> = ids.into_iter().filter(|id| **id == 0).collect();
    if unassigned.is_empty() {
        return Ok(());
    }
    let mut next = get_max_id(client, table).await? + 1;
    for id in unassigned.iter_mut() {
        **id = next;
        next += 1;
    }
    Ok(())
}

async fn resolve_addresses(
    session: &mut PgSession,
    candidates: &mut [Address],
    use_cache: bool,
) -> Result<(u64, Vec<(AddressHash, Id)>), StoreError> {
    validation::addresses(candidates)?;
    let firsts = identity::first_appearances(candidates);

    let mut resolved: HashMap<Vec<u8>, Id> = HashMap::new();
    let mut uncached: Vec<AddressHash> = vec![];
    for &i in &firsts {
        let hash = &candidates[i].hash;
        match use_cache.then(|| session.address_cache.get(hash)).flatten() {
            Some(id) => {
                resolved.insert(hash.clone(), id);
            }
            None => uncached.push(hash.clone()),
        }
    }
    if !uncached.is_empty() {
        resolved.extend(addresses::get_ids(&session.client, &uncached).await?);
    }

    let fresh: Vec<usize> = firsts
        .into_iter()
        .filter(|&i| !resolved.contains_key(&candidates[i].hash))
        .collect();
    if !fresh.is_empty() {
        let mut next = get_max_id(&session.client, "addresses").await? + 1;
        for &i in &fresh {
            let address = Address {
                id: next,
                ..candidates[i].clone()
            };
            if !addresses::insert_new(&session.client, &address).await? {
                return Err(StoreError::Conflict(format!(
                    "address {address} was inserted concurrently"
                )));
            }
            resolved.insert(address.hash, next);
            next += 1;
        }
    }

    identity::backfill(candidates, &resolved)?;
    Ok((fresh.len() as u64, resolved.into_iter().collect()))
}

async fn resolve_rollups(
    session: &mut PgSession,
    candidates: &mut [Rollup],
    use_cache: bool,
) -> Result<(u64, Vec<(ChainID, Id)>), StoreError> {
    validation::rollups(candidates)?;
    let firsts = identity::first_appearances(candidates);

    let mut resolved: HashMap<Vec<u8>, Id> = HashMap::new();
    let mut uncached: Vec<ChainID> = vec![];
    for &i in &firsts {
        let chain_id = &candidates[i].chain_id;
        match use_cache.then(|| session.rollup_cache.get(chain_id)).flatten() {
            Some(id) => {
                resolved.insert(chain_id.clone(), id);
            }
            None => uncached.push(chain_id.clone()),
        }
    }
    if !uncached.is_empty() {
        resolved.extend(rollups::get_ids(&session.client, &uncached).await?);
    }

    let fresh: Vec<usize> = firsts
        .into_iter()
        .filter(|&i| !resolved.contains_key(&candidates[i].chain_id))
        .collect();
    if !fresh.is_empty() {
        let mut next = get_max_id(&session.client, "rollups").await? + 1;
        for &i in &fresh {
            let rollup = Rollup {
                id: next,
                ..candidates[i].clone()
            };
            if !rollups::insert_new(&session.client, &rollup).await? {
                return Err(StoreError::Conflict(format!(
                    "rollup {} was inserted concurrently",
                    base16::encode_lower(&rollup.chain_id)
                )));
            }
            resolved.insert(rollup.chain_id, next);
            next += 1;
        }
    }

    identity::backfill(candidates, &resolved)?;
    Ok((fresh.len() as u64, resolved.into_iter().collect()))
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn save_block(&mut self, block: &mut Block) -> Result<(), StoreError> {
        self.guard()?;
        let client = &self.session.client;
        let result: Result<(), StoreError> = async {
            validation::block(block)?;
            assign_ids(client, "blocks", vec![&mut block.id]).await?;
            blocks::insert(client, block).await
        }
        .await;
        self.track(result)
    }

    async fn save_block_stats(&mut self, stats: &mut BlockStats) -> Result<(), StoreError> {
        self.guard()?;
        let client = &self.session.client;
        let result: Result<(), StoreError> = async {
            validation::block_stats(stats)?;
            assign_ids(client, "block_stats", vec![&mut stats.id]).await?;
            blocks::insert_stats(client, stats).await
        }
        .await;
        self.track(result)
    }

    async fn save_state(&mut self, chain_state: &mut ChainState) -> Result<(), StoreError> {
        self.guard()?;
        let client = &self.session.client;
        let result: Result<(), StoreError> = async {
            validation::chain_state(chain_state)?;
            chain_state.id = match state::get_id(client, &chain_state.name).await? {
                Some(id) => id,
                None => get_max_id(client, "chain_states").await? + 1,
            };
            state::upsert(client, chain_state).await
        }
        .await;
        self.track(result)
    }

    async fn save_transactions(&mut self, txs: &mut [Tx]) -> Result<(), StoreError> {
        self.guard()?;
        let client = &self.session.client;
        let result: Result<(), StoreError> = async {
            validation::txs(txs)?;
            assign_ids(client, "txs", txs.iter_mut().map(|tx| &mut tx.id).collect()).await?;
            txs::insert_many(client, txs).await
        }
        .await;
        self.track(result)
    }

    async fn save_actions(&mut self, actions: &mut [Action]) -> Result<(), StoreError> {
        self.guard()?;
        let client = &self.session.client;
        let result: Result<(), StoreError> = async {
            validation::actions(actions)?;
            assign_ids(client, "actions", actions.iter_mut().map(|a| &mut a.id).collect()).await?;
            actions::insert_many(client, actions).await
        }
        .await;
        self.track(result)
    }

    async fn save_validators(&mut self, validators: &mut [Validator]) -> Result<(), StoreError> {
        self.guard()?;
        let client = &self.session.client;
        let result: Result<(), StoreError> = async {
            validation::validators(validators)?;
            assign_ids(client, "validators", validators.iter_mut().map(|v| &mut v.id).collect()).await?;
            validators::insert_many(client, validators).await
        }
        .await;
        self.track(result)
    }

    async fn save_rollup_actions(&mut self, links: &[RollupAction]) -> Result<(), StoreError> {
        self.guard()?;
        let client = &self.session.client;
        let result: Result<(), StoreError> = async {
            validation::rollup_actions(links)?;
            links::insert_rollup_actions(client, links).await
        }
        .await;
        self.track(result)
    }

    async fn save_rollup_addresses(&mut self, links: &[RollupAddress]) -> Result<(), StoreError> {
        self.guard()?;
        let client = &self.session.client;
        let result: Result<(), StoreError> = async {
            validation::rollup_addresses(links)?;
            links::insert_rollup_addresses(client, links).await
        }
        .await;
        self.track(result)
    }

    async fn save_address_actions(&mut self, links: &[AddressAction]) -> Result<(), StoreError> {
        self.guard()?;
        let client = &self.session.client;
        let result: Result<(), StoreError> = async {
            validation::address_actions(links)?;
            links::insert_address_actions(client, links).await
        }
        .await;
        self.track(result)
    }

    async fn save_block_signatures(
        &mut self,
        signatures: &mut [BlockSignature],
    ) -> Result<(), StoreError> {
        self.guard()?;
        let client = &self.session.client;
        let result: Result<(), StoreError> = async {
            validation::block_signatures(signatures)?;
            assign_ids(
                client,
                "block_signatures",
                signatures.iter_mut().map(|s| &mut s.id).collect(),
            )
            .await?;
            signatures::insert_many(client, signatures).await
        }
        .await;
        self.track(result)
    }

    async fn save_balances(&mut self, balances: &[Balance]) -> Result<(), StoreError> {
        self.guard()?;
        let client = &self.session.client;
        let result: Result<(), StoreError> = async {
            validation::balances(balances)?;
            balances::upsert_many(client, &merge_balances(balances)).await
        }
        .await;
        self.track(result)
    }

    async fn save_balance_updates(&mut self, updates: &mut [BalanceUpdate]) -> Result<(), StoreError> {
        self.guard()?;
        let client = &self.session.client;
        let result: Result<(), StoreError> = async {
            validation::balance_updates(updates)?;
            assign_ids(client, "balance_updates", updates.iter_mut().map(|u| &mut u.id).collect()).await?;
            balances::insert_updates(client, updates).await
        }
        .await;
        self.track(result)
    }

    async fn save_constants(&mut self, constants: &[Constant]) -> Result<(), StoreError> {
        self.guard()?;
        let client = &self.session.client;
        let result: Result<(), StoreError> = async {
            validation::constants(constants)?;
            constants::insert_many(client, constants).await
        }
        .await;
        self.track(result)
    }

    async fn save_addresses(&mut self, candidates: &mut [Address]) -> Result<u64, StoreError> {
        self.guard()?;
        let use_cache = !self.identities_removed;
        let result = resolve_addresses(&mut self.session, candidates, use_cache).await;
        let (inserted, entries) = self.track(result)?;
        self.pending_addresses.extend(entries);
        tracing::debug!("inserted {inserted} new addresses");
        Ok(inserted)
    }

    async fn save_rollups(&mut self, candidates: &mut [Rollup]) -> Result<u64, StoreError> {
        self.guard()?;
        let use_cache = !self.identities_removed;
        let result = resolve_rollups(&mut self.session, candidates, use_cache).await;
        let (inserted, entries) = self.track(result)?;
        self.pending_rollups.extend(entries);
        tracing::debug!("inserted {inserted} new rollups");
        Ok(inserted)
    }

    async fn update_addresses(&mut self, updates: &[AddressUpdate]) -> Result<(), StoreError> {
        self.guard()?;
        let client = &self.session.client;
        let result: Result<(), StoreError> = async {
            for u in AddressUpdate::merge_all(updates) {
                if !addresses::update(client, &u).await? {
                    return Err(StoreError::NotFound(format!("address {}", u.id)));
                }
            }
            Ok(())
        }
        .await;
        self.track(result)
    }

    async fn update_rollups(&mut self, updates: &[RollupUpdate]) -> Result<(), StoreError> {
        self.guard()?;
        let client = &self.session.client;
        let result: Result<(), StoreError> = async {
            for u in RollupUpdate::merge_all(updates) {
                if !rollups::update(client, &u).await? {
                    return Err(StoreError::NotFound(format!("rollup {}", u.id)));
                }
            }
            Ok(())
        }
        .await;
        self.track(result)
    }

    async fn rollback_block(&mut self, height: Height) -> Result<(), StoreError> {
        self.guard()?;
        let result = blocks::delete_at(&self.session.client, height).await;
        self.track(result).map(|_| ())
    }

    async fn rollback_block_stats(
        &mut self,
        height: Height,
    ) -> Result<Option<BlockStats>, StoreError> {
        self.guard()?;
        let result = blocks::delete_stats_at(&self.session.client, height).await;
        self.track(result)
    }

    async fn rollback_addresses(&mut self, height: Height) -> Result<Vec<Address>, StoreError> {
        self.guard()?;
        let result = addresses::delete_at(&self.session.client, height).await;
        let removed = self.track(result)?;
        if !removed.is_empty() {
            self.identities_removed = true;
        }
        Ok(removed)
    }

    async fn rollback_txs(&mut self, height: Height) -> Result<Vec<Tx>, StoreError> {
        self.guard()?;
        let result = txs::delete_at(&self.session.client, height).await;
        self.track(result)
    }

    async fn rollback_actions(&mut self, height: Height) -> Result<Vec<Action>, StoreError> {
        self.guard()?;
        let result = actions::delete_at(&self.session.client, height).await;
        self.track(result)
    }

    async fn rollback_validators(&mut self, height: Height) -> Result<(), StoreError> {
        self.guard()?;
        let boundary = self.settings.validator_rollback;
        let result = validators::delete_after(&self.session.client, height, boundary).await;
        self.track(result).map(|_| ())
    }

    async fn rollback_block_signatures(&mut self, height: Height) -> Result<(), StoreError> {
        self.guard()?;
        let result = signatures::delete_at(&self.session.client, height).await;
        self.track(result).map(|_| ())
    }

    async fn rollback_balance_updates(
        &mut self,
        height: Height,
    ) -> Result<Vec<BalanceUpdate>, StoreError> {
        self.guard()?;
        let result = balances::delete_updates_at(&self.session.client, height).await;
        self.track(result)
    }

    async fn rollback_address_actions(
        &mut self,
        height: Height,
    ) -> Result<Vec<AddressAction>, StoreError> {
        self.guard()?;
        let result = links::delete_address_actions_at(&self.session.client, height).await;
        self.track(result)
    }

    async fn rollback_rollup_actions(
        &mut self,
        height: Height,
    ) -> Result<Vec<RollupAction>, StoreError> {
        self.guard()?;
        let result = links::delete_rollup_actions_at(&self.session.client, height).await;
        self.track(result)
    }

    async fn rollback_rollup_addresses(&mut self, height: Height) -> Result<(), StoreError> {
        self.guard()?;
        let result = links::delete_rollup_addresses_at(&self.session.client, height).await;
        self.track(result).map(|_| ())
    }

    async fn rollback_rollups(&mut self, height: Height) -> Result<Vec<Rollup>, StoreError> {
        self.guard()?;
        let result = rollups::delete_at(&self.session.client, height).await;
        let removed = self.track(result)?;
        if !removed.is_empty() {
            self.identities_removed = true;
        }
        Ok(removed)
    }

    async fn rollback_balances(&mut self, address_ids: &[Id]) -> Result<(), StoreError> {
        self.guard()?;
        let result = balances::delete_many(&self.session.client, address_ids).await;
        self.track(result).map(|_| ())
    }

    async fn rollback_untracked_balances(
        &mut self,
        keys: &[(Id, Currency)],
    ) -> Result<(), StoreError> {
        self.guard()?;
        let result = balances::delete_untracked(&self.session.client, keys).await;
        self.track(result).map(|_| ())
    }

    async fn retention_block_signatures(&mut self, boundary: Height) -> Result<(), StoreError> {
        self.guard()?;
        let cutoff = boundary - Height::from(self.settings.signature_retention);
        let result = signatures::delete_below(&self.session.client, cutoff).await;
        let n = self.track(result)?;
        tracing::debug!("pruned {n} block signatures below {cutoff}");
        Ok(())
    }

    async fn last_block(&mut self) -> Result<Option<Block>, StoreError> {
        self.guard()?;
        let result = blocks::get_last(&self.session.client).await;
        self.track(result)
    }

    async fn chain_state(&mut self, name: &str) -> Result<Option<ChainState>, StoreError> {
        self.guard()?;
        let result = state::get(&self.session.client, name).await;
        self.track(result)
    }

    async fn last_nonce(&mut self, signer_id: Id) -> Result<Option<Nonce>, StoreError> {
        self.guard()?;
        let result = txs::get_last_nonce(&self.session.client, signer_id).await;
        self.track(result)
    }

    async fn validators(&mut self) -> Result<Vec<Validator>, StoreError> {
        self.guard()?;
        let result = validators::get_all(&self.session.client).await;
        self.track(result)
    }

    async fn get_proposer_id(&mut self, address: &str) -> Result<Id, StoreError> {
        self.guard()?;
        let result = validators::get_id(&self.session.client, address).await;
        self.track(result)?
            .ok_or_else(|| StoreError::NotFound(format!("validator {address}")))
    }

    async fn get_address(&mut self, id: Id) -> Result<Option<Address>, StoreError> {
        self.guard()?;
        let result = addresses::get(&self.session.client, id).await;
        self.track(result)
    }

    async fn get_address_by_hash(
        &mut self,
        hash: &AddressHash,
    ) -> Result<Option<Address>, StoreError> {
        self.guard()?;
        let result = addresses::get_by_hash(&self.session.client, hash).await;
        self.track(result)
    }

    async fn get_rollup(&mut self, id: Id) -> Result<Option<Rollup>, StoreError> {
        self.guard()?;
        let result = rollups::get(&self.session.client, id).await;
        self.track(result)
    }

    async fn get_balance(
        &mut self,
        address_id: Id,
        currency: &Currency,
    ) -> Result<Option<Balance>, StoreError> {
        self.guard()?;
        let result = balances::get(&self.session.client, address_id, currency).await;
        self.track(result)
    }

    async fn flush(&mut self) -> Result<(), StoreError> {
        self.guard()?;
        tracing::trace!("flushing unit of work");
        let committed = self.session.client.batch_execute("commit;").await;
        if committed.is_err() {
            // A failed commit ends the transaction.
            self.session.in_transaction = false;
        }
        self.track(committed.map_err(StoreError::from))?;

        let session = &mut *self.session;
        if self.identities_removed {
            session.address_cache.reset();
            session.rollup_cache.reset();
            self.identities_removed = false;
            self.pending_addresses.clear();
            self.pending_rollups.clear();
        } else {
            session.address_cache.extend(self.pending_addresses.drain(..));
            session.rollup_cache.extend(self.pending_rollups.drain(..));
        }

        let begun = self.session.client.batch_execute("begin;").await;
        if begun.is_err() {
            self.session.in_transaction = false;
        }
        self.track(begun.map_err(StoreError::from))
    }

    async fn close(mut self) -> Result<(), StoreError> {
        tracing::trace!("closing unit of work");
        if self.session.in_transaction {
            self.session.client.batch_execute("rollback;").await?;
            self.session.in_transaction = false;
        }
        Ok(())
    }
}
