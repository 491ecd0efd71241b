//! Unit of work contract shared by all storage backends.
mod identity;
pub mod memory;
pub mod pg;
mod validation;

use async_trait::async_trait;

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

pub use memory::MemoryStorage;
pub use pg::PgStorage;

/// Source of units of work.
#[async_trait]
pub trait Storage: Send + Sync {
    type Uow: UnitOfWork;

    /// Opens a new unit of work.
    ///
    /// Waits for any other open unit of work on the same storage to be
    /// closed or dropped.
    async fn begin(&self) -> Result<Self::Uow, StoreError>;

    fn settings(&self) -> &StoreSettings;
}

/// Atomic group of storage mutations.
///
/// Nothing written through a unit of work is visible outside of it until
/// `flush` returns. Whatever was written after the last flush is discarded
/// by `close` or when the unit of work is dropped.
///
/// Any failed operation poisons the unit of work: later calls return
/// [`StoreError::Aborted`] and only `close` remains meaningful.
#[async_trait]
pub trait UnitOfWork: Send {
    // Entity store

    async fn save_block(&mut self, block: &mut Block) -> Result<(), StoreError>;

    async fn save_block_stats(&mut self, stats: &mut BlockStats) -> Result<(), StoreError>;

    /// Inserts or replaces the chain state with the same name.
    async fn save_state(&mut self, state: &mut ChainState) -> Result<(), StoreError>;

    async fn save_transactions(&mut self, txs: &mut [Tx]) -> Result<(), StoreError>;

    async fn save_actions(&mut self, actions: &mut [Action]) -> Result<(), StoreError>;

    async fn save_validators(&mut self, validators: &mut [Validator]) -> Result<(), StoreError>;

    async fn save_rollup_actions(&mut self, links: &[RollupAction]) -> Result<(), StoreError>;

    /// Saves rollup-address links. Pairs already stored are left untouched.
    async fn save_rollup_addresses(&mut self, links: &[RollupAddress]) -> Result<(), StoreError>;

    async fn save_address_actions(&mut self, links: &[AddressAction]) -> Result<(), StoreError>;

    async fn save_block_signatures(
        &mut self,
        signatures: &mut [BlockSignature],
    ) -> Result<(), StoreError>;

    /// Adds each balance total to the stored total of the same (id, currency),
    /// creating missing balances.
    async fn save_balances(&mut self, balances: &[Balance]) -> Result<(), StoreError>;

    async fn save_balance_updates(&mut self, updates: &mut [BalanceUpdate]) -> Result<(), StoreError>;

    async fn save_constants(&mut self, constants: &[Constant]) -> Result<(), StoreError>;

    // Identity resolver

    /// Resolves address candidates by hash.
    ///
    /// Candidates of known addresses get the stored id. Each unknown hash is
    /// inserted once, from its first candidate. Returns the number of new
    /// addresses.
    async fn save_addresses(&mut self, addresses: &mut [Address]) -> Result<u64, StoreError>;

    /// Resolves rollup candidates by chain id. Returns the number of new rollups.
    async fn save_rollups(&mut self, rollups: &mut [Rollup]) -> Result<u64, StoreError>;

    // Aggregate updater

    async fn update_addresses(&mut self, updates: &[AddressUpdate]) -> Result<(), StoreError>;

    async fn update_rollups(&mut self, updates: &[RollupUpdate]) -> Result<(), StoreError>;

    // Rollback engine

    async fn rollback_block(&mut self, height: Height) -> Result<(), StoreError>;

    async fn rollback_block_stats(&mut self, height: Height)
        -> Result<Option<BlockStats>, StoreError>;

    /// Deletes addresses first spotted at `height`.
    async fn rollback_addresses(&mut self, height: Height) -> Result<Vec<Address>, StoreError>;

    async fn rollback_txs(&mut self, height: Height) -> Result<Vec<Tx>, StoreError>;

    async fn rollback_actions(&mut self, height: Height) -> Result<Vec<Action>, StoreError>;

    /// Deletes validators first seen past `height`, see [`crate::config::ValidatorBoundary`].
    async fn rollback_validators(&mut self, height: Height) -> Result<(), StoreError>;

    async fn rollback_block_signatures(&mut self, height: Height) -> Result<(), StoreError>;

    async fn rollback_balance_updates(
        &mut self,
        height: Height,
    ) -> Result<Vec<BalanceUpdate>, StoreError>;

    async fn rollback_address_actions(
        &mut self,
        height: Height,
    ) -> Result<Vec<AddressAction>, StoreError>;

    async fn rollback_rollup_actions(
        &mut self,
        height: Height,
    ) -> Result<Vec<RollupAction>, StoreError>;

    async fn rollback_rollup_addresses(&mut self, height: Height) -> Result<(), StoreError>;

    /// Deletes rollups first seen at `height`.
    async fn rollback_rollups(&mut self, height: Height) -> Result<Vec<Rollup>, StoreError>;

    /// Deletes all balances of given addresses.
    async fn rollback_balances(&mut self, address_ids: &[Id]) -> Result<(), StoreError>;

    /// Deletes the given balances when no balance update is left for them.
    ///
    /// Run after `rollback_balance_updates` to drop balances the rolled back
    /// height created.
    async fn rollback_untracked_balances(
        &mut self,
        keys: &[(Id, Currency)],
    ) -> Result<(), StoreError>;

    // Retention

    /// Deletes block signatures older than the retention window ending at `boundary`.
    async fn retention_block_signatures(&mut self, boundary: Height) -> Result<(), StoreError>;

    // Reads

    async fn last_block(&mut self) -> Result<Option<Block>, StoreError>;

    async fn chain_state(&mut self, name: &str) -> Result<Option<ChainState>, StoreError>;

    /// Nonce of the latest transaction signed by `signer_id`.
    async fn last_nonce(&mut self, signer_id: Id) -> Result<Option<Nonce>, StoreError>;

    /// All validators, ordered by id.
    async fn validators(&mut self) -> Result<Vec<Validator>, StoreError>;

    /// Id of the validator with given consensus address.
    async fn get_proposer_id(&mut self, address: &str) -> Result<Id, StoreError>;

    async fn get_address(&mut self, id: Id) -> Result<Option<Address>, StoreError>;

    async fn get_address_by_hash(&mut self, hash: &AddressHash)
        -> Result<Option<Address>, StoreError>;

    async fn get_rollup(&mut self, id: Id) -> Result<Option<Rollup>, StoreError>;

    async fn get_balance(
        &mut self,
        address_id: Id,
        currency: &Currency,
    ) -> Result<Option<Balance>, StoreError>;

    // Lifecycle

    /// Makes everything written so far durable. The unit of work stays open.
    async fn flush(&mut self) -> Result<(), StoreError>;

    /// Discards unflushed writes and releases the underlying session.
    async fn close(self) -> Result<(), StoreError>;
}
