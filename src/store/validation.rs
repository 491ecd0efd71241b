//! Structural checks run on every batch before anything is written.
use std::collections::HashSet;

use crate::error::StoreError;
use crate::types::Action;
use crate::types::Address;
use crate::types::AddressAction;
use crate::types::Balance;
use crate::types::BalanceUpdate;
use crate::types::Block;
use crate::types::BlockSignature;
use crate::types::BlockStats;
use crate::types::ChainState;
use crate::types::Constant;
use crate::types::Height;
use crate::types::Id;
use crate::types::Rollup;
use crate::types::RollupAction;
use crate::types::RollupAddress;
use crate::types::Tx;
use crate::types::Validator;
use crate::types::ADDRESS_HASH_LENGTH;
use crate::types::CHAIN_ID_LENGTH;

fn invalid<T>(msg: String) -> Result<T, StoreError> {
    Err(StoreError::Validation(msg))
}

fn height(kind: &str, height: Height) -> Result<(), StoreError> {
    if height < 0 {
        return invalid(format!("{kind} has negative height {height}"));
    }
    Ok(())
}

fn reference(kind: &str, field: &str, id: Id) -> Result<(), StoreError> {
    if id <= 0 {
        return invalid(format!("{kind} references unassigned {field} {id}"));
    }
    Ok(())
}

fn unique<'a, K, T, F>(kind: &str, rows: &'a [T], key: F) -> Result<(), StoreError>
where
    K: Eq + std::hash::Hash + std::fmt::Debug,
    F: Fn(&'a T) -> K,
{
    let mut seen = HashSet::new();
    for r in rows {
        let k = key(r);
        if seen.contains(&k) {
            return invalid(format!("duplicate {kind} {k:?} in batch"));
        }
        seen.insert(k);
    }
    Ok(())
}

pub(super) fn block(b: &Block) -> Result<(), StoreError> {
    height("block", b.height)?;
    if b.hash.is_empty() {
        return invalid(format!("block {} has an empty hash", b.height));
    }
    reference("block", "proposer", b.proposer_id)
}

pub(super) fn block_stats(s: &BlockStats) -> Result<(), StoreError> {
    height("block stats", s.height)?;
    if s.tx_count < 0 || s.bytes_in_block < 0 || s.data_size < 0 {
        return invalid(format!("block stats {} has negative counts", s.height));
    }
    Ok(())
}

pub(super) fn chain_state(s: &ChainState) -> Result<(), StoreError> {
    if s.name.is_empty() {
        return invalid(String::from("chain state has an empty name"));
    }
    height("chain state", s.last_height)
}

pub(super) fn addresses(rows: &[Address]) -> Result<(), StoreError> {
    for a in rows {
        height("address", a.height)?;
        if a.hash.len() != ADDRESS_HASH_LENGTH {
            return invalid(format!(
                "address hash must be {ADDRESS_HASH_LENGTH} bytes, got {}",
                a.hash.len()
            ));
        }
    }
    Ok(())
}

pub(super) fn rollups(rows: &[Rollup]) -> Result<(), StoreError> {
    for r in rows {
        height("rollup", r.first_height)?;
        if r.chain_id.len() != CHAIN_ID_LENGTH {
            return invalid(format!(
                "rollup chain id must be {CHAIN_ID_LENGTH} bytes, got {}",
                r.chain_id.len()
            ));
        }
        if let Some(id) = r.bridge_address_id {
            reference("rollup", "bridge address", id)?;
        }
    }
    Ok(())
}

pub(super) fn txs(rows: &[Tx]) -> Result<(), StoreError> {
    for tx in rows {
        height("tx", tx.height)?;
        if tx.position < 0 {
            return invalid(format!("tx at {} has negative position", tx.height));
        }
        if tx.hash.is_empty() {
            return invalid(format!("tx {}/{} has an empty hash", tx.height, tx.position));
        }
        reference("tx", "signer", tx.signer_id)?;
    }
    unique("tx position", rows, |tx| (tx.height, tx.position))
}

pub(super) fn actions(rows: &[Action]) -> Result<(), StoreError> {
    for a in rows {
        height("action", a.height)?;
        if a.position < 0 {
            return invalid(format!("action at {} has negative position", a.height));
        }
        reference("action", "tx", a.tx_id)?;
    }
    unique("action position", rows, |a| (a.tx_id, a.position))
}

pub(super) fn validators(rows: &[Validator]) -> Result<(), StoreError> {
    for v in rows {
        height("validator", v.height)?;
        if v.address.len() != 2 * ADDRESS_HASH_LENGTH
            || !v.address.chars().all(|c| c.is_ascii_hexdigit())
        {
            return invalid(format!("malformed validator address {:?}", v.address));
        }
        if v.pubkey.is_empty() || v.pubkey_type.is_empty() {
            return invalid(format!("validator {} has an empty pubkey", v.address));
        }
    }
    unique("validator", rows, |v| v.address.as_str())
}

pub(super) fn rollup_actions(rows: &[RollupAction]) -> Result<(), StoreError> {
    for ra in rows {
        height("rollup action", ra.height)?;
        reference("rollup action", "rollup", ra.rollup_id)?;
        reference("rollup action", "action", ra.action_id)?;
        reference("rollup action", "tx", ra.tx_id)?;
        if ra.size < 0 {
            return invalid(format!("rollup action {} has negative size", ra.action_id));
        }
    }
    unique("rollup action", rows, |ra| (ra.rollup_id, ra.action_id))
}

pub(super) fn rollup_addresses(rows: &[RollupAddress]) -> Result<(), StoreError> {
    for ra in rows {
        height("rollup address", ra.height)?;
        reference("rollup address", "rollup", ra.rollup_id)?;
        reference("rollup address", "address", ra.address_id)?;
    }
    Ok(())
}

pub(super) fn address_actions(rows: &[AddressAction]) -> Result<(), StoreError> {
    for aa in rows {
        height("address action", aa.height)?;
        reference("address action", "address", aa.address_id)?;
        reference("address action", "action", aa.action_id)?;
        reference("address action", "tx", aa.tx_id)?;
    }
    unique("address action", rows, |aa| (aa.address_id, aa.action_id))
}

pub(super) fn block_signatures(rows: &[BlockSignature]) -> Result<(), StoreError> {
    for s in rows {
        height("block signature", s.height)?;
        reference("block signature", "validator", s.validator_id)?;
    }
    unique("block signature", rows, |s| (s.validator_id, s.height))
}

pub(super) fn balances(rows: &[Balance]) -> Result<(), StoreError> {
    for b in rows {
        reference("balance", "address", b.id)?;
        if b.currency.is_empty() {
            return invalid(format!("balance of address {} has an empty currency", b.id));
        }
    }
    Ok(())
}

pub(super) fn balance_updates(rows: &[BalanceUpdate]) -> Result<(), StoreError> {
    for u in rows {
        height("balance update", u.height)?;
        reference("balance update", "address", u.address_id)?;
        if u.currency.is_empty() {
            return invalid(format!(
                "balance update of address {} has an empty currency",
                u.address_id
            ));
        }
    }
    Ok(())
}

pub(super) fn constants(rows: &[Constant]) -> Result<(), StoreError> {
    for c in rows {
        if c.name.is_empty() {
            return invalid(format!("{} constant has an empty name", c.module));
        }
    }
    unique("constant", rows, |c| (c.module, c.name.as_str()))
}
