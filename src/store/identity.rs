//! Natural identity handling shared by the backends.
use std::collections::HashMap;
use std::collections::HashSet;

use crate::error::StoreError;
use crate::types::Address;
use crate::types::Id;
use crate::types::Rollup;

/// Row carrying an immutable external identity.
pub(super) trait Identified {
    const KIND: &'static str;

    fn natural_key(&self) -> &[u8];

    fn set_id(&mut self, id: Id);
}

impl Identified for Address {
    const KIND: &'static str = "address";

    fn natural_key(&self) -> &[u8] {
        &self.hash
    }

    fn set_id(&mut self, id: Id) {
        self.id = id;
    }
}

impl Identified for Rollup {
    const KIND: &'static str = "rollup";

    // Bridge address plays no part in rollup identity.
    fn natural_key(&self) -> &[u8] {
        &self.chain_id
    }

    fn set_id(&mut self, id: Id) {
        self.id = id;
    }
}

/// Indices of the first candidate of each distinct identity, in order of appearance.
pub(super) fn first_appearances<T: Identified>(candidates: &[T]) -> Vec<usize> {
    let mut seen: HashSet<&[u8]> = HashSet::new();
    candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| seen.insert(c.natural_key()))
        .map(|(i, _)| i)
        .collect()
}

/// Writes resolved ids back into every candidate.
pub(super) fn backfill<T: Identified>(
    candidates: &mut [T],
    resolved: &HashMap<Vec<u8>, Id>,
) -> Result<(), StoreError> {
    for c in candidates.iter_mut() {
        let id = *resolved.get(c.natural_key()).ok_or_else(|| {
            StoreError::Conflict(format!(
                "{} {} was not resolved",
                T::KIND,
                base16::encode_lower(c.natural_key())
            ))
        })?;
        c.set_id(id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_first_appearances() {
        let a = Address::dummy();
        let b = Address::dummy();
        let candidates = vec![a.height(5), b.clone(), a.height(3), b.height(9), Address::dummy()];
        assert_eq!(first_appearances(&candidates), vec![0, 1, 4]);
    }

    #[test]
    fn test_rollup_identity_ignores_bridge() {
        let r = Rollup::dummy();
        let candidates = vec![r.clone(), r.bridge_address_id(7)];
        assert_eq!(first_appearances(&candidates), vec![0]);
    }

    #[test]
    fn test_backfill() {
        let a = Address::dummy();
        let b = Address::dummy();
        let mut candidates = vec![a.clone(), b.clone(), a.height(8)];
        let resolved = HashMap::from([(a.hash.clone(), 3), (b.hash.clone(), 11)]);
        backfill(&mut candidates, &resolved).unwrap();
        let ids: Vec<Id> = candidates.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![3, 11, 3]);
    }

    #[test]
    fn test_backfill_unresolved() {
        let mut candidates = vec![Address::dummy()];
        let err = backfill(&mut candidates, &HashMap::new()).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }
}
