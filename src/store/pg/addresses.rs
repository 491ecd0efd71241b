use postgres_from_row::FromRow;
use tokio_postgres::Client;

use crate::aggregates::AddressUpdate;
use crate::error::StoreError;
use crate::types::Address;
use crate::types::AddressHash;
use crate::types::Height;
use crate::types::Id;

/// Map known address hashes to their id.
pub(super) async fn get_ids(
    client: &Client,
    hashes: &Vec<AddressHash>,
) -> Result<Vec<(AddressHash, Id)>, StoreError> {
    tracing::trace!("get_ids {}", hashes.len());
    let qry = "select hash, id from idx.addresses where hash = any($1);";
    Ok(client
        .query(qry, &[hashes])
        .await?
        .iter()
        .map(|row| (row.get(0), row.get(1)))
        .collect())
}

/// Insert a new address.
///
/// Returns false if the hash got claimed in the meantime.
pub(super) async fn insert_new(client: &Client, address: &Address) -> Result<bool, StoreError> {
    tracing::trace!("insert_new {address}");
    let stmt = "
        insert into idx.addresses (id, height, hash, nonce, actions_count, signed_tx_count)
        values ($1, $2, $3, $4, $5, $6)
        on conflict (hash) do nothing;";
    let n = client
        .execute(
            stmt,
            &[
                &address.id,
                &address.height,
                &address.hash,
                &address.nonce,
                &address.actions_count,
                &address.signed_tx_count,
            ],
        )
        .await?;
    Ok(n == 1)
}

/// Apply an update in place, returns false if the address does not exist.
pub(super) async fn update(client: &Client, update: &AddressUpdate) -> Result<bool, StoreError> {
    tracing::trace!("update {update:?}");
    let stmt = "
        update idx.addresses
        set actions_count = actions_count + $2
            , signed_tx_count = signed_tx_count + $3
            , nonce = coalesce($4::bigint, nonce)
        where id = $1;";
    let n = client
        .execute(
            stmt,
            &[
                &update.id,
                &update.actions_count,
                &update.signed_tx_count,
                &update.nonce,
            ],
        )
        .await?;
    Ok(n == 1)
}

/// Delete addresses spotted at `height`
pub(super) async fn delete_at(client: &Client, height: Height) -> Result<Vec<Address>, StoreError> {
    tracing::trace!("delete_at {height}");
    let stmt = "
        delete from idx.addresses
        where height = $1
        returning id, height, hash, nonce, actions_count, signed_tx_count;";
    let mut removed = client
        .query(stmt, &[&height])
        .await?
        .iter()
        .map(Address::try_from_row)
        .collect::<Result<Vec<Address>, _>>()?;
    removed.sort_by_key(|a| a.id);
    Ok(removed)
}

pub(super) async fn get(client: &Client, id: Id) -> Result<Option<Address>, StoreError> {
    tracing::trace!("get {id}");
    let qry = "
        select id, height, hash, nonce, actions_count, signed_tx_count
        from idx.addresses
        where id = $1;";
    match client.query_opt(qry, &[&id]).await? {
        Some(row) => Ok(Some(Address::try_from_row(&row)?)),
        None => Ok(None),
    }
}

pub(super) async fn get_by_hash(
    client: &Client,
    hash: &AddressHash,
) -> Result<Option<Address>, StoreError> {
    tracing::trace!("get_by_hash {}", base16::encode_lower(hash));
    let qry = "
        select id, height, hash, nonce, actions_count, signed_tx_count
        from idx.addresses
        where hash = $1;";
    match client.query_opt(qry, &[hash]).await? {
        Some(row) => Ok(Some(Address::try_from_row(&row)?)),
        None => Ok(None),
    }
}
