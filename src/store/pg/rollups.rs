use postgres_from_row::FromRow;
use tokio_postgres::Client;

use crate::aggregates::RollupUpdate;
use crate::error::StoreError;
use crate::types::ChainID;
use crate::types::Height;
use crate::types::Id;
use crate::types::Rollup;

/// Map known chain ids to their rollup id.
pub(super) async fn get_ids(
    client: &Client,
    chain_ids: &Vec<ChainID>,
) -> Result<Vec<(ChainID, Id)>, StoreError> {
    tracing::trace!("get_ids {}", chain_ids.len());
    let qry = "select chain_id, id from idx.rollups where chain_id = any($1);";
    Ok(client
        .query(qry, &[chain_ids])
        .await?
        .iter()
        .map(|row| (row.get(0), row.get(1)))
        .collect())
}

/// Insert a new rollup.
///
/// Returns false if the chain id got claimed in the meantime.
pub(super) async fn insert_new(client: &Client, rollup: &Rollup) -> Result<bool, StoreError> {
    tracing::trace!("insert_new {}", rollup.id);
    let stmt = "
        insert into idx.rollups (id, chain_id, first_height, actions_count, size, bridge_address_id)
        values ($1, $2, $3, $4, $5, $6)
        on conflict (chain_id) do nothing;";
    let n = client
        .execute(
            stmt,
            &[
                &rollup.id,
                &rollup.chain_id,
                &rollup.first_height,
                &rollup.actions_count,
                &rollup.size,
                &rollup.bridge_address_id,
            ],
        )
        .await?;
    Ok(n == 1)
}

pub(super) async fn update(client: &Client, update: &RollupUpdate) -> Result<bool, StoreError> {
    tracing::trace!("update {update:?}");
    let stmt = "
        update idx.rollups
        set actions_count = actions_count + $2
            , size = size + $3
        where id = $1;";
    let n = client
        .execute(stmt, &[&update.id, &update.actions_count, &update.size])
        .await?;
    Ok(n == 1)
}

/// Delete rollups first seen at `height`
pub(super) async fn delete_at(client: &Client, height: Height) -> Result<Vec<Rollup>, StoreError> {
    tracing::trace!("delete_at {height}");
    let stmt = "
        delete from idx.rollups
        where first_height = $1
        returning id, chain_id, first_height, actions_count, size, bridge_address_id;";
    let mut removed = client
        .query(stmt, &[&height])
        .await?
        .iter()
        .map(Rollup::try_from_row)
        .collect::<Result<Vec<Rollup>, _>>()?;
    removed.sort_by_key(|r| r.id);
    Ok(removed)
}

pub(super) async fn get(client: &Client, id: Id) -> Result<Option<Rollup>, StoreError> {
    tracing::trace!("get {id}");
    let qry = "
        select id, chain_id, first_height, actions_count, size, bridge_address_id
        from idx.rollups
        where id = $1;";
    match client.query_opt(qry, &[&id]).await? {
        Some(row) => Ok(Some(Rollup::try_from_row(&row)?)),
        None => Ok(None),
    }
}
