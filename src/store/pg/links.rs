//! Height-stamped many-to-many links.
use postgres_from_row::FromRow;
use tokio_postgres::Client;

use crate::error::StoreError;
use crate::types::AddressAction;
use crate::types::Height;
use crate::types::RollupAction;
use crate::types::RollupAddress;

pub(super) async fn insert_rollup_actions(
    client: &Client,
    links: &[RollupAction],
) -> Result<(), StoreError> {
    tracing::trace!("insert_rollup_actions {}", links.len());
    let sql = "
        insert into idx.rollup_actions (rollup_id, action_id, tx_id, height, time, action_type, size)
        values ($1, $2, $3, $4, $5, $6, $7);";
    let stmt = client.prepare(sql).await?;
    for ra in links {
        client
            .execute(
                &stmt,
                &[
                    &ra.rollup_id,
                    &ra.action_id,
                    &ra.tx_id,
                    &ra.height,
                    &ra.time,
                    &ra.action_type,
                    &ra.size,
                ],
            )
            .await?;
    }
    Ok(())
}

/// Insert rollup-address pairs, leaving existing ones untouched.
pub(super) async fn insert_rollup_addresses(
    client: &Client,
    links: &[RollupAddress],
) -> Result<(), StoreError> {
    tracing::trace!("insert_rollup_addresses {}", links.len());
    let sql = "
        insert into idx.rollup_addresses (rollup_id, address_id, height)
        values ($1, $2, $3)
        on conflict (rollup_id, address_id) do nothing;";
    let stmt = client.prepare(sql).await?;
    for ra in links {
        client
            .execute(&stmt, &[&ra.rollup_id, &ra.address_id, &ra.height])
            .await?;
    }
    Ok(())
}

pub(super) async fn insert_address_actions(
    client: &Client,
    links: &[AddressAction],
) -> Result<(), StoreError> {
    tracing::trace!("insert_address_actions {}", links.len());
    let sql = "
        insert into idx.address_actions (address_id, action_id, tx_id, action_type, height, time)
        values ($1, $2, $3, $4, $5, $6);";
    let stmt = client.prepare(sql).await?;
    for aa in links {
        client
            .execute(
                &stmt,
                &[
                    &aa.address_id,
                    &aa.action_id,
                    &aa.tx_id,
                    &aa.action_type,
                    &aa.height,
                    &aa.time,
                ],
            )
            .await?;
    }
    Ok(())
}

pub(super) async fn delete_rollup_actions_at(
    client: &Client,
    height: Height,
) -> Result<Vec<RollupAction>, StoreError> {
    tracing::trace!("delete_rollup_actions_at {height}");
    let stmt = "
        delete from idx.rollup_actions
        where height = $1
        returning rollup_id, action_id, tx_id, height, time, action_type, size;";
    let mut removed = client
        .query(stmt, &[&height])
        .await?
        .iter()
        .map(RollupAction::try_from_row)
        .collect::<Result<Vec<RollupAction>, _>>()?;
    removed.sort_by_key(|ra| (ra.rollup_id, ra.action_id));
    Ok(removed)
}

pub(super) async fn delete_rollup_addresses_at(
    client: &Client,
    height: Height,
) -> Result<u64, StoreError> {
    tracing::trace!("delete_rollup_addresses_at {height}");
    let stmt = "delete from idx.rollup_addresses where height = $1;";
    Ok(client.execute(stmt, &[&height]).await?)
}

pub(super) async fn delete_address_actions_at(
    client: &Client,
    height: Height,
) -> Result<Vec<AddressAction>, StoreError> {
    tracing::trace!("delete_address_actions_at {height}");
    let stmt = "
        delete from idx.address_actions
        where height = $1
        returning address_id, action_id, tx_id, action_type, height, time;";
    let mut removed = client
        .query(stmt, &[&height])
        .await?
        .iter()
        .map(AddressAction::try_from_row)
        .collect::<Result<Vec<AddressAction>, _>>()?;
    removed.sort_by_key(|aa| (aa.address_id, aa.action_id));
    Ok(removed)
}
