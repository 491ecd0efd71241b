use postgres_from_row::FromRow;
use tokio_postgres::Client;

use crate::error::StoreError;
use crate::types::Balance;
use crate::types::BalanceUpdate;
use crate::types::Currency;
use crate::types::Height;
use crate::types::Id;

/// Add balance totals to existing ones, inserting missing balances.
///
/// Expects at most one record per (id, currency).
pub(super) async fn upsert_many(client: &Client, balances: &[Balance]) -> Result<(), StoreError> {
    tracing::trace!("upsert_many {}", balances.len());
    let sql = "
        insert into idx.balances (id, currency, total)
        values ($1, $2, $3)
        on conflict (id, currency) do update
        set total = idx.balances.total + EXCLUDED.total;";
    let stmt = client.prepare(sql).await?;
    for b in balances {
        client
            .execute(&stmt, &[&b.id, &b.currency, &b.total])
            .await?;
    }
    Ok(())
}

/// Delete balances for given address id's.
pub(super) async fn delete_many(client: &Client, address_ids: &[Id]) -> Result<u64, StoreError> {
    tracing::trace!("delete_many {}", address_ids.len());
    let stmt = "delete from idx.balances where id = any($1);";
    Ok(client.execute(stmt, &[&address_ids]).await?)
}

/// Delete given balances having no balance updates.
pub(super) async fn delete_untracked(
    client: &Client,
    keys: &[(Id, Currency)],
) -> Result<u64, StoreError> {
    tracing::trace!("delete_untracked {}", keys.len());
    let sql = "
        delete from idx.balances b
        where b.id = $1
            and b.currency = $2
            and not exists (
                select 1
                from idx.balance_updates u
                where u.address_id = $1
                    and u.currency = $2
            );";
    let stmt = client.prepare(sql).await?;
    let mut n = 0;
    for (id, currency) in keys {
        n += client.execute(&stmt, &[id, currency]).await?;
    }
    Ok(n)
}

pub(super) async fn get(
    client: &Client,
    address_id: Id,
    currency: &Currency,
) -> Result<Option<Balance>, StoreError> {
    tracing::trace!("get {address_id} {currency}");
    let qry = "
        select id, currency, total
        from idx.balances
        where id = $1 and currency = $2;";
    match client.query_opt(qry, &[&address_id, currency]).await? {
        Some(row) => Ok(Some(Balance::try_from_row(&row)?)),
        None => Ok(None),
    }
}

pub(super) async fn insert_updates(
    client: &Client,
    updates: &[BalanceUpdate],
) -> Result<(), StoreError> {
    tracing::trace!("insert_updates {}", updates.len());
    let sql = "
        insert into idx.balance_updates (id, height, address_id, currency, delta)
        values ($1, $2, $3, $4, $5);";
    let stmt = client.prepare(sql).await?;
    for u in updates {
        client
            .execute(
                &stmt,
                &[&u.id, &u.height, &u.address_id, &u.currency, &u.delta],
            )
            .await?;
    }
    Ok(())
}

/// Delete balance updates at `height`
pub(super) async fn delete_updates_at(
    client: &Client,
    height: Height,
) -> Result<Vec<BalanceUpdate>, StoreError> {
    tracing::trace!("delete_updates_at {height}");
    let stmt = "
        delete from idx.balance_updates
        where height = $1
        returning id, height, address_id, currency, delta;";
    let mut removed = client
        .query(stmt, &[&height])
        .await?
        .iter()
        .map(BalanceUpdate::try_from_row)
        .collect::<Result<Vec<BalanceUpdate>, _>>()?;
    removed.sort_by_key(|u| u.id);
    Ok(removed)
}
