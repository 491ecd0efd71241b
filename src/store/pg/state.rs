use postgres_from_row::FromRow;
use tokio_postgres::Client;

use crate::error::StoreError;
use crate::types::ChainState;
use crate::types::Id;

pub(super) async fn get(client: &Client, name: &str) -> Result<Option<ChainState>, StoreError> {
    tracing::trace!("get {name}");
    let qry = "
        select id
            , name
            , last_height
            , last_hash
            , last_time
            , total_tx
            , total_accounts
            , total_rollups
            , total_bytes
            , total_supply
            , genesis_time
        from idx.chain_states
        where name = $1;";
    match client.query_opt(qry, &[&name]).await? {
        Some(row) => Ok(Some(ChainState::try_from_row(&row)?)),
        None => Ok(None),
    }
}

pub(super) async fn get_id(client: &Client, name: &str) -> Result<Option<Id>, StoreError> {
    let qry = "select id from idx.chain_states where name = $1;";
    Ok(client.query_opt(qry, &[&name]).await?.map(|row| row.get(0)))
}

/// Insert or overwrite state with same name.
pub(super) async fn upsert(client: &Client, state: &ChainState) -> Result<(), StoreError> {
    tracing::trace!("upsert {} at {}", state.name, state.last_height);
    let stmt = "
        insert into idx.chain_states (
            id,
            name,
            last_height,
            last_hash,
            last_time,
            total_tx,
            total_accounts,
            total_rollups,
            total_bytes,
            total_supply,
            genesis_time
        )
        values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        on conflict (name) do update
        set last_height = EXCLUDED.last_height
            , last_hash = EXCLUDED.last_hash
            , last_time = EXCLUDED.last_time
            , total_tx = EXCLUDED.total_tx
            , total_accounts = EXCLUDED.total_accounts
            , total_rollups = EXCLUDED.total_rollups
            , total_bytes = EXCLUDED.total_bytes
            , total_supply = EXCLUDED.total_supply
            , genesis_time = EXCLUDED.genesis_time;";
    client
        .execute(
            stmt,
            &[
                &state.id,
                &state.name,
                &state.last_height,
                &state.last_hash,
                &state.last_time,
                &state.total_tx,
                &state.total_accounts,
                &state.total_rollups,
                &state.total_bytes,
                &state.total_supply,
                &state.genesis_time,
            ],
        )
        .await?;
    Ok(())
}
