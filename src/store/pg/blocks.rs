use postgres_from_row::FromRow;
use tokio_postgres::Client;

use crate::error::StoreError;
use crate::types::Block;
use crate::types::BlockStats;
use crate::types::Height;

pub(super) async fn insert(client: &Client, block: &Block) -> Result<(), StoreError> {
    tracing::trace!("insert {}", block.height);
    let stmt = "
        insert into idx.blocks (id, height, time, hash, parent_hash, proposer_id)
        values ($1, $2, $3, $4, $5, $6);";
    client
        .execute(
            stmt,
            &[
                &block.id,
                &block.height,
                &block.time,
                &block.hash,
                &block.parent_hash,
                &block.proposer_id,
            ],
        )
        .await?;
    Ok(())
}

pub(super) async fn delete_at(client: &Client, height: Height) -> Result<u64, StoreError> {
    tracing::trace!("delete_at {height}");
    let stmt = "delete from idx.blocks where height = $1;";
    Ok(client.execute(stmt, &[&height]).await?)
}

/// Retrieve the highest block, if any.
pub(super) async fn get_last(client: &Client) -> Result<Option<Block>, StoreError> {
    tracing::trace!("get_last");
    let qry = "
        select id, height, time, hash, parent_hash, proposer_id
        from idx.blocks
        order by height desc
        limit 1;";
    match client.query_opt(qry, &[]).await? {
        Some(row) => Ok(Some(Block::try_from_row(&row)?)),
        None => Ok(None),
    }
}

pub(super) async fn insert_stats(client: &Client, stats: &BlockStats) -> Result<(), StoreError> {
    tracing::trace!("insert_stats {}", stats.height);
    let stmt = "
        insert into idx.block_stats (
            id,
            height,
            time,
            tx_count,
            block_time,
            bytes_in_block,
            data_size,
            supply_change
        )
        values ($1, $2, $3, $4, $5, $6, $7, $8);";
    client
        .execute(
            stmt,
            &[
                &stats.id,
                &stats.height,
                &stats.time,
                &stats.tx_count,
                &stats.block_time,
                &stats.bytes_in_block,
                &stats.data_size,
                &stats.supply_change,
            ],
        )
        .await?;
    Ok(())
}

pub(super) async fn delete_stats_at(
    client: &Client,
    height: Height,
) -> Result<Option<BlockStats>, StoreError> {
    tracing::trace!("delete_stats_at {height}");
    let stmt = "
        delete from idx.block_stats
        where height = $1
        returning id
            , height
            , time
            , tx_count
            , block_time
            , bytes_in_block
            , data_size
            , supply_change;";
    match client.query_opt(stmt, &[&height]).await? {
        Some(row) => Ok(Some(BlockStats::try_from_row(&row)?)),
        None => Ok(None),
    }
}
