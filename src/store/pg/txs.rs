use postgres_from_row::FromRow;
use tokio_postgres::Client;

use crate::error::StoreError;
use crate::types::Height;
use crate::types::Id;
use crate::types::Nonce;
use crate::types::Tx;

pub(super) async fn insert_many(client: &Client, txs: &[Tx]) -> Result<(), StoreError> {
    tracing::trace!("insert_many {}", txs.len());
    let sql = "
        insert into idx.txs (
            id,
            height,
            time,
            position,
            actions_count,
            status,
            error,
            hash,
            signer_id,
            nonce
        )
        values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10);";
    let stmt = client.prepare(sql).await?;
    for tx in txs {
        client
            .execute(
                &stmt,
                &[
                    &tx.id,
                    &tx.height,
                    &tx.time,
                    &tx.position,
                    &tx.actions_count,
                    &tx.status,
                    &tx.error,
                    &tx.hash,
                    &tx.signer_id,
                    &tx.nonce,
                ],
            )
            .await?;
    }
    Ok(())
}

/// Delete txs at `height`
pub(super) async fn delete_at(client: &Client, height: Height) -> Result<Vec<Tx>, StoreError> {
    tracing::trace!("delete_at {height}");
    let stmt = "
        delete from idx.txs
        where height = $1
        returning id
            , height
            , time
            , position
            , actions_count
            , status
            , error
            , hash
            , signer_id
            , nonce;";
    let mut removed = client
        .query(stmt, &[&height])
        .await?
        .iter()
        .map(Tx::try_from_row)
        .collect::<Result<Vec<Tx>, _>>()?;
    removed.sort_by_key(|tx| tx.id);
    Ok(removed)
}

/// Nonce of the latest tx signed by `signer_id`.
pub(super) async fn get_last_nonce(
    client: &Client,
    signer_id: Id,
) -> Result<Option<Nonce>, StoreError> {
    tracing::trace!("get_last_nonce {signer_id}");
    let qry = "
        select nonce
        from idx.txs
        where signer_id = $1
        order by height desc, position desc
        limit 1;";
    Ok(client.query_opt(qry, &[&signer_id]).await?.map(|row| row.get(0)))
}
