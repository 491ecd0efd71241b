use tokio_postgres::Client;

use crate::error::StoreError;
use crate::types::BlockSignature;
use crate::types::Height;

pub(super) async fn insert_many(
    client: &Client,
    signatures: &[BlockSignature],
) -> Result<(), StoreError> {
    tracing::trace!("insert_many {}", signatures.len());
    let sql = "
        insert into idx.block_signatures (id, validator_id, height, time)
        values ($1, $2, $3, $4);";
    let stmt = client.prepare(sql).await?;
    for s in signatures {
        client
            .execute(&stmt, &[&s.id, &s.validator_id, &s.height, &s.time])
            .await?;
    }
    Ok(())
}

/// Delete signatures at `height`
pub(super) async fn delete_at(client: &Client, height: Height) -> Result<u64, StoreError> {
    tracing::trace!("delete_at {height}");
    let stmt = "delete from idx.block_signatures where height = $1;";
    Ok(client.execute(stmt, &[&height]).await?)
}

/// Delete signatures below `height`
pub(super) async fn delete_below(client: &Client, height: Height) -> Result<u64, StoreError> {
    tracing::trace!("delete_below {height}");
    let stmt = "delete from idx.block_signatures where height < $1;";
    Ok(client.execute(stmt, &[&height]).await?)
}
