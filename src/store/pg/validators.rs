use postgres_from_row::FromRow;
use tokio_postgres::Client;

use crate::config::ValidatorBoundary;
use crate::error::StoreError;
use crate::types::Height;
use crate::types::Id;
use crate::types::Validator;

pub(super) async fn insert_many(client: &Client, validators: &[Validator]) -> Result<(), StoreError> {
    tracing::trace!("insert_many {}", validators.len());
    let sql = "
        insert into idx.validators (id, height, address, pubkey_type, pubkey, power)
        values ($1, $2, $3, $4, $5, $6);";
    let stmt = client.prepare(sql).await?;
    for v in validators {
        client
            .execute(
                &stmt,
                &[
                    &v.id,
                    &v.height,
                    &v.address,
                    &v.pubkey_type,
                    &v.pubkey,
                    &v.power,
                ],
            )
            .await?;
    }
    Ok(())
}

/// Delete validators first seen past `height`.
pub(super) async fn delete_after(
    client: &Client,
    height: Height,
    boundary: ValidatorBoundary,
) -> Result<u64, StoreError> {
    tracing::trace!("delete_after {height} {boundary:?}");
    let stmt = match boundary {
        ValidatorBoundary::After => "delete from idx.validators where height > $1;",
        ValidatorBoundary::AtOrAfter => "delete from idx.validators where height >= $1;",
    };
    Ok(client.execute(stmt, &[&height]).await?)
}

pub(super) async fn get_all(client: &Client) -> Result<Vec<Validator>, StoreError> {
    tracing::trace!("get_all");
    let qry = "
        select id, height, address, pubkey_type, pubkey, power
        from idx.validators
        order by id;";
    Ok(client
        .query(qry, &[])
        .await?
        .iter()
        .map(Validator::try_from_row)
        .collect::<Result<Vec<Validator>, _>>()?)
}

pub(super) async fn get_id(client: &Client, address: &str) -> Result<Option<Id>, StoreError> {
    tracing::trace!("get_id {address}");
    let qry = "select id from idx.validators where address = $1;";
    Ok(client.query_opt(qry, &[&address]).await?.map(|row| row.get(0)))
}
