use postgres_from_row::FromRow;
use tokio_postgres::Client;

use crate::error::StoreError;
use crate::types::Action;
use crate::types::Height;

pub(super) async fn insert_many(client: &Client, actions: &[Action]) -> Result<(), StoreError> {
    tracing::trace!("insert_many {}", actions.len());
    let sql = "
        insert into idx.actions (id, height, time, position, action_type, tx_id, data)
        values ($1, $2, $3, $4, $5, $6, $7);";
    let stmt = client.prepare(sql).await?;
    for a in actions {
        client
            .execute(
                &stmt,
                &[
                    &a.id,
                    &a.height,
                    &a.time,
                    &a.position,
                    &a.action_type,
                    &a.tx_id,
                    &a.data,
                ],
            )
            .await?;
    }
    Ok(())
}

/// Delete actions at `height`
pub(super) async fn delete_at(client: &Client, height: Height) -> Result<Vec<Action>, StoreError> {
    tracing::trace!("delete_at {height}");
    let stmt = "
        delete from idx.actions
        where height = $1
        returning id, height, time, position, action_type, tx_id, data;";
    let mut removed = client
        .query(stmt, &[&height])
        .await?
        .iter()
        .map(Action::try_from_row)
        .collect::<Result<Vec<Action>, _>>()?;
    removed.sort_by_key(|a| a.id);
    Ok(removed)
}
