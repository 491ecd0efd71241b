use tokio_postgres::Client;

use crate::error::StoreError;
use crate::types::Constant;

pub(super) async fn insert_many(client: &Client, constants: &[Constant]) -> Result<(), StoreError> {
    tracing::trace!("insert_many {}", constants.len());
    let sql = "insert into idx.constants (module, name, value) values ($1, $2, $3);";
    let stmt = client.prepare(sql).await?;
    for c in constants {
        client
            .execute(&stmt, &[&c.module, &c.name, &c.value])
            .await?;
    }
    Ok(())
}
