use tokio_postgres::Client;

use crate::error::StoreError;

pub(super) struct Schema {
    name: &'static str,
    sql: &'static str,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Revision {
    pub major: i32,
    pub minor: i32,
}

impl Revision {
    pub fn new(major: i32, minor: i32) -> Self {
        Self { major, minor }
    }
}

/// Revision of the embedded schema.
pub const CURRENT_REVISION: Revision = Revision { major: 1, minor: 0 };

impl Schema {
    pub const fn new(name: &'static str, sql: &'static str) -> Self {
        Self { name, sql }
    }

    /// Loads the schema if absent and checks its revision.
    pub async fn init(&self, client: &mut Client) -> Result<(), StoreError> {
        if !self.schema_exists(client).await? {
            self.load_schema(client).await?;
        }
        let rev = self.schema_revision(client).await?;
        if rev != CURRENT_REVISION {
            return Err(StoreError::Validation(format!(
                "schema {} is at revision {}.{}, expected {}.{}",
                self.name, rev.major, rev.minor, CURRENT_REVISION.major, CURRENT_REVISION.minor
            )));
        }
        Ok(())
    }

    async fn schema_revision(&self, client: &Client) -> Result<Revision, StoreError> {
        tracing::debug!("reading current revision");
        let qry = format!("select rev_major, rev_minor from {}._rev;", self.name);
        let row = client.query_one(&qry, &[]).await?;
        Ok(Revision::new(row.get(0), row.get(1)))
    }

    async fn schema_exists(&self, client: &Client) -> Result<bool, StoreError> {
        tracing::debug!("checking for existing schema");
        let qry = "
        select exists(
            select schema_name
            from information_schema.schemata
            where schema_name = $1
        );";
        Ok(client.query_one(qry, &[&self.name]).await?.get(0))
    }

    async fn load_schema(&self, client: &mut Client) -> Result<(), StoreError> {
        tracing::info!("loading schema {}", self.name);
        let tx = client.transaction().await?;
        tx.batch_execute(self.sql).await?;
        tx.commit().await?;
        Ok(())
    }
}
