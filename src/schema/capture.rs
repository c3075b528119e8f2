use async_trait::async_trait;
use std::path::Path;
use tokio::fs;
use tracing::{debug, info};

use super::{Column, Schema};
use crate::{Error, Result};

/// Administrative view of the upstream database used to build the initial
/// schema snapshot.
#[async_trait]
pub trait SchemaCapturer: Send + Sync {
    async fn list_databases(&self) -> Result<Vec<String>>;

    async fn list_tables(&self, database: &str) -> Result<Vec<String>>;

    /// Columns in ordinal order.
    async fn list_columns(&self, database: &str, table: &str) -> Result<Vec<Column>>;

    async fn primary_key(&self, _database: &str, _table: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Serves a schema snapshot stored as JSON.
///
/// The file has the shape of [`Schema`]:
///
/// ```json
/// {"databases": [{"name": "shop", "tables": [
///   {"name": "orders", "columns": [{"name": "id", "type": "bigint"}], "primary_key": ["id"]}
/// ]}]}
/// ```
#[derive(Debug, Clone)]
pub struct JsonSchemaCapturer {
    schema: Schema,
}

impl JsonSchemaCapturer {
    pub fn new(schema: Schema) -> Self {
        Self { schema }
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).await?;
        let schema: Schema = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Invalid schema snapshot {:?}: {}", path, e))
        })?;

        info!(
            path = ?path,
            databases = schema.databases.len(),
            "Loaded schema snapshot"
        );
        Ok(Self::new(schema))
    }

    fn table(&self, database: &str, table: &str) -> Result<&super::Table> {
        self.schema
            .table(database, table)
            .ok_or_else(|| Error::UnknownTable {
                database: database.to_string(),
                table: table.to_string(),
            })
    }
}

#[async_trait]
impl SchemaCapturer for JsonSchemaCapturer {
    async fn list_databases(&self) -> Result<Vec<String>> {
        Ok(self.schema.databases.iter().map(|d| d.name.clone()).collect())
    }

    async fn list_tables(&self, database: &str) -> Result<Vec<String>> {
        let db = self.schema.database(database).ok_or_else(|| {
            Error::consistency(format!("database {} missing from snapshot", database))
        })?;
        Ok(db.tables.iter().map(|t| t.name.clone()).collect())
    }

    async fn list_columns(&self, database: &str, table: &str) -> Result<Vec<Column>> {
        debug!(database, table, "Listing columns");
        Ok(self.table(database, table)?.columns.clone())
    }

    async fn primary_key(&self, database: &str, table: &str) -> Result<Vec<String>> {
        Ok(self.table(database, table)?.primary_key.clone())
    }
}
