//! Full-table resync interleaved with live replication.
//!
//! A row inserted into `<schema_database>.bootstrap` asks for a table to be
//! re-sent. Once the transaction carrying the request is handed off, the
//! table is scanned and emitted into the same ordered stream as
//! `bootstrap-start`, one `bootstrap-insert` per row, and
//! `bootstrap-complete`. The markers never reach sinks as data.
//!
//! The requesting transaction checkpoints at its own start, and a commit
//! marker after the last bootstrap row moves the checkpoint past it. A
//! session that dies mid-bootstrap reads the request again on restart.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::dispatch::DeliveryQueue;
use crate::position::Position;
use crate::row::{RowEvent, RowKind};
use crate::schema::SchemaStore;
use crate::{Error, Result};

pub const BOOTSTRAP_TABLE: &str = "bootstrap";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapRequest {
    pub database: String,
    pub table: String,
    pub client_id: Option<String>,
}

impl BootstrapRequest {
    /// Reads a request from an insert into the bootstrap table.
    ///
    /// Returns `None` for rows addressed to another client.
    pub fn from_row(row: &RowEvent, client_id: &str) -> Result<Option<Self>> {
        let text = |column: &str| row.data.get(column).and_then(Value::as_str).map(str::to_string);

        let (Some(database), Some(table)) = (text("database_name"), text("table_name")) else {
            return Err(Error::InvalidMessage {
                message: format!(
                    "bootstrap request at {} lacks database_name or table_name",
                    row.position
                ),
            });
        };
        let requested_by = text("client_id");
        if requested_by.as_deref().is_some_and(|c| c != client_id) {
            debug!(database, table, client = ?requested_by, "Bootstrap request for another client");
            return Ok(None);
        }

        Ok(Some(Self {
            database,
            table,
            client_id: requested_by,
        }))
    }
}

/// Reads the current rows of a table, values in column order.
#[async_trait]
pub trait TableScanner: Send + Sync {
    async fn scan(&self, database: &str, table: &str) -> Result<BoxStream<'static, Result<Vec<Value>>>>;
}

/// Serves rows from `<dir>/<database>.<table>.json`, a JSON array of rows.
#[derive(Debug, Clone)]
pub struct SnapshotTableScanner {
    dir: PathBuf,
}

impl SnapshotTableScanner {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl TableScanner for SnapshotTableScanner {
    async fn scan(&self, database: &str, table: &str) -> Result<BoxStream<'static, Result<Vec<Value>>>> {
        let path = self.dir.join(format!("{}.{}.json", database, table));
        let content = tokio::fs::read_to_string(&path).await?;
        let rows: Vec<Vec<Value>> = serde_json::from_str(&content)?;
        debug!(path = ?path, rows = rows.len(), "Read table snapshot");
        Ok(stream::iter(rows.into_iter().map(Ok)).boxed())
    }
}

/// In-memory table contents, for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryTableScanner {
    tables: HashMap<(String, String), Vec<Vec<Value>>>,
}

impl MemoryTableScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, database: &str, table: &str, rows: Vec<Vec<Value>>) -> Self {
        self.tables
            .insert((database.to_string(), table.to_string()), rows);
        self
    }
}

#[async_trait]
impl TableScanner for MemoryTableScanner {
    async fn scan(&self, database: &str, table: &str) -> Result<BoxStream<'static, Result<Vec<Value>>>> {
        let rows = self
            .tables
            .get(&(database.to_string(), table.to_string()))
            .cloned()
            .unwrap_or_default();
        Ok(stream::iter(rows.into_iter().map(Ok)).boxed())
    }
}

pub struct Bootstrapper {
    scanner: Arc<dyn TableScanner>,
}

impl Bootstrapper {
    pub fn new(scanner: Arc<dyn TableScanner>) -> Self {
        Self { scanner }
    }

    /// Emits the bracketed resync of one table at `position` and returns the
    /// number of rows sent.
    #[instrument(skip(self, schema, position, queue), fields(database = %request.database, table = %request.table))]
    pub async fn run(
        &self,
        request: &BootstrapRequest,
        schema: &SchemaStore,
        position: &Position,
        queue: &DeliveryQueue,
    ) -> Result<u64> {
        let table = schema
            .table(&request.database, &request.table)
            .ok_or_else(|| Error::UnknownTable {
                database: request.database.clone(),
                table: request.table.clone(),
            })?;
        let primary_key = table.primary_key.clone();

        let marker = |kind: RowKind| {
            let mut row = RowEvent::new(
                kind,
                &request.database,
                Some(request.table.clone()),
                chrono::Utc::now().timestamp_millis(),
                position.clone(),
                position.clone(),
            )
            .with_primary_key(primary_key.clone());
            row.schema_version = schema.version();
            row
        };

        info!("Starting bootstrap");
        queue.push(marker(RowKind::BootstrapStart))?;

        let mut rows = self.scanner.scan(&request.database, &request.table).await?;
        let mut sent = 0u64;
        while let Some(values) = rows.next().await {
            let mut row = marker(RowKind::BootstrapInsert);
            row.data = schema.resolve(&request.database, &request.table, &values?)?;
            queue.push(row)?;
            sent += 1;
        }

        queue.push(marker(RowKind::BootstrapComplete))?;
        if sent == 0 {
            warn!("Bootstrapped table is empty");
        }
        info!(rows = sent, "Bootstrap complete");
        Ok(sent)
    }
}
