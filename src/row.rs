//! Logical change events.
//!
//! A [`RowEvent`] is one row mutation, DDL statement, heartbeat or control
//! marker, resolved against the schema and stamped with its log coordinates.
//! Rows are built by the replicator and read-only afterwards, except for
//! [`RowEvent::redact_columns`] and the transaction metadata the row buffer
//! stamps as rows leave it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::config::OutputConfig;
use crate::position::Position;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RowKind {
    Insert,
    Update,
    Delete,
    Ddl,
    Heartbeat,
    /// Synthetic end of an otherwise empty transaction.
    Commit,
    BootstrapStart,
    BootstrapInsert,
    BootstrapComplete,
}

impl RowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowKind::Insert => "insert",
            RowKind::Update => "update",
            RowKind::Delete => "delete",
            RowKind::Ddl => "ddl",
            RowKind::Heartbeat => "heartbeat",
            RowKind::Commit => "commit",
            RowKind::BootstrapStart => "bootstrap-start",
            RowKind::BootstrapInsert => "bootstrap-insert",
            RowKind::BootstrapComplete => "bootstrap-complete",
        }
    }

    /// Row mutations, live or bootstrapped.
    pub fn is_data(&self) -> bool {
        matches!(
            self,
            RowKind::Insert | RowKind::Update | RowKind::Delete | RowKind::BootstrapInsert
        )
    }
}

impl fmt::Display for RowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowEvent {
    pub kind: RowKind,
    pub database: String,
    pub table: Option<String>,
    pub timestamp_millis: i64,
    #[serde(default)]
    pub primary_key_columns: Vec<String>,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub old_data: Map<String, Value>,
    /// Where the event starts in the log.
    pub position: Position,
    /// Where the next event starts; what a checkpoint stores.
    pub next_position: Position,
    pub transaction_id: Option<u64>,
    #[serde(default)]
    pub transaction_offset: u32,
    /// Last row of its transaction.
    #[serde(default)]
    pub tx_commit: bool,
    pub server_id: Option<u64>,
    #[serde(default)]
    pub schema_version: u64,
    /// Statement text for DDL rows.
    pub sql: Option<String>,
}

const ROW_OVERHEAD: u64 = 100;

impl RowEvent {
    pub fn new(
        kind: RowKind,
        database: impl Into<String>,
        table: Option<String>,
        timestamp_millis: i64,
        position: Position,
        next_position: Position,
    ) -> Self {
        Self {
            kind,
            database: database.into(),
            table,
            timestamp_millis,
            primary_key_columns: Vec::new(),
            data: Map::new(),
            old_data: Map::new(),
            position,
            next_position,
            transaction_id: None,
            transaction_offset: 0,
            tx_commit: false,
            server_id: None,
            schema_version: 0,
            sql: None,
        }
    }

    pub fn heartbeat(
        database: impl Into<String>,
        timestamp_millis: i64,
        position: Position,
        next_position: Position,
    ) -> Self {
        let mut row = Self::new(
            RowKind::Heartbeat,
            database,
            Some("heartbeats".to_string()),
            timestamp_millis,
            position,
            next_position,
        );
        row.data.insert(
            "heartbeat".to_string(),
            Value::from(row.next_position.last_heartbeat_read()),
        );
        row
    }

    pub fn ddl(
        database: impl Into<String>,
        table: Option<String>,
        sql: impl Into<String>,
        timestamp_millis: i64,
        position: Position,
        next_position: Position,
    ) -> Self {
        let mut row = Self::new(
            RowKind::Ddl,
            database,
            table,
            timestamp_millis,
            position,
            next_position,
        );
        row.sql = Some(sql.into());
        row
    }

    pub fn with_primary_key(mut self, columns: Vec<String>) -> Self {
        self.primary_key_columns = columns;
        self
    }

    pub fn table_name(&self) -> &str {
        self.table.as_deref().unwrap_or("")
    }

    /// Rough in-memory footprint used for buffer budgets.
    pub fn approximate_size(&self) -> u64 {
        let mut size = ROW_OVERHEAD;
        size += (self.database.len() + self.table_name().len()) as u64 * 2;
        for (k, v) in self.data.iter().chain(self.old_data.iter()) {
            size += approximate_kv_size(k, v);
        }
        if let Some(sql) = &self.sql {
            size += sql.len() as u64 * 2;
        }
        size
    }

    /// Removes the named columns from `data` and `old_data`.
    pub fn redact_columns<S: AsRef<str>>(&mut self, columns: &[S]) {
        for column in columns {
            self.data.remove(column.as_ref());
            self.old_data.remove(column.as_ref());
        }
    }

    /// Whether a sink should see this row as data.
    pub fn should_output(&self, output: &OutputConfig) -> bool {
        match self.kind {
            RowKind::Insert | RowKind::Update | RowKind::Delete | RowKind::BootstrapInsert => true,
            RowKind::Ddl => output.include_ddl,
            RowKind::Heartbeat => output.include_heartbeats,
            RowKind::Commit | RowKind::BootstrapStart | RowKind::BootstrapComplete => false,
        }
    }

    /// Primary key values concatenated; `database + table` without a key.
    pub fn pk_as_concat_string(&self) -> String {
        if self.primary_key_columns.is_empty() {
            return format!("{}{}", self.database, self.table_name());
        }

        let keys: String = self
            .primary_key_columns
            .iter()
            .filter_map(|pk| self.data.get(pk))
            .filter(|v| !v.is_null())
            .map(value_to_key_string)
            .collect();

        if keys.is_empty() {
            "None".to_string()
        } else {
            keys
        }
    }

    /// Values of `columns` concatenated, skipping missing and null ones.
    pub fn build_partition_key<S: AsRef<str>>(&self, columns: &[S]) -> String {
        columns
            .iter()
            .filter_map(|c| self.data.get(c.as_ref()))
            .filter(|v| !v.is_null())
            .map(value_to_key_string)
            .collect()
    }
}

fn approximate_kv_size(key: &str, value: &Value) -> u64 {
    let mut length = 40;
    length += key.len() as u64 * 2;
    match value {
        Value::String(s) => length += s.len() as u64 * 2,
        _ => length += 64,
    }
    length
}

pub(crate) fn value_to_key_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
