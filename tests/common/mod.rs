#![allow(dead_code)]

use async_trait::async_trait;
use binlog_capture::config::{CheckpointStoreKind, Config};
use binlog_capture::schema::{Column, Database, JsonSchemaCapturer, Schema, Table};
use binlog_capture::source::{LogSource, RawEvent, RawEventKind, RawRow, RowOp};
use binlog_capture::{BinlogPosition, Error, Result};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

pub const LOG_FILE: &str = "mysql-bin.000001";

/// Schema used by the integration tests.
///
/// `shop.orders(id, total)` and `shop.users(id, name, password)` keyed by
/// `id`, plus the bootstrap control table.
pub fn test_schema() -> Schema {
    let mut shop = Database::new("shop");
    shop.tables.push(Table::new(
        "orders",
        vec![Column::new("id", "int"), Column::new("total", "int")],
        vec!["id".to_string()],
    ));
    shop.tables.push(Table::new(
        "users",
        vec![
            Column::new("id", "int"),
            Column::new("name", "varchar(64)"),
            Column::new("password", "varchar(64)"),
        ],
        vec!["id".to_string()],
    ));

    let mut control = Database::new("binlog_capture");
    control.tables.push(Table::new(
        "bootstrap",
        vec![
            Column::new("id", "int"),
            Column::new("database_name", "varchar(255)"),
            Column::new("table_name", "varchar(255)"),
            Column::new("client_id", "varchar(255)"),
        ],
        vec!["id".to_string()],
    ));

    Schema {
        databases: vec![shop, control],
    }
}

pub fn test_capturer() -> Arc<JsonSchemaCapturer> {
    Arc::new(JsonSchemaCapturer::new(test_schema()))
}

/// Configuration with in-memory checkpoints and fast retries, starting at
/// the beginning of [`LOG_FILE`].
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.replication.client_id = "test-client".to_string();
    config.replication.start_position = Some(format!("{}:4", LOG_FILE));
    config.replication.retry_backoff_ms = 1;
    config.replication.max_retry_backoff_ms = 5;
    config.checkpoint.store = CheckpointStoreKind::Memory;
    config.checkpoint.flush_interval_ms = 10;
    config.buffer.max_in_memory_elements = 2;
    config
}

pub fn position(offset: u64) -> BinlogPosition {
    BinlogPosition::new(LOG_FILE, offset).unwrap()
}

/// Builds a log with contiguous positions, 10 bytes per event.
#[derive(Debug, Clone)]
pub struct EventLog {
    events: Vec<RawEvent>,
    offset: u64,
    server_id: u64,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            offset: 4,
            server_id: 1,
        }
    }

    pub fn with_server_id(mut self, server_id: u64) -> Self {
        self.server_id = server_id;
        self
    }

    fn push(&mut self, kind: RawEventKind) -> &mut Self {
        let start = position(self.offset);
        self.offset += 10;
        self.events.push(RawEvent {
            position: start,
            next_position: position(self.offset),
            timestamp_millis: 1_700_000_000_000 + self.offset as i64,
            server_id: self.server_id,
            kind,
        });
        self
    }

    pub fn begin(&mut self) -> &mut Self {
        self.push(RawEventKind::Begin)
    }

    pub fn commit(&mut self, xid: u64) -> &mut Self {
        self.push(RawEventKind::Commit { xid })
    }

    pub fn rollback(&mut self) -> &mut Self {
        self.push(RawEventKind::Rollback)
    }

    pub fn heartbeat(&mut self, heartbeat: i64) -> &mut Self {
        self.push(RawEventKind::Heartbeat { heartbeat })
    }

    pub fn query(&mut self, database: &str, sql: &str) -> &mut Self {
        self.push(RawEventKind::Query {
            database: database.to_string(),
            sql: sql.to_string(),
        })
    }

    pub fn insert(&mut self, database: &str, table: &str, values: Vec<Value>) -> &mut Self {
        self.rows(RowOp::Insert, database, table, None, Some(values))
    }

    pub fn update(&mut self, database: &str, table: &str, before: Vec<Value>, after: Vec<Value>) -> &mut Self {
        self.rows(RowOp::Update, database, table, Some(before), Some(after))
    }

    pub fn delete(&mut self, database: &str, table: &str, values: Vec<Value>) -> &mut Self {
        self.rows(RowOp::Delete, database, table, Some(values), None)
    }

    fn rows(
        &mut self,
        op: RowOp,
        database: &str,
        table: &str,
        before: Option<Vec<Value>>,
        after: Option<Vec<Value>>,
    ) -> &mut Self {
        self.push(RawEventKind::Rows {
            op,
            database: database.to_string(),
            table: table.to_string(),
            rows: vec![RawRow { before, after }],
        })
    }

    /// Position right after the last event.
    pub fn head(&self) -> BinlogPosition {
        position(self.offset)
    }

    pub fn events(&self) -> Vec<RawEvent> {
        self.events.clone()
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    seeks: Vec<BinlogPosition>,
    failures: Vec<usize>,
    cancel_after: Option<(usize, CancellationToken)>,
}

/// Replays a fixed list of events.
///
/// Reads of the event at an index passed to [`ScriptedSource::fail_once_at`]
/// fail with a transient error the first time.
#[derive(Debug, Clone)]
pub struct ScriptedSource {
    events: Vec<RawEvent>,
    server_id: u64,
    cursor: usize,
    hold_open: bool,
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedSource {
    pub fn new(log: &EventLog) -> Self {
        let server_id = log.events.first().map_or(1, |e| e.server_id);
        Self {
            events: log.events(),
            server_id,
            cursor: 0,
            hold_open: false,
            state: Arc::new(Mutex::new(ScriptState::default())),
        }
    }

    pub fn with_server_id(mut self, server_id: u64) -> Self {
        self.server_id = server_id;
        self
    }

    /// Blocks at the end of the events instead of ending the stream.
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn fail_once_at(self, index: usize) -> Self {
        self.state.lock().unwrap().failures.push(index);
        self
    }

    /// Cancels `token` once the event at `index` has been handed out.
    pub fn cancel_after(self, index: usize, token: CancellationToken) -> Self {
        self.state.lock().unwrap().cancel_after = Some((index, token));
        self
    }

    pub fn seeks(&self) -> Vec<BinlogPosition> {
        self.state.lock().unwrap().seeks.clone()
    }
}

#[async_trait]
impl LogSource for ScriptedSource {
    async fn server_id(&mut self) -> Result<u64> {
        Ok(self.server_id)
    }

    async fn head_position(&mut self) -> Result<BinlogPosition> {
        Ok(self
            .events
            .last()
            .map_or_else(|| position(4), |e| e.next_position.clone()))
    }

    async fn list_logs(&mut self) -> Result<Vec<String>> {
        let mut logs: Vec<String> = Vec::new();
        for event in &self.events {
            if logs.last().map(String::as_str) != Some(event.position.file()) {
                logs.push(event.position.file().to_string());
            }
        }
        Ok(logs)
    }

    async fn seek(&mut self, position: &BinlogPosition) -> Result<()> {
        self.state.lock().unwrap().seeks.push(position.clone());
        self.cursor = self
            .events
            .iter()
            .position(|e| e.position >= *position)
            .unwrap_or(self.events.len());
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<RawEvent>> {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(i) = state.failures.iter().position(|f| *f == self.cursor) {
                state.failures.remove(i);
                return Err(Error::Connection("connection reset by peer".to_string()));
            }
        }

        match self.events.get(self.cursor).cloned() {
            Some(event) => {
                if let Some((index, token)) = &self.state.lock().unwrap().cancel_after {
                    if *index == self.cursor {
                        token.cancel();
                    }
                }
                self.cursor += 1;
                Ok(Some(event))
            }
            None if self.hold_open => futures::future::pending().await,
            None => Ok(None),
        }
    }
}
