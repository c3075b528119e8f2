//! Raw upstream events and the log source collaborator.
//!
//! The replicator treats the source as an ordered, blocking stream of
//! [`RawEvent`]s. Vendor wire decoding lives behind [`LogSource`]; the
//! bundled [`JsonLinesSource`] replays events recorded as JSON lines.

mod jsonl;

pub use jsonl::JsonLinesSource;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::position::BinlogPosition;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowOp {
    Insert,
    Update,
    Delete,
}

/// One row image pair; values are positional, in column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRow {
    #[serde(default)]
    pub before: Option<Vec<Value>>,
    #[serde(default)]
    pub after: Option<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawEventKind {
    Begin,
    Rows {
        op: RowOp,
        database: String,
        table: String,
        rows: Vec<RawRow>,
    },
    Commit {
        xid: u64,
    },
    Rollback,
    /// A statement event; DDL, `SAVEPOINT` and friends arrive this way.
    Query {
        database: String,
        sql: String,
    },
    Heartbeat {
        heartbeat: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub position: BinlogPosition,
    pub next_position: BinlogPosition,
    pub timestamp_millis: i64,
    pub server_id: u64,
    #[serde(flatten)]
    pub kind: RawEventKind,
}

/// An ordered source of raw log events.
#[async_trait]
pub trait LogSource: Send {
    /// Id of the server currently producing the log.
    async fn server_id(&mut self) -> Result<u64>;

    /// Position just past the newest event in the log.
    async fn head_position(&mut self) -> Result<BinlogPosition>;

    /// Log file names, oldest first.
    async fn list_logs(&mut self) -> Result<Vec<String>>;

    /// Positions the stream so the next event starts at or after `position`.
    async fn seek(&mut self, position: &BinlogPosition) -> Result<()>;

    /// Next event; `None` once a finite stream is exhausted.
    ///
    /// Must be cancel safe: a cancelled call loses no event.
    async fn next_event(&mut self) -> Result<Option<RawEvent>>;

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
