//! Binary-log change data capture.
//!
//! Reads an ordered stream of raw log events, resolves them against a
//! tracked schema, groups them into transactions and hands every committed
//! transaction to a producer in log order. Acknowledged positions are
//! checkpointed per client so a restart resumes after the last delivered
//! transaction.

pub mod bootstrap;
pub mod buffer;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod filter;
pub mod pipeline;
pub mod position;
pub mod producer;
pub mod recovery;
pub mod replicator;
pub mod row;
pub mod schema;
pub mod source;

pub mod kafka;
pub mod postgres;

pub use config::Config;
pub use error::{Error, Result};
pub use position::{BinlogPosition, Position};
pub use replicator::{Replicator, ReplicatorState};
pub use row::{RowEvent, RowKind};
