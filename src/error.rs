//! Error types and result handling for binlog-capture.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! Errors fall into a few classes that drive how the replicator reacts:
//!
//! - transient source failures ([`Error::Io`], [`Error::Connection`]) are
//!   retried with backoff,
//! - schema-desync failures ([`Error::SchemaParse`], [`Error::UnknownTable`],
//!   ...) stop forward progress and move the replicator to `FAILED`,
//! - sink failures ([`Error::Producer`]) are either logged or escalated,
//!   depending on `ignore_producer_error`.
//!
//! # Example
//!
//! ```rust
//! use binlog_capture::{Error, Result};
//!
//! fn lookup() -> Result<()> {
//!     Err(Error::UnknownTable {
//!         database: "shop".to_string(),
//!         table: "orders".to_string(),
//!     })
//! }
//!
//! match lookup() {
//!     Ok(()) => println!("found"),
//!     Err(e) if e.is_schema_desync() => eprintln!("schema out of sync: {}", e),
//!     Err(e) => eprintln!("other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for binlog-capture operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, typically from an invalid config file or
    /// environment variable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// PostgreSQL client error (checkpoint store).
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Kafka client or producer error.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// JSON serialization error when encoding messages or checkpoints.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error from spill files, checkpoint files or the log source.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Transient failure talking to the upstream log.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A raw upstream event could not be interpreted.
    #[error("Invalid message format: {message}")]
    InvalidMessage {
        /// Description of what was invalid
        message: String,
    },

    /// Log coordinates could not be parsed or were out of range.
    #[error("Malformed position '{input}': {reason}")]
    MalformedPosition {
        /// The offending input
        input: String,
        /// Why it was rejected
        reason: String,
    },

    /// A DDL statement was not understood.
    #[error("Unable to parse DDL '{sql}': {message}")]
    SchemaParse {
        /// The statement as read from the log
        sql: String,
        /// Parser diagnostic
        message: String,
    },

    /// A DDL statement or row references objects the snapshot does not have.
    #[error("Schema consistency error: {message}")]
    SchemaConsistency {
        /// Description of the inconsistency
        message: String,
    },

    /// A row event references a table absent from the schema snapshot.
    #[error("Unknown table {database}.{table}")]
    UnknownTable {
        /// Database name
        database: String,
        /// Table name
        table: String,
    },

    /// `remove_first` was called on an empty buffer.
    #[error("removeFirst called on an empty buffer")]
    EmptyBuffer,

    /// A sink reported a failed delivery.
    #[error("Producer error: {message}")]
    Producer {
        /// Description reported by the sink
        message: String,
    },

    /// Operation timeout.
    #[error("Timeout error: {message}")]
    Timeout {
        /// Description of what timed out
        message: String,
    },

    /// Replication-specific error.
    #[error("Replication error: {message}")]
    Replication {
        /// Description of the replication error
        message: String,
    },

    /// Graceful shutdown was requested.
    ///
    /// Not really an error; used to unwind out of blocking waits.
    #[error("Shutdown requested")]
    Shutdown,
}

impl Error {
    /// Whether the error is worth retrying against the upstream log.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Connection(_))
    }

    /// Whether the error means the schema snapshot no longer matches the log.
    pub fn is_schema_desync(&self) -> bool {
        matches!(
            self,
            Error::SchemaParse { .. }
                | Error::SchemaConsistency { .. }
                | Error::UnknownTable { .. }
                | Error::MalformedPosition { .. }
                | Error::InvalidMessage { .. }
        )
    }

    pub(crate) fn producer(message: impl Into<String>) -> Self {
        Error::Producer {
            message: message.into(),
        }
    }

    pub(crate) fn consistency(message: impl Into<String>) -> Self {
        Error::SchemaConsistency {
            message: message.into(),
        }
    }
}

/// A convenient Result type alias for binlog-capture operations.
///
/// This is equivalent to `std::result::Result<T, binlog_capture::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
