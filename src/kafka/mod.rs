//! Kafka sink.
//!
//! Rows are serialized with the shared [`crate::producer::RowSerializer`],
//! keyed by [`KeyStrategy`] and routed to a partition by the configured
//! [`crate::dispatch::Partitioner`].

pub mod key_strategy;
pub mod producer;

pub use key_strategy::KeyStrategy;
pub use producer::{KafkaDiagnostic, KafkaProducer};
