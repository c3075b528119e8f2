//! Delivery of ordered rows to the producer.
//!
//! The replicator appends committed transactions to a [`DeliveryQueue`];
//! one [`Dispatcher`] task drains it in order, applies column filtering,
//! registers each row with the [`InflightTracker`] and pushes it to the
//! producer. Rows that sinks never see (commit markers, bootstrap
//! markers, disabled heartbeats) still pass through the tracker so their
//! positions are acknowledged in order.

mod inflight;
pub mod partition;
mod queue;

pub use inflight::{Completion, InflightTracker};
pub use partition::{HashFunction, Partitioner};
pub use queue::DeliveryQueue;

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::config::OutputConfig;
use crate::context::ReplicationContext;
use crate::filter::ColumnFilter;
use crate::producer::Producer;
use crate::row::RowEvent;
use crate::{Error, Result};

pub struct Dispatcher {
    queue: Arc<DeliveryQueue>,
    producer: Arc<dyn Producer>,
    inflight: Arc<InflightTracker>,
    context: Arc<ReplicationContext>,
    column_filter: ColumnFilter,
    output: OutputConfig,
    ack_timeout: Option<Duration>,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<DeliveryQueue>,
        producer: Arc<dyn Producer>,
        inflight: Arc<InflightTracker>,
        context: Arc<ReplicationContext>,
        output: OutputConfig,
    ) -> Self {
        Self {
            queue,
            producer,
            inflight,
            context,
            column_filter: ColumnFilter::default(),
            output,
            ack_timeout: None,
        }
    }

    pub fn with_column_filter(mut self, column_filter: ColumnFilter) -> Self {
        self.column_filter = column_filter;
        self
    }

    /// Terminate when the oldest delivery stays unacknowledged this long.
    pub fn with_ack_timeout(mut self, ack_timeout: Option<Duration>) -> Self {
        self.ack_timeout = ack_timeout.filter(|t| !t.is_zero());
        self
    }

    /// Delivers rows until the queue is closed and drained, then waits for
    /// every outstanding acknowledgement.
    #[instrument(skip(self), fields(producer = self.producer.name()))]
    pub async fn run(self) -> Result<()> {
        let cancel = self.context.cancellation_token();
        let watchdog = self.ack_timeout.map(|timeout| {
            tokio::spawn(watch_ack_timeout(
                self.inflight.clone(),
                self.context.clone(),
                timeout,
            ))
        });

        let result = self.deliver_all().await;
        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        match result {
            Err(Error::Shutdown) if cancel.is_cancelled() => {
                info!("Dispatcher stopped by termination");
                Ok(())
            }
            other => other,
        }
    }

    async fn deliver_all(&self) -> Result<()> {
        let cancel = self.context.cancellation_token();
        let mut delivered = 0u64;

        loop {
            let row = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Shutdown),
                row = self.queue.pop() => row?,
            };
            let Some(row) = row else {
                break;
            };

            self.dispatch(row).await?;
            delivered += 1;
        }

        debug!(delivered, pending = self.inflight.len(), "Queue drained");
        self.inflight.wait_empty(&cancel).await?;
        info!(delivered, "All deliveries acknowledged");
        Ok(())
    }

    async fn dispatch(&self, mut row: RowEvent) -> Result<()> {
        let cancel = self.context.cancellation_token();
        let checkpoint = row.tx_commit.then(|| row.next_position.clone());
        let id = self.inflight.acquire(checkpoint, &cancel).await?;
        let completion = Completion::new(
            id,
            format!("{} {}.{} at {}", row.kind, row.database, row.table_name(), row.position.binlog()),
            self.inflight.clone(),
            self.context.clone(),
        );

        if !row.should_output(&self.output) {
            completion.complete();
            return Ok(());
        }

        self.column_filter.apply(&mut row);
        if !self.output.exclude_columns.is_empty() {
            row.redact_columns(&self.output.exclude_columns);
        }

        if let Err(e) = self.producer.push(row, completion).await {
            self.context
                .terminate(format!("producer {} failed: {}", self.producer.name(), e));
            return Err(e);
        }
        Ok(())
    }
}

async fn watch_ack_timeout(
    inflight: Arc<InflightTracker>,
    context: Arc<ReplicationContext>,
    timeout: Duration,
) {
    let mut tick = tokio::time::interval((timeout / 4).max(Duration::from_millis(10)));
    loop {
        tick.tick().await;
        if let Some(age) = inflight.oldest_age() {
            if age > timeout {
                warn!(age_ms = age.as_millis() as u64, "Oldest delivery not acknowledged");
                context.terminate(format!(
                    "delivery not acknowledged within {} ms",
                    timeout.as_millis()
                ));
                return;
            }
        }
    }
}
