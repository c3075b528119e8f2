//! Wiring of one replication session.
//!
//! [`start`] resolves the start position, captures the schema and spawns
//! three tasks: the replicator, the dispatcher and the checkpoint writer.
//! The returned [`PipelineHandle`] stops them in dependency order so the
//! last checkpoint written is the last position the producer acknowledged.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::bootstrap::{Bootstrapper, SnapshotTableScanner, TableScanner};
use crate::buffer::SpillLimits;
use crate::checkpoint::{open_store, CheckpointStore, CheckpointWriter};
use crate::config::{Config, ProducerKind};
use crate::context::ReplicationContext;
use crate::dispatch::{DeliveryQueue, Dispatcher, InflightTracker};
use crate::filter::{ColumnFilter, TableFilter};
use crate::kafka::KafkaProducer;
use crate::position::Position;
use crate::producer::{Producer, StdoutProducer};
use crate::recovery::{resolve_start_position, StartPosition};
use crate::replicator::{Replicator, ReplicatorOptions, ReplicatorState};
use crate::schema::{JsonSchemaCapturer, SchemaCapturer, SchemaStore};
use crate::source::{JsonLinesSource, LogSource};
use crate::{Error, Result};

/// Collaborators a session runs against.
pub struct PipelineComponents {
    pub source: Box<dyn LogSource>,
    pub capturer: Arc<dyn SchemaCapturer>,
    pub producer: Arc<dyn Producer>,
    pub store: Arc<dyn CheckpointStore>,
    pub scanner: Option<Arc<dyn TableScanner>>,
}

impl PipelineComponents {
    /// Builds the bundled implementations selected by `config`.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let producer: Arc<dyn Producer> = match config.producer.kind {
            ProducerKind::Stdout => Arc::new(StdoutProducer::new(config.output.clone())),
            ProducerKind::Kafka => {
                let kafka = config.kafka.as_ref().ok_or_else(|| {
                    Error::Config("[kafka] section is required for the kafka producer".to_string())
                })?;
                Arc::new(KafkaProducer::new(
                    kafka,
                    &config.partition,
                    config.output.clone(),
                )?)
            }
        };

        Ok(Self {
            source: Box::new(JsonLinesSource::from_config(&config.source)),
            capturer: Arc::new(JsonSchemaCapturer::from_file(&config.schema.snapshot_path).await?),
            producer,
            store: open_store(&config.checkpoint).await?,
            scanner: config
                .bootstrap
                .rows_dir
                .as_ref()
                .map(|dir| Arc::new(SnapshotTableScanner::new(dir)) as Arc<dyn TableScanner>),
        })
    }
}

/// Overrides applied on top of the loaded configuration.
#[derive(Debug, Clone, Default)]
pub struct StartOverrides {
    pub start_position: Option<Position>,
    pub stop_at_heartbeat: Option<i64>,
}

/// Starts a session and returns once every task is running.
#[instrument(skip_all, fields(client_id = %config.replication.client_id))]
pub async fn start(config: &Config, components: PipelineComponents) -> Result<PipelineHandle> {
    start_with(config, components, StartOverrides::default()).await
}

pub async fn start_with(
    config: &Config,
    components: PipelineComponents,
    overrides: StartOverrides,
) -> Result<PipelineHandle> {
    let PipelineComponents {
        mut source,
        capturer,
        producer,
        store,
        scanner,
    } = components;
    let replication = &config.replication;
    let context = ReplicationContext::new(replication.ignore_producer_error);

    let mut start = resolve_start_position(
        store.as_ref(),
        source.as_mut(),
        &replication.client_id,
        config.start_position()?,
        replication.master_recovery,
    )
    .await?;
    if let Some(position) = overrides.start_position {
        info!(position = %position, "Start position overridden");
        start.position = position;
    }

    let schema = SchemaStore::capture(capturer.as_ref(), &config.schema.exclude_databases).await?;
    let filter = TableFilter::new(&config.filter.rules)?;
    let column_filter = match &config.filter.column_filter_file {
        Some(path) => ColumnFilter::load(path).await,
        None => ColumnFilter::default(),
    };

    let queue = Arc::new(DeliveryQueue::new(SpillLimits::from(&config.buffer)));
    let inflight = Arc::new(InflightTracker::new(config.producer.inflight_capacity));

    let mut options = ReplicatorOptions::from_config(config);
    if overrides.stop_at_heartbeat.is_some() {
        options.stop_at_heartbeat = overrides.stop_at_heartbeat;
    }
    let mut replicator = Replicator::new(
        source,
        schema,
        queue.clone(),
        context.clone(),
        options,
        start.position.clone(),
    )
    .with_filter(filter);
    if let Some(scanner) = scanner {
        replicator = replicator.with_bootstrapper(Bootstrapper::new(scanner));
    }
    replicator.start().await?;

    let stop = replicator.stop_token();
    let state = replicator.subscribe_state();

    let writer_stop = CancellationToken::new();
    let writer = CheckpointWriter::new(
        store,
        replication.client_id.clone(),
        start.server_id,
        Duration::from_millis(config.checkpoint.flush_interval_ms),
    )
    .with_stored(start.stored.clone());
    let writer = writer.run(context.subscribe_acknowledged(), writer_stop.clone());
    let writer_context = context.clone();
    let writer = tokio::spawn(async move {
        let result = writer.await;
        if let Err(e) = &result {
            // progress can no longer be recorded
            writer_context.terminate(format!("checkpoint writer failed: {}", e));
        }
        result
    });

    let ack_timeout = Duration::from_millis(config.producer.ack_timeout_ms);
    let dispatcher = Dispatcher::new(
        queue,
        producer.clone(),
        inflight,
        context.clone(),
        config.output.clone(),
    )
    .with_column_filter(column_filter)
    .with_ack_timeout(Some(ack_timeout));
    let dispatcher = tokio::spawn(dispatcher.run());

    let replicator = tokio::spawn(async move { replicator.run().await });

    info!(position = %start.position, source = ?start.source, "Pipeline started");
    Ok(PipelineHandle {
        context,
        stop,
        state,
        producer,
        start,
        replicator,
        dispatcher,
        writer,
        writer_stop,
    })
}

pub struct PipelineHandle {
    context: Arc<ReplicationContext>,
    stop: CancellationToken,
    state: watch::Receiver<ReplicatorState>,
    producer: Arc<dyn Producer>,
    start: StartPosition,
    replicator: JoinHandle<Result<()>>,
    dispatcher: JoinHandle<Result<()>>,
    writer: JoinHandle<Result<()>>,
    writer_stop: CancellationToken,
}

impl PipelineHandle {
    /// Asks the replicator to stop after the open transaction.
    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn state(&self) -> ReplicatorState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ReplicatorState> {
        self.state.clone()
    }

    pub fn context(&self) -> &Arc<ReplicationContext> {
        &self.context
    }

    pub fn start_position(&self) -> &StartPosition {
        &self.start
    }

    /// Runs until the session ends on its own or is stopped.
    ///
    /// Once a stop is requested, `stop_timeout` bounds how long the
    /// replicator may take to finish its open transaction, and then how
    /// long the producer may take to drain.
    pub async fn wait(self, stop_timeout: Duration) -> Result<()> {
        let aborts = self.abort_handles();
        let context = self.context.clone();
        match self.join(stop_timeout).await {
            Err(Error::Timeout { message }) => {
                abort_all(&aborts);
                context.terminate(format!("shutdown timed out: {}", message));
                Err(Error::Timeout { message })
            }
            other => other,
        }
    }

    /// Requests a stop and waits up to `timeout` for every task to finish;
    /// tasks still running then are aborted.
    #[instrument(skip(self))]
    pub async fn await_stop(self, timeout: Duration) -> Result<()> {
        self.request_stop();
        let aborts = self.abort_handles();
        let context = self.context.clone();

        match tokio::time::timeout(timeout, self.join(timeout)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Pipeline did not stop in time, aborting");
                abort_all(&aborts);
                context.terminate("pipeline did not stop within its timeout");
                Err(Error::Timeout {
                    message: format!("pipeline did not stop within {} ms", timeout.as_millis()),
                })
            }
        }
    }

    fn abort_handles(&self) -> Vec<AbortHandle> {
        vec![
            self.replicator.abort_handle(),
            self.dispatcher.abort_handle(),
            self.writer.abort_handle(),
        ]
    }

    async fn join(self, stop_timeout: Duration) -> Result<()> {
        let mut failure: Option<Error> = None;
        let mut record = |result: Result<()>, task: &str| {
            if let Err(e) = result {
                error!(task, error = %e, "Pipeline task failed");
                failure.get_or_insert(e);
            }
        };

        let mut replicator = self.replicator;
        let stopped = tokio::select! {
            result = &mut replicator => Some(joined(result)),
            _ = self.stop.cancelled() => {
                tokio::time::timeout(stop_timeout, &mut replicator)
                    .await
                    .ok()
                    .map(joined)
            }
        };
        match stopped {
            Some(result) => record(result, "replicator"),
            None => {
                warn!(
                    timeout_ms = stop_timeout.as_millis() as u64,
                    "Replicator did not stop in time, terminating"
                );
                self.context.terminate("replicator did not stop within its timeout");
                if tokio::time::timeout(stop_timeout, &mut replicator).await.is_err() {
                    replicator.abort();
                }
                record(
                    Err(Error::Timeout {
                        message: format!(
                            "replicator did not stop within {} ms",
                            stop_timeout.as_millis()
                        ),
                    }),
                    "replicator",
                );
            }
        }
        record(joined(self.dispatcher.await), "dispatcher");

        self.producer.request_stop();
        record(self.producer.await_stop(stop_timeout).await, "producer");

        self.writer_stop.cancel();
        record(joined(self.writer.await), "checkpoint writer");

        if let Some(e) = failure {
            return Err(e);
        }
        if let Some(cause) = self.context.termination_cause() {
            return Err(Error::Replication { message: cause });
        }
        info!(state = %*self.state.borrow(), "Pipeline stopped");
        Ok(())
    }
}

fn joined(result: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    result.map_err(|e| Error::Replication {
        message: format!("task panicked or was aborted: {}", e),
    })?
}

fn abort_all(handles: &[AbortHandle]) {
    for handle in handles {
        handle.abort();
    }
}
