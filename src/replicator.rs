//! The replication state machine.
//!
//! A [`Replicator`] reads raw events from a [`LogSource`], resolves row
//! images against the [`SchemaStore`], collects the rows of the open
//! transaction in a [`RowBuffer`] and hands each committed transaction to
//! the [`DeliveryQueue`] as one contiguous run of rows.
//!
//! ```text
//! STARTING -> RUNNING -> STOPPING -> STOPPED
//!                 \          \
//!                  +----------+--> FAILED
//! ```
//!
//! A stop request (explicit, end of a finite log, or a reached heartbeat
//! target) never cuts a transaction: the replicator keeps reading until the
//! open transaction commits or rolls back.

use serde_json::Map;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::bootstrap::{BootstrapRequest, Bootstrapper, BOOTSTRAP_TABLE};
use crate::buffer::{RowBuffer, SpillLimits};
use crate::config::Config;
use crate::context::ReplicationContext;
use crate::dispatch::DeliveryQueue;
use crate::filter::TableFilter;
use crate::position::{BinlogPosition, Position};
use crate::row::{RowEvent, RowKind};
use crate::schema::ddl::{is_schema_statement, strip_leading_comments};
use crate::schema::{SchemaChange, SchemaStore};
use crate::source::{LogSource, RawEvent, RawEventKind, RawRow, RowOp};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for ReplicatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReplicatorState::Starting => "STARTING",
            ReplicatorState::Running => "RUNNING",
            ReplicatorState::Stopping => "STOPPING",
            ReplicatorState::Stopped => "STOPPED",
            ReplicatorState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct ReplicatorOptions {
    pub client_id: String,
    /// Database of the internal control tables; never forwarded as data.
    pub schema_database: String,
    pub stop_at_heartbeat: Option<i64>,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub max_retry_backoff: Duration,
    pub buffer: SpillLimits,
}

impl ReplicatorOptions {
    pub fn from_config(config: &Config) -> Self {
        let replication = &config.replication;
        Self {
            client_id: replication.client_id.clone(),
            schema_database: replication.schema_database.clone(),
            stop_at_heartbeat: replication.stop_at_heartbeat,
            max_retries: replication.max_retries,
            retry_backoff: Duration::from_millis(replication.retry_backoff_ms),
            max_retry_backoff: Duration::from_millis(replication.max_retry_backoff_ms),
            buffer: SpillLimits::from(&config.buffer),
        }
    }
}

impl Default for ReplicatorOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Statement events that are not DDL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryKind {
    Begin,
    Commit,
    Rollback,
    Ignored,
    Ddl,
    Other,
}

fn classify_query(sql: &str) -> QueryKind {
    let stripped = strip_leading_comments(sql).trim_end().trim_end_matches(';');
    let upper = stripped.to_ascii_uppercase();

    if upper.is_empty() {
        // MariaDB dummy events are bare comments
        return QueryKind::Ignored;
    }
    match upper.as_str() {
        "BEGIN" | "START TRANSACTION" | "XA START" => return QueryKind::Begin,
        "COMMIT" => return QueryKind::Commit,
        "ROLLBACK" => return QueryKind::Rollback,
        _ => {}
    }

    const IGNORED_PREFIXES: &[&str] = &[
        "SAVEPOINT",
        "ROLLBACK TO",
        "RELEASE SAVEPOINT",
        "DROP TEMPORARY TABLE",
        "INSERT INTO MYSQL.RDS_",
        "DELETE FROM MYSQL.RDS_",
        "UPDATE MYSQL.RDS_",
        "INSERT INTO MYSQL.HA_HEALTH_CHECK",
        "FLUSH",
    ];
    if IGNORED_PREFIXES.iter().any(|p| upper.starts_with(p)) {
        return QueryKind::Ignored;
    }

    if is_schema_statement(stripped) {
        QueryKind::Ddl
    } else {
        QueryKind::Other
    }
}

struct Transaction {
    rows: RowBuffer,
    /// Where re-reading the transaction starts after a reconnect.
    begin: BinlogPosition,
}

enum Step {
    Terminated,
    StopRequested,
    Event(Result<Option<RawEvent>>),
}

pub struct Replicator {
    source: Box<dyn LogSource>,
    schema: SchemaStore,
    filter: TableFilter,
    queue: Arc<DeliveryQueue>,
    context: Arc<ReplicationContext>,
    bootstrapper: Option<Bootstrapper>,
    options: ReplicatorOptions,
    state: watch::Sender<ReplicatorState>,
    stop: CancellationToken,
    /// Position of the next event to read, with the last heartbeat seen.
    position: Position,
    server_id: u64,
    transaction: Option<Transaction>,
    pending_heartbeat: Option<RowEvent>,
    pending_bootstrap: Vec<BootstrapRequest>,
    resume_at: Option<BinlogPosition>,
}

impl Replicator {
    pub fn new(
        source: Box<dyn LogSource>,
        schema: SchemaStore,
        queue: Arc<DeliveryQueue>,
        context: Arc<ReplicationContext>,
        options: ReplicatorOptions,
        start: Position,
    ) -> Self {
        let (state, _) = watch::channel(ReplicatorState::Starting);
        Self {
            source,
            schema,
            filter: TableFilter::default(),
            queue,
            context,
            bootstrapper: None,
            options,
            state,
            stop: CancellationToken::new(),
            position: start,
            server_id: 0,
            transaction: None,
            pending_heartbeat: None,
            pending_bootstrap: Vec::new(),
            resume_at: None,
        }
    }

    pub fn with_filter(mut self, filter: TableFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_bootstrapper(mut self, bootstrapper: Bootstrapper) -> Self {
        self.bootstrapper = Some(bootstrapper);
        self
    }

    pub fn state(&self) -> ReplicatorState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ReplicatorState> {
        self.state.subscribe()
    }

    /// Token that requests a graceful stop when cancelled.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    pub fn position(&self) -> &Position {
        &self.position
    }

    pub fn schema(&self) -> &SchemaStore {
        &self.schema
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    fn set_state(&self, next: ReplicatorState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, position = %self.position, "Replicator state changed");
        }
    }

    /// Positions the source at the start position.
    #[instrument(skip(self), fields(position = %self.position))]
    pub async fn start(&mut self) -> Result<()> {
        let start = self.position.binlog().clone();
        let opened = async {
            self.server_id = self.source.server_id().await?;
            self.source.seek(&start).await
        }
        .await;

        if let Err(e) = opened {
            self.set_state(ReplicatorState::Failed);
            return Err(e);
        }
        info!(server_id = self.server_id, "Replicator started");
        Ok(())
    }

    /// Runs until stopped, the log ends, or a fatal error.
    pub async fn run(&mut self) -> Result<()> {
        let terminate = self.context.cancellation_token();
        let stop = self.stop.clone();
        self.set_state(ReplicatorState::Running);

        let mut attempts = 0u32;
        let mut terminated = false;
        let result = loop {
            if self.state() == ReplicatorState::Stopped {
                break Ok(());
            }

            if let Some(target) = self.resume_at.clone() {
                match self.source.seek(&target).await {
                    Ok(()) => self.resume_at = None,
                    Err(e) => {
                        if let Err(e) = self.retry_source(e, &mut attempts, &terminate).await {
                            break Err(e);
                        }
                    }
                }
                continue;
            }

            let running = self.state() == ReplicatorState::Running;
            let step = tokio::select! {
                biased;
                _ = terminate.cancelled() => Step::Terminated,
                _ = stop.cancelled(), if running => Step::StopRequested,
                event = self.source.next_event() => Step::Event(event),
            };

            match step {
                Step::Terminated => {
                    info!(
                        cause = self.context.termination_cause().as_deref().unwrap_or("unknown"),
                        "Replication terminated, stopping replicator"
                    );
                    terminated = true;
                    break Ok(());
                }
                Step::StopRequested => self.begin_stop("stop requested"),
                Step::Event(Ok(Some(event))) => {
                    attempts = 0;
                    if let Err(e) = self.process_event(event).await {
                        break Err(e);
                    }
                }
                Step::Event(Ok(None)) => {
                    if let Some(transaction) = self.transaction.take() {
                        warn!(
                            rows = transaction.rows.size(),
                            "Log ended inside a transaction, discarding it"
                        );
                    }
                    self.begin_stop("end of log");
                }
                Step::Event(Err(e)) => {
                    if let Err(e) = self.retry_source(e, &mut attempts, &terminate).await {
                        break Err(e);
                    }
                }
            }
        };

        self.queue.close();
        if let Err(e) = self.source.close().await {
            warn!(error = %e, "Failed to close log source");
        }

        match result {
            Ok(()) if terminated => {
                self.set_state(ReplicatorState::Failed);
                Ok(())
            }
            Ok(()) => {
                self.set_state(ReplicatorState::Stopped);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, position = %self.position, "Replicator failed");
                self.set_state(ReplicatorState::Failed);
                self.context.terminate(format!("replicator failed at {}: {}", self.position, e));
                Err(e)
            }
        }
    }

    /// Schedules a reconnect for transient errors within the retry budget.
    async fn retry_source(
        &mut self,
        error: Error,
        attempts: &mut u32,
        terminate: &CancellationToken,
    ) -> Result<()> {
        if !error.is_transient() || *attempts >= self.options.max_retries {
            return Err(error);
        }
        *attempts += 1;

        let backoff = self
            .options
            .retry_backoff
            .saturating_mul(1 << (*attempts - 1).min(16))
            .min(self.options.max_retry_backoff);
        warn!(
            attempt = *attempts,
            max_retries = self.options.max_retries,
            backoff_ms = backoff.as_millis() as u64,
            error = %error,
            "Transient log source error, reconnecting"
        );

        tokio::select! {
            _ = terminate.cancelled() => {}
            _ = tokio::time::sleep(backoff) => {}
        }

        // a half-read transaction is read again from its start
        let resume = match self.transaction.take() {
            Some(transaction) => {
                debug!(rows = transaction.rows.size(), "Discarding partially read transaction");
                self.pending_bootstrap.clear();
                transaction.begin
            }
            None => self.position.binlog().clone(),
        };
        self.position = Position::new(resume.clone(), self.position.last_heartbeat_read());
        self.resume_at = Some(resume);
        Ok(())
    }

    fn begin_stop(&self, reason: &str) {
        if self.state() == ReplicatorState::Running {
            info!(reason, in_transaction = self.transaction.is_some(), "Stopping replicator");
            self.set_state(ReplicatorState::Stopping);
        }
        self.finish_if_stopping();
    }

    fn finish_if_stopping(&self) {
        if self.state() == ReplicatorState::Stopping && self.transaction.is_none() {
            self.set_state(ReplicatorState::Stopped);
        }
    }

    /// Applies one raw event.
    pub async fn process_event(&mut self, event: RawEvent) -> Result<()> {
        self.server_id = event.server_id;

        match &event.kind {
            RawEventKind::Begin => self.open_transaction(&event.position),
            RawEventKind::Rows {
                op,
                database,
                table,
                rows,
            } => self.handle_rows(*op, database, table, rows, &event).await?,
            RawEventKind::Commit { xid } => self.commit(Some(*xid), &event).await?,
            RawEventKind::Rollback => self.rollback(&event)?,
            RawEventKind::Query { database, sql } => self.handle_query(database, sql, &event).await?,
            RawEventKind::Heartbeat { heartbeat } => self.handle_heartbeat(*heartbeat, &event)?,
        }

        self.position = Position::new(
            event.next_position.clone(),
            self.position.last_heartbeat_read(),
        );
        self.finish_if_stopping();
        Ok(())
    }

    fn positions(&self, event: &RawEvent) -> (Position, Position) {
        let heartbeat = self.position.last_heartbeat_read();
        (
            Position::new(event.position.clone(), heartbeat),
            Position::new(event.next_position.clone(), heartbeat),
        )
    }

    fn open_transaction(&mut self, at: &BinlogPosition) {
        if self.transaction.is_some() {
            warn!(position = %at, "BEGIN inside an open transaction, keeping the open one");
            return;
        }
        self.transaction = Some(Transaction {
            rows: RowBuffer::new(self.options.buffer.clone()),
            begin: at.clone(),
        });
    }

    async fn handle_rows(
        &mut self,
        op: RowOp,
        database: &str,
        table: &str,
        rows: &[RawRow],
        event: &RawEvent,
    ) -> Result<()> {
        if database == self.options.schema_database {
            return self.handle_control_rows(op, database, table, rows, event).await;
        }
        if self.schema.is_excluded(database) || !self.filter.includes(database, table) {
            debug!(database, table, "Skipping rows of excluded table");
            return Ok(());
        }

        let resolved = self.resolve_rows(op, database, table, rows, event)?;

        if self.transaction.is_none() {
            warn!(position = %event.position, "Row event outside a transaction, starting one implicitly");
            self.open_transaction(&event.position);
        }
        if let Some(transaction) = self.transaction.as_mut() {
            for row in resolved {
                transaction.rows.add(row)?;
            }
        }
        Ok(())
    }

    fn resolve_rows(
        &self,
        op: RowOp,
        database: &str,
        table: &str,
        rows: &[RawRow],
        event: &RawEvent,
    ) -> Result<Vec<RowEvent>> {
        let definition = self
            .schema
            .table(database, table)
            .ok_or_else(|| Error::UnknownTable {
                database: database.to_string(),
                table: table.to_string(),
            })?;
        let primary_key = definition.primary_key.clone();
        let version = self.schema.version();
        let (position, next_position) = self.positions(event);

        let image = |values: &Option<Vec<serde_json::Value>>, which: &str| {
            let values = values.as_ref().ok_or_else(|| Error::InvalidMessage {
                message: format!(
                    "{} row event for {}.{} at {} has no {} image",
                    format!("{:?}", op).to_lowercase(),
                    database,
                    table,
                    event.position,
                    which
                ),
            })?;
            self.schema.resolve(database, table, values)
        };

        rows.iter()
            .map(|raw| {
                let (kind, data, old_data) = match op {
                    RowOp::Insert => (RowKind::Insert, image(&raw.after, "after")?, Map::new()),
                    RowOp::Delete => (RowKind::Delete, image(&raw.before, "before")?, Map::new()),
                    RowOp::Update => {
                        let after = image(&raw.after, "after")?;
                        let before = image(&raw.before, "before")?;
                        let old: Map<String, serde_json::Value> = before
                            .into_iter()
                            .filter(|(column, value)| after.get(column) != Some(value))
                            .collect();
                        (RowKind::Update, after, old)
                    }
                };

                let mut row = RowEvent::new(
                    kind,
                    database,
                    Some(table.to_string()),
                    event.timestamp_millis,
                    position.clone(),
                    next_position.clone(),
                )
                .with_primary_key(primary_key.clone());
                row.data = data;
                row.old_data = old_data;
                row.schema_version = version;
                Ok(row)
            })
            .collect()
    }

    async fn handle_control_rows(
        &mut self,
        op: RowOp,
        database: &str,
        table: &str,
        rows: &[RawRow],
        event: &RawEvent,
    ) -> Result<()> {
        if table != BOOTSTRAP_TABLE || op != RowOp::Insert {
            debug!(database, table, "Ignoring write to control table");
            return Ok(());
        }

        for row in self.resolve_rows(op, database, table, rows, event)? {
            if let Some(request) = BootstrapRequest::from_row(&row, &self.options.client_id)? {
                info!(database = %request.database, table = %request.table, "Bootstrap requested");
                self.pending_bootstrap.push(request);
            }
        }

        if self.transaction.is_none() {
            let (_, next_position) = self.positions(event);
            self.run_bootstraps(&next_position, event.timestamp_millis).await?;
        }
        Ok(())
    }

    /// Whether the open transaction carries a request that will be run.
    fn bootstrap_pending(&self) -> bool {
        self.bootstrapper.is_some()
            && self
                .pending_bootstrap
                .iter()
                .any(|request| self.filter.includes(&request.database, &request.table))
    }

    /// Runs the pending requests, then releases the checkpoint held at the
    /// requesting transaction with a commit marker at `position`.
    async fn run_bootstraps(&mut self, position: &Position, timestamp_millis: i64) -> Result<()> {
        let requests = std::mem::take(&mut self.pending_bootstrap);
        let Some(bootstrapper) = &self.bootstrapper else {
            if !requests.is_empty() {
                warn!(requests = requests.len(), "Bootstrap requested but no table scanner is configured");
            }
            return Ok(());
        };

        let mut ran = 0usize;
        for request in requests {
            if !self.filter.includes(&request.database, &request.table) {
                warn!(database = %request.database, table = %request.table, "Bootstrap of excluded table skipped");
                continue;
            }
            bootstrapper
                .run(&request, &self.schema, position, &self.queue)
                .await?;
            ran += 1;
        }

        if ran > 0 {
            let mut marker = RowEvent::new(
                RowKind::Commit,
                String::new(),
                None,
                timestamp_millis,
                position.clone(),
                position.clone(),
            );
            marker.server_id = Some(self.server_id);
            marker.tx_commit = true;
            self.queue.push(marker)?;
        }
        Ok(())
    }

    async fn commit(&mut self, xid: Option<u64>, event: &RawEvent) -> Result<()> {
        let (position, next_position) = self.positions(event);
        let hold = self.bootstrap_pending();

        let (mut rows, begin) = match self.transaction.take() {
            Some(transaction) => (transaction.rows, transaction.begin),
            None => {
                debug!(position = %event.position, "Commit without an open transaction");
                (RowBuffer::new(SpillLimits::elements(1)), event.position.clone())
            }
        };
        // until its bootstrap rows are acknowledged, a request is re-read on restart
        let checkpoint = if hold {
            Position::new(begin, next_position.last_heartbeat_read())
        } else {
            next_position.clone()
        };
        rows.set_xid(xid);
        rows.set_server_id(self.server_id);

        let delivered = rows.size();
        if rows.is_empty() {
            let mut marker = RowEvent::new(
                RowKind::Commit,
                String::new(),
                None,
                event.timestamp_millis,
                position,
                checkpoint,
            );
            marker.transaction_id = xid;
            marker.server_id = Some(self.server_id);
            marker.tx_commit = true;
            self.queue.push(marker)?;
        } else {
            let mut row = rows.remove_first()?;
            while !rows.is_empty() {
                let next = rows.remove_first()?;
                self.queue.push(std::mem::replace(&mut row, next))?;
            }
            row.tx_commit = true;
            row.next_position = checkpoint;
            self.queue.push(row)?;
        }
        debug!(xid = ?xid, rows = delivered, position = %next_position, "Transaction committed");

        self.run_bootstraps(&next_position, event.timestamp_millis).await?;
        if let Some(mut heartbeat) = self.pending_heartbeat.take() {
            heartbeat.position = next_position.clone();
            heartbeat.next_position = next_position;
            self.emit_heartbeat(heartbeat)?;
        }
        Ok(())
    }

    fn rollback(&mut self, event: &RawEvent) -> Result<()> {
        if let Some(transaction) = self.transaction.take() {
            debug!(rows = transaction.rows.size(), "Transaction rolled back, discarding rows");
        }
        self.pending_bootstrap.clear();
        // a deferred heartbeat must not checkpoint inside the discarded transaction
        if let Some(mut heartbeat) = self.pending_heartbeat.take() {
            let (_, next_position) = self.positions(event);
            heartbeat.position = next_position.clone();
            heartbeat.next_position = next_position;
            self.emit_heartbeat(heartbeat)?;
        }
        Ok(())
    }

    async fn handle_query(&mut self, database: &str, sql: &str, event: &RawEvent) -> Result<()> {
        match classify_query(sql) {
            QueryKind::Begin => self.open_transaction(&event.position),
            QueryKind::Commit => self.commit(None, event).await?,
            QueryKind::Rollback => self.rollback(event)?,
            QueryKind::Ignored => debug!(sql, "Ignoring statement"),
            QueryKind::Other => debug!(sql, "Skipping non-schema statement"),
            QueryKind::Ddl => self.apply_ddl(database, sql, event)?,
        }
        Ok(())
    }

    fn apply_ddl(&mut self, database: &str, sql: &str, event: &RawEvent) -> Result<()> {
        let changes = self.schema.apply_ddl(database, sql)?;
        if changes.is_empty() {
            return Ok(());
        }

        let version = self.schema.version();
        let (position, next_position) = self.positions(event);
        let mut rows: Vec<RowEvent> = changes
            .iter()
            .filter(|change| self.ddl_is_replicated(change))
            .map(|change| {
                let mut row = RowEvent::ddl(
                    &change.database,
                    change.table.clone(),
                    sql,
                    event.timestamp_millis,
                    position.clone(),
                    next_position.clone(),
                );
                row.schema_version = version;
                row.server_id = Some(self.server_id);
                row.data
                    .insert("change".to_string(), change.kind.as_str().into());
                if let Some((old_database, old_table)) = &change.renamed_from {
                    row.data.insert(
                        "renamed_from".to_string(),
                        format!("{}.{}", old_database, old_table).into(),
                    );
                }
                row
            })
            .collect();
        info!(
            database,
            changes = changes.len(),
            emitted = rows.len(),
            version,
            "Applied schema change"
        );

        if let Some(transaction) = self.transaction.as_mut() {
            for row in rows {
                transaction.rows.add(row)?;
            }
            return Ok(());
        }

        match rows.last_mut() {
            Some(last) => last.tx_commit = true,
            None => {
                let mut marker = RowEvent::new(
                    RowKind::Commit,
                    database,
                    None,
                    event.timestamp_millis,
                    position,
                    next_position,
                );
                marker.tx_commit = true;
                rows.push(marker);
            }
        }
        for row in rows {
            self.queue.push(row)?;
        }
        Ok(())
    }

    fn ddl_is_replicated(&self, change: &SchemaChange) -> bool {
        match &change.table {
            Some(table) => self.filter.includes(&change.database, table),
            None => self.filter.includes_database(&change.database),
        }
    }

    fn handle_heartbeat(&mut self, heartbeat: i64, event: &RawEvent) -> Result<()> {
        let last = self.position.last_heartbeat_read().max(heartbeat);
        self.position = self.position.with_heartbeat(last);

        let (position, next_position) = self.positions(event);
        let mut row = RowEvent::heartbeat(
            &self.options.schema_database,
            event.timestamp_millis,
            position,
            next_position,
        );
        row.data.insert("heartbeat".to_string(), heartbeat.into());
        row.server_id = Some(self.server_id);
        row.tx_commit = true;

        if self.transaction.is_some() {
            debug!(heartbeat, "Heartbeat inside a transaction, deferring it");
            self.pending_heartbeat = Some(row);
            return Ok(());
        }
        self.emit_heartbeat(row)
    }

    fn emit_heartbeat(&mut self, row: RowEvent) -> Result<()> {
        let heartbeat = row
            .data
            .get("heartbeat")
            .and_then(|v| v.as_i64())
            .unwrap_or_else(|| row.next_position.last_heartbeat_read());
        self.queue.push(row)?;

        if let Some(target) = self.options.stop_at_heartbeat {
            if heartbeat >= target {
                info!(heartbeat, target, "Heartbeat target reached");
                self.begin_stop("heartbeat target reached");
            }
        }
        Ok(())
    }
}
