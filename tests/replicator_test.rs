mod common;

use binlog_capture::bootstrap::{Bootstrapper, MemoryTableScanner};
use binlog_capture::buffer::SpillLimits;
use binlog_capture::context::ReplicationContext;
use binlog_capture::dispatch::DeliveryQueue;
use binlog_capture::filter::TableFilter;
use binlog_capture::replicator::{Replicator, ReplicatorOptions};
use binlog_capture::schema::SchemaStore;
use binlog_capture::{Position, ReplicatorState, RowEvent, RowKind};
use common::{position, test_schema, EventLog, ScriptedSource};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn options() -> ReplicatorOptions {
    ReplicatorOptions {
        client_id: "test-client".to_string(),
        retry_backoff: Duration::from_millis(1),
        max_retry_backoff: Duration::from_millis(5),
        buffer: SpillLimits::elements(2),
        ..ReplicatorOptions::default()
    }
}

fn replicator(source: ScriptedSource, options: ReplicatorOptions) -> (Replicator, Arc<DeliveryQueue>) {
    let queue = Arc::new(DeliveryQueue::new(SpillLimits::elements(1000)));
    let replicator = Replicator::new(
        Box::new(source),
        SchemaStore::new(test_schema(), &[]),
        queue.clone(),
        ReplicationContext::new(true),
        options,
        Position::new(position(4), 0),
    );
    (replicator, queue)
}

async fn run_to_end(mut replicator: Replicator, queue: &DeliveryQueue) -> (Replicator, Vec<RowEvent>) {
    replicator.start().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), replicator.run())
        .await
        .expect("replicator did not finish")
        .unwrap();

    let mut rows = Vec::new();
    while let Some(row) = queue.pop().await.unwrap() {
        rows.push(row);
    }
    (replicator, rows)
}

fn data_rows(rows: &[RowEvent]) -> Vec<(RowKind, i64)> {
    rows.iter()
        .filter(|r| r.kind.is_data())
        .map(|r| (r.kind, r.data["id"].as_i64().unwrap_or(-1)))
        .collect()
}

#[tokio::test]
async fn test_transactions_are_delivered_whole_and_in_order() {
    let mut log = EventLog::new();
    log.begin()
        .insert("shop", "orders", vec![json!(1), json!(10)])
        .insert("shop", "orders", vec![json!(2), json!(20)])
        .insert("shop", "orders", vec![json!(3), json!(30)])
        .commit(100)
        .begin()
        .update("shop", "orders", vec![json!(1), json!(10)], vec![json!(1), json!(11)])
        .delete("shop", "orders", vec![json!(2), json!(20)])
        .commit(101);

    let (replicator, queue) = replicator(ScriptedSource::new(&log), options());
    let (replicator, rows) = run_to_end(replicator, &queue).await;

    assert_eq!(replicator.state(), ReplicatorState::Stopped);
    assert_eq!(
        data_rows(&rows),
        vec![
            (RowKind::Insert, 1),
            (RowKind::Insert, 2),
            (RowKind::Insert, 3),
            (RowKind::Update, 1),
            (RowKind::Delete, 2),
        ]
    );

    let offsets: Vec<u32> = rows.iter().map(|r| r.transaction_offset).collect();
    assert_eq!(offsets, vec![0, 1, 2, 0, 1]);
    let commits: Vec<bool> = rows.iter().map(|r| r.tx_commit).collect();
    assert_eq!(commits, vec![false, false, true, false, true]);
    assert_eq!(rows[2].transaction_id, Some(100));
    assert_eq!(rows[4].transaction_id, Some(101));
    assert_eq!(rows[4].next_position.binlog(), &log.head());
    assert_eq!(rows[3].old_data, json!({"total": 10}).as_object().unwrap().clone());
}

#[tokio::test]
async fn test_rolled_back_transaction_is_never_delivered() {
    let mut log = EventLog::new();
    log.begin()
        .insert("shop", "orders", vec![json!(1), json!(10)])
        .insert("shop", "orders", vec![json!(2), json!(20)])
        .insert("shop", "orders", vec![json!(3), json!(30)])
        .rollback()
        .begin()
        .insert("shop", "orders", vec![json!(4), json!(40)])
        .commit(7);

    let (replicator, queue) = replicator(ScriptedSource::new(&log), options());
    let (_, rows) = run_to_end(replicator, &queue).await;

    assert_eq!(data_rows(&rows), vec![(RowKind::Insert, 4)]);
    assert_eq!(rows[0].transaction_offset, 0);
}

#[tokio::test]
async fn test_stop_at_heartbeat() {
    let mut log = EventLog::new();
    log.heartbeat(1)
        .begin()
        .insert("shop", "orders", vec![json!(1), json!(10)])
        .commit(1)
        .heartbeat(2)
        .begin()
        .insert("shop", "orders", vec![json!(2), json!(20)])
        .commit(2);

    let options = ReplicatorOptions {
        stop_at_heartbeat: Some(2),
        ..options()
    };
    let (replicator, queue) = replicator(ScriptedSource::new(&log).hold_open(), options);
    let mut states = replicator.subscribe_state();
    let (replicator, rows) = run_to_end(replicator, &queue).await;

    assert_eq!(replicator.state(), ReplicatorState::Stopped);
    assert_eq!(*states.borrow_and_update(), ReplicatorState::Stopped);
    assert_eq!(data_rows(&rows), vec![(RowKind::Insert, 1)]);
    assert_eq!(replicator.position().last_heartbeat_read(), 2);
    assert_eq!(rows.last().map(|r| r.kind), Some(RowKind::Heartbeat));
}

#[tokio::test]
async fn test_stop_request_waits_for_open_transaction() {
    let mut log = EventLog::new();
    log.begin()
        .insert("shop", "orders", vec![json!(1), json!(10)])
        .insert("shop", "orders", vec![json!(2), json!(20)])
        .commit(1)
        .begin()
        .insert("shop", "orders", vec![json!(3), json!(30)])
        .commit(2);

    let queue = Arc::new(DeliveryQueue::new(SpillLimits::elements(100)));
    let stop = tokio_util::sync::CancellationToken::new();
    // stop is requested while the first transaction is open
    let source = ScriptedSource::new(&log).hold_open().cancel_after(1, stop.clone());
    let replicator = Replicator::new(
        Box::new(source),
        SchemaStore::new(test_schema(), &[]),
        queue.clone(),
        ReplicationContext::new(true),
        options(),
        Position::new(position(4), 0),
    );
    let forward = replicator.stop_token();
    tokio::spawn(async move {
        stop.cancelled().await;
        forward.cancel();
    });

    let (replicator, rows) = run_to_end(replicator, &queue).await;
    assert_eq!(replicator.state(), ReplicatorState::Stopped);
    assert_eq!(data_rows(&rows), vec![(RowKind::Insert, 1), (RowKind::Insert, 2)]);
    assert!(rows[1].tx_commit);
    assert_eq!(replicator.position().binlog(), &log.events()[3].next_position);
}

#[tokio::test]
async fn test_transient_error_rereads_open_transaction() {
    let mut log = EventLog::new();
    log.begin()
        .insert("shop", "orders", vec![json!(1), json!(10)])
        .commit(1)
        .begin()
        .insert("shop", "orders", vec![json!(2), json!(20)])
        .insert("shop", "orders", vec![json!(3), json!(30)])
        .commit(2);

    // fails while reading the second insert of the second transaction
    let source = ScriptedSource::new(&log).fail_once_at(5);
    let handle = source.clone();
    let (replicator, queue) = replicator(source, options());
    let (_, rows) = run_to_end(replicator, &queue).await;

    assert_eq!(
        data_rows(&rows),
        vec![(RowKind::Insert, 1), (RowKind::Insert, 2), (RowKind::Insert, 3)]
    );
    let seeks = handle.seeks();
    assert_eq!(seeks.len(), 2);
    assert_eq!(seeks[1], log.events()[3].position);
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let mut log = EventLog::new();
    log.begin()
        .insert("shop", "orders", vec![json!(1), json!(10)])
        .commit(1);

    let source = ScriptedSource::new(&log)
        .fail_once_at(0)
        .fail_once_at(0)
        .fail_once_at(0);
    let options = ReplicatorOptions {
        max_retries: 2,
        ..options()
    };
    let (mut replicator, _queue) = replicator(source, options);
    replicator.start().await.unwrap();

    let err = replicator.run().await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(replicator.state(), ReplicatorState::Failed);
}

#[tokio::test]
async fn test_unknown_table_fails_replication() {
    let mut log = EventLog::new();
    log.begin()
        .insert("shop", "invoices", vec![json!(1)])
        .commit(1);

    let queue = Arc::new(DeliveryQueue::new(SpillLimits::elements(10)));
    let context = ReplicationContext::new(true);
    let mut replicator = Replicator::new(
        Box::new(ScriptedSource::new(&log)),
        SchemaStore::new(test_schema(), &[]),
        queue.clone(),
        context.clone(),
        options(),
        Position::new(position(4), 0),
    );
    replicator.start().await.unwrap();

    let err = replicator.run().await.unwrap_err();
    assert!(err.is_schema_desync());
    assert_eq!(replicator.state(), ReplicatorState::Failed);
    assert!(context.is_terminated());
    assert!(context.termination_cause().unwrap().contains("invoices"));
    assert!(queue.is_closed());
}

#[tokio::test]
async fn test_filtered_tables_and_ignored_statements() {
    let mut log = EventLog::new();
    log.begin()
        .query("shop", "SAVEPOINT before_users")
        .insert("shop", "users", vec![json!(1), json!("ann"), json!("secret")])
        .insert("shop", "orders", vec![json!(1), json!(10)])
        .query("shop", "DROP TEMPORARY TABLE IF EXISTS scratch")
        .commit(1);

    let (replicator, queue) = replicator(ScriptedSource::new(&log), options());
    let replicator = replicator.with_filter(TableFilter::new(&["exclude: shop.users"]).unwrap());
    let (_, rows) = run_to_end(replicator, &queue).await;

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].table.as_deref(), Some("orders"));
    assert!(rows[0].tx_commit);
}

#[tokio::test]
async fn test_ddl_changes_schema_mid_stream() {
    let mut log = EventLog::new();
    log.query("shop", "ALTER TABLE orders ADD COLUMN status VARCHAR(16) AFTER id")
        .begin()
        .insert("shop", "orders", vec![json!(1), json!("new"), json!(10)])
        .commit(1)
        .query("shop", "CREATE TABLE refunds (id INT PRIMARY KEY, amount INT)")
        .begin()
        .insert("shop", "refunds", vec![json!(5), json!(3)])
        .commit(2);

    let (replicator, queue) = replicator(ScriptedSource::new(&log), options());
    let (replicator, rows) = run_to_end(replicator, &queue).await;

    let kinds: Vec<RowKind> = rows.iter().map(|r| r.kind).collect();
    assert_eq!(
        kinds,
        vec![RowKind::Ddl, RowKind::Insert, RowKind::Ddl, RowKind::Insert]
    );
    assert!(rows[0].tx_commit);
    assert_eq!(rows[1].data["status"], json!("new"));
    assert_eq!(rows[1].data["total"], json!(10));
    assert_eq!(rows[3].primary_key_columns, vec!["id"]);
    assert_eq!(rows[3].schema_version, replicator.schema().version());
}

#[tokio::test]
async fn test_bootstrap_request_emits_table_snapshot() {
    let mut log = EventLog::new();
    log.begin()
        .insert(
            "binlog_capture",
            "bootstrap",
            vec![json!(1), json!("shop"), json!("users"), json!(null)],
        )
        .commit(1)
        .begin()
        .insert("shop", "orders", vec![json!(9), json!(90)])
        .commit(2);

    let scanner = MemoryTableScanner::new().with_table(
        "shop",
        "users",
        vec![
            vec![json!(1), json!("ann"), json!("x")],
            vec![json!(2), json!("bob"), json!("y")],
        ],
    );
    let (replicator, queue) = replicator(ScriptedSource::new(&log), options());
    let replicator = replicator.with_bootstrapper(Bootstrapper::new(Arc::new(scanner)));
    let (_, rows) = run_to_end(replicator, &queue).await;

    let kinds: Vec<RowKind> = rows.iter().map(|r| r.kind).collect();
    assert_eq!(
        kinds,
        vec![
            RowKind::Commit,
            RowKind::BootstrapStart,
            RowKind::BootstrapInsert,
            RowKind::BootstrapInsert,
            RowKind::BootstrapComplete,
            RowKind::Commit,
            RowKind::Insert,
        ]
    );
    assert!(rows.iter().all(|r| r.database != "binlog_capture"));
    assert_eq!(rows[2].data["name"], json!("ann"));

    // the request only checkpoints past itself once the snapshot is out
    let events = log.events();
    assert!(rows[0].tx_commit);
    assert_eq!(rows[0].next_position.binlog(), &events[0].position);
    assert!(rows[1..5].iter().all(|r| !r.tx_commit));
    assert!(rows[5].tx_commit);
    assert_eq!(rows[5].next_position.binlog(), &events[2].next_position);
}

#[tokio::test]
async fn test_bootstrap_of_excluded_table_does_not_hold_checkpoint() {
    let mut log = EventLog::new();
    log.begin()
        .insert(
            "binlog_capture",
            "bootstrap",
            vec![json!(1), json!("shop"), json!("users"), json!(null)],
        )
        .commit(1);

    let (replicator, queue) = replicator(ScriptedSource::new(&log), options());
    let replicator = replicator
        .with_filter(TableFilter::new(&["exclude: shop.users"]).unwrap())
        .with_bootstrapper(Bootstrapper::new(Arc::new(MemoryTableScanner::new())));
    let (_, rows) = run_to_end(replicator, &queue).await;

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].kind, RowKind::Commit);
    assert_eq!(rows[0].next_position.binlog(), &log.events()[2].next_position);
}
