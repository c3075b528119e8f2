use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

use super::Producer;
use crate::dispatch::Completion;
use crate::row::RowEvent;
use crate::{Error, Result};

#[derive(Debug, Default)]
struct Inner {
    rows: Vec<RowEvent>,
    failing_tables: HashSet<String>,
    failed: usize,
}

/// Keeps delivered rows in memory.
///
/// Cloning shares the same storage, so a test can keep a handle while the
/// pipeline owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryProducer {
    inner: Arc<Mutex<Inner>>,
    delivered: Arc<Notify>,
}

impl MemoryProducer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliveries for `database.table` fail from now on.
    pub fn fail_table(&self, database: &str, table: &str) {
        self.lock()
            .failing_tables
            .insert(format!("{}.{}", database, table));
    }

    pub fn rows(&self) -> Vec<RowEvent> {
        self.lock().rows.clone()
    }

    pub fn failed_count(&self) -> usize {
        self.lock().failed
    }

    /// Waits until at least `count` rows were delivered.
    pub async fn wait_for_rows(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let delivered = self.delivered.notified();
                if self.lock().rows.len() >= count {
                    return;
                }
                delivered.await;
            }
        })
        .await
        .is_ok()
    }
}

#[async_trait]
impl Producer for MemoryProducer {
    fn name(&self) -> &str {
        "memory"
    }

    async fn push(&self, row: RowEvent, completion: Completion) -> Result<()> {
        let key = format!("{}.{}", row.database, row.table_name());
        let fail = {
            let mut inner = self.lock();
            if inner.failing_tables.contains(&key) {
                inner.failed += 1;
                true
            } else {
                inner.rows.push(row);
                false
            }
        };

        if fail {
            completion.fail(Error::producer(format!("delivery to {} rejected", key)));
        } else {
            completion.complete();
            self.delivered.notify_waiters();
        }
        Ok(())
    }
}
