use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

use crate::buffer::{SpillBuffer, SpillLimits};
use crate::row::RowEvent;
use crate::Result;

/// Ordered hand-off between the replicator and the dispatcher.
///
/// Rows are appended in commit order by a single writer and consumed by a
/// single reader. Growth past the memory budget spills to disk, so a slow
/// sink never stalls log ingestion.
#[derive(Debug)]
pub struct DeliveryQueue {
    rows: Mutex<SpillBuffer>,
    available: Notify,
    closed: AtomicBool,
}

impl DeliveryQueue {
    pub fn new(limits: SpillLimits) -> Self {
        Self {
            rows: Mutex::new(SpillBuffer::new(limits)),
            available: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SpillBuffer> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, row: RowEvent) -> Result<()> {
        self.lock().push_back(row)?;
        self.available.notify_one();
        Ok(())
    }

    /// Next row, waiting for one; `None` once closed and drained.
    pub async fn pop(&self) -> Result<Option<RowEvent>> {
        loop {
            let available = self.available.notified();
            {
                let mut rows = self.lock();
                if !rows.is_empty() {
                    return rows.pop_front().map(Some);
                }
                if self.closed.load(Ordering::Acquire) {
                    return Ok(None);
                }
            }
            available.await;
        }
    }

    /// No more rows will be pushed.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.available.notify_waiters();
        self.available.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::tests::insert_row;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(DeliveryQueue::new(SpillLimits::elements(10)));

        let reader = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(insert_row("shop", "orders", 1000)).unwrap();

        let row = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(row.timestamp_millis, 1000);
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let dir = TempDir::new().unwrap();
        let queue = DeliveryQueue::new(SpillLimits {
            max_in_memory_elements: 1,
            max_memory_bytes: u64::MAX,
            spill_dir: Some(dir.path().to_path_buf()),
        });

        for ts in [1000, 2000, 3000] {
            queue.push(insert_row("shop", "orders", ts)).unwrap();
        }
        queue.close();

        let mut seen = Vec::new();
        while let Some(row) = queue.pop().await.unwrap() {
            seen.push(row.timestamp_millis);
        }
        assert_eq!(seen, vec![1000, 2000, 3000]);
        assert!(queue.is_closed());
    }
}
