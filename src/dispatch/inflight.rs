//! In-flight delivery bookkeeping.
//!
//! Sinks may acknowledge deliveries out of order. The tracker keeps every
//! unacknowledged delivery in dispatch order and only reports a position
//! once all deliveries before it are acknowledged too, so the checkpoint
//! never moves past a delivery that might still fail.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::context::ReplicationContext;
use crate::position::Position;
use crate::{Error, Result};

#[derive(Debug)]
struct Entry {
    id: u64,
    position: Option<Position>,
    sent_at: Instant,
    done: bool,
}

#[derive(Debug, Default)]
struct Inner {
    entries: VecDeque<Entry>,
    next_id: u64,
}

#[derive(Debug)]
pub struct InflightTracker {
    inner: Mutex<Inner>,
    changed: Notify,
    capacity: usize,
}

impl InflightTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            changed: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // entries stay consistent even if a holder panicked
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a delivery, waiting while `capacity` deliveries are pending.
    ///
    /// `position` is set for rows whose acknowledgement makes their
    /// position safe to checkpoint.
    pub async fn acquire(
        &self,
        position: Option<Position>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        loop {
            let changed = self.changed.notified();
            {
                let mut inner = self.lock();
                if inner.entries.len() < self.capacity {
                    let id = inner.next_id;
                    inner.next_id += 1;
                    inner.entries.push_back(Entry {
                        id,
                        position,
                        sent_at: Instant::now(),
                        done: false,
                    });
                    return Ok(id);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Shutdown),
                _ = changed => {}
            }
        }
    }

    /// Marks `id` acknowledged and returns the newest checkpointable
    /// position that became safe, if any.
    pub fn complete(&self, id: u64) -> Option<Position> {
        let mut inner = self.lock();
        match inner.entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => entry.done = true,
            None => {
                warn!(id, "Acknowledgement for unknown delivery");
                return None;
            }
        }

        let mut safe = None;
        while inner.entries.front().is_some_and(|e| e.done) {
            if let Some(entry) = inner.entries.pop_front() {
                if entry.position.is_some() {
                    safe = entry.position;
                }
            }
        }
        drop(inner);

        self.changed.notify_waiters();
        safe
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Age of the oldest unacknowledged delivery.
    pub fn oldest_age(&self) -> Option<Duration> {
        self.lock()
            .entries
            .iter()
            .find(|e| !e.done)
            .map(|e| e.sent_at.elapsed())
    }

    /// Waits until every delivery is acknowledged.
    pub async fn wait_empty(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            let changed = self.changed.notified();
            if self.is_empty() {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Shutdown),
                _ = changed => {}
            }
        }
    }
}

/// Acknowledgement handle for one delivery.
///
/// Sinks call [`Completion::complete`] once the row is durable on their side,
/// or [`Completion::fail`] when it cannot be delivered. Dropping a handle
/// without either terminates the session, even when delivery errors are
/// ignored, since nothing says whether the row went out.
#[derive(Debug)]
pub struct Completion {
    id: u64,
    description: String,
    tracker: Arc<InflightTracker>,
    context: Arc<ReplicationContext>,
    resolved: bool,
}

impl Completion {
    pub fn new(
        id: u64,
        description: impl Into<String>,
        tracker: Arc<InflightTracker>,
        context: Arc<ReplicationContext>,
    ) -> Self {
        Self {
            id,
            description: description.into(),
            tracker,
            context,
            resolved: false,
        }
    }

    /// Cancelled once the session is terminated.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.context.cancellation_token()
    }

    pub fn complete(mut self) {
        self.resolved = true;
        self.acknowledge();
    }

    /// Records a failed delivery.
    ///
    /// With `ignore_producer_error` the failure is logged and the delivery
    /// counts as acknowledged; otherwise the session is terminated.
    pub fn fail(mut self, error: Error) {
        self.resolved = true;
        self.reject(error);
    }

    fn acknowledge(&self) {
        if let Some(position) = self.tracker.complete(self.id) {
            debug!(position = %position, "Position acknowledged");
            self.context.set_acknowledged(position);
        }
    }

    fn reject(&self, error: Error) {
        if self.context.ignore_producer_error() {
            error!(
                row = %self.description,
                error = %error,
                "Delivery failed, continuing"
            );
            self.acknowledge();
        } else {
            self.context.terminate(format!(
                "delivery of {} failed: {}",
                self.description, error
            ));
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        if self.context.is_terminated() {
            debug!(row = %self.description, "Unresolved delivery dropped during termination");
            return;
        }
        self.context.terminate(format!(
            "delivery of {} dropped without acknowledgement",
            self.description
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::tests::position;

    #[tokio::test]
    async fn test_position_waits_for_oldest_delivery() {
        let tracker = InflightTracker::new(10);
        let cancel = CancellationToken::new();

        let first = tracker.acquire(Some(position(10)), &cancel).await.unwrap();
        let second = tracker.acquire(None, &cancel).await.unwrap();
        let third = tracker.acquire(Some(position(30)), &cancel).await.unwrap();

        assert_eq!(tracker.complete(third), None);
        assert_eq!(tracker.complete(second), None);
        assert_eq!(tracker.complete(first), Some(position(30)));
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_acquire_blocks_at_capacity() {
        let tracker = Arc::new(InflightTracker::new(1));
        let cancel = CancellationToken::new();
        let first = tracker.acquire(None, &cancel).await.unwrap();

        let waiting = {
            let tracker = tracker.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { tracker.acquire(None, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        tracker.complete(first);
        let second = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(second, 1);
    }

    #[tokio::test]
    async fn test_acquire_gives_up_on_cancel() {
        let tracker = InflightTracker::new(1);
        let cancel = CancellationToken::new();
        tracker.acquire(None, &cancel).await.unwrap();

        cancel.cancel();
        assert!(matches!(
            tracker.acquire(None, &cancel).await,
            Err(Error::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_failed_completion_terminates_unless_ignored() {
        let tracker = Arc::new(InflightTracker::new(10));
        let cancel = CancellationToken::new();

        let ignoring = ReplicationContext::new(true);
        let id = tracker.acquire(Some(position(5)), &cancel).await.unwrap();
        Completion::new(id, "shop.orders", tracker.clone(), ignoring.clone())
            .fail(Error::producer("broker down"));
        assert!(!ignoring.is_terminated());
        assert_eq!(ignoring.acknowledged(), Some(position(5)));

        let strict = ReplicationContext::new(false);
        let id = tracker.acquire(Some(position(6)), &cancel).await.unwrap();
        Completion::new(id, "shop.orders", tracker.clone(), strict.clone())
            .fail(Error::producer("broker down"));
        assert!(strict.is_terminated());
        assert!(strict.acknowledged().is_none());
        assert!(strict
            .termination_cause()
            .unwrap()
            .contains("broker down"));
    }

    #[tokio::test]
    async fn test_dropped_completion_counts_as_failed() {
        let tracker = Arc::new(InflightTracker::new(2));
        let cancel = CancellationToken::new();
        let strict = ReplicationContext::new(false);

        for offset in [10, 20] {
            let id = tracker.acquire(Some(position(offset)), &cancel).await.unwrap();
            drop(Completion::new(id, "shop.orders", tracker.clone(), strict.clone()));
        }
        assert!(strict.is_terminated());
        assert!(strict.acknowledged().is_none());
        assert!(strict.termination_cause().unwrap().contains("dropped"));

        // the full tracker no longer blocks once the session is terminated
        let third = tokio::time::timeout(
            Duration::from_secs(1),
            tracker.acquire(None, &strict.cancellation_token()),
        )
        .await
        .unwrap();
        assert!(matches!(third, Err(Error::Shutdown)));
    }

    #[tokio::test]
    async fn test_dropped_completion_is_not_ignored() {
        let tracker = Arc::new(InflightTracker::new(2));
        let cancel = CancellationToken::new();
        let ignoring = ReplicationContext::new(true);

        let id = tracker.acquire(Some(position(10)), &cancel).await.unwrap();
        drop(Completion::new(id, "shop.orders", tracker.clone(), ignoring.clone()));
        assert!(ignoring.is_terminated());
        assert!(ignoring.acknowledged().is_none());
    }

    #[tokio::test]
    async fn test_dropped_completion_after_termination_is_not_acknowledged() {
        let tracker = Arc::new(InflightTracker::new(2));
        let cancel = CancellationToken::new();
        let ignoring = ReplicationContext::new(true);

        let id = tracker.acquire(Some(position(10)), &cancel).await.unwrap();
        ignoring.terminate("stopping");
        drop(Completion::new(id, "shop.orders", tracker.clone(), ignoring.clone()));
        assert!(ignoring.acknowledged().is_none());
        assert_eq!(tracker.len(), 1);
    }
}
