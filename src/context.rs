//! State shared by every task of one replication session.
//!
//! The context owns the process-wide cancellation token, the first
//! termination cause, and the newest acknowledged position. Only the
//! in-flight tracker advances the acknowledged position, and only forward.

use std::cmp::Ordering;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::position::Position;

#[derive(Debug)]
pub struct ReplicationContext {
    cancel: CancellationToken,
    termination: Mutex<Option<String>>,
    acknowledged: watch::Sender<Option<Position>>,
    ignore_producer_error: bool,
}

impl ReplicationContext {
    pub fn new(ignore_producer_error: bool) -> Arc<Self> {
        let (acknowledged, _) = watch::channel(None);
        Arc::new(Self {
            cancel: CancellationToken::new(),
            termination: Mutex::new(None),
            acknowledged,
            ignore_producer_error,
        })
    }

    /// Token cancelled once the session is terminated.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn ignore_producer_error(&self) -> bool {
        self.ignore_producer_error
    }

    /// Requests termination of the whole session.
    ///
    /// The first cause is kept; later ones are only logged.
    pub fn terminate(&self, cause: impl Into<String>) {
        let cause = cause.into();
        match self.termination.lock() {
            Ok(mut termination) if termination.is_none() => {
                error!(cause = %cause, "Terminating replication");
                *termination = Some(cause);
            }
            Ok(_) => warn!(cause = %cause, "Replication already terminating"),
            Err(_) => error!(cause = %cause, "Termination lock poisoned"),
        }
        self.cancel.cancel();
    }

    pub fn is_terminated(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn termination_cause(&self) -> Option<String> {
        self.termination.lock().ok().and_then(|t| t.clone())
    }

    /// Records `position` as acknowledged unless an equal or newer one is.
    pub fn set_acknowledged(&self, position: Position) {
        self.acknowledged.send_if_modified(|current| {
            let advance = match current {
                None => true,
                Some(current) => match position.compare_to(current) {
                    Ordering::Greater => true,
                    Ordering::Equal => {
                        position.last_heartbeat_read() > current.last_heartbeat_read()
                    }
                    Ordering::Less => false,
                },
            };
            if advance {
                *current = Some(position);
            }
            advance
        });
    }

    pub fn acknowledged(&self) -> Option<Position> {
        self.acknowledged.borrow().clone()
    }

    pub fn subscribe_acknowledged(&self) -> watch::Receiver<Option<Position>> {
        self.acknowledged.subscribe()
    }
}
