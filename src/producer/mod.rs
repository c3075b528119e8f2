//! Sink capability interface.
//!
//! Every backend implements [`Producer`]. The dispatcher hands each row to
//! [`Producer::push`] together with a [`Completion`]; the backend completes
//! it once the row is durable on its side, which may happen after `push`
//! returns. A producer must keep the order of the rows it is given.

mod memory;
pub mod serializer;
mod stdout;

pub use memory::MemoryProducer;
pub use serializer::{NameCache, RowSerializer};
pub use stdout::StdoutProducer;

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::dispatch::Completion;
use crate::row::RowEvent;
use crate::Result;

#[async_trait]
pub trait Producer: Send + Sync {
    fn name(&self) -> &str;

    /// Delivers one row.
    ///
    /// Delivery outcome is reported through `completion`. An `Err` means the
    /// producer itself is unusable and terminates the session.
    async fn push(&self, row: RowEvent, completion: Completion) -> Result<()>;

    /// Stops accepting rows; pending deliveries may still complete.
    fn request_stop(&self) {}

    /// Waits up to `timeout` for pending deliveries to finish.
    async fn await_stop(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn diagnostic(&self) -> Option<Arc<dyn Diagnostic>> {
        None
    }
}

/// Result of one health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Check {
    pub name: String,
    pub mandatory: bool,
    pub success: bool,
    pub message: Option<String>,
}

impl Check {
    pub fn ok(name: impl Into<String>, mandatory: bool) -> Self {
        Self {
            name: name.into(),
            mandatory,
            success: true,
            message: None,
        }
    }

    pub fn failed(name: impl Into<String>, mandatory: bool, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mandatory,
            success: false,
            message: Some(message.into()),
        }
    }
}

#[async_trait]
pub trait Diagnostic: Send + Sync {
    fn name(&self) -> &str;

    fn is_mandatory(&self) -> bool;

    async fn check(&self) -> Check;
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    /// All mandatory checks passed.
    pub success: bool,
    pub checks: Vec<Check>,
}

/// Runs every diagnostic, treating one that exceeds `timeout` as failed.
pub async fn run_diagnostics(
    diagnostics: &[Arc<dyn Diagnostic>],
    timeout: Duration,
) -> DiagnosticReport {
    let checks = futures::future::join_all(diagnostics.iter().map(|d| async move {
        match tokio::time::timeout(timeout, d.check()).await {
            Ok(check) => check,
            Err(_) => Check::failed(d.name(), d.is_mandatory(), "check timed out"),
        }
    }))
    .await;

    for check in &checks {
        if check.success {
            info!(check = %check.name, "Diagnostic passed");
        } else {
            warn!(
                check = %check.name,
                mandatory = check.mandatory,
                message = ?check.message,
                "Diagnostic failed"
            );
        }
    }

    DiagnosticReport {
        success: checks.iter().all(|c| c.success || !c.mandatory),
        checks,
    }
}
