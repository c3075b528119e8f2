//! Start-position resolution.
//!
//! On startup the stored checkpoint of this client wins over a configured
//! start position, which wins over the current head of the log. When the
//! checkpoint was written against a different upstream server and
//! `master_recovery` is enabled, the heartbeat recorded in the checkpoint is
//! looked up in the new server's logs and replication resumes right after it.

use tracing::{debug, info, instrument, warn};

use crate::checkpoint::{CheckpointStore, RecoveryInfo};
use crate::position::{BinlogPosition, Position};
use crate::source::{LogSource, RawEventKind};
use crate::{Error, Result};

/// Where a log file's events are read from during a scan.
const LOG_START_OFFSET: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartSource {
    Checkpoint,
    MasterRecovery,
    Configured,
    Head,
}

#[derive(Debug, Clone)]
pub struct StartPosition {
    pub position: Position,
    /// Id of the server the log is read from.
    pub server_id: u64,
    pub source: StartSource,
    /// Position already persisted for this client, if any.
    pub stored: Option<Position>,
}

#[instrument(skip(store, source, configured))]
pub async fn resolve_start_position(
    store: &dyn CheckpointStore,
    source: &mut dyn LogSource,
    client_id: &str,
    configured: Option<BinlogPosition>,
    master_recovery: bool,
) -> Result<StartPosition> {
    let server_id = source.server_id().await?;

    if let Some(info) = store.load(client_id).await? {
        if info.server_id == server_id || info.server_id == 0 {
            info!(position = %info.position, "Resuming from checkpoint");
            return Ok(StartPosition {
                position: info.position.clone(),
                server_id,
                source: StartSource::Checkpoint,
                stored: Some(info.position),
            });
        }

        if master_recovery {
            let position = recover_on_new_master(source, &info).await?;
            return Ok(StartPosition {
                position,
                server_id,
                source: StartSource::MasterRecovery,
                stored: None,
            });
        }

        warn!(
            stored_server_id = info.server_id,
            server_id,
            "Checkpoint was written against another server, resuming from it anyway"
        );
        return Ok(StartPosition {
            position: info.position.clone(),
            server_id,
            source: StartSource::Checkpoint,
            stored: Some(info.position),
        });
    }

    if let Some(configured) = configured {
        info!(position = %configured, "No checkpoint, starting at the configured position");
        return Ok(StartPosition {
            position: Position::new(configured, 0),
            server_id,
            source: StartSource::Configured,
            stored: None,
        });
    }

    let head = source.head_position().await?;
    info!(position = %head, "No checkpoint, starting at the head of the log");
    Ok(StartPosition {
        position: Position::new(head, 0),
        server_id,
        source: StartSource::Head,
        stored: None,
    })
}

/// Scans the logs newest first for the checkpoint's heartbeat.
async fn recover_on_new_master(source: &mut dyn LogSource, info: &RecoveryInfo) -> Result<Position> {
    let heartbeat = info.position.last_heartbeat_read();
    info!(
        stored_server_id = info.server_id,
        heartbeat,
        "Upstream server changed, searching logs for the last heartbeat"
    );

    let head = source.head_position().await?;
    let mut logs = source.list_logs().await?;
    logs.reverse();

    for log in logs {
        debug!(log = %log, "Scanning log for heartbeat");
        source
            .seek(&BinlogPosition::new(log.clone(), LOG_START_OFFSET)?)
            .await?;

        while let Some(event) = source.next_event().await? {
            if event.position.file() != log {
                break;
            }
            if let RawEventKind::Heartbeat { heartbeat: found } = event.kind {
                if found == heartbeat {
                    let position = Position::new(event.next_position, heartbeat);
                    info!(position = %position, "Found heartbeat on new server");
                    return Ok(position);
                }
            }
            if event.next_position >= head {
                break;
            }
        }
    }

    Err(Error::Replication {
        message: format!(
            "master recovery failed: heartbeat {} not found in any log of the new server",
            heartbeat
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::source::RawEvent;
    use async_trait::async_trait;

    struct Logs {
        server_id: u64,
        events: Vec<RawEvent>,
        cursor: usize,
    }

    fn event(file: &str, offset: u64, kind: RawEventKind) -> RawEvent {
        RawEvent {
            position: BinlogPosition::new(file, offset).unwrap(),
            next_position: BinlogPosition::new(file, offset + 10).unwrap(),
            timestamp_millis: 0,
            server_id: 2,
            kind,
        }
    }

    impl Logs {
        fn new(server_id: u64) -> Self {
            Self {
                server_id,
                events: vec![
                    event("bin.000001", 4, RawEventKind::Heartbeat { heartbeat: 100 }),
                    event("bin.000001", 14, RawEventKind::Begin),
                    event("bin.000002", 4, RawEventKind::Heartbeat { heartbeat: 200 }),
                    event("bin.000002", 14, RawEventKind::Heartbeat { heartbeat: 300 }),
                ],
                cursor: 0,
            }
        }
    }

    #[async_trait]
    impl LogSource for Logs {
        async fn server_id(&mut self) -> Result<u64> {
            Ok(self.server_id)
        }

        async fn head_position(&mut self) -> Result<BinlogPosition> {
            BinlogPosition::new("bin.000002", 24)
        }

        async fn list_logs(&mut self) -> Result<Vec<String>> {
            Ok(vec!["bin.000001".to_string(), "bin.000002".to_string()])
        }

        async fn seek(&mut self, position: &BinlogPosition) -> Result<()> {
            self.cursor = self
                .events
                .iter()
                .position(|e| e.position >= *position)
                .unwrap_or(self.events.len());
            Ok(())
        }

        async fn next_event(&mut self) -> Result<Option<RawEvent>> {
            let event = self.events.get(self.cursor).cloned();
            self.cursor += 1;
            Ok(event)
        }
    }

    fn stored(server_id: u64, heartbeat: i64) -> RecoveryInfo {
        RecoveryInfo::new(
            Position::new(BinlogPosition::new("old.000009", 500).unwrap(), heartbeat),
            server_id,
            "client",
        )
    }

    #[tokio::test]
    async fn test_head_when_nothing_stored() {
        let store = MemoryCheckpointStore::new();
        let start = resolve_start_position(&store, &mut Logs::new(2), "client", None, false)
            .await
            .unwrap();
        assert_eq!(start.source, StartSource::Head);
        assert_eq!(start.position.binlog().to_string(), "bin.000002:24");
        assert_eq!(start.server_id, 2);
    }

    #[tokio::test]
    async fn test_configured_position_when_nothing_stored() {
        let store = MemoryCheckpointStore::new();
        let configured = BinlogPosition::new("bin.000001", 14).unwrap();
        let start = resolve_start_position(&store, &mut Logs::new(2), "client", Some(configured.clone()), false)
            .await
            .unwrap();
        assert_eq!(start.source, StartSource::Configured);
        assert_eq!(start.position.binlog(), &configured);
    }

    #[tokio::test]
    async fn test_checkpoint_wins() {
        let store = MemoryCheckpointStore::new();
        store.save(&stored(2, 7)).await.unwrap();
        let configured = BinlogPosition::new("bin.000001", 14).unwrap();

        let start = resolve_start_position(&store, &mut Logs::new(2), "client", Some(configured), true)
            .await
            .unwrap();
        assert_eq!(start.source, StartSource::Checkpoint);
        assert_eq!(start.position.binlog().file(), "old.000009");
        assert_eq!(start.stored, Some(start.position.clone()));
    }

    #[tokio::test]
    async fn test_master_recovery_finds_heartbeat() {
        let store = MemoryCheckpointStore::new();
        store.save(&stored(1, 100)).await.unwrap();

        let start = resolve_start_position(&store, &mut Logs::new(2), "client", None, true)
            .await
            .unwrap();
        assert_eq!(start.source, StartSource::MasterRecovery);
        assert_eq!(start.position.binlog().to_string(), "bin.000001:14");
        assert_eq!(start.position.last_heartbeat_read(), 100);
    }

    #[tokio::test]
    async fn test_master_recovery_fails_without_heartbeat() {
        let store = MemoryCheckpointStore::new();
        store.save(&stored(1, 150)).await.unwrap();

        let err = resolve_start_position(&store, &mut Logs::new(2), "client", None, true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Replication { .. }));
    }
}
