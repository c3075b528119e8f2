//! Checkpoint persistence for restart-safe delivery.
//!
//! A checkpoint ([`RecoveryInfo`]) records the position right after the last
//! acknowledged transaction, the upstream server id, and the client id it
//! belongs to. Several clients may share one store; each has its own record.
//!
//! # Example
//!
//! ```rust,no_run
//! use binlog_capture::checkpoint::{CheckpointStore, FileCheckpointStore, RecoveryInfo};
//! use binlog_capture::position::Position;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = FileCheckpointStore::new("positions");
//!
//!     if let Some(info) = store.load("binlog_capture").await? {
//!         println!("Resuming from {}", info.position);
//!     }
//!
//!     let info = RecoveryInfo::new(Position::parse("mysql-bin.000003:4")?, 1, "binlog_capture");
//!     store.save(&info).await?;
//!
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::config::{CheckpointConfig, CheckpointStoreKind};
use crate::position::Position;
use crate::{Error, Result};

/// The durable record read at startup to resume replication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryInfo {
    /// Position right after the last acknowledged transaction.
    pub position: Position,
    pub server_id: u64,
    pub client_id: String,
    /// When this record was written
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl RecoveryInfo {
    pub fn new(position: Position, server_id: u64, client_id: impl Into<String>) -> Self {
        Self {
            position,
            server_id,
            client_id: client_id.into(),
            updated_at: chrono::Utc::now(),
        }
    }
}

/// Key-value store of [`RecoveryInfo`] by client id.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// `None` when the client has never checkpointed.
    async fn load(&self, client_id: &str) -> Result<Option<RecoveryInfo>>;

    async fn save(&self, info: &RecoveryInfo) -> Result<()>;

    async fn delete(&self, client_id: &str) -> Result<()>;
}

/// Stores one JSON file per client id in a directory.
///
/// Writes are atomic: the record goes to a temporary file that is synced
/// and then renamed over the previous one, so a crash never leaves a
/// partially written checkpoint.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, client_id: &str) -> PathBuf {
        let name: String = client_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", name))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, client_id: &str) -> Result<Option<RecoveryInfo>> {
        let path = self.path_for(client_id);
        if !path.exists() {
            debug!("No checkpoint file found at {:?}", path);
            return Ok(None);
        }

        match fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str::<RecoveryInfo>(&content) {
                Ok(info) => {
                    info!(
                        client_id,
                        position = %info.position,
                        server_id = info.server_id,
                        "Loaded checkpoint"
                    );
                    Ok(Some(info))
                }
                Err(e) => {
                    error!("Failed to parse checkpoint file {:?}: {}", path, e);
                    Err(Error::Config(format!("Invalid checkpoint file {:?}: {}", path, e)))
                }
            },
            Err(e) => {
                error!("Failed to read checkpoint file {:?}: {}", path, e);
                Err(Error::Io(e))
            }
        }
    }

    async fn save(&self, info: &RecoveryInfo) -> Result<()> {
        debug!(client_id = %info.client_id, position = %info.position, "Saving checkpoint");
        fs::create_dir_all(&self.dir).await?;

        let path = self.path_for(&info.client_id);
        let temp_path = path.with_extension("tmp");

        let json = serde_json::to_string_pretty(info)?;
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    async fn delete(&self, client_id: &str) -> Result<()> {
        let path = self.path_for(client_id);
        if path.exists() {
            fs::remove_file(&path).await?;
            info!(client_id, "Deleted checkpoint file");
        }
        Ok(())
    }
}

/// Keeps checkpoints in memory; clones share storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    records: Arc<Mutex<HashMap<String, RecoveryInfo>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, client_id: &str) -> Result<Option<RecoveryInfo>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records.get(client_id).cloned())
    }

    async fn save(&self, info: &RecoveryInfo) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.insert(info.client_id.clone(), info.clone());
        Ok(())
    }

    async fn delete(&self, client_id: &str) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.remove(client_id);
        Ok(())
    }
}

/// Opens the store selected by `config`.
pub async fn open_store(config: &CheckpointConfig) -> Result<Arc<dyn CheckpointStore>> {
    match config.store {
        CheckpointStoreKind::File => Ok(Arc::new(FileCheckpointStore::new(&config.dir))),
        CheckpointStoreKind::Memory => Ok(Arc::new(MemoryCheckpointStore::new())),
        CheckpointStoreKind::Postgres => {
            let postgres = config.postgres.as_ref().ok_or_else(|| {
                Error::Config("[checkpoint.postgres] section is required".to_string())
            })?;
            let store = crate::postgres::PostgresCheckpointStore::connect(postgres).await?;
            Ok(Arc::new(store))
        }
    }
}

/// Whether `candidate` should replace `stored` as the checkpoint.
fn advances(candidate: &Position, stored: Option<&Position>) -> bool {
    match stored {
        None => true,
        Some(stored) => match candidate.compare_to(stored) {
            Ordering::Greater => true,
            Ordering::Equal => candidate.last_heartbeat_read() > stored.last_heartbeat_read(),
            Ordering::Less => false,
        },
    }
}

/// Flushes acknowledged positions to a [`CheckpointStore`].
///
/// Positions are written at most once per interval and only when they move
/// forward; a final flush happens when the writer is stopped.
pub struct CheckpointWriter {
    store: Arc<dyn CheckpointStore>,
    client_id: String,
    server_id: u64,
    interval: Duration,
    stored: Option<Position>,
}

impl CheckpointWriter {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        client_id: impl Into<String>,
        server_id: u64,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            client_id: client_id.into(),
            server_id,
            interval,
            stored: None,
        }
    }

    /// Position already persisted, so it is not written again.
    pub fn with_stored(mut self, stored: Option<Position>) -> Self {
        self.stored = stored;
        self
    }

    #[instrument(skip_all, fields(client_id = %self.client_id))]
    pub async fn run(
        mut self,
        mut acknowledged: watch::Receiver<Option<Position>>,
        stop: CancellationToken,
    ) -> Result<()> {
        let mut tick = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tick.tick() => {
                    let current = acknowledged.borrow_and_update().clone();
                    self.flush(current).await?;
                }
            }
        }

        let current = acknowledged.borrow().clone();
        self.flush(current).await?;
        info!(position = ?self.stored.as_ref().map(|p| p.to_string()), "Checkpoint writer stopped");
        Ok(())
    }

    async fn flush(&mut self, current: Option<Position>) -> Result<()> {
        let Some(position) = current else {
            return Ok(());
        };
        if !advances(&position, self.stored.as_ref()) {
            return Ok(());
        }

        let info = RecoveryInfo::new(position.clone(), self.server_id, &self.client_id);
        self.store.save(&info).await?;
        debug!(position = %position, "Checkpoint flushed");
        self.stored = Some(position);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::tests::position;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_checkpoint_save_load() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(temp_dir.path().join("positions"));

        assert!(store.load("client-a").await.unwrap().is_none());

        let info = RecoveryInfo::new(position(120).with_heartbeat(99), 7, "client-a");
        store.save(&info).await.unwrap();

        let loaded = store.load("client-a").await.unwrap().unwrap();
        assert_eq!(loaded.position, info.position);
        assert_eq!(loaded.server_id, 7);
        assert!(store.load("client-b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_checkpoint_atomic_write() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(temp_dir.path());

        store
            .save(&RecoveryInfo::new(position(10), 1, "client"))
            .await
            .unwrap();
        store
            .save(&RecoveryInfo::new(position(20), 1, "client"))
            .await
            .unwrap();

        let loaded = store.load("client").await.unwrap().unwrap();
        assert_eq!(loaded.position, position(20));
        assert!(!temp_dir.path().join("client.tmp").exists());

        store.delete("client").await.unwrap();
        assert!(store.load("client").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        tokio::fs::write(temp_dir.path().join("client.json"), "{")
            .await
            .unwrap();

        let store = FileCheckpointStore::new(temp_dir.path());
        assert!(store.load("client").await.is_err());
    }

    #[tokio::test]
    async fn test_writer_only_flushes_forward_and_on_stop() {
        let store = MemoryCheckpointStore::new();
        let (tx, rx) = watch::channel(None);
        let stop = CancellationToken::new();

        let writer = CheckpointWriter::new(
            Arc::new(store.clone()),
            "client",
            3,
            Duration::from_secs(3600),
        )
        .with_stored(Some(position(50)));
        let handle = tokio::spawn(writer.run(rx, stop.clone()));

        tx.send(Some(position(40))).unwrap();
        tokio::task::yield_now().await;
        assert!(store.load("client").await.unwrap().is_none());

        tx.send(Some(position(60))).unwrap();
        stop.cancel();
        handle.await.unwrap().unwrap();

        let saved = store.load("client").await.unwrap().unwrap();
        assert_eq!(saved.position, position(60));
        assert_eq!(saved.server_id, 3);
    }
}
