use async_trait::async_trait;
use std::time::Duration;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, info};

use crate::checkpoint::{CheckpointStore, RecoveryInfo};
use crate::config::PostgresConfig;
use crate::position::{BinlogPosition, Position};
use crate::{Error, Result};

/// Keeps one checkpoint row per client id in a PostgreSQL table.
pub struct PostgresCheckpointStore {
    client: Client,
    table: String,
    connection_task: tokio::task::JoinHandle<()>,
}

impl PostgresCheckpointStore {
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        validate_table_name(&config.table)?;
        info!(host = %config.host, port = config.port, table = %config.table, "Connecting checkpoint store");

        let connection_string = config.connection_string();
        let connect = tokio_postgres::connect(&connection_string, NoTls);
        let (client, connection) =
            tokio::time::timeout(Duration::from_secs(config.connect_timeout_secs), connect)
                .await
                .map_err(|_| Error::Timeout {
                    message: format!(
                        "connecting to PostgreSQL at {}:{}",
                        config.host, config.port
                    ),
                })??;

        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Connection error: {}", e);
            }
        });

        let store = Self {
            client,
            table: config.table.clone(),
            connection_task,
        };
        store.ensure_table().await?;
        Ok(store)
    }

    async fn ensure_table(&self) -> Result<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                client_id TEXT PRIMARY KEY,
                binlog_file TEXT NOT NULL,
                binlog_offset BIGINT NOT NULL,
                last_heartbeat_read BIGINT NOT NULL,
                server_id BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )",
            self.table
        );
        self.client.batch_execute(&ddl).await?;
        debug!(table = %self.table, "Checkpoint table ready");
        Ok(())
    }
}

impl Drop for PostgresCheckpointStore {
    fn drop(&mut self) {
        self.connection_task.abort();
    }
}

fn validate_table_name(table: &str) -> Result<()> {
    let valid = !table.is_empty()
        && table
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    if valid {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "checkpoint.postgres.table '{}' is not a plain identifier",
            table
        )))
    }
}

fn to_i64(value: u64, what: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| Error::Config(format!("{} {} exceeds BIGINT", what, value)))
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    async fn load(&self, client_id: &str) -> Result<Option<RecoveryInfo>> {
        let query = format!(
            "SELECT binlog_file, binlog_offset, last_heartbeat_read, server_id, updated_at
             FROM {} WHERE client_id = $1",
            self.table
        );
        let Some(row) = self.client.query_opt(&query, &[&client_id]).await? else {
            debug!(client_id, "No stored checkpoint");
            return Ok(None);
        };

        let file: String = row.try_get("binlog_file")?;
        let offset: i64 = row.try_get("binlog_offset")?;
        let heartbeat: i64 = row.try_get("last_heartbeat_read")?;
        let server_id: i64 = row.try_get("server_id")?;
        let updated_at: chrono::DateTime<chrono::Utc> = row.try_get("updated_at")?;

        let offset = u64::try_from(offset).map_err(|_| Error::MalformedPosition {
            input: format!("{}:{}", file, offset),
            reason: "negative offset".to_string(),
        })?;
        let position = Position::new(BinlogPosition::new(file, offset)?, heartbeat);

        info!(client_id, position = %position, "Loaded checkpoint");
        Ok(Some(RecoveryInfo {
            position,
            server_id: server_id as u64,
            client_id: client_id.to_string(),
            updated_at,
        }))
    }

    async fn save(&self, info: &RecoveryInfo) -> Result<()> {
        let statement = format!(
            "INSERT INTO {} (client_id, binlog_file, binlog_offset, last_heartbeat_read, server_id, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (client_id) DO UPDATE SET
                binlog_file = EXCLUDED.binlog_file,
                binlog_offset = EXCLUDED.binlog_offset,
                last_heartbeat_read = EXCLUDED.last_heartbeat_read,
                server_id = EXCLUDED.server_id,
                updated_at = EXCLUDED.updated_at",
            self.table
        );

        let binlog = info.position.binlog();
        let offset = to_i64(binlog.offset(), "binlog offset")?;
        let heartbeat = info.position.last_heartbeat_read();
        let server_id = to_i64(info.server_id, "server id")?;
        self.client
            .execute(
                &statement,
                &[
                    &info.client_id,
                    &binlog.file(),
                    &offset,
                    &heartbeat,
                    &server_id,
                    &info.updated_at,
                ],
            )
            .await?;
        debug!(client_id = %info.client_id, position = %info.position, "Checkpoint saved");
        Ok(())
    }

    async fn delete(&self, client_id: &str) -> Result<()> {
        let statement = format!("DELETE FROM {} WHERE client_id = $1", self.table);
        self.client.execute(&statement, &[&client_id]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn test_config() -> PostgresConfig {
        PostgresConfig {
            host: env::var("TEST_PG_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: env::var("TEST_PG_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5432),
            database: env::var("TEST_PG_DATABASE").unwrap_or_else(|_| "postgres".to_string()),
            username: env::var("TEST_PG_USERNAME").unwrap_or_else(|_| "postgres".to_string()),
            password: env::var("TEST_PG_PASSWORD").unwrap_or_else(|_| "postgres".to_string()),
            table: format!("test_positions_{}", std::process::id()),
            connect_timeout_secs: 5,
        }
    }

    #[test]
    fn test_table_name_validation() {
        assert!(validate_table_name("positions").is_ok());
        assert!(validate_table_name("cdc.positions").is_ok());
        assert!(validate_table_name("positions; DROP TABLE x").is_err());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("cdc.").is_err());
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL
    async fn test_upsert_and_load() {
        let store = PostgresCheckpointStore::connect(&test_config()).await.unwrap();
        let position = Position::new(BinlogPosition::new("mysql-bin.000002", 4096).unwrap(), 17);

        store.delete("client").await.unwrap();
        assert!(store.load("client").await.unwrap().is_none());

        store
            .save(&RecoveryInfo::new(position.clone(), 9, "client"))
            .await
            .unwrap();
        store
            .save(&RecoveryInfo::new(position.with_heartbeat(18), 9, "client"))
            .await
            .unwrap();

        let loaded = store.load("client").await.unwrap().unwrap();
        assert_eq!(loaded.position, position.with_heartbeat(18));
        assert_eq!(loaded.server_id, 9);

        store.delete("client").await.unwrap();
    }
}
