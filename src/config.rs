use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::position::BinlogPosition;
use crate::{Error, Result};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub schema: SchemaConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub producer: ProducerConfig,
    pub kafka: Option<KafkaConfig>,
    #[serde(default)]
    pub partition: PartitionConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplicationConfig {
    /// Distinguishes independent consumers of the same upstream log.
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Database holding the internal control tables (bootstrap requests).
    #[serde(default = "default_schema_database")]
    pub schema_database: String,
    /// Explicit `file:offset` to start from when no checkpoint exists.
    pub start_position: Option<String>,
    /// Stop once a heartbeat at or beyond this value is processed.
    pub stop_at_heartbeat: Option<i64>,
    #[serde(default)]
    pub master_recovery: bool,
    #[serde(default = "default_true")]
    pub ignore_producer_error: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_retry_backoff_ms")]
    pub max_retry_backoff_ms: u64,
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    /// Newline-delimited JSON file of raw log events.
    #[serde(default = "default_source_path")]
    pub path: PathBuf,
    /// Keep polling the file for appended events instead of ending at EOF.
    #[serde(default)]
    pub follow: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchemaConfig {
    /// JSON snapshot the initial schema is captured from.
    #[serde(default = "default_schema_snapshot")]
    pub snapshot_path: PathBuf,
    /// Databases excluded on top of the built-in system deny-list.
    #[serde(default)]
    pub exclude_databases: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BufferConfig {
    #[serde(default = "default_max_in_memory_elements")]
    pub max_in_memory_elements: usize,
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: u64,
    /// Directory for spill files; the system temp dir when unset.
    pub spill_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FilterConfig {
    /// Ordered `include: db.table` / `exclude: db.table` rules, `*` wildcards.
    #[serde(default)]
    pub rules: Vec<String>,
    /// JSON file of `{table, columns}` entries removed before delivery.
    pub column_filter_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProducerKind {
    #[default]
    Stdout,
    Kafka,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProducerConfig {
    #[serde(default)]
    pub kind: ProducerKind,
    /// Maximum deliveries awaiting acknowledgement.
    #[serde(default = "default_inflight_capacity")]
    pub inflight_capacity: usize,
    /// Terminate when the oldest in-flight delivery is older than this; 0 disables.
    #[serde(default)]
    pub ack_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyFormat {
    #[default]
    Hash,
    Array,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    /// Topic name; `%{database}` and `%{table}` are substituted per row.
    #[serde(default = "default_topic")]
    pub topic: String,
    /// Partition count; fetched from broker metadata when unset.
    pub partitions: Option<u32>,
    #[serde(default)]
    pub key_format: KeyFormat,
    #[serde(default = "default_compression")]
    pub compression: String,
    #[serde(default = "default_acks")]
    pub acks: String,
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
    /// Extra librdkafka properties, applied after the settings above.
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HashFunctionKind {
    #[default]
    Default,
    Murmur3,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionBasis {
    #[default]
    Database,
    Table,
    PrimaryKey,
    Column,
    Fixed,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PartitionConfig {
    #[serde(default)]
    pub hash_function: HashFunctionKind,
    #[serde(default)]
    pub partition_by: PartitionBasis,
    /// Columns hashed when partitioning by `column`.
    #[serde(default)]
    pub columns: Vec<String>,
    /// Basis used for DDL and when the primary basis yields nothing.
    #[serde(default = "default_fallback_basis")]
    pub fallback: PartitionBasis,
    /// `database` or `database.table` to partition number, for `fixed`.
    #[serde(default)]
    pub fixed: HashMap<String, u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NamingStrategy {
    #[default]
    Default,
    UnderscoreToCamelCase,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub include_binlog_position: bool,
    #[serde(default = "default_true")]
    pub include_commit_info: bool,
    #[serde(default = "default_true")]
    pub include_xoffset: bool,
    #[serde(default = "default_true")]
    pub include_nulls: bool,
    #[serde(default)]
    pub include_server_id: bool,
    #[serde(default)]
    pub include_heartbeats: bool,
    #[serde(default = "default_true")]
    pub include_ddl: bool,
    #[serde(default)]
    pub naming_strategy: NamingStrategy,
    /// Column names removed from every row.
    #[serde(default)]
    pub exclude_columns: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BootstrapConfig {
    /// Directory of `<database>.<table>.json` row snapshots served to
    /// bootstrap requests; bootstrapping is disabled when unset.
    pub rows_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStoreKind {
    #[default]
    File,
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CheckpointConfig {
    #[serde(default)]
    pub store: CheckpointStoreKind,
    /// Directory for file checkpoints, one JSON file per client id.
    #[serde(default = "default_checkpoint_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    pub postgres: Option<PostgresConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_positions_table")]
    pub table: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("BINLOG_CAPTURE")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-field checks serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if let Some(start) = &self.replication.start_position {
            start
                .parse::<BinlogPosition>()
                .map_err(|e| Error::Config(format!("replication.start_position: {}", e)))?;
        }
        if self.replication.client_id.trim().is_empty() {
            return Err(Error::Config(
                "replication.client_id must not be empty".to_string(),
            ));
        }
        if self.buffer.max_in_memory_elements == 0 {
            return Err(Error::Config(
                "buffer.max_in_memory_elements must be at least 1".to_string(),
            ));
        }
        if self.producer.inflight_capacity == 0 {
            return Err(Error::Config(
                "producer.inflight_capacity must be at least 1".to_string(),
            ));
        }
        if self.partition.partition_by == PartitionBasis::Column
            && self.partition.columns.is_empty()
        {
            return Err(Error::Config(
                "partition.columns is required when partition_by = \"column\"".to_string(),
            ));
        }
        if matches!(
            self.partition.fallback,
            PartitionBasis::PrimaryKey | PartitionBasis::Column
        ) {
            return Err(Error::Config(
                "partition.fallback must be database, table or fixed".to_string(),
            ));
        }

        if self.producer.kind == ProducerKind::Kafka {
            let kafka = self.kafka.as_ref().ok_or_else(|| {
                Error::Config("[kafka] section is required for the kafka producer".to_string())
            })?;
            if kafka.brokers.is_empty() {
                return Err(Error::Config("kafka.brokers must not be empty".to_string()));
            }
            if kafka.partitions == Some(0) {
                return Err(Error::Config("kafka.partitions must be at least 1".to_string()));
            }
            if kafka.topic.contains("%{") && kafka.partitions.is_none() {
                return Err(Error::Config(
                    "kafka.partitions is required when kafka.topic is templated".to_string(),
                ));
            }
        }

        if self.checkpoint.store == CheckpointStoreKind::Postgres
            && self.checkpoint.postgres.is_none()
        {
            return Err(Error::Config(
                "[checkpoint.postgres] section is required for the postgres store".to_string(),
            ));
        }

        Ok(())
    }

    pub fn start_position(&self) -> Result<Option<BinlogPosition>> {
        self.replication
            .start_position
            .as_deref()
            .map(str::parse)
            .transpose()
    }
}

impl PostgresConfig {
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={} connect_timeout={}",
            self.host,
            self.port,
            self.database,
            self.username,
            self.password,
            self.connect_timeout_secs
        )
    }
}

impl KafkaConfig {
    /// Topic for one row, with `%{database}` / `%{table}` substituted.
    pub fn topic_for(&self, database: &str, table: &str) -> String {
        self.topic
            .replace("%{database}", database)
            .replace("%{table}", table)
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            schema_database: default_schema_database(),
            start_position: None,
            stop_at_heartbeat: None,
            master_recovery: false,
            ignore_producer_error: true,
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_retry_backoff_ms: default_max_retry_backoff_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            path: default_source_path(),
            follow: false,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_schema_snapshot(),
            exclude_databases: Vec::new(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_in_memory_elements: default_max_in_memory_elements(),
            max_memory_bytes: default_max_memory_bytes(),
            spill_dir: None,
        }
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            kind: ProducerKind::default(),
            inflight_capacity: default_inflight_capacity(),
            ack_timeout_ms: 0,
        }
    }
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            hash_function: HashFunctionKind::default(),
            partition_by: PartitionBasis::default(),
            columns: Vec::new(),
            fallback: default_fallback_basis(),
            fixed: HashMap::new(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            include_binlog_position: false,
            include_commit_info: true,
            include_xoffset: true,
            include_nulls: true,
            include_server_id: false,
            include_heartbeats: false,
            include_ddl: true,
            naming_strategy: NamingStrategy::default(),
            exclude_columns: Vec::new(),
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            store: CheckpointStoreKind::default(),
            dir: default_checkpoint_dir(),
            flush_interval_ms: default_flush_interval_ms(),
            postgres: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_client_id() -> String {
    "binlog_capture".to_string()
}

fn default_schema_database() -> String {
    "binlog_capture".to_string()
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_max_retry_backoff_ms() -> u64 {
    30_000
}

fn default_stop_timeout_ms() -> u64 {
    10_000
}

fn default_source_path() -> PathBuf {
    PathBuf::from("binlog.jsonl")
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_schema_snapshot() -> PathBuf {
    PathBuf::from("schema.json")
}

fn default_max_in_memory_elements() -> usize {
    10_000
}

fn default_max_memory_bytes() -> u64 {
    64 * 1024 * 1024 // 64MB
}

fn default_inflight_capacity() -> usize {
    1000
}

fn default_topic() -> String {
    "binlog_capture".to_string()
}

fn default_compression() -> String {
    "snappy".to_string()
}

fn default_acks() -> String {
    "all".to_string()
}

fn default_linger_ms() -> u32 {
    100
}

fn default_batch_size() -> usize {
    16384
}

fn default_message_timeout_ms() -> u64 {
    30_000
}

fn default_fallback_basis() -> PartitionBasis {
    PartitionBasis::Database
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("positions")
}

fn default_flush_interval_ms() -> u64 {
    1000
}

fn default_pg_port() -> u16 {
    5432
}

fn default_positions_table() -> String {
    "positions".to_string()
}

fn default_connect_timeout() -> u64 {
    30
}
