use async_trait::async_trait;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer as _};
use rdkafka::ClientConfig;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::KeyStrategy;
use crate::config::{KafkaConfig, OutputConfig, PartitionConfig};
use crate::dispatch::{Completion, Partitioner};
use crate::producer::{Check, Diagnostic, Producer, RowSerializer};
use crate::row::RowEvent;
use crate::{Error, Result};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(50);

fn client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", config.brokers.join(","))
        .set("compression.type", &config.compression)
        .set("acks", &config.acks)
        .set("linger.ms", config.linger_ms.to_string())
        .set("batch.size", config.batch_size.to_string())
        .set("message.timeout.ms", config.message_timeout_ms.to_string());
    for (key, value) in &config.properties {
        client.set(key, value);
    }
    client
}

/// Deliveries handed to librdkafka and not yet reported back.
#[derive(Debug, Default)]
struct Pending {
    count: AtomicUsize,
    idle: Notify,
}

impl Pending {
    fn start(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn finish(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

/// Publishes rows to Kafka, one message per row.
///
/// The partition is chosen by the configured [`Partitioner`] so that rows
/// sharing a key basis keep their relative order.
pub struct KafkaProducer {
    producer: FutureProducer,
    config: KafkaConfig,
    serializer: RowSerializer,
    keys: KeyStrategy,
    partitioner: Partitioner,
    partition_counts: Mutex<HashMap<String, u32>>,
    pending: Arc<Pending>,
    stopped: AtomicBool,
}

impl KafkaProducer {
    pub fn new(config: &KafkaConfig, partition: &PartitionConfig, output: OutputConfig) -> Result<Self> {
        let producer: FutureProducer = client_config(config).create().map_err(Error::Kafka)?;
        info!(brokers = ?config.brokers, topic = %config.topic, "Kafka producer created");

        Ok(Self {
            producer,
            config: config.clone(),
            serializer: RowSerializer::new(output),
            keys: KeyStrategy::new(config.key_format),
            partitioner: Partitioner::from_config(partition),
            partition_counts: Mutex::new(HashMap::new()),
            pending: Arc::new(Pending::default()),
            stopped: AtomicBool::new(false),
        })
    }

    /// Partition count of `topic`, from config or broker metadata.
    async fn partitions(&self, topic: &str) -> Result<u32> {
        if let Some(partitions) = self.config.partitions {
            return Ok(partitions);
        }
        {
            let counts = self.partition_counts.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(count) = counts.get(topic) {
                return Ok(*count);
            }
        }

        let count = fetch_partition_count(self.producer.clone(), topic.to_string()).await?;
        debug!(topic, partitions = count, "Fetched partition count");
        self.partition_counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(topic.to_string(), count);
        Ok(count)
    }

    /// Hands one message to librdkafka, waiting while its queue is full
    /// until `cancel` fires.
    async fn enqueue(
        &self,
        topic: &str,
        partition: i32,
        key: &str,
        payload: &str,
        cancel: &CancellationToken,
    ) -> Result<rdkafka::producer::DeliveryFuture> {
        loop {
            let record = FutureRecord::to(topic)
                .partition(partition)
                .key(key)
                .payload(payload);
            match self.producer.send_result(record) {
                Ok(delivery) => return Ok(delivery),
                Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), _)) => {}
                Err((e, _)) => return Err(Error::Kafka(e)),
            }
            debug!(topic, "Producer queue full, backing off");
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Shutdown),
                _ = tokio::time::sleep(QUEUE_FULL_BACKOFF) => {}
            }
        }
    }

    pub fn kafka_diagnostic(&self) -> KafkaDiagnostic {
        KafkaDiagnostic {
            producer: self.producer.clone(),
            topic: (!self.config.topic.contains("%{")).then(|| self.config.topic.clone()),
        }
    }
}

async fn fetch_partition_count(producer: FutureProducer, topic: String) -> Result<u32> {
    tokio::task::spawn_blocking(move || -> Result<u32> {
        let metadata = producer
            .client()
            .fetch_metadata(Some(&topic), METADATA_TIMEOUT)?;
        let partitions = metadata
            .topics()
            .iter()
            .find(|t| t.name() == topic)
            .map(|t| t.partitions().len() as u32)
            .unwrap_or(0);
        if partitions == 0 {
            return Err(Error::Config(format!("Kafka topic '{}' has no partitions", topic)));
        }
        Ok(partitions)
    })
    .await
    .map_err(|e| Error::producer(format!("metadata task failed: {}", e)))
    .and_then(|counted| counted)
}

#[async_trait]
impl Producer for KafkaProducer {
    fn name(&self) -> &str {
        "kafka"
    }

    async fn push(&self, row: RowEvent, completion: Completion) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::producer("kafka producer is stopped"));
        }

        let topic = self.config.topic_for(&row.database, row.table_name());
        let partitions = match self.partitions(&topic).await {
            Ok(partitions) => partitions,
            Err(e) => {
                completion.fail(e);
                return Ok(());
            }
        };
        let partition = self.partitioner.partition(&row, partitions) as i32;
        let key = self.keys.key_for(&row);
        let payload = match self.serializer.to_json(&row) {
            Ok(payload) => payload,
            Err(e) => {
                completion.fail(e);
                return Ok(());
            }
        };

        let cancel = completion.cancellation_token();
        let delivery = match self.enqueue(&topic, partition, &key, &payload, &cancel).await {
            Ok(delivery) => delivery,
            Err(Error::Shutdown) => return Err(Error::Shutdown),
            Err(e) => {
                completion.fail(e);
                return Ok(());
            }
        };
        self.pending.start();
        let pending = self.pending.clone();
        tokio::spawn(async move {
            match delivery.await {
                Ok(Ok(_)) => completion.complete(),
                Ok(Err((e, _))) => completion.fail(Error::Kafka(e)),
                Err(_) => completion.fail(Error::producer("delivery report dropped")),
            }
            pending.finish();
        });
        Ok(())
    }

    fn request_stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    #[instrument(skip(self))]
    async fn await_stop(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let idle = self.pending.idle.notified();
            let pending = self.pending.len();
            if pending == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                warn!(pending, "Kafka deliveries still pending at stop");
                return Err(Error::Timeout {
                    message: format!("{} Kafka deliveries pending", pending),
                });
            }
        }

        let producer = self.producer.clone();
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        tokio::task::spawn_blocking(move || producer.flush(remaining))
            .await
            .map_err(|e| Error::producer(format!("flush task failed: {}", e)))??;
        info!("Kafka producer stopped");
        Ok(())
    }

    fn diagnostic(&self) -> Option<Arc<dyn Diagnostic>> {
        Some(Arc::new(self.kafka_diagnostic()))
    }
}

/// Checks that the brokers answer a metadata request.
pub struct KafkaDiagnostic {
    producer: FutureProducer,
    /// Topic that must exist; none when the topic is templated per row.
    topic: Option<String>,
}

#[async_trait]
impl Diagnostic for KafkaDiagnostic {
    fn name(&self) -> &str {
        "kafka"
    }

    fn is_mandatory(&self) -> bool {
        true
    }

    async fn check(&self) -> Check {
        let producer = self.producer.clone();
        let topic = self.topic.clone();
        let checked = tokio::task::spawn_blocking(move || -> Result<()> {
            let metadata = producer
                .client()
                .fetch_metadata(topic.as_deref(), METADATA_TIMEOUT)?;
            if let Some(topic) = &topic {
                let found = metadata
                    .topics()
                    .iter()
                    .any(|t| t.name() == topic && !t.partitions().is_empty());
                if !found {
                    return Err(Error::Config(format!("topic '{}' not found", topic)));
                }
            }
            Ok(())
        })
        .await;

        match checked {
            Ok(Ok(())) => Check::ok(self.name(), true),
            Ok(Err(e)) => Check::failed(self.name(), true, e.to_string()),
            Err(e) => Check::failed(self.name(), true, format!("metadata task failed: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeyFormat;
    use crate::context::ReplicationContext;
    use crate::dispatch::InflightTracker;
    use crate::row::tests::insert_row;
    use std::env;

    fn test_config(partitions: Option<u32>) -> KafkaConfig {
        KafkaConfig {
            brokers: vec![env::var("TEST_KAFKA_BROKERS").unwrap_or_else(|_| "localhost:9092".to_string())],
            topic: env::var("TEST_KAFKA_TOPIC").unwrap_or_else(|_| "binlog_capture_test".to_string()),
            partitions,
            key_format: KeyFormat::Hash,
            compression: "none".to_string(),
            acks: "all".to_string(),
            linger_ms: 5,
            batch_size: 16384,
            message_timeout_ms: 10_000,
            properties: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_creation_does_not_need_brokers() {
        let producer = KafkaProducer::new(
            &test_config(Some(4)),
            &PartitionConfig::default(),
            OutputConfig::default(),
        )
        .unwrap();
        assert_eq!(producer.partitions("any").await.unwrap(), 4);

        producer.request_stop();
        producer.await_stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_full_queue_gives_up_on_cancel() {
        let mut config = test_config(Some(1));
        config.brokers = vec!["127.0.0.1:1".to_string()];
        config.message_timeout_ms = 1000;
        config
            .properties
            .insert("queue.buffering.max.messages".to_string(), "1".to_string());
        let producer =
            KafkaProducer::new(&config, &PartitionConfig::default(), OutputConfig::default()).unwrap();
        let cancel = CancellationToken::new();

        let _first = producer
            .enqueue("unreachable", 0, "k", "{}", &cancel)
            .await
            .unwrap();
        // the queue holds one message, so this one waits for room
        let second = producer.enqueue("unreachable", 0, "k", "{}", &cancel);
        let cancelled = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        };

        let (result, ()) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(second, cancelled)
        })
        .await
        .unwrap();
        assert!(matches!(result, Err(Error::Shutdown)));
    }

    #[tokio::test]
    async fn test_pending_counter_wakes_waiters() {
        let pending = Arc::new(Pending::default());
        pending.start();

        let waiter = {
            let pending = pending.clone();
            tokio::spawn(async move {
                let idle = pending.idle.notified();
                if pending.len() > 0 {
                    idle.await;
                }
            })
        };
        tokio::task::yield_now().await;
        pending.finish();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    #[ignore] // Requires Kafka
    async fn test_publish_and_acknowledge() {
        let producer = KafkaProducer::new(
            &test_config(None),
            &PartitionConfig::default(),
            OutputConfig::default(),
        )
        .unwrap();
        assert!(producer.kafka_diagnostic().check().await.success);

        let tracker = Arc::new(InflightTracker::new(4));
        let context = ReplicationContext::new(false);
        let mut row = insert_row("shop", "orders", 1);
        row.tx_commit = true;
        let checkpoint = row.next_position.clone();

        let id = tracker
            .acquire(Some(checkpoint.clone()), &CancellationToken::new())
            .await
            .unwrap();
        let completion = Completion::new(id, "test row", tracker.clone(), context.clone());
        producer.push(row, completion).await.unwrap();

        producer.request_stop();
        producer.await_stop(Duration::from_secs(30)).await.unwrap();
        assert_eq!(context.acknowledged(), Some(checkpoint));
        assert!(!context.is_terminated());
    }
}
