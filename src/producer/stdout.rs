use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use super::{Producer, RowSerializer};
use crate::config::OutputConfig;
use crate::dispatch::Completion;
use crate::row::RowEvent;
use crate::{Error, Result};

/// Writes one JSON document per line.
pub struct StdoutProducer {
    serializer: RowSerializer,
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    stopped: AtomicBool,
}

impl StdoutProducer {
    pub fn new(output: OutputConfig) -> Self {
        Self::with_writer(output, Box::new(tokio::io::stdout()))
    }

    pub fn with_writer(output: OutputConfig, writer: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        Self {
            serializer: RowSerializer::new(output),
            writer: Mutex::new(writer),
            stopped: AtomicBool::new(false),
        }
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl Producer for StdoutProducer {
    fn name(&self) -> &str {
        "stdout"
    }

    async fn push(&self, row: RowEvent, completion: Completion) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::producer("stdout producer is stopped"));
        }

        let written = match self.serializer.to_json(&row) {
            Ok(line) => self.write_line(&line).await,
            Err(e) => Err(e),
        };
        match written {
            Ok(()) => completion.complete(),
            Err(e) => completion.fail(e),
        }
        Ok(())
    }

    fn request_stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ReplicationContext;
    use crate::dispatch::InflightTracker;
    use crate::row::tests::insert_row;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_writes_json_lines_and_acknowledges() {
        let (writer, mut reader) = tokio::io::duplex(4096);
        let producer = StdoutProducer::with_writer(OutputConfig::default(), Box::new(writer));

        let context = ReplicationContext::new(false);
        let tracker = Arc::new(InflightTracker::new(4));
        let mut row = insert_row("shop", "orders", 1000);
        row.tx_commit = true;
        row.data.insert("id".to_string(), json!(1));

        let id = tracker
            .acquire(Some(row.next_position.clone()), &CancellationToken::new())
            .await
            .unwrap();
        let completion = Completion::new(id, "shop.orders", tracker.clone(), context.clone());
        producer.push(row.clone(), completion).await.unwrap();

        assert_eq!(context.acknowledged(), Some(row.next_position.clone()));

        drop(producer);
        let mut output = String::new();
        reader.read_to_string(&mut output).await.unwrap();
        let doc: Value = serde_json::from_str(output.trim()).unwrap();
        assert_eq!(doc["data"], json!({"id": 1}));
    }
}
