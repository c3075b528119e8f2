use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use super::{LogSource, RawEvent};
use crate::position::BinlogPosition;
use crate::{Error, Result};

/// Replays raw events from a newline-delimited JSON file.
///
/// In follow mode the file is polled for appended lines instead of ending
/// the stream at EOF.
pub struct JsonLinesSource {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    pending: Vec<u8>,
    line_number: u64,
    skip_before: Option<BinlogPosition>,
    follow: bool,
    poll_interval: Duration,
}

impl JsonLinesSource {
    pub fn new(path: impl AsRef<Path>, follow: bool, poll_interval: Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            reader: None,
            pending: Vec::new(),
            line_number: 0,
            skip_before: None,
            follow,
            poll_interval,
        }
    }

    pub fn from_config(config: &crate::config::SourceConfig) -> Self {
        Self::new(
            &config.path,
            config.follow,
            Duration::from_millis(config.poll_interval_ms),
        )
    }

    async fn open(&mut self) -> Result<()> {
        let file = File::open(&self.path).await.map_err(|e| {
            Error::Connection(format!("cannot open log file {:?}: {}", self.path, e))
        })?;
        self.reader = Some(BufReader::new(file));
        self.pending.clear();
        self.line_number = 0;
        Ok(())
    }

    /// Every event currently in the file, read independently of the stream.
    async fn scan(&self) -> Result<Vec<RawEvent>> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            Error::Connection(format!("cannot read log file {:?}: {}", self.path, e))
        })?;

        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| parse_line(line, i as u64 + 1))
            .collect()
    }

    /// Reads one complete line into `pending`; `false` at EOF.
    async fn fill_line(&mut self) -> Result<bool> {
        if self.reader.is_none() {
            self.open().await?;
        }
        let Some(reader) = self.reader.as_mut() else {
            return Ok(false);
        };

        loop {
            // read_until keeps partial bytes in `pending` if cancelled
            let n = reader.read_until(b'\n', &mut self.pending).await?;
            if self.pending.ends_with(b"\n") {
                return Ok(true);
            }
            if n == 0 {
                if self.follow {
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
                return Ok(!self.pending.is_empty());
            }
        }
    }
}

fn parse_line(line: &str, line_number: u64) -> Result<RawEvent> {
    serde_json::from_str(line).map_err(|e| Error::InvalidMessage {
        message: format!("line {}: {}", line_number, e),
    })
}

#[async_trait]
impl LogSource for JsonLinesSource {
    async fn server_id(&mut self) -> Result<u64> {
        Ok(self.scan().await?.last().map_or(0, |e| e.server_id))
    }

    async fn head_position(&mut self) -> Result<BinlogPosition> {
        match self.scan().await?.last() {
            Some(event) => Ok(event.next_position.clone()),
            None => Err(Error::Connection(format!(
                "log file {:?} holds no events",
                self.path
            ))),
        }
    }

    async fn list_logs(&mut self) -> Result<Vec<String>> {
        let mut logs: Vec<String> = Vec::new();
        for event in self.scan().await? {
            if logs.last().map(String::as_str) != Some(event.position.file()) {
                logs.push(event.position.file().to_string());
            }
        }
        Ok(logs)
    }

    async fn seek(&mut self, position: &BinlogPosition) -> Result<()> {
        info!(position = %position, path = ?self.path, "Seeking log");
        self.open().await?;
        self.skip_before = Some(position.clone());
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<RawEvent>> {
        loop {
            if !self.fill_line().await? {
                return Ok(None);
            }
            self.line_number += 1;

            let raw = std::mem::take(&mut self.pending);
            let line = String::from_utf8(raw).map_err(|_| Error::InvalidMessage {
                message: format!("line {}: invalid utf-8", self.line_number),
            })?;
            if line.trim().is_empty() {
                continue;
            }

            let event = parse_line(line.trim_end(), self.line_number)?;
            if let Some(target) = &self.skip_before {
                if event.position < *target {
                    continue;
                }
                if event.position != *target {
                    warn!(
                        requested = %target,
                        found = %event.position,
                        "No event starts at the requested position, resuming at the next one"
                    );
                }
                self.skip_before = None;
            }

            debug!(position = %event.position, "Read event");
            return Ok(Some(event));
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.reader = None;
        self.pending.clear();
        Ok(())
    }
}
