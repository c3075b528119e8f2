//! Two-tier FIFO: an in-memory window backed by an append-only spill file.
//!
//! When either budget is exceeded the oldest in-memory rows are appended to
//! the spill file. Every row on disk is older than every row in memory, so
//! `remove_first` drains the file before touching memory and FIFO order
//! holds across both tiers. The file is created on first spill and deleted
//! once drained.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::codec;
use crate::row::RowEvent;
use crate::{Error, Result};

/// Memory/disk limits for one buffer.
#[derive(Debug, Clone)]
pub struct SpillLimits {
    pub max_in_memory_elements: usize,
    pub max_memory_bytes: u64,
    pub spill_dir: Option<PathBuf>,
}

impl SpillLimits {
    pub fn elements(max_in_memory_elements: usize) -> Self {
        Self {
            max_in_memory_elements,
            max_memory_bytes: u64::MAX,
            spill_dir: None,
        }
    }
}

impl From<&crate::config::BufferConfig> for SpillLimits {
    fn from(config: &crate::config::BufferConfig) -> Self {
        Self {
            max_in_memory_elements: config.max_in_memory_elements,
            max_memory_bytes: config.max_memory_bytes,
            spill_dir: config.spill_dir.clone(),
        }
    }
}

struct SpillFile {
    file: NamedTempFile,
    writer: BufWriter<File>,
    reader: BufReader<File>,
    elements: usize,
    dirty: bool,
}

impl SpillFile {
    fn create(dir: Option<&PathBuf>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("binlog-capture-spill-").suffix(".bin");
        let file = match dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };

        let mut writer = BufWriter::new(file.reopen()?);
        writer.write_all(&codec::header())?;
        writer.flush()?;

        let mut reader = BufReader::new(file.reopen()?);
        let mut header = [0u8; codec::HEADER_LEN];
        reader.read_exact(&mut header)?;
        codec::check_header(&header)?;

        debug!(path = ?file.path(), "Created spill file");
        Ok(Self {
            file,
            writer,
            reader,
            elements: 0,
            dirty: false,
        })
    }

    fn append(&mut self, row: &RowEvent) -> Result<()> {
        let record = codec::encode(row)?;
        self.writer.write_all(&record)?;
        self.elements += 1;
        self.dirty = true;
        Ok(())
    }

    fn read_next(&mut self) -> Result<RowEvent> {
        if self.dirty {
            self.writer.flush()?;
            self.dirty = false;
        }

        let mut len = [0u8; 4];
        self.reader.read_exact(&mut len)?;
        let len = codec::check_record_len(u32::from_be_bytes(len))?;
        let mut body = vec![0u8; len];
        self.reader.read_exact(&mut body)?;

        let row = codec::decode(body.into())?;
        self.elements -= 1;
        Ok(row)
    }
}

pub struct SpillBuffer {
    memory: VecDeque<RowEvent>,
    memory_bytes: u64,
    spill: Option<SpillFile>,
    limits: SpillLimits,
}

impl SpillBuffer {
    pub fn new(limits: SpillLimits) -> Self {
        Self {
            memory: VecDeque::new(),
            memory_bytes: 0,
            spill: None,
            limits,
        }
    }

    pub fn push_back(&mut self, row: RowEvent) -> Result<()> {
        self.memory_bytes += row.approximate_size();
        self.memory.push_back(row);

        while self.over_budget() {
            self.evict_oldest()?;
        }
        Ok(())
    }

    pub fn pop_front(&mut self) -> Result<RowEvent> {
        if let Some(spill) = self.spill.as_mut() {
            if spill.elements > 0 {
                let row = spill.read_next()?;
                if spill.elements == 0 {
                    if let Some(drained) = self.spill.take() {
                        debug!(path = ?drained.file.path(), "Spill file drained, removing");
                        if let Err(e) = drained.file.close() {
                            warn!(error = %e, "Failed to remove drained spill file");
                        }
                    }
                }
                return Ok(row);
            }
        }

        let row = self.memory.pop_front().ok_or(Error::EmptyBuffer)?;
        self.memory_bytes = self.memory_bytes.saturating_sub(row.approximate_size());
        Ok(row)
    }

    pub fn len(&self) -> usize {
        self.memory.len() + self.on_disk()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_memory_len(&self) -> usize {
        self.memory.len()
    }

    pub fn on_disk(&self) -> usize {
        self.spill.as_ref().map_or(0, |s| s.elements)
    }

    /// Path of the live spill file, if any.
    pub fn spill_path(&self) -> Option<PathBuf> {
        self.spill.as_ref().map(|s| s.file.path().to_path_buf())
    }

    fn over_budget(&self) -> bool {
        !self.memory.is_empty()
            && (self.memory.len() > self.limits.max_in_memory_elements
                || self.memory_bytes > self.limits.max_memory_bytes)
    }

    /// Moves the oldest in-memory row to disk; on error the row stays in memory.
    fn evict_oldest(&mut self) -> Result<()> {
        let Some(row) = self.memory.front() else {
            return Ok(());
        };

        let spill = match self.spill.as_mut() {
            Some(spill) => spill,
            None => self
                .spill
                .insert(SpillFile::create(self.limits.spill_dir.as_ref())?),
        };
        spill.append(row)?;

        if let Some(row) = self.memory.pop_front() {
            self.memory_bytes = self.memory_bytes.saturating_sub(row.approximate_size());
        }
        Ok(())
    }
}

impl std::fmt::Debug for SpillBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpillBuffer")
            .field("in_memory", &self.memory.len())
            .field("on_disk", &self.on_disk())
            .field("memory_bytes", &self.memory_bytes)
            .finish()
    }
}
