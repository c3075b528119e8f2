//! Transaction row buffer.
//!
//! The replicator collects the rows of the open transaction in a
//! [`RowBuffer`]. The transaction id is only known at commit, so rows are
//! stamped with it (and with their in-transaction offset and server id) as
//! they leave the buffer.
//!
//! # Example
//!
//! ```rust,no_run
//! use binlog_capture::buffer::{RowBuffer, SpillLimits};
//! # fn rows() -> Vec<binlog_capture::row::RowEvent> { vec![] }
//!
//! # fn main() -> binlog_capture::Result<()> {
//! let mut buffer = RowBuffer::new(SpillLimits::elements(2));
//! for row in rows() {
//!     buffer.add(row)?;
//! }
//! buffer.set_xid(Some(1234));
//! while !buffer.is_empty() {
//!     let row = buffer.remove_first()?;
//!     assert_eq!(row.transaction_id, Some(1234));
//! }
//! # Ok(())
//! # }
//! ```

pub mod codec;
mod spill;

pub use spill::{SpillBuffer, SpillLimits};

use crate::row::RowEvent;
use crate::Result;

#[derive(Debug)]
pub struct RowBuffer {
    rows: SpillBuffer,
    xid: Option<u64>,
    xoffset: u32,
    server_id: Option<u64>,
}

impl RowBuffer {
    pub fn new(limits: SpillLimits) -> Self {
        Self {
            rows: SpillBuffer::new(limits),
            xid: None,
            xoffset: 0,
            server_id: None,
        }
    }

    pub fn add(&mut self, row: RowEvent) -> Result<()> {
        self.rows.push_back(row)
    }

    /// Returns the oldest row, stamped with this buffer's transaction metadata.
    ///
    /// Fails with [`crate::Error::EmptyBuffer`] when nothing is buffered.
    pub fn remove_first(&mut self) -> Result<RowEvent> {
        let mut row = self.rows.pop_front()?;
        row.transaction_id = self.xid;
        row.transaction_offset = self.xoffset;
        row.server_id = self.server_id;
        self.xoffset += 1;
        Ok(row)
    }

    pub fn set_xid(&mut self, xid: Option<u64>) {
        self.xid = xid;
    }

    pub fn set_server_id(&mut self, server_id: u64) {
        self.server_id = Some(server_id);
    }

    /// Entries held in memory and on disk.
    pub fn size(&self) -> usize {
        self.rows.len()
    }

    pub fn in_memory_size(&self) -> usize {
        self.rows.in_memory_len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
