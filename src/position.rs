//! Coordinates into the upstream change log.
//!
//! A [`BinlogPosition`] names a byte offset inside one log file. A
//! [`Position`] pairs it with the most recent heartbeat value observed
//! before (or, for heartbeat rows, at) that point. Positions are immutable:
//! every event produces a new one.
//!
//! # Example
//!
//! ```rust
//! use binlog_capture::position::{BinlogPosition, Position};
//!
//! let a: BinlogPosition = "mysql-bin.000002:120".parse().unwrap();
//! let b = BinlogPosition::new("mysql-bin.000010", 4).unwrap();
//! assert!(b > a); // file numbers compare numerically
//!
//! let p = Position::new(a, 0).with_heartbeat(1_700_000_000_000);
//! assert_eq!(p.last_heartbeat_read(), 1_700_000_000_000);
//! ```

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// A file/offset coordinate in the binary log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawBinlogPosition", into = "RawBinlogPosition")]
pub struct BinlogPosition {
    file: String,
    offset: u64,
    file_number: Option<u64>,
}

#[derive(Serialize, Deserialize)]
struct RawBinlogPosition {
    file: String,
    offset: u64,
}

impl TryFrom<RawBinlogPosition> for BinlogPosition {
    type Error = Error;

    fn try_from(raw: RawBinlogPosition) -> Result<Self> {
        BinlogPosition::new(raw.file, raw.offset)
    }
}

impl From<BinlogPosition> for RawBinlogPosition {
    fn from(p: BinlogPosition) -> Self {
        RawBinlogPosition {
            file: p.file,
            offset: p.offset,
        }
    }
}

impl BinlogPosition {
    /// Creates a position, rejecting file names that cannot identify a log.
    pub fn new(file: impl Into<String>, offset: u64) -> Result<Self> {
        let file = file.into();

        if file.trim().is_empty() {
            return Err(Error::MalformedPosition {
                input: format!("{}:{}", file, offset),
                reason: "log file name is empty".to_string(),
            });
        }
        if file.contains(':') || file.chars().any(char::is_whitespace) {
            return Err(Error::MalformedPosition {
                input: format!("{}:{}", file, offset),
                reason: "log file name contains ':' or whitespace".to_string(),
            });
        }

        let file_number = parse_file_number(&file);
        Ok(Self {
            file,
            offset,
            file_number,
        })
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Numeric suffix of the file name (`mysql-bin.000042` -> 42), if any.
    pub fn file_number(&self) -> Option<u64> {
        self.file_number
    }

    /// Strictly newer than `other` in log order.
    pub fn newer_than(&self, other: &BinlogPosition) -> bool {
        self.cmp(other) == Ordering::Greater
    }
}

fn parse_file_number(file: &str) -> Option<u64> {
    let (_, suffix) = file.rsplit_once('.')?;
    suffix.parse().ok()
}

impl Ord for BinlogPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        let by_file = match (self.file_number, other.file_number) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.file.cmp(&other.file)),
            _ => self.file.cmp(&other.file),
        };
        by_file.then(self.offset.cmp(&other.offset))
    }
}

impl PartialOrd for BinlogPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.offset)
    }
}

impl FromStr for BinlogPosition {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = |reason: &str| Error::MalformedPosition {
            input: s.to_string(),
            reason: reason.to_string(),
        };

        let (file, offset) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| malformed("expected <file>:<offset>"))?;
        let offset = offset
            .parse::<u64>()
            .map_err(|_| malformed("offset is not a non-negative integer"))?;

        BinlogPosition::new(file, offset)
    }
}

/// A log coordinate plus the last heartbeat read at that point.
///
/// Ordering is by log coordinates only; the heartbeat is liveness
/// information and never participates in [`Position::compare_to`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    binlog: BinlogPosition,
    last_heartbeat_read: i64,
}

impl Position {
    pub fn new(binlog: BinlogPosition, last_heartbeat_read: i64) -> Self {
        Self {
            binlog,
            last_heartbeat_read,
        }
    }

    /// Parses `file:offset` with a zero heartbeat.
    pub fn parse(s: &str) -> Result<Self> {
        Ok(Self::new(s.parse()?, 0))
    }

    pub fn binlog(&self) -> &BinlogPosition {
        &self.binlog
    }

    pub fn last_heartbeat_read(&self) -> i64 {
        self.last_heartbeat_read
    }

    /// Same log coordinates, new heartbeat.
    pub fn with_heartbeat(&self, last_heartbeat_read: i64) -> Self {
        Self {
            binlog: self.binlog.clone(),
            last_heartbeat_read,
        }
    }

    /// Lexicographic comparison on (file, offset).
    pub fn compare_to(&self, other: &Position) -> Ordering {
        self.binlog.cmp(&other.binlog)
    }

    pub fn newer_than(&self, other: &Position) -> bool {
        self.binlog.newer_than(&other.binlog)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Position[{}, lastHeartbeat={}]",
            self.binlog, self.last_heartbeat_read
        )
    }
}
