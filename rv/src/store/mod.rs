//! Coordination store adapter
//!
//! The sync client needs exactly two primitives from its backing store:
//! an atomic counter per key and an append-only log per key with resumable
//! blocking reads. [`CoordinationStore`] exposes them;
//! [`RedisStore`] maps them onto Redis and [`MemoryStore`] keeps them
//! in-process.

mod memory;
mod redis_store;
mod tail;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub(crate) use tail::Tailer;

/// Position of a record in a log; also the cursor to resume reading after it
///
/// Ordered by `(ms, seq)`; rendered as `ms-seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RecordId {
    pub ms: u64,
    pub seq: u64,
}

impl RecordId {
    /// Cursor that precedes every record of a log
    pub const ORIGIN: RecordId = RecordId { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Smallest id strictly greater than `self`
    pub fn next(&self) -> Self {
        match self.seq.checked_add(1) {
            Some(seq) => Self { ms: self.ms, seq },
            None => Self {
                ms: self.ms + 1,
                seq: 0,
            },
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for RecordId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || StoreError::Command(format!("malformed record id {s:?}"));
        let (ms, seq) = match s.split_once('-') {
            Some((ms, seq)) => (ms, seq),
            None => (s, "0"),
        };
        Ok(Self {
            ms: ms.parse().map_err(|_| bad())?,
            seq: seq.parse().map_err(|_| bad())?,
        })
    }
}

/// One record read back from a log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    pub id: RecordId,
    pub payload: Vec<u8>,
}

/// Records read from one log, oldest first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamBatch {
    pub key: String,
    pub records: Vec<StreamRecord>,
}

/// Outcome of appending to a log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Appended {
    pub id: RecordId,
    /// 1-based position of the record in its log
    pub position: u64,
}

/// The primitives the sync client needs from its backing store
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Round-trip to check the store is reachable
    async fn ping(&self) -> Result<(), StoreError>;

    /// Atomically increment a counter, creating it at 0 first if needed
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    /// Current values of several counters; missing counters read as 0
    async fn counters(&self, keys: &[String]) -> Result<Vec<i64>, StoreError>;

    /// Append a record to a log
    async fn append(&self, key: &str, payload: &[u8]) -> Result<Appended, StoreError>;

    /// Oldest record of a log, if any
    async fn first_record(&self, key: &str) -> Result<Option<StreamRecord>, StoreError>;

    /// Open a dedicated connection for blocking log reads
    async fn open_reader(&self) -> Result<Box<dyn LogReader>, StoreError>;
}

/// A connection dedicated to reading logs
#[async_trait]
pub trait LogReader: Send {
    /// Read up to `count` records per log strictly after each cursor
    ///
    /// With `block` set, waits up to that long for at least one record and
    /// returns an empty vec on timeout. Without it, returns immediately.
    async fn read(
        &mut self,
        cursors: &[(String, RecordId)],
        block: Option<Duration>,
        count: usize,
    ) -> Result<Vec<StreamBatch>, StoreError>;
}
