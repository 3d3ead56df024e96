//! In-process coordination store
//!
//! Backs tests and single-process runs. Connection loss can be simulated with
//! [`MemoryStore::sever_connections`] and [`MemoryStore::set_available`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::{Appended, CoordinationStore, LogReader, RecordId, StreamBatch, StreamRecord};
use crate::error::StoreError;

/// Coordination store kept entirely in memory
///
/// Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    data: Mutex<Data>,
    /// Woken on every append and on every simulated fault
    changed: Notify,
    /// Bumped to drop every open reader
    generation: AtomicU64,
    unavailable: AtomicBool,
    operations: AtomicU64,
}

#[derive(Default)]
struct Data {
    counters: HashMap<String, i64>,
    logs: HashMap<String, Vec<StreamRecord>>,
    last_id: RecordId,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next read of every currently open reader with a connection error
    pub fn sever_connections(&self) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(generation, "MemoryStore::sever_connections: called");
        self.inner.changed.notify_waiters();
    }

    /// Make every operation fail (false) or succeed again (true)
    pub fn set_available(&self, available: bool) {
        debug!(available, "MemoryStore::set_available: called");
        self.inner.unavailable.store(!available, Ordering::SeqCst);
        self.inner.changed.notify_waiters();
    }

    /// Number of store operations issued so far
    pub fn operations(&self) -> u64 {
        self.inner.operations.load(Ordering::SeqCst)
    }

    /// Number of records in a log
    pub fn log_len(&self, key: &str) -> usize {
        self.inner.lock().logs.get(key).map_or(0, Vec::len)
    }

    fn begin(&self) -> Result<MutexGuard<'_, Data>, StoreError> {
        self.inner.operations.fetch_add(1, Ordering::SeqCst);
        self.inner.check_available()?;
        Ok(self.inner.lock())
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Data> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("memory store unavailable".to_string()));
        }
        Ok(())
    }
}

impl Data {
    fn next_id(&mut self) -> RecordId {
        let now_ms = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
        let id = if now_ms > self.last_id.ms {
            RecordId::new(now_ms, 0)
        } else {
            self.last_id.next()
        };
        self.last_id = id;
        id
    }

    fn collect(&self, cursors: &[(String, RecordId)], count: usize) -> Vec<StreamBatch> {
        cursors
            .iter()
            .filter_map(|(key, cursor)| {
                let log = self.logs.get(key)?;
                let start = log.partition_point(|r| r.id <= *cursor);
                let records: Vec<StreamRecord> = log[start..].iter().take(count).cloned().collect();
                if records.is_empty() {
                    return None;
                }
                Some(StreamBatch {
                    key: key.clone(),
                    records,
                })
            })
            .collect()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.begin().map(|_| ())
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut data = self.begin()?;
        let counter = data.counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn counters(&self, keys: &[String]) -> Result<Vec<i64>, StoreError> {
        let data = self.begin()?;
        Ok(keys
            .iter()
            .map(|k| data.counters.get(k).copied().unwrap_or(0))
            .collect())
    }

    async fn append(&self, key: &str, payload: &[u8]) -> Result<Appended, StoreError> {
        let appended = {
            let mut data = self.begin()?;
            let id = data.next_id();
            let log = data.logs.entry(key.to_string()).or_default();
            log.push(StreamRecord {
                id,
                payload: payload.to_vec(),
            });
            Appended {
                id,
                position: log.len() as u64,
            }
        };
        self.inner.changed.notify_waiters();
        Ok(appended)
    }

    async fn first_record(&self, key: &str) -> Result<Option<StreamRecord>, StoreError> {
        let data = self.begin()?;
        Ok(data.logs.get(key).and_then(|log| log.first()).cloned())
    }

    async fn open_reader(&self) -> Result<Box<dyn LogReader>, StoreError> {
        drop(self.begin()?);
        Ok(Box::new(MemoryReader {
            inner: self.inner.clone(),
            generation: self.inner.generation.load(Ordering::SeqCst),
        }))
    }
}

struct MemoryReader {
    inner: Arc<Inner>,
    generation: u64,
}

impl MemoryReader {
    fn check_connection(&self) -> Result<(), StoreError> {
        self.inner.check_available()?;
        if self.inner.generation.load(Ordering::SeqCst) != self.generation {
            return Err(StoreError::Connection("connection reset by peer".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LogReader for MemoryReader {
    async fn read(
        &mut self,
        cursors: &[(String, RecordId)],
        block: Option<Duration>,
        count: usize,
    ) -> Result<Vec<StreamBatch>, StoreError> {
        self.inner.operations.fetch_add(1, Ordering::SeqCst);
        let deadline = block.map(|d| Instant::now() + d);

        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.check_connection()?;
            let batches = self.inner.lock().collect(cursors, count);
            if !batches.is_empty() {
                return Ok(batches);
            }

            let Some(deadline) = deadline else {
                return Ok(Vec::new());
            };
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_incr_is_sequential() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("k").await.unwrap(), 1);
        assert_eq!(store.incr("k").await.unwrap(), 2);
        assert_eq!(store.incr("other").await.unwrap(), 1);

        let values = store
            .counters(&["k".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(values, vec![2, 0]);
    }

    #[tokio::test]
    async fn test_append_positions_and_ids() {
        let store = MemoryStore::new();
        let a = store.append("log", b"a").await.unwrap();
        let b = store.append("log", b"b").await.unwrap();
        assert_eq!(a.position, 1);
        assert_eq!(b.position, 2);
        assert!(b.id > a.id);
        assert_eq!(store.log_len("log"), 2);
    }

    #[tokio::test]
    async fn test_first_record() {
        let store = MemoryStore::new();
        assert_eq!(store.first_record("log").await.unwrap(), None);

        let first = store.append("log", b"x").await.unwrap();
        store.append("log", b"y").await.unwrap();
        let record = store.first_record("log").await.unwrap().unwrap();
        assert_eq!(record.id, first.id);
        assert_eq!(record.payload, b"x");
    }

    #[tokio::test]
    async fn test_read_from_cursor() {
        let store = MemoryStore::new();
        let first = store.append("log", b"1").await.unwrap();
        store.append("log", b"2").await.unwrap();

        let mut reader = store.open_reader().await.unwrap();
        let batches = reader
            .read(&[("log".to_string(), first.id)], None, 100)
            .await
            .unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].records.len(), 1);
        assert_eq!(batches[0].records[0].payload, b"2");
    }

    #[tokio::test]
    async fn test_read_respects_count() {
        let store = MemoryStore::new();
        for i in 0..5u8 {
            store.append("log", &[i]).await.unwrap();
        }
        let mut reader = store.open_reader().await.unwrap();
        let batches = reader
            .read(&[("log".to_string(), RecordId::ORIGIN)], None, 3)
            .await
            .unwrap();
        assert_eq!(batches[0].records.len(), 3);
    }

    #[tokio::test]
    async fn test_blocking_read_times_out_empty() {
        let store = MemoryStore::new();
        let mut reader = store.open_reader().await.unwrap();
        let batches = reader
            .read(
                &[("log".to_string(), RecordId::ORIGIN)],
                Some(Duration::from_millis(20)),
                10,
            )
            .await
            .unwrap();
        assert!(batches.is_empty());
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_append() {
        let store = MemoryStore::new();
        let mut reader = store.open_reader().await.unwrap();

        let writer = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append("log", b"late").await.unwrap();
        });

        let batches = reader
            .read(&[("log".to_string(), RecordId::ORIGIN)], Some(Duration::from_secs(5)), 10)
            .await
            .unwrap();
        assert_eq!(batches[0].records[0].payload, b"late");
    }

    #[tokio::test]
    async fn test_sever_fails_open_readers_only() {
        let store = MemoryStore::new();
        let mut old = store.open_reader().await.unwrap();
        store.sever_connections();

        let err = old
            .read(&[("log".to_string(), RecordId::ORIGIN)], None, 10)
            .await
            .unwrap_err();
        assert!(err.is_connection_error());

        let mut fresh = store.open_reader().await.unwrap();
        assert!(
            fresh
                .read(&[("log".to_string(), RecordId::ORIGIN)], None, 10)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_unavailable() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(store.incr("k").await.unwrap_err().is_connection_error());
        assert!(store.open_reader().await.is_err());
        store.set_available(true);
        assert_eq!(store.incr("k").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_operations_counted() {
        let store = MemoryStore::new();
        assert_eq!(store.operations(), 0);
        store.ping().await.unwrap();
        store.incr("k").await.unwrap();
        assert_eq!(store.operations(), 2);
    }
}
