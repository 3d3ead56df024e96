//! Reconnecting log tailer
//!
//! Wraps a [`LogReader`] in a small state machine: `Connected` reads until the
//! connection drops, then `Reconnecting` dials a fresh reader with backoff.
//! Cursors are owned by the caller and passed to every read, so a read that
//! is retried after a reconnect resumes exactly where the last delivered
//! record left off.
//!
//! Dropping a `read` future mid-flight abandons the reader (its connection
//! may still have a blocking command outstanding); the next read dials anew.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{CoordinationStore, LogReader, RecordId, StreamBatch};
use crate::config::Backoff;
use crate::error::StoreError;

enum TailState {
    Connected(Box<dyn LogReader>),
    Reconnecting { attempt: u32, last_error: Option<String> },
}

pub(crate) struct Tailer {
    store: Arc<dyn CoordinationStore>,
    state: TailState,
    max_attempts: u32,
    backoff: Backoff,
    /// Connection failures since the last successful read
    failures: u32,
    reconnects: u64,
}

impl Tailer {
    pub(crate) fn new(store: Arc<dyn CoordinationStore>, max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            store,
            state: TailState::Reconnecting {
                attempt: 0,
                last_error: None,
            },
            max_attempts: max_attempts.max(1),
            backoff,
            failures: 0,
            reconnects: 0,
        }
    }

    /// Number of times a lost connection was re-established
    pub(crate) fn reconnects(&self) -> u64 {
        self.reconnects
    }

    /// Read after `cursors`, transparently re-establishing the connection
    ///
    /// Every re-dial after a failure backs off first. Fails with
    /// [`StoreError::ReconnectExhausted`] once `max_attempts` consecutive
    /// dials or reads have failed without a successful read in between, and
    /// with any non-connection error as-is.
    pub(crate) async fn read(
        &mut self,
        cursors: &[(String, RecordId)],
        block: Option<Duration>,
        count: usize,
    ) -> Result<Vec<StreamBatch>, StoreError> {
        loop {
            let state = std::mem::replace(
                &mut self.state,
                TailState::Reconnecting {
                    attempt: 0,
                    last_error: None,
                },
            );

            match state {
                TailState::Connected(mut reader) => match reader.read(cursors, block, count).await {
                    Ok(batches) => {
                        self.failures = 0;
                        self.state = TailState::Connected(reader);
                        return Ok(batches);
                    }
                    Err(e) if e.is_connection_error() => {
                        self.failures += 1;
                        warn!(failures = self.failures, error = %e, "Tailer::read: connection lost, regenerating");
                        self.state = TailState::Reconnecting {
                            attempt: self.failures,
                            last_error: Some(e.to_string()),
                        };
                        self.reconnects += 1;
                    }
                    Err(e) => {
                        self.state = TailState::Connected(reader);
                        return Err(e);
                    }
                },

                TailState::Reconnecting { attempt, last_error } => {
                    if attempt >= self.max_attempts {
                        let last = last_error.unwrap_or_default();
                        warn!(attempts = attempt, %last, "Tailer::read: giving up on reconnect");
                        self.failures = 0;
                        return Err(StoreError::ReconnectExhausted { attempts: attempt, last });
                    }
                    if attempt > 0 {
                        tokio::time::sleep(self.backoff.delay(attempt - 1)).await;
                    }
                    match self.store.open_reader().await {
                        Ok(reader) => {
                            if last_error.is_some() {
                                info!(attempt, "Tailer::read: reader re-established");
                            } else {
                                debug!("Tailer::read: reader opened");
                            }
                            self.state = TailState::Connected(reader);
                        }
                        Err(e) => {
                            warn!(attempt, error = %e, "Tailer::read: failed to open reader");
                            self.failures = attempt + 1;
                            self.state = TailState::Reconnecting {
                                attempt: attempt + 1,
                                last_error: Some(e.to_string()),
                            };
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Appended, MemoryStore, StreamRecord};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn tailer(store: &MemoryStore, attempts: u32) -> Tailer {
        Tailer::new(Arc::new(store.clone()), attempts, Backoff::new(1, 5))
    }

    #[tokio::test]
    async fn test_reads_after_reconnect_from_same_cursor() {
        let store = MemoryStore::new();
        let first = store.append("log", b"1").await.unwrap();
        let mut tailer = tailer(&store, 3);

        let cursors = vec![("log".to_string(), RecordId::ORIGIN)];
        let batches = tailer.read(&cursors, None, 10).await.unwrap();
        assert_eq!(batches[0].records.len(), 1);

        store.append("log", b"2").await.unwrap();
        store.sever_connections();

        let cursors = vec![("log".to_string(), first.id)];
        let batches = tailer.read(&cursors, None, 10).await.unwrap();
        assert_eq!(batches[0].records.len(), 1);
        assert_eq!(batches[0].records[0].payload, b"2");
        assert_eq!(tailer.reconnects(), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let store = MemoryStore::new();
        store.set_available(false);
        let mut tailer = tailer(&store, 2);

        let err = tailer
            .read(&[("log".to_string(), RecordId::ORIGIN)], None, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ReconnectExhausted { attempts: 2, .. }));

        // A later call starts a fresh round of attempts
        store.set_available(true);
        assert!(tailer.read(&[("log".to_string(), RecordId::ORIGIN)], None, 10).await.is_ok());
    }

    /// Store that always dials fine but whose readers drop every read
    #[derive(Default)]
    struct FlakyStore {
        dials: AtomicU32,
    }

    struct FlakyReader;

    #[async_trait]
    impl LogReader for FlakyReader {
        async fn read(
            &mut self,
            _cursors: &[(String, RecordId)],
            _block: Option<Duration>,
            _count: usize,
        ) -> Result<Vec<StreamBatch>, StoreError> {
            Err(StoreError::Connection("reset by peer".to_string()))
        }
    }

    #[async_trait]
    impl CoordinationStore for FlakyStore {
        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }

        async fn incr(&self, _key: &str) -> Result<i64, StoreError> {
            Ok(1)
        }

        async fn counters(&self, keys: &[String]) -> Result<Vec<i64>, StoreError> {
            Ok(vec![0; keys.len()])
        }

        async fn append(&self, _key: &str, _payload: &[u8]) -> Result<Appended, StoreError> {
            Ok(Appended {
                id: RecordId::new(1, 0),
                position: 1,
            })
        }

        async fn first_record(&self, _key: &str) -> Result<Option<StreamRecord>, StoreError> {
            Ok(None)
        }

        async fn open_reader(&self) -> Result<Box<dyn LogReader>, StoreError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FlakyReader))
        }
    }

    #[tokio::test]
    async fn test_failing_reads_back_off_and_give_up() {
        let store = Arc::new(FlakyStore::default());
        let mut tailer = Tailer::new(store.clone(), 3, Backoff::new(10, 50));

        let started = tokio::time::Instant::now();
        let err = tokio::time::timeout(
            Duration::from_secs(2),
            tailer.read(&[("log".to_string(), RecordId::ORIGIN)], None, 10),
        )
        .await
        .expect("tailer kept re-dialing")
        .unwrap_err();

        assert!(matches!(err, StoreError::ReconnectExhausted { attempts: 3, .. }), "got {err:?}");
        assert_eq!(store.dials.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(20), "re-dials did not back off");
        assert_eq!(tailer.reconnects(), 3);
    }
}
