//! WatchClient - read side of a run's lifecycle event log
//!
//! Used by orchestrators rather than test instances: it needs no run identity
//! of its own and takes the run to watch per call.

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{ClientConfig, Config};
use crate::domain::{Event, RunIdentity, events_key};
use crate::error::{SyncError, SyncResult};
use crate::store::{CoordinationStore, RecordId, RedisStore, StreamRecord, Tailer};

pub struct WatchClient {
    store: Arc<dyn CoordinationStore>,
    config: ClientConfig,
}

impl WatchClient {
    pub async fn connect(config: &Config) -> SyncResult<Self> {
        debug!(host = %config.store.host, port = config.store.port, "WatchClient::connect: called");
        let store = RedisStore::connect(&config.store).await?;
        Ok(Self::with_store(Arc::new(store), config.client.clone()))
    }

    pub fn with_store(store: Arc<dyn CoordinationStore>, config: ClientConfig) -> Self {
        Self { store, config }
    }

    /// Every event recorded so far for `identity`'s run, oldest first
    pub async fn fetch_all_events(&self, identity: &RunIdentity) -> SyncResult<Vec<Event>> {
        let key = events_key(identity);
        debug!(%key, "fetch_all_events: called");

        let mut reader = self.store.open_reader().await?;
        let mut cursor = RecordId::ORIGIN;
        let mut events = Vec::new();
        let count = self.config.read_count.max(1);

        loop {
            let batches = reader.read(&[(key.clone(), cursor)], None, count).await?;
            let records: Vec<StreamRecord> = batches.into_iter().flat_map(|b| b.records).collect();
            if records.is_empty() {
                break;
            }
            for record in records {
                events.push(decode_event(&key, &record)?);
                cursor = record.id;
            }
        }

        debug!(%key, events = events.len(), "fetch_all_events: done");
        Ok(events)
    }

    /// Live feed of `identity`'s events: history first, then new ones as they land
    ///
    /// The stream reconnects on connection loss and ends after yielding an
    /// error, or with `Cancelled` once `token` fires.
    pub fn subscribe_events(&self, identity: &RunIdentity, token: CancellationToken) -> EventStream {
        let key = events_key(identity);
        debug!(%key, "subscribe_events: called");

        let (tx, rx) = mpsc::channel(self.config.event_buffer.max(1));
        let tailer = Tailer::new(
            self.store.clone(),
            self.config.reconnect_attempts,
            self.config.reconnect_backoff(),
        );
        tokio::spawn(tail_events(
            tailer,
            key,
            tx,
            token.clone(),
            self.config.read_block(),
            self.config.read_count.max(1),
        ));

        EventStream {
            rx,
            token,
            done: false,
        }
    }
}

fn decode_event(key: &str, record: &StreamRecord) -> SyncResult<Event> {
    serde_json::from_slice(&record.payload).map_err(|e| SyncError::Decode {
        key: key.to_string(),
        record: record.id.to_string(),
        message: e.to_string(),
    })
}

async fn tail_events(
    mut tailer: Tailer,
    key: String,
    tx: mpsc::Sender<SyncResult<Event>>,
    token: CancellationToken,
    block: Duration,
    count: usize,
) {
    let mut cursor = RecordId::ORIGIN;

    loop {
        let cursors = [(key.clone(), cursor)];
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = tx.closed() => break,
            outcome = tailer.read(&cursors, Some(block), count) => outcome,
        };

        let records = match outcome {
            Ok(batches) => batches.into_iter().flat_map(|b| b.records),
            Err(e) => {
                warn!(%key, error = %e, "tail_events: giving up");
                let _ = tx.send(Err(e.into())).await;
                break;
            }
        };

        for record in records {
            let item = decode_event(&key, &record);
            let failed = item.is_err();
            if failed {
                warn!(%key, record = %record.id, "tail_events: undecodable event");
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                sent = tx.send(item) => if sent.is_err() { return },
            }
            if failed {
                return;
            }
            cursor = record.id;
        }
    }
    debug!(%key, "tail_events: stopped");
}

/// Live event feed returned by [`WatchClient::subscribe_events`]
pub struct EventStream {
    rx: mpsc::Receiver<SyncResult<Event>>,
    token: CancellationToken,
    done: bool,
}

impl EventStream {
    /// Next event, the terminal error, or `None` once ended
    pub async fn next(&mut self) -> Option<SyncResult<Event>> {
        if self.done {
            return None;
        }
        tokio::select! {
            biased;
            item = self.rx.recv() => match item {
                Some(Ok(event)) => Some(Ok(event)),
                Some(Err(e)) => {
                    self.done = true;
                    Some(Err(e))
                }
                None => {
                    self.done = true;
                    self.token.is_cancelled().then_some(Err(SyncError::Cancelled))
                }
            },
            _ = self.token.cancelled() => {
                self.done = true;
                Some(Err(SyncError::Cancelled))
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = SyncResult<Event>> + Send {
        futures::stream::unfold(self, |mut events| async move {
            let item = events.next().await?;
            Some((item, events))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn identity() -> RunIdentity {
        RunIdentity::new("r", "p", "c")
    }

    fn watcher(store: &MemoryStore) -> WatchClient {
        let config = ClientConfig {
            read_block_ms: 20,
            read_count: 2,
            reconnect_attempts: 3,
            reconnect_min_backoff_ms: 1,
            reconnect_max_backoff_ms: 5,
            ..ClientConfig::default()
        };
        WatchClient::with_store(Arc::new(store.clone()), config)
    }

    async fn record(store: &MemoryStore, event: &Event) {
        store
            .append(&events_key(&identity()), &serde_json::to_vec(event).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_fetch_all_pages_through_log() {
        let store = MemoryStore::new();
        for i in 0..5 {
            record(&store, &Event::Message { message: format!("m{i}") }).await;
        }

        let events = watcher(&store).fetch_all_events(&identity()).await.unwrap();
        assert_eq!(events.len(), 5);
        assert_eq!(events[4], Event::Message { message: "m4".to_string() });
    }

    #[tokio::test]
    async fn test_fetch_all_empty_log() {
        let store = MemoryStore::new();
        assert!(watcher(&store).fetch_all_events(&identity()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_all_decode_error() {
        let store = MemoryStore::new();
        store.append(&events_key(&identity()), b"garbage").await.unwrap();

        let err = watcher(&store).fetch_all_events(&identity()).await.unwrap_err();
        assert!(matches!(err, SyncError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_subscribe_events_history_live_and_cancel() {
        let store = MemoryStore::new();
        record(&store, &Event::Message { message: "before".to_string() }).await;

        let token = CancellationToken::new();
        let mut events = watcher(&store).subscribe_events(&identity(), token.clone());
        let first = tokio::time::timeout(Duration::from_secs(2), events.next()).await.unwrap();
        assert_eq!(first, Some(Ok(Event::Message { message: "before".to_string() })));

        store.sever_connections();
        record(&store, &Event::Success { group: "single".to_string() }).await;
        let second = tokio::time::timeout(Duration::from_secs(2), events.next()).await.unwrap();
        assert_eq!(second, Some(Ok(Event::Success { group: "single".to_string() })));

        token.cancel();
        assert_eq!(events.next().await, Some(Err(SyncError::Cancelled)));
        assert_eq!(events.next().await, None);
    }
}
