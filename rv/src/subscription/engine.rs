//! SubscriptionEngine - actor that tails every subscribed topic
//!
//! One task, one reader connection. Each round it issues a single blocking
//! multi-key read covering all subscribed topics, starting each key at the
//! lowest cursor among that key's subscribers, and fans the records out.
//! New registrations are accepted while a read is in flight; they start at
//! the origin and are picked up by the next round.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::messages::{DeliverySink, SubscriptionMetrics, SubscriptionRequest};
use crate::config::ClientConfig;
use crate::error::SyncError;
use crate::store::{CoordinationStore, RecordId, StreamBatch, Tailer};

struct ActiveSubscription {
    key: String,
    cursor: RecordId,
    token: CancellationToken,
    sink: Box<dyn DeliverySink>,
}

/// Subscriber bookkeeping, kept apart from the reader so a read can stay in
/// flight while requests are handled
#[derive(Default)]
struct Registry {
    active: HashMap<String, ActiveSubscription>,
    metrics: SubscriptionMetrics,
}

impl Registry {
    fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    fn handle(&mut self, req: SubscriptionRequest) {
        match req {
            SubscriptionRequest::Register {
                id,
                key,
                token,
                sink,
                ack,
            } => {
                debug!(%id, %key, "SubscriptionEngine::handle: Register");
                self.active.insert(
                    id,
                    ActiveSubscription {
                        key,
                        cursor: RecordId::ORIGIN,
                        token,
                        sink,
                    },
                );
                self.metrics.active = self.active.len();
                let _ = ack.send(());
            }

            SubscriptionRequest::GetMetrics { reply } => {
                let _ = reply.send(self.metrics.clone());
            }
        }
    }

    /// Remove subscriptions whose caller cancelled or went away
    fn reap(&mut self) {
        let gone: Vec<String> = self
            .active
            .iter()
            .filter(|(_, sub)| sub.token.is_cancelled() || sub.sink.is_closed())
            .map(|(id, _)| id.clone())
            .collect();

        for id in gone {
            if let Some(sub) = self.active.remove(&id) {
                debug!(%id, key = %sub.key, "SubscriptionEngine::reap: subscription ended");
                if sub.token.is_cancelled() {
                    sub.sink.finish(SyncError::Cancelled);
                }
            }
        }
        self.metrics.active = self.active.len();
    }

    /// Lowest cursor per subscribed key
    fn cursors(&self) -> Vec<(String, RecordId)> {
        let mut lowest: BTreeMap<&str, RecordId> = BTreeMap::new();
        for sub in self.active.values() {
            lowest
                .entry(sub.key.as_str())
                .and_modify(|c| *c = (*c).min(sub.cursor))
                .or_insert(sub.cursor);
        }
        lowest.into_iter().map(|(k, c)| (k.to_string(), c)).collect()
    }

    /// Hand each batch to the subscriptions it is contiguous for
    ///
    /// A batch read after cursor `from` covers a subscriber only if that
    /// subscriber has already seen everything up to `from`. Subscribers
    /// further behind wait for the next round, which starts at their cursor.
    fn dispatch(&mut self, used: &[(String, RecordId)], batches: Vec<StreamBatch>) {
        let mut failed = Vec::new();

        for batch in &batches {
            let Some(from) = used.iter().find(|(k, _)| *k == batch.key).map(|(_, c)| *c) else {
                continue;
            };

            for (id, sub) in self.active.iter_mut() {
                if sub.key != batch.key || sub.cursor < from {
                    continue;
                }
                for record in &batch.records {
                    if record.id <= sub.cursor {
                        continue;
                    }
                    match sub.sink.deliver(record) {
                        Ok(()) => {
                            sub.cursor = record.id;
                            self.metrics.delivered += 1;
                        }
                        Err(e) => {
                            failed.push((id.clone(), e));
                            break;
                        }
                    }
                }
            }
        }

        for (id, e) in failed {
            if let Some(sub) = self.active.remove(&id) {
                error!(%id, key = %sub.key, error = %e, "SubscriptionEngine::dispatch: undeliverable record");
                self.metrics.failed += 1;
                sub.sink.finish(e);
            }
        }
        self.metrics.active = self.active.len();
    }

    /// End every subscription with the same outcome
    fn finish_all(&mut self, outcome: SyncError, count_failed: bool) {
        for (id, sub) in self.active.drain() {
            debug!(%id, key = %sub.key, outcome = %outcome, "SubscriptionEngine::finish_all");
            if count_failed {
                self.metrics.failed += 1;
            }
            sub.sink.finish(outcome.clone());
        }
        self.metrics.active = 0;
    }
}

pub(crate) struct SubscriptionEngine {
    rx: mpsc::Receiver<SubscriptionRequest>,
    shutdown: CancellationToken,
    tailer: Tailer,
    read_block: Duration,
    read_count: usize,
    registry: Registry,
}

impl SubscriptionEngine {
    /// Spawn the engine task; it runs until `shutdown` fires or every sender is dropped
    pub(crate) fn spawn(
        store: Arc<dyn CoordinationStore>,
        config: &ClientConfig,
        shutdown: CancellationToken,
    ) -> (mpsc::Sender<SubscriptionRequest>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.request_buffer.max(1));
        let engine = Self {
            rx,
            shutdown,
            tailer: Tailer::new(store, config.reconnect_attempts, config.reconnect_backoff()),
            read_block: config.read_block(),
            read_count: config.read_count.max(1),
            registry: Registry::default(),
        };
        let handle = tokio::spawn(engine.run());
        (tx, handle)
    }

    async fn run(self) {
        let SubscriptionEngine {
            mut rx,
            shutdown,
            mut tailer,
            read_block,
            read_count,
            mut registry,
        } = self;
        info!(?read_block, read_count, "Subscription engine started");

        'run: loop {
            registry.reap();

            if registry.is_empty() {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break 'run,
                    req = rx.recv() => match req {
                        Some(req) => registry.handle(req),
                        None => break 'run,
                    },
                }
                continue;
            }

            let cursors = registry.cursors();
            let outcome = {
                let read = tailer.read(&cursors, Some(read_block), read_count);
                tokio::pin!(read);
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break 'run,
                        outcome = &mut read => break outcome,
                        req = rx.recv() => match req {
                            Some(req) => registry.handle(req),
                            None => break 'run,
                        },
                    }
                }
            };
            registry.metrics.reconnects = tailer.reconnects();

            match outcome {
                Ok(batches) => registry.dispatch(&cursors, batches),
                Err(e) => {
                    warn!(error = %e, subscriptions = registry.active.len(), "SubscriptionEngine::run: read failed");
                    registry.finish_all(SyncError::Store(e), true);
                }
            }
        }

        debug!("SubscriptionEngine::run: stopping");
        rx.close();
        while let Ok(req) = rx.try_recv() {
            if let SubscriptionRequest::Register { sink, .. } = req {
                sink.finish(SyncError::ClientClosed);
            }
        }
        registry.finish_all(SyncError::ClientClosed, false);
        info!(
            delivered = registry.metrics.delivered,
            failed = registry.metrics.failed,
            reconnects = registry.metrics.reconnects,
            "Subscription engine stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::subscription::handle::{Delivery, TypedSink};
    use crate::subscription::Subscription;
    use tokio::sync::{broadcast, oneshot};

    fn config() -> ClientConfig {
        ClientConfig {
            read_block_ms: 20,
            reconnect_attempts: 3,
            reconnect_min_backoff_ms: 1,
            reconnect_max_backoff_ms: 5,
            ..ClientConfig::default()
        }
    }

    async fn subscribe(tx: &mpsc::Sender<SubscriptionRequest>, key: &str, token: CancellationToken) -> Subscription<u32> {
        let (sink_tx, rx) = broadcast::channel::<Delivery<u32>>(64);
        let (ack, ack_rx) = oneshot::channel();
        let id = uuid::Uuid::now_v7().to_string();
        tx.send(SubscriptionRequest::Register {
            id: id.clone(),
            key: key.to_string(),
            token: token.clone(),
            sink: Box::new(TypedSink::new(key.to_string(), sink_tx)),
            ack,
        })
        .await
        .unwrap();
        ack_rx.await.unwrap();
        Subscription::new(id, key.to_string(), rx, token)
    }

    async fn next(sub: &mut Subscription<u32>) -> Option<crate::error::SyncResult<u32>> {
        tokio::time::timeout(Duration::from_secs(2), sub.next()).await.unwrap()
    }

    async fn metrics(tx: &mpsc::Sender<SubscriptionRequest>) -> SubscriptionMetrics {
        let (reply, rx) = oneshot::channel();
        tx.send(SubscriptionRequest::GetMetrics { reply }).await.unwrap();
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn test_history_then_live() {
        let store = MemoryStore::new();
        store.append("t", b"1").await.unwrap();
        store.append("t", b"2").await.unwrap();

        let shutdown = CancellationToken::new();
        let (tx, _handle) = SubscriptionEngine::spawn(Arc::new(store.clone()), &config(), shutdown.clone());
        let mut sub = subscribe(&tx, "t", CancellationToken::new()).await;

        assert_eq!(next(&mut sub).await, Some(Ok(1)));
        assert_eq!(next(&mut sub).await, Some(Ok(2)));

        store.append("t", b"3").await.unwrap();
        assert_eq!(next(&mut sub).await, Some(Ok(3)));
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_full_history_once() {
        let store = MemoryStore::new();
        let shutdown = CancellationToken::new();
        let (tx, _handle) = SubscriptionEngine::spawn(Arc::new(store.clone()), &config(), shutdown.clone());

        let mut early = subscribe(&tx, "t", CancellationToken::new()).await;
        for i in 1..=3u32 {
            store.append("t", i.to_string().as_bytes()).await.unwrap();
        }
        for i in 1..=3u32 {
            assert_eq!(next(&mut early).await, Some(Ok(i)));
        }

        let mut late = subscribe(&tx, "t", CancellationToken::new()).await;
        store.append("t", b"4").await.unwrap();
        for i in 1..=4u32 {
            assert_eq!(next(&mut late).await, Some(Ok(i)));
        }
        assert_eq!(next(&mut early).await, Some(Ok(4)));
    }

    #[tokio::test]
    async fn test_decode_failure_ends_only_that_subscription() {
        let store = MemoryStore::new();
        let shutdown = CancellationToken::new();
        let (tx, _handle) = SubscriptionEngine::spawn(Arc::new(store.clone()), &config(), shutdown.clone());

        let mut good = subscribe(&tx, "good", CancellationToken::new()).await;
        let mut bad = subscribe(&tx, "bad", CancellationToken::new()).await;
        store.append("bad", b"{not json").await.unwrap();
        store.append("good", b"5").await.unwrap();

        assert!(matches!(next(&mut bad).await, Some(Err(SyncError::Decode { .. }))));
        assert_eq!(next(&mut bad).await, None);
        assert_eq!(next(&mut good).await, Some(Ok(5)));
        assert_eq!(metrics(&tx).await.failed, 1);
    }

    #[tokio::test]
    async fn test_reconnect_has_no_gaps_or_duplicates() {
        let store = MemoryStore::new();
        let shutdown = CancellationToken::new();
        let (tx, _handle) = SubscriptionEngine::spawn(Arc::new(store.clone()), &config(), shutdown.clone());

        let mut sub = subscribe(&tx, "t", CancellationToken::new()).await;
        store.append("t", b"1").await.unwrap();
        assert_eq!(next(&mut sub).await, Some(Ok(1)));

        store.sever_connections();
        store.append("t", b"2").await.unwrap();
        store.append("t", b"3").await.unwrap();

        assert_eq!(next(&mut sub).await, Some(Ok(2)));
        assert_eq!(next(&mut sub).await, Some(Ok(3)));
        assert!(metrics(&tx).await.reconnects >= 1);
    }

    #[tokio::test]
    async fn test_reconnect_exhausted_fails_subscriptions() {
        let store = MemoryStore::new();
        let shutdown = CancellationToken::new();
        let (tx, handle) = SubscriptionEngine::spawn(Arc::new(store.clone()), &config(), shutdown.clone());

        let mut sub = subscribe(&tx, "t", CancellationToken::new()).await;
        store.set_available(false);

        let outcome = next(&mut sub).await;
        assert!(matches!(
            outcome,
            Some(Err(SyncError::Store(crate::error::StoreError::ReconnectExhausted { .. })))
        ));

        // The engine keeps serving new subscriptions once the store is back
        store.set_available(true);
        assert!(!handle.is_finished());
        store.append("t", b"9").await.unwrap();
        let mut again = subscribe(&tx, "t", CancellationToken::new()).await;
        assert_eq!(next(&mut again).await, Some(Ok(9)));
    }

    #[tokio::test]
    async fn test_shutdown_closes_subscriptions() {
        let store = MemoryStore::new();
        let shutdown = CancellationToken::new();
        let (tx, handle) = SubscriptionEngine::spawn(Arc::new(store.clone()), &config(), shutdown.clone());

        let mut sub = subscribe(&tx, "t", CancellationToken::new()).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(next(&mut sub).await, Some(Err(SyncError::ClientClosed)));
    }

    #[tokio::test]
    async fn test_cancelled_subscription_is_reaped() {
        let store = MemoryStore::new();
        let shutdown = CancellationToken::new();
        let (tx, _handle) = SubscriptionEngine::spawn(Arc::new(store.clone()), &config(), shutdown.clone());

        let token = CancellationToken::new();
        let mut sub = subscribe(&tx, "t", token.clone()).await;
        token.cancel();
        assert_eq!(next(&mut sub).await, Some(Err(SyncError::Cancelled)));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(metrics(&tx).await.active, 0);
    }
}
