//! Subscription - caller side of a topic subscription

use futures::Stream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::messages::DeliverySink;
use crate::domain::Payload;
use crate::error::{SyncError, SyncResult};
use crate::store::StreamRecord;

/// What the engine pushes down a subscription's buffer
#[derive(Debug, Clone)]
pub(crate) enum Delivery<T> {
    Item(T),
    End(SyncError),
}

/// Decodes records as `T` into a bounded drop-oldest buffer
pub(crate) struct TypedSink<T> {
    key: String,
    tx: broadcast::Sender<Delivery<T>>,
}

impl<T> TypedSink<T> {
    pub(crate) fn new(key: String, tx: broadcast::Sender<Delivery<T>>) -> Self {
        Self { key, tx }
    }
}

impl<T: Payload> DeliverySink for TypedSink<T> {
    fn deliver(&self, record: &StreamRecord) -> SyncResult<()> {
        let value: T = serde_json::from_slice(&record.payload).map_err(|e| SyncError::Decode {
            key: self.key.clone(),
            record: record.id.to_string(),
            message: e.to_string(),
        })?;
        // Fails only when the receiver is gone; the engine reaps it next round
        let _ = self.tx.send(Delivery::Item(value));
        Ok(())
    }

    fn finish(&self, outcome: SyncError) {
        let _ = self.tx.send(Delivery::End(outcome));
    }

    fn is_closed(&self) -> bool {
        self.tx.receiver_count() == 0
    }
}

/// A live, ordered feed of one topic's payloads
///
/// Yields the topic's full history and then every new message, in append
/// order. The buffer is bounded: if the consumer falls more than the
/// configured capacity behind, the oldest undelivered messages are dropped
/// and counted in [`Subscription::dropped`]. Dropping the subscription
/// unsubscribes.
#[derive(Debug)]
pub struct Subscription<T> {
    id: String,
    topic: String,
    rx: broadcast::Receiver<Delivery<T>>,
    token: CancellationToken,
    dropped: u64,
    done: bool,
}

impl<T: Payload> Subscription<T> {
    pub(crate) fn new(
        id: String,
        topic: String,
        rx: broadcast::Receiver<Delivery<T>>,
        token: CancellationToken,
    ) -> Self {
        Self {
            id,
            topic,
            rx,
            token,
            dropped: 0,
            done: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Messages lost because this consumer fell behind
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Next payload, or the terminal error, or `None` once ended
    ///
    /// The terminal error is `Cancelled` when the caller's token fires,
    /// `ClientClosed` when the client shuts down, or the store/decode error
    /// that ended the subscription.
    pub async fn next(&mut self) -> Option<SyncResult<T>> {
        if self.done {
            return None;
        }

        loop {
            tokio::select! {
                biased;

                received = self.rx.recv() => match received {
                    Ok(Delivery::Item(value)) => return Some(Ok(value)),
                    Ok(Delivery::End(outcome)) => {
                        self.done = true;
                        return Some(Err(outcome));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(topic = %self.topic, skipped, "subscriber fell behind, oldest messages dropped");
                        self.dropped += skipped;
                    }
                    Err(RecvError::Closed) => {
                        self.done = true;
                        return Some(Err(SyncError::ClientClosed));
                    }
                },

                _ = self.token.cancelled() => {
                    self.done = true;
                    return Some(Err(SyncError::Cancelled));
                }
            }
        }
    }

    /// Adapt into a `Stream`
    pub fn into_stream(self) -> impl Stream<Item = SyncResult<T>> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            let item = sub.next().await?;
            Some((item, sub))
        })
    }
}
