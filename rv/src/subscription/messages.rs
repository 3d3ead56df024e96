//! Subscription engine messages

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{SyncError, SyncResult};
use crate::store::StreamRecord;

/// Type-erased consumer end of a subscription, as seen by the engine
///
/// The engine only moves raw records; decoding into the subscriber's payload
/// type happens behind this trait.
pub(crate) trait DeliverySink: Send {
    /// Decode one record and hand it to the consumer without blocking
    fn deliver(&self, record: &StreamRecord) -> SyncResult<()>;

    /// Send the terminal outcome; nothing is delivered afterwards
    fn finish(&self, outcome: SyncError);

    /// Whether the consumer has gone away
    fn is_closed(&self) -> bool;
}

/// Requests sent to the subscription engine
pub(crate) enum SubscriptionRequest {
    /// Start tailing `key` from its origin for a new subscriber
    Register {
        id: String,
        key: String,
        token: CancellationToken,
        sink: Box<dyn DeliverySink>,
        ack: oneshot::Sender<()>,
    },

    GetMetrics {
        reply: oneshot::Sender<SubscriptionMetrics>,
    },
}

/// Subscription engine counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionMetrics {
    /// Subscriptions currently being fed
    pub active: usize,
    /// Records handed to subscribers
    pub delivered: u64,
    /// Times the reader connection was regenerated
    pub reconnects: u64,
    /// Subscriptions ended by a store or decode error
    pub failed: u64,
}
