//! Barrier engine messages
//!
//! Requests and replies for the barrier actor.

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::domain::State;
use crate::error::SyncResult;

/// A wait registered with the engine, resolved exactly once through `result`
#[derive(Debug)]
pub(crate) struct PendingBarrier {
    pub state: State,
    pub key: String,
    pub target: i64,
    pub token: CancellationToken,
    pub result: oneshot::Sender<SyncResult<()>>,
}

/// Requests sent to the barrier engine
#[derive(Debug)]
pub(crate) enum BarrierRequest {
    /// Add a barrier to the active set; `ack` fires once it is registered
    Register {
        barrier: PendingBarrier,
        ack: oneshot::Sender<()>,
    },

    GetMetrics {
        reply: oneshot::Sender<BarrierMetrics>,
    },
}

/// Barrier engine counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BarrierMetrics {
    /// Barriers currently waiting on their counter
    pub pending: usize,
    pub satisfied: u64,
    pub cancelled: u64,
    pub failed: u64,
}
