//! Barrier - caller side of a registered wait

use std::future::IntoFuture;

use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::domain::State;
use crate::error::{SyncError, SyncResult};

/// A pending wait on a state reaching its target count
///
/// Resolves to `Ok(())` once satisfied, `Err(Cancelled)` when the caller's
/// token fires, `Err(ClientClosed)` when the client shuts down, or the store
/// error that made the engine give up. `.await` it directly or call
/// [`Barrier::wait`].
#[derive(Debug)]
pub struct Barrier {
    state: State,
    target: u64,
    result: oneshot::Receiver<SyncResult<()>>,
    token: CancellationToken,
}

impl Barrier {
    pub(crate) fn new(
        state: State,
        target: u64,
        result: oneshot::Receiver<SyncResult<()>>,
        token: CancellationToken,
    ) -> Self {
        Self {
            state,
            target,
            result,
            token,
        }
    }

    /// A barrier that is already satisfied
    pub(crate) fn satisfied(state: State, token: CancellationToken) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Ok(()));
        Self::new(state, 0, rx, token)
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn target(&self) -> u64 {
        self.target
    }

    /// Outcome if the barrier already resolved, without waiting
    pub fn try_outcome(&mut self) -> Option<SyncResult<()>> {
        match self.result.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) if self.token.is_cancelled() => Some(Err(SyncError::Cancelled)),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(SyncError::ClientClosed)),
        }
    }

    /// Wait for the barrier to resolve
    pub async fn wait(self) -> SyncResult<()> {
        let Barrier { mut result, token, .. } = self;
        tokio::select! {
            biased;
            outcome = &mut result => outcome.unwrap_or(Err(SyncError::ClientClosed)),
            _ = token.cancelled() => Err(SyncError::Cancelled),
        }
    }
}

impl IntoFuture for Barrier {
    type Output = SyncResult<()>;
    type IntoFuture = BoxFuture<'static, SyncResult<()>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}
