//! BarrierEngine - actor that owns the set of active barriers
//!
//! On every tick it reads the counters of all pending barriers in a single
//! store round-trip and resolves the ones that reached their target. Only
//! this task ever touches the active set.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::messages::{BarrierMetrics, BarrierRequest, PendingBarrier};
use crate::error::SyncError;
use crate::store::CoordinationStore;

pub(crate) struct BarrierEngine {
    store: Arc<dyn CoordinationStore>,
    rx: mpsc::Receiver<BarrierRequest>,
    shutdown: CancellationToken,
    poll_interval: Duration,
    pending: Vec<PendingBarrier>,
    metrics: BarrierMetrics,
}

impl BarrierEngine {
    /// Spawn the engine task; it runs until `shutdown` fires or every sender is dropped
    pub(crate) fn spawn(
        store: Arc<dyn CoordinationStore>,
        poll_interval: Duration,
        buffer: usize,
        shutdown: CancellationToken,
    ) -> (mpsc::Sender<BarrierRequest>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let engine = Self {
            store,
            rx,
            shutdown,
            poll_interval,
            pending: Vec::new(),
            metrics: BarrierMetrics::default(),
        };
        let handle = tokio::spawn(engine.run());
        (tx, handle)
    }

    async fn run(mut self) {
        info!(poll_interval = ?self.poll_interval, "Barrier engine started");
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    debug!("BarrierEngine::run: shutdown requested");
                    break;
                }

                req = self.rx.recv() => match req {
                    Some(req) => self.handle(req),
                    None => {
                        debug!("BarrierEngine::run: request channel closed");
                        break;
                    }
                },

                _ = ticker.tick() => self.poll().await,
            }
        }

        self.close_all();
        info!(
            satisfied = self.metrics.satisfied,
            cancelled = self.metrics.cancelled,
            failed = self.metrics.failed,
            "Barrier engine stopped"
        );
    }

    fn handle(&mut self, req: BarrierRequest) {
        match req {
            BarrierRequest::Register { barrier, ack } => {
                debug!(state = %barrier.state, target = barrier.target, "BarrierEngine::handle: Register");
                self.pending.push(barrier);
                self.metrics.pending = self.pending.len();
                let _ = ack.send(());
            }

            BarrierRequest::GetMetrics { reply } => {
                let _ = reply.send(self.metrics.clone());
            }
        }
    }

    /// Resolve satisfied, cancelled and failed barriers; keep the rest
    async fn poll(&mut self) {
        let mut live = Vec::with_capacity(self.pending.len());
        for barrier in self.pending.drain(..) {
            if barrier.token.is_cancelled() {
                debug!(state = %barrier.state, "BarrierEngine::poll: barrier cancelled");
                self.metrics.cancelled += 1;
                let _ = barrier.result.send(Err(SyncError::Cancelled));
            } else if barrier.result.is_closed() {
                debug!(state = %barrier.state, "BarrierEngine::poll: waiter gone, dropping barrier");
                self.metrics.cancelled += 1;
            } else {
                live.push(barrier);
            }
        }

        if live.is_empty() {
            self.metrics.pending = 0;
            return;
        }

        let keys: Vec<String> = live.iter().map(|b| b.key.clone()).collect();
        let counters = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            counters = self.store.counters(&keys) => Some(counters),
        };
        let Some(counters) = counters else {
            debug!(barriers = live.len(), "BarrierEngine::poll: shutdown during counter read");
            self.pending.extend(live);
            self.metrics.pending = self.pending.len();
            return;
        };

        match counters {
            Ok(values) => {
                for (barrier, value) in live.into_iter().zip(values) {
                    if value >= barrier.target {
                        debug!(state = %barrier.state, value, target = barrier.target, "BarrierEngine::poll: satisfied");
                        self.metrics.satisfied += 1;
                        let _ = barrier.result.send(Ok(()));
                    } else {
                        self.pending.push(barrier);
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, barriers = live.len(), "BarrierEngine::poll: failed to read counters");
                for barrier in live {
                    self.metrics.failed += 1;
                    let _ = barrier.result.send(Err(SyncError::Store(e.clone())));
                }
            }
        }
        self.metrics.pending = self.pending.len();
    }

    /// Fail everything still pending or queued with ClientClosed
    fn close_all(&mut self) {
        self.rx.close();
        while let Ok(req) = self.rx.try_recv() {
            if let BarrierRequest::Register { barrier, .. } = req {
                self.pending.push(barrier);
            }
        }
        for barrier in self.pending.drain(..) {
            self.metrics.cancelled += 1;
            let _ = barrier.result.send(Err(SyncError::ClientClosed));
        }
        self.metrics.pending = 0;
    }
}
