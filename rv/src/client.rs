//! Client - synchronization primitives for one test instance
//!
//! A `Client` owns a store connection and two background engines: one polls
//! barrier counters, the other tails subscribed topics. Every operation is
//! scoped to a [`RunIdentity`], either the one given at construction or one
//! bound later with [`Client::with_identity`]. Clones share the connection
//! and the engines.

use std::sync::Arc;

use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::barrier::{Barrier, BarrierEngine, BarrierMetrics, BarrierRequest, PendingBarrier};
use crate::config::{ClientConfig, Config};
use crate::domain::{Event, Payload, RunIdentity, STATE_INITIALIZED_GLOBAL, State, Topic, events_key};
use crate::error::{StoreError, SyncError, SyncResult};
use crate::store::{CoordinationStore, RedisStore};
use crate::subscription::{Subscription, SubscriptionEngine, SubscriptionMetrics, SubscriptionRequest, TypedSink};

/// Sequence numbers claimed by [`Client::claim_ranks`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ranks {
    /// 1-based position among all instances of the run
    pub global: u64,
    /// 1-based position among the instances of this instance's group
    pub group: u64,
}

/// Counters from both engines
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientMetrics {
    pub barriers: BarrierMetrics,
    pub subscriptions: SubscriptionMetrics,
}

struct ClientInner {
    store: Arc<dyn CoordinationStore>,
    config: ClientConfig,
    barrier_tx: mpsc::Sender<BarrierRequest>,
    subscription_tx: mpsc::Sender<SubscriptionRequest>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Handle to the synchronization service
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
    identity: Option<Arc<RunIdentity>>,
}

impl Client {
    /// Connect to the configured store and start the engines
    pub async fn connect(config: &Config, identity: Option<RunIdentity>) -> SyncResult<Self> {
        debug!(host = %config.store.host, port = config.store.port, "Client::connect: called");
        let store = RedisStore::connect(&config.store).await?;
        Ok(Self::with_store(Arc::new(store), identity, config.client.clone()))
    }

    /// Build a client over an existing store and start the engines
    ///
    /// Must be called within a tokio runtime.
    pub fn with_store(store: Arc<dyn CoordinationStore>, identity: Option<RunIdentity>, config: ClientConfig) -> Self {
        let shutdown = CancellationToken::new();
        let (barrier_tx, barrier_worker) = BarrierEngine::spawn(
            store.clone(),
            config.barrier_poll(),
            config.request_buffer,
            shutdown.child_token(),
        );
        let (subscription_tx, subscription_worker) =
            SubscriptionEngine::spawn(store.clone(), &config, shutdown.child_token());

        info!(identity = ?identity.as_ref().map(|i| i.to_string()), "Client started");
        Self {
            inner: Arc::new(ClientInner {
                store,
                config,
                barrier_tx,
                subscription_tx,
                shutdown,
                workers: Mutex::new(vec![barrier_worker, subscription_worker]),
            }),
            identity: identity.map(Arc::new),
        }
    }

    /// A handle sharing this client's connection and engines, scoped to `identity`
    pub fn with_identity(&self, identity: RunIdentity) -> Self {
        Self {
            inner: self.inner.clone(),
            identity: Some(Arc::new(identity)),
        }
    }

    pub fn identity(&self) -> Option<&RunIdentity> {
        self.identity.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if self.is_closed() {
            return Err(SyncError::ClientClosed);
        }
        Ok(())
    }

    fn scope(&self) -> SyncResult<&RunIdentity> {
        self.ensure_open()?;
        self.identity.as_deref().ok_or(SyncError::MissingRunIdentity)
    }

    /// Register a wait for `state` to reach `target` entries
    ///
    /// Returns once the engine has accepted the barrier; await the returned
    /// [`Barrier`] for the outcome. A target of zero is satisfied at once
    /// without touching the store.
    pub async fn barrier(&self, state: &State, target: u64, token: &CancellationToken) -> SyncResult<Barrier> {
        debug!(%state, target, "barrier: called");
        self.ensure_open()?;
        if target == 0 {
            warn!(%state, "barrier: target is zero, resolving immediately");
            return Ok(Barrier::satisfied(state.clone(), token.clone()));
        }
        let identity = self.scope()?;

        let (result_tx, result_rx) = oneshot::channel();
        let (ack_tx, ack_rx) = oneshot::channel();
        let request = BarrierRequest::Register {
            barrier: PendingBarrier {
                state: state.clone(),
                key: state.key(identity),
                target: i64::try_from(target).unwrap_or(i64::MAX),
                token: token.clone(),
                result: result_tx,
            },
            ack: ack_tx,
        };
        self.inner
            .barrier_tx
            .send(request)
            .await
            .map_err(|_| SyncError::ClientClosed)?;
        ack_rx.await.map_err(|_| SyncError::ClientClosed)?;

        Ok(Barrier::new(state.clone(), target, result_rx, token.clone()))
    }

    /// Atomically increment the entry counter of `state`, returning the new value
    pub async fn signal_entry(&self, state: &State) -> SyncResult<u64> {
        debug!(%state, "signal_entry: called");
        let identity = self.scope()?;
        let value = self.inner.store.incr(&state.key(identity)).await?;
        let seq = u64::try_from(value)
            .map_err(|_| SyncError::Store(StoreError::Command(format!("counter for {state} is negative: {value}"))))?;
        debug!(%state, seq, "signal_entry: signalled");
        Ok(seq)
    }

    /// Signal entry into `state`, then wait for it to reach `target`
    pub async fn signal_and_wait(&self, state: &State, target: u64, token: &CancellationToken) -> SyncResult<u64> {
        let seq = self.signal_entry(state).await?;
        self.barrier(state, target, token).await?.wait().await?;
        Ok(seq)
    }

    /// Append `payload` to `topic`, returning its 1-based position
    pub async fn publish<T: Payload>(&self, topic: &Topic<T>, payload: &T) -> SyncResult<u64> {
        debug!(topic = topic.name(), "publish: called");
        let identity = self.scope()?;
        self.validate_topic(identity, topic).await?;

        let key = topic.key(identity);
        let bytes = serde_json::to_vec(payload).map_err(|e| SyncError::Encode {
            key: key.clone(),
            message: e.to_string(),
        })?;
        let appended = self.inner.store.append(&key, &bytes).await?;
        debug!(topic = topic.name(), position = appended.position, id = %appended.id, "publish: appended");
        Ok(appended.position)
    }

    /// Subscribe to `topic` from its first message
    pub async fn subscribe<T: Payload>(&self, topic: &Topic<T>, token: &CancellationToken) -> SyncResult<Subscription<T>> {
        debug!(topic = topic.name(), "subscribe: called");
        let identity = self.scope()?;
        self.validate_topic(identity, topic).await?;

        let key = topic.key(identity);
        let id = Uuid::now_v7().to_string();
        let (tx, rx) = broadcast::channel(self.inner.config.subscription_buffer.max(1));
        let (ack_tx, ack_rx) = oneshot::channel();
        let request = SubscriptionRequest::Register {
            id: id.clone(),
            key: key.clone(),
            token: token.clone(),
            sink: Box::new(TypedSink::<T>::new(key, tx)),
            ack: ack_tx,
        };
        self.inner
            .subscription_tx
            .send(request)
            .await
            .map_err(|_| SyncError::ClientClosed)?;
        ack_rx.await.map_err(|_| SyncError::ClientClosed)?;

        debug!(topic = topic.name(), %id, "subscribe: registered");
        Ok(Subscription::new(id, topic.name().to_string(), rx, token.clone()))
    }

    /// Publish to `topic`, then wait for `state` to reach `target`
    pub async fn publish_and_wait<T: Payload>(
        &self,
        topic: &Topic<T>,
        payload: &T,
        state: &State,
        target: u64,
        token: &CancellationToken,
    ) -> SyncResult<u64> {
        let position = self.publish(topic, payload).await?;
        self.barrier(state, target, token).await?.wait().await?;
        Ok(position)
    }

    /// Publish to `topic`, then subscribe to `subscribe_to`
    pub async fn publish_subscribe<T: Payload, U: Payload>(
        &self,
        topic: &Topic<T>,
        payload: &T,
        subscribe_to: &Topic<U>,
        token: &CancellationToken,
    ) -> SyncResult<(u64, Subscription<U>)> {
        let position = self.publish(topic, payload).await?;
        let subscription = self.subscribe(subscribe_to, token).await?;
        Ok((position, subscription))
    }

    /// Record a lifecycle event in the run's event log
    pub async fn signal_event(&self, event: &Event) -> SyncResult<()> {
        debug!(kind = event.kind(), "signal_event: called");
        let identity = self.scope()?;
        let key = events_key(identity);
        let bytes = serde_json::to_vec(event).map_err(|e| SyncError::Encode {
            key: key.clone(),
            message: e.to_string(),
        })?;
        self.inner.store.append(&key, &bytes).await?;
        Ok(())
    }

    /// Claim this instance's global and group sequence numbers
    pub async fn claim_ranks(&self) -> SyncResult<Ranks> {
        let identity = self.scope()?;
        let global = self.signal_entry(&State::new(STATE_INITIALIZED_GLOBAL)).await?;
        let group = self
            .signal_entry(&State::initialized_group(&identity.group_id))
            .await?;
        info!(global, group, group_id = %identity.group_id, "claim_ranks: claimed");
        Ok(Ranks { global, group })
    }

    /// Snapshot of both engines' counters
    pub async fn metrics(&self) -> SyncResult<ClientMetrics> {
        self.ensure_open()?;

        let (reply, rx) = oneshot::channel();
        self.inner
            .barrier_tx
            .send(BarrierRequest::GetMetrics { reply })
            .await
            .map_err(|_| SyncError::ClientClosed)?;
        let barriers = rx.await.map_err(|_| SyncError::ClientClosed)?;

        let (reply, rx) = oneshot::channel();
        self.inner
            .subscription_tx
            .send(SubscriptionRequest::GetMetrics { reply })
            .await
            .map_err(|_| SyncError::ClientClosed)?;
        let subscriptions = rx.await.map_err(|_| SyncError::ClientClosed)?;

        Ok(ClientMetrics {
            barriers,
            subscriptions,
        })
    }

    /// Stop both engines and wait for them to finish
    ///
    /// Pending barriers and live subscriptions end with `ClientClosed`, as
    /// does every later operation on this client or its clones. Calling it
    /// again is a no-op.
    pub async fn close(&self) -> SyncResult<()> {
        debug!("close: called");
        self.inner.shutdown.cancel();

        // Held until every engine has stopped so a concurrent close waits too
        let mut workers = self.inner.workers.lock().await;
        if workers.is_empty() {
            return Ok(());
        }
        for worker in workers.drain(..) {
            if let Err(e) = worker.await {
                warn!(error = %e, "close: engine task failed");
            }
        }
        info!("Client closed");
        Ok(())
    }

    /// Ensure `topic` is only ever used with one payload schema
    ///
    /// Schema tags are appended to a per-topic log; the oldest record decides.
    /// First users racing each other both append, and whichever landed first
    /// wins for everyone.
    async fn validate_topic<T>(&self, identity: &RunIdentity, topic: &Topic<T>) -> SyncResult<()> {
        let key = topic.schema_key(identity);
        let first = match self.inner.store.first_record(&key).await? {
            Some(record) => record,
            None => {
                self.inner.store.append(&key, topic.schema().as_bytes()).await?;
                self.inner
                    .store
                    .first_record(&key)
                    .await?
                    .ok_or_else(|| StoreError::Command(format!("schema log {key} is empty after append")))?
            }
        };

        let expected = String::from_utf8_lossy(&first.payload);
        if expected != topic.schema() {
            warn!(topic = topic.name(), %expected, found = topic.schema(), "validate_topic: schema mismatch");
            return Err(SyncError::TypeMismatch {
                topic: topic.name().to_string(),
                expected: expected.into_owned(),
                found: topic.schema().to_string(),
            });
        }
        Ok(())
    }
}
