//! Rendezvous - synchronization service for distributed test instances
//!
//! Instances of a test run coordinate through a shared Redis-like store:
//! they signal entry into named states, wait on barriers until a state has
//! been entered enough times, publish typed messages to ordered topics and
//! subscribe to them, and record lifecycle events that an orchestrator can
//! watch.
//!
//! # Modules
//!
//! - [`client`] - The per-instance [`Client`] and its composite operations
//! - [`barrier`] - Barrier engine and the [`Barrier`] wait handle
//! - [`subscription`] - Topic tailing engine and [`Subscription`] feeds
//! - [`watch`] - Read side of a run's event log
//! - [`store`] - Store abstraction, Redis and in-memory adapters
//! - [`domain`] - Run identity, states, topics and events
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod barrier;
pub mod cli;
pub mod client;
pub mod config;
pub mod domain;
pub mod error;
pub mod store;
pub mod subscription;
pub mod watch;

pub use barrier::{Barrier, BarrierMetrics};
pub use client::{Client, ClientMetrics, Ranks};
pub use config::{ClientConfig, Config, StoreConfig};
pub use domain::{Event, Payload, RunIdentity, State, Topic};
pub use error::{StoreError, SyncError, SyncResult};
pub use store::{CoordinationStore, MemoryStore, RedisStore};
pub use subscription::{Subscription, SubscriptionMetrics};
pub use tokio_util::sync::CancellationToken;
pub use watch::{EventStream, WatchClient};
