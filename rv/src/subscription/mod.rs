//! Subscription engine
//!
//! Topic subscriptions are fed by one task that tails all subscribed topics
//! over a dedicated reader connection and fans records out to per-subscriber
//! bounded buffers.

mod engine;
mod handle;
mod messages;

pub(crate) use engine::SubscriptionEngine;
pub(crate) use handle::TypedSink;
pub use handle::Subscription;
pub(crate) use messages::SubscriptionRequest;
pub use messages::SubscriptionMetrics;
