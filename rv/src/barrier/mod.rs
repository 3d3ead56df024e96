//! Barrier engine
//!
//! A single task owns every pending barrier and polls the store counters on a
//! fixed interval; callers register over a channel and get a single-fire
//! result back.

mod engine;
mod handle;
mod messages;

pub(crate) use engine::BarrierEngine;
pub use handle::Barrier;
pub use messages::BarrierMetrics;
pub(crate) use messages::{BarrierRequest, PendingBarrier};
