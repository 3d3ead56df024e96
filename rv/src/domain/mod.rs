//! Domain types: run identity, states, topics and events

mod event;
mod identity;
mod keys;

pub use event::Event;
pub use identity::{
    DEFAULT_GROUP_ID, ENV_TEST_CASE, ENV_TEST_GROUP_ID, ENV_TEST_GROUP_INSTANCE_COUNT, ENV_TEST_INSTANCE_COUNT,
    ENV_TEST_INSTANCE_PARAMS, ENV_TEST_PLAN, ENV_TEST_RUN, IdentityError, RunIdentity,
};
pub use keys::{Payload, STATE_INITIALIZED_GLOBAL, State, Topic, events_key};
