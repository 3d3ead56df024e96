//! Logical names (states, topics) and their store keys
//!
//! Every instance of a run must derive identical keys independently, so the
//! formats here are part of the wire contract:
//!
//! ```text
//! run:{run}:plan:{plan}:case:{case}:states:{state}    counter
//! run:{run}:plan:{plan}:case:{case}:topics:{topic}    append-only log
//! run:{run}:plan:{plan}:case:{case}:schemas:{topic}   log of payload type tags, oldest wins
//! run:{run}:plan:{plan}:case:{case}:run_events        event log
//! ```

use std::fmt;
use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::identity::RunIdentity;

/// State signalled by every instance at start-up to claim its global rank
pub const STATE_INITIALIZED_GLOBAL: &str = "initialized_global";

/// A named rendezvous counter scoped to a run
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct State(String);

impl State {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// State signalled by the members of one group to claim their group rank
    pub fn initialized_group(group_id: &str) -> Self {
        Self(format!("initialized_group_{group_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Store key of this state's counter
    pub fn key(&self, identity: &RunIdentity) -> String {
        format!("{}:states:{}", identity.key_prefix(), self.0)
    }
}

impl From<&str> for State {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for State {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Anything that can travel over a topic
pub trait Payload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// A named append-only log with a declared payload type
///
/// The schema tag defaults to the Rust type name of `T`. Processes built from
/// different crates that share a topic should agree on an explicit tag via
/// [`Topic::with_schema`].
pub struct Topic<T> {
    name: String,
    schema: String,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Topic<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_schema(name, std::any::type_name::<T>())
    }

    pub fn with_schema(name: impl Into<String>, schema: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: schema.into(),
            _payload: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Store key of this topic's log
    pub fn key(&self, identity: &RunIdentity) -> String {
        format!("{}:topics:{}", identity.key_prefix(), self.name)
    }

    /// Store key of the log of schema tags claimed for this topic
    pub fn schema_key(&self, identity: &RunIdentity) -> String {
        format!("{}:schemas:{}", identity.key_prefix(), self.name)
    }
}

impl<T> Clone for Topic<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            schema: self.schema.clone(),
            _payload: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Topic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field("schema", &self.schema)
            .finish()
    }
}

/// Store key of the run's event log
pub fn events_key(identity: &RunIdentity) -> String {
    format!("{}:run_events", identity.key_prefix())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde::Deserialize;

    #[derive(Clone, Serialize, Deserialize)]
    struct Config {
        latency_ms: u64,
    }

    fn identity() -> RunIdentity {
        RunIdentity::new("r1", "net", "latency")
    }

    #[test]
    fn test_state_key() {
        let state = State::new("ready");
        assert_eq!(state.key(&identity()), "run:r1:plan:net:case:latency:states:ready");
    }

    #[test]
    fn test_group_state() {
        assert_eq!(State::initialized_group("clients").as_str(), "initialized_group_clients");
    }

    #[test]
    fn test_topic_keys() {
        let topic: Topic<Config> = Topic::new("cfg");
        assert_eq!(topic.key(&identity()), "run:r1:plan:net:case:latency:topics:cfg");
        assert_eq!(topic.schema_key(&identity()), "run:r1:plan:net:case:latency:schemas:cfg");
        assert!(topic.schema().ends_with("Config"));
    }

    #[test]
    fn test_topic_explicit_schema() {
        let topic: Topic<serde_json::Value> = Topic::with_schema("cfg", "json");
        assert_eq!(topic.schema(), "json");
        assert_eq!(topic.clone().name(), "cfg");
    }

    #[test]
    fn test_events_key() {
        assert_eq!(events_key(&identity()), "run:r1:plan:net:case:latency:run_events");
    }

    proptest! {
        #[test]
        fn prop_keys_are_deterministic_and_distinct(run in "[a-z0-9]{1,12}", name in "[a-z_]{1,16}") {
            let a = RunIdentity::new(run.clone(), "plan", "case");
            let b = RunIdentity::new(run, "plan", "case");
            let state = State::new(name.clone());
            let topic: Topic<u64> = Topic::new(name);

            prop_assert_eq!(state.key(&a), state.key(&b));
            prop_assert_eq!(topic.key(&a), topic.key(&b));
            prop_assert_ne!(state.key(&a), topic.key(&a));
            prop_assert_ne!(topic.key(&a), topic.schema_key(&a));
        }
    }
}
