//! Run identity - the tuple that scopes every store key for a test run

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const ENV_TEST_RUN: &str = "TEST_RUN";
pub const ENV_TEST_PLAN: &str = "TEST_PLAN";
pub const ENV_TEST_CASE: &str = "TEST_CASE";
pub const ENV_TEST_GROUP_ID: &str = "TEST_GROUP_ID";
pub const ENV_TEST_INSTANCE_COUNT: &str = "TEST_INSTANCE_COUNT";
pub const ENV_TEST_GROUP_INSTANCE_COUNT: &str = "TEST_GROUP_INSTANCE_COUNT";
pub const ENV_TEST_INSTANCE_PARAMS: &str = "TEST_INSTANCE_PARAMS";

/// Group used when the environment does not name one
pub const DEFAULT_GROUP_ID: &str = "single";

/// Errors building a RunIdentity from the environment
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Missing environment variable {0}")]
    Missing(&'static str),

    #[error("Invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

/// Identity of a test run, immutable for the life of the process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIdentity {
    #[serde(rename = "run")]
    pub run_id: String,
    pub plan: String,
    pub case: String,
    #[serde(rename = "group")]
    pub group_id: String,
    #[serde(rename = "instances")]
    pub instance_count: u64,
    #[serde(rename = "group-instances")]
    pub group_instance_count: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

impl RunIdentity {
    /// Create an identity for a single-instance, single-group run
    pub fn new(run_id: impl Into<String>, plan: impl Into<String>, case: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            plan: plan.into(),
            case: case.into(),
            group_id: DEFAULT_GROUP_ID.to_string(),
            instance_count: 1,
            group_instance_count: 1,
            params: BTreeMap::new(),
        }
    }

    /// Set the group this instance belongs to
    pub fn with_group(mut self, group_id: impl Into<String>, group_instance_count: u64) -> Self {
        self.group_id = group_id.into();
        self.group_instance_count = group_instance_count;
        self
    }

    /// Set the total number of instances in the run
    pub fn with_instance_count(mut self, instance_count: u64) -> Self {
        self.instance_count = instance_count;
        self
    }

    /// Build from the process environment (`TEST_RUN`, `TEST_PLAN`, ...)
    pub fn from_env() -> Result<Self, IdentityError> {
        debug!("RunIdentity::from_env: called");
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, IdentityError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |var: &'static str| -> Result<String, IdentityError> {
            lookup(var)
                .filter(|v| !v.is_empty())
                .ok_or(IdentityError::Missing(var))
        };
        let count = |var: &'static str| -> Result<u64, IdentityError> {
            match lookup(var).filter(|v| !v.is_empty()) {
                None => Ok(1),
                Some(value) => value
                    .trim()
                    .parse()
                    .map_err(|_| IdentityError::Invalid { var, value }),
            }
        };

        let identity = Self {
            run_id: required(ENV_TEST_RUN)?,
            plan: required(ENV_TEST_PLAN)?,
            case: required(ENV_TEST_CASE)?,
            group_id: lookup(ENV_TEST_GROUP_ID)
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_GROUP_ID.to_string()),
            instance_count: count(ENV_TEST_INSTANCE_COUNT)?,
            group_instance_count: count(ENV_TEST_GROUP_INSTANCE_COUNT)?,
            params: lookup(ENV_TEST_INSTANCE_PARAMS)
                .map(|raw| parse_params(&raw))
                .unwrap_or_default(),
        };
        debug!(%identity, "RunIdentity::from_lookup: built identity");
        Ok(identity)
    }

    /// Key prefix shared by every key of this run
    pub(crate) fn key_prefix(&self) -> String {
        format!("run:{}:plan:{}:case:{}", self.run_id, self.plan, self.case)
    }
}

impl fmt::Display for RunIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{} (group {})",
            self.run_id, self.plan, self.case, self.group_id
        )
    }
}

/// Parse `k=v|k2=v2` instance parameters; entries without `=` are ignored
fn parse_params(raw: &str) -> BTreeMap<String, String> {
    raw.split('|')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            let k = k.trim();
            if k.is_empty() {
                return None;
            }
            Some((k.to_string(), v.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_from_lookup_full() {
        let identity = RunIdentity::from_lookup(lookup_from(&[
            (ENV_TEST_RUN, "r1"),
            (ENV_TEST_PLAN, "ping"),
            (ENV_TEST_CASE, "pong"),
            (ENV_TEST_GROUP_ID, "clients"),
            (ENV_TEST_INSTANCE_COUNT, "10"),
            (ENV_TEST_GROUP_INSTANCE_COUNT, "4"),
            (ENV_TEST_INSTANCE_PARAMS, "size=3|mode=fast"),
        ]))
        .unwrap();

        assert_eq!(identity.run_id, "r1");
        assert_eq!(identity.group_id, "clients");
        assert_eq!(identity.instance_count, 10);
        assert_eq!(identity.group_instance_count, 4);
        assert_eq!(identity.params.get("size").map(String::as_str), Some("3"));
        assert_eq!(identity.params.get("mode").map(String::as_str), Some("fast"));
    }

    #[test]
    fn test_from_lookup_defaults() {
        let identity = RunIdentity::from_lookup(lookup_from(&[
            (ENV_TEST_RUN, "r1"),
            (ENV_TEST_PLAN, "ping"),
            (ENV_TEST_CASE, "pong"),
        ]))
        .unwrap();

        assert_eq!(identity.group_id, DEFAULT_GROUP_ID);
        assert_eq!(identity.instance_count, 1);
        assert!(identity.params.is_empty());
    }

    #[test]
    fn test_from_lookup_missing_run() {
        let err = RunIdentity::from_lookup(lookup_from(&[(ENV_TEST_PLAN, "ping"), (ENV_TEST_CASE, "pong")]))
            .unwrap_err();
        assert!(matches!(err, IdentityError::Missing(ENV_TEST_RUN)));
    }

    #[test]
    fn test_from_lookup_bad_count() {
        let err = RunIdentity::from_lookup(lookup_from(&[
            (ENV_TEST_RUN, "r1"),
            (ENV_TEST_PLAN, "ping"),
            (ENV_TEST_CASE, "pong"),
            (ENV_TEST_INSTANCE_COUNT, "many"),
        ]))
        .unwrap_err();
        assert!(matches!(err, IdentityError::Invalid { var: ENV_TEST_INSTANCE_COUNT, .. }));
    }

    #[test]
    fn test_parse_params_skips_garbage() {
        let params = parse_params("a=1||novalue|=x| b = 2 ");
        assert_eq!(params.len(), 2);
        assert_eq!(params["a"], "1");
        assert_eq!(params["b"], "2");
    }

    #[test]
    #[serial]
    fn test_from_env() {
        // SAFETY: serialized with other env-mutating tests
        unsafe {
            std::env::set_var(ENV_TEST_RUN, "env-run");
            std::env::set_var(ENV_TEST_PLAN, "env-plan");
            std::env::set_var(ENV_TEST_CASE, "env-case");
        }
        let identity = RunIdentity::from_env().unwrap();
        assert_eq!(identity.key_prefix(), "run:env-run:plan:env-plan:case:env-case");
        unsafe {
            std::env::remove_var(ENV_TEST_RUN);
            std::env::remove_var(ENV_TEST_PLAN);
            std::env::remove_var(ENV_TEST_CASE);
        }
    }

    #[test]
    fn test_identity_serialization() {
        let identity = RunIdentity::new("r", "p", "c").with_group("g", 2).with_instance_count(5);
        let json = serde_json::to_string(&identity).unwrap();
        assert!(json.contains("\"group-instances\":2"));
        let back: RunIdentity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, identity);
    }
}
