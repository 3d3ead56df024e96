//! Lifecycle events written by instances and consumed by the watch client

use serde::{Deserialize, Serialize};

use super::identity::RunIdentity;

/// One record of an instance's event log
///
/// Exactly one variant is present per record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// The instance started with these run parameters
    #[serde(rename = "start_event")]
    Start { runenv: RunIdentity },

    /// Free-form informational message
    #[serde(rename = "message_event")]
    Message { message: String },

    #[serde(rename = "success_event")]
    Success { group: String },

    #[serde(rename = "failure_event")]
    Failure { group: String, error: String },

    #[serde(rename = "crash_event")]
    Crash {
        group: String,
        error: String,
        stacktrace: String,
    },

    #[serde(rename = "stage_start_event")]
    StageStart { name: String, group: String },

    #[serde(rename = "stage_end_event")]
    StageEnd { name: String, group: String },
}

impl Event {
    /// Get the event kind as a string (for logging)
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Start { .. } => "start",
            Event::Message { .. } => "message",
            Event::Success { .. } => "success",
            Event::Failure { .. } => "failure",
            Event::Crash { .. } => "crash",
            Event::StageStart { .. } => "stage_start",
            Event::StageEnd { .. } => "stage_end",
        }
    }

    /// Group the emitting instance belongs to, when the event records it
    pub fn group_id(&self) -> Option<&str> {
        match self {
            Event::Start { runenv } => Some(&runenv.group_id),
            Event::Message { .. } => None,
            Event::Success { group }
            | Event::Failure { group, .. }
            | Event::Crash { group, .. }
            | Event::StageStart { group, .. }
            | Event::StageEnd { group, .. } => Some(group),
        }
    }

    /// Whether this event ends the instance's lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Success { .. } | Event::Failure { .. } | Event::Crash { .. })
    }
}
