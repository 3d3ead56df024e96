//! CLI command definitions and subcommands

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::debug;

use crate::domain::{ENV_TEST_CASE, ENV_TEST_GROUP_ID, ENV_TEST_PLAN, ENV_TEST_RUN, IdentityError, RunIdentity};

/// Rendezvous - synchronization for distributed test instances
#[derive(Debug, Parser)]
#[command(
    name = "rv",
    about = "Barriers, topics and event logs for distributed test runs",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Run id (overrides TEST_RUN)
    #[arg(long, global = true)]
    pub run: Option<String>,

    /// Test plan (overrides TEST_PLAN)
    #[arg(long, global = true)]
    pub plan: Option<String>,

    /// Test case (overrides TEST_CASE)
    #[arg(long = "case", global = true)]
    pub case: Option<String>,

    /// Group id (overrides TEST_GROUP_ID)
    #[arg(long, global = true)]
    pub group: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the store keys used by this run
    Keys {
        /// Also print the counter key for this state
        #[arg(short, long)]
        state: Option<String>,

        /// Also print the log and schema keys for this topic
        #[arg(short, long)]
        topic: Option<String>,
    },

    /// Signal entry into a state and print the sequence number
    Signal {
        state: String,
    },

    /// Wait until a state has been entered TARGET times
    Barrier {
        state: String,

        target: u64,

        /// Give up after this many seconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Publish a JSON payload to a topic
    Publish {
        topic: String,

        /// JSON document
        payload: String,
    },

    /// Print a topic's messages as they arrive
    Subscribe {
        topic: String,

        /// Exit after this many messages
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },

    /// Claim this instance's global and group sequence numbers
    Ranks,

    /// Print every event recorded for the run
    Events,

    /// Follow the run's events as they are recorded
    Watch,
}

impl Cli {
    /// Run identity from the flags, falling back to the environment
    pub fn identity(&self) -> Result<RunIdentity, IdentityError> {
        debug!(run = ?self.run, plan = ?self.plan, case = ?self.case, group = ?self.group, "Cli::identity: called");
        RunIdentity::from_lookup(|var| {
            let flag = match var {
                ENV_TEST_RUN => self.run.clone(),
                ENV_TEST_PLAN => self.plan.clone(),
                ENV_TEST_CASE => self.case.clone(),
                ENV_TEST_GROUP_ID => self.group.clone(),
                _ => None,
            };
            flag.or_else(|| std::env::var(var).ok())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_barrier() {
        let cli = Cli::try_parse_from(["rv", "--run", "r1", "barrier", "ready", "3", "--timeout", "5"]).unwrap();
        assert_eq!(cli.run.as_deref(), Some("r1"));
        match cli.command {
            Command::Barrier { state, target, timeout } => {
                assert_eq!(state, "ready");
                assert_eq!(target, 3);
                assert_eq!(timeout, Some(5));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["rv", "events", "--plan", "p", "-l", "debug"]).unwrap();
        assert_eq!(cli.plan.as_deref(), Some("p"));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_identity_from_flags() {
        let cli = Cli::try_parse_from([
            "rv", "--run", "r", "--plan", "p", "--case", "c", "--group", "g", "ranks",
        ])
        .unwrap();
        let identity = cli.identity().unwrap();
        assert_eq!(identity.run_id, "r");
        assert_eq!(identity.group_id, "g");
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Cli::try_parse_from(["rv"]).is_err());
    }
}
