//! Configuration for the sync client and its store

use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const ENV_REDIS_HOST: &str = "REDIS_HOST";
pub const ENV_REDIS_PORT: &str = "REDIS_PORT";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Log level used by the `rv` binary (trace, debug, info, warn, error)
    #[serde(default)]
    pub log_level: Option<String>,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub client: ClientConfig,
}

/// How to reach the coordination store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StoreConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Connection attempts before giving up
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    #[serde(default = "default_min_backoff_ms")]
    pub min_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Upper bound on a single connection attempt
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
}

/// Engine cadence and buffering
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClientConfig {
    /// Interval between barrier counter polls
    #[serde(default = "default_barrier_poll_ms")]
    pub barrier_poll_ms: u64,

    /// How long a tailing read blocks waiting for new records
    #[serde(default = "default_read_block_ms")]
    pub read_block_ms: u64,

    /// Max records returned by a single read
    #[serde(default = "default_read_count")]
    pub read_count: usize,

    /// Per-subscription buffer; the oldest undelivered message is dropped when full
    #[serde(default = "default_subscription_buffer")]
    pub subscription_buffer: usize,

    /// Buffer between the watch tailer and its consumer
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Buffer of the engines' request channels
    #[serde(default = "default_request_buffer")]
    pub request_buffer: usize,

    /// Reader reconnect attempts before active subscriptions are failed
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,

    #[serde(default = "default_min_backoff_ms")]
    pub reconnect_min_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub reconnect_max_backoff_ms: u64,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    6379
}

fn default_connect_attempts() -> u32 {
    30
}

fn default_min_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    3000
}

fn default_dial_timeout_ms() -> u64 {
    10_000
}

fn default_barrier_poll_ms() -> u64 {
    1000
}

fn default_read_block_ms() -> u64 {
    1000
}

fn default_read_count() -> usize {
    10_000
}

fn default_subscription_buffer() -> usize {
    1024
}

fn default_event_buffer() -> usize {
    256
}

fn default_request_buffer() -> usize {
    256
}

fn default_reconnect_attempts() -> u32 {
    30
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_attempts: default_connect_attempts(),
            min_backoff_ms: default_min_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            dial_timeout_ms: default_dial_timeout_ms(),
        }
    }
}

impl StoreConfig {
    /// Address in `redis://host:port` form
    pub fn url(&self) -> String {
        format!("redis://{}:{}", self.host, self.port)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.min_backoff_ms, self.max_backoff_ms)
    }

    /// Apply `REDIS_HOST` / `REDIS_PORT` from an arbitrary lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(ENV_REDIS_HOST).filter(|h| !h.is_empty()) {
            debug!(%host, "StoreConfig::apply_overrides: host override");
            self.host = host;
        }
        if let Some(port) = lookup(ENV_REDIS_PORT).filter(|p| !p.is_empty()) {
            debug!(%port, "StoreConfig::apply_overrides: port override");
            self.port = port
                .trim()
                .parse()
                .map_err(|_| eyre!("failed to parse port {:?} from {}", port, ENV_REDIS_PORT))?;
        }
        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            barrier_poll_ms: default_barrier_poll_ms(),
            read_block_ms: default_read_block_ms(),
            read_count: default_read_count(),
            subscription_buffer: default_subscription_buffer(),
            event_buffer: default_event_buffer(),
            request_buffer: default_request_buffer(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_min_backoff_ms: default_min_backoff_ms(),
            reconnect_max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl ClientConfig {
    pub fn barrier_poll(&self) -> Duration {
        Duration::from_millis(self.barrier_poll_ms.max(1))
    }

    pub fn read_block(&self) -> Duration {
        Duration::from_millis(self.read_block_ms.max(1))
    }

    pub fn reconnect_backoff(&self) -> Backoff {
        Backoff::new(self.reconnect_min_backoff_ms, self.reconnect_max_backoff_ms)
    }
}

/// Exponential backoff between two bounds, with a little jitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub min: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        let min = Duration::from_millis(min_ms);
        let max = Duration::from_millis(max_ms.max(min_ms));
        Self { min, max }
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        let base = self.min.saturating_mul(factor).min(self.max);
        let jitter_cap = (base.as_millis() as u64) / 10;
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::random_range(0..=jitter_cap)
        };
        (base + Duration::from_millis(jitter)).min(self.max)
    }
}

impl Config {
    /// Load config from file, or use defaults, then apply environment overrides
    pub fn load(path: Option<&PathBuf>) -> Result<Self> {
        debug!(?path, "Config::load: called");
        let mut config = Self::load_file(path)?;
        config.store.apply_overrides(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    fn load_file(path: Option<&PathBuf>) -> Result<Self> {
        if let Some(config_path) = path {
            return Self::read(config_path);
        }

        let default_paths = [
            dirs::config_dir().map(|p| p.join("rendezvous").join("rendezvous.yml")),
            Some(PathBuf::from("rendezvous.yml")),
        ];

        for path in default_paths.iter().flatten() {
            if path.exists() {
                debug!(path = %path.display(), "Config::load_file: found config");
                return Self::read(path);
            }
        }

        debug!("Config::load_file: using defaults");
        Ok(Config::default())
    }

    fn read(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_yaml::from_str(&content).with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
