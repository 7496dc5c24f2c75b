use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::queue::{Backoff, ISSUES_QUEUE, RESCANS_QUEUE, TOOLS_QUEUE};
use crate::tool::{ToolDefinition, DEFAULT_SHELL};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub queues: BTreeMap<String, QueueConfig>,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    #[serde(default = "default_shell")]
    pub shell: String,
}

fn default_shell() -> String {
    DEFAULT_SHELL.to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Store location; `~` expands to the home directory.
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,
    #[serde(default = "default_rescan_stale_after_seconds")]
    pub rescan_stale_after_seconds: u64,
    /// Tools run, in order, by every scheduled rescan.
    #[serde(default)]
    pub rescan_tools: Vec<String>,
}

fn default_tick_seconds() -> u64 {
    60
}

fn default_lease_seconds() -> u64 {
    300
}

fn default_rescan_stale_after_seconds() -> u64 {
    6 * 60 * 60
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_seconds: default_tick_seconds(),
            lease_seconds: default_lease_seconds(),
            rescan_stale_after_seconds: default_rescan_stale_after_seconds(),
            rescan_tools: Vec::new(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_seconds)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_seconds)
    }

    pub fn rescan_stale_after(&self) -> Duration {
        Duration::from_secs(self.rescan_stale_after_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Worker threads; unset means the queue's default.
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_cap_ms() -> u64 {
    300_000
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: None,
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl QueueConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_cap_ms),
        )
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// The queues jobs are routed to; `queues` may only configure these.
pub const QUEUE_NAMES: [&str; 3] = [TOOLS_QUEUE, ISSUES_QUEUE, RESCANS_QUEUE];

/// Worker count for a queue with no explicit `concurrency`.
pub fn default_concurrency(queue: &str) -> usize {
    match queue {
        TOOLS_QUEUE => num_cpus::get(),
        ISSUES_QUEUE => 1,
        RESCANS_QUEUE => num_cpus::get().clamp(1, 4),
        _ => 1,
    }
}

/// A queue's settings with defaults applied.
#[derive(Debug, Clone)]
pub struct ResolvedQueue {
    pub name: String,
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub poll_interval: Duration,
}

impl Config {
    /// Every queue jobs are enqueued on, with defaults filled in.
    pub fn resolved_queues(&self) -> Vec<ResolvedQueue> {
        QUEUE_NAMES.iter().map(|name| self.queue(name)).collect()
    }

    /// Settings for one queue, defaults applied.
    pub fn queue(&self, name: &str) -> ResolvedQueue {
        let queue = self.queues.get(name).cloned().unwrap_or_default();
        ResolvedQueue {
            name: name.to_string(),
            concurrency: queue.concurrency.unwrap_or_else(|| default_concurrency(name)),
            max_attempts: queue.max_attempts,
            backoff: queue.backoff(),
            poll_interval: queue.poll_interval(),
        }
    }

    /// Configured store path with `~` expanded, falling back to
    /// `~/.surfwatch/data/surfwatch.db`.
    pub fn database_path(&self) -> Option<PathBuf> {
        match self.database.path.as_deref() {
            Some(path) => Some(expand_home(path)),
            None => crate::db::default_database_path(),
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        serde_json::from_str(r#"{"version":"1.0"}"#).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = minimal();
        assert_eq!(config.shell, "/bin/sh");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.scheduler.tick_interval(), Duration::from_secs(60));
        assert_eq!(config.queue(RESCANS_QUEUE).max_attempts, 3);
    }

    #[test]
    fn test_queue_defaults() {
        let config = minimal();
        let queues = config.resolved_queues();
        assert_eq!(queues.len(), 3);
        assert_eq!(config.queue(ISSUES_QUEUE).concurrency, 1);
        assert_eq!(config.queue(TOOLS_QUEUE).concurrency, num_cpus::get());
        assert_eq!(config.queue(TOOLS_QUEUE).max_attempts, 3);
    }

    #[test]
    fn test_queue_overrides() {
        let config: Config = serde_json::from_str(
            r#"{"version":"1.0","queues":{"tools":{"concurrency":2,"max_attempts":5},"rescans":{"max_attempts":1}}}"#,
        )
        .unwrap();
        let tools = config.queue(TOOLS_QUEUE);
        assert_eq!(tools.concurrency, 2);
        assert_eq!(tools.max_attempts, 5);
        assert_eq!(config.queue(RESCANS_QUEUE).max_attempts, 1);
        assert_eq!(config.resolved_queues().len(), 3);
    }

    #[test]
    fn test_database_path_expands_home() {
        let mut config = minimal();
        config.database.path = Some("/var/lib/surfwatch.db".to_string());
        assert_eq!(
            config.database_path(),
            Some(PathBuf::from("/var/lib/surfwatch.db"))
        );

        if let Some(home) = dirs::home_dir() {
            config.database.path = Some("~/sw.db".to_string());
            assert_eq!(config.database_path(), Some(home.join("sw.db")));
        }
    }
}
