//! Nudge configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NudgeConfig {
    /// "development" or "production". In production a dead queue is fatal at
    /// startup; elsewhere the scheduler starts disabled with an error log.
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Directory for the scheduler and queue databases.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    /// Path to the product database the membership/selection adapters read.
    #[serde(default)]
    pub product_db: String,
}

fn default_environment() -> String {
    "development".into()
}
fn default_data_dir() -> String {
    NudgeConfig::home_dir().to_string_lossy().into_owned()
}

impl Default for NudgeConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            data_dir: default_data_dir(),
            scheduler: SchedulerConfig::default(),
            queue: QueueConfig::default(),
            dispatcher: DispatcherConfig::default(),
            telegram: TelegramConfig::default(),
            product_db: String::new(),
        }
    }
}

impl NudgeConfig {
    /// Load config from the default path (~/.nudge/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::error::NudgeError::Config(format!("Failed to read config: {e}"))
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            crate::error::NudgeError::Config(format!("Failed to parse config: {e}"))
        })?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| {
            crate::error::NudgeError::Config(format!("Failed to serialize config: {e}"))
        })?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Nudge home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".nudge")
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

/// Scheduler sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between due-job sweeps.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// Run the stale-execution reaper every N ticks.
    #[serde(default = "default_reconcile_every")]
    pub reconcile_every_ticks: u64,
}

fn default_tick_interval() -> u64 {
    30
}
fn default_reconcile_every() -> u64 {
    10
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            reconcile_every_ticks: default_reconcile_every(),
        }
    }
}

/// Durable queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue database path. Empty = `<data_dir>/queue.db`.
    #[serde(default)]
    pub path: String,
    /// Logical namespace; lets several deployments share one queue file.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Worker pool size — upper bound on concurrently running jobs.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Random extra sleep added to each poll, spreads worker wakeups.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    /// Total attempts per queued run (first try included).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Exponential backoff base between attempts.
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,
    /// How many completed rows to retain for inspection.
    #[serde(default = "default_keep_completed")]
    pub keep_completed: usize,
    /// How many failed rows to retain for inspection.
    #[serde(default = "default_keep_failed")]
    pub keep_failed: usize,
    /// Hard wall-clock limit for one handler run.
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,
}

fn default_namespace() -> String {
    "nudge".into()
}
fn default_concurrency() -> usize {
    4
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_jitter_ms() -> u64 {
    250
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base() -> u64 {
    5
}
fn default_keep_completed() -> usize {
    100
}
fn default_keep_failed() -> usize {
    500
}
fn default_job_timeout() -> u64 {
    300
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            namespace: default_namespace(),
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            jitter_ms: default_jitter_ms(),
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base(),
            keep_completed: default_keep_completed(),
            keep_failed: default_keep_failed(),
            job_timeout_secs: default_job_timeout(),
        }
    }
}

/// Notification dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Outbound message rate. Telegram documents 30/s; 25 leaves margin.
    #[serde(default = "default_messages_per_second")]
    pub messages_per_second: u32,
    /// Total attempts for one message in `send_with_retry`.
    #[serde(default = "default_send_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
}

fn default_messages_per_second() -> u32 {
    25
}
fn default_send_retries() -> u32 {
    3
}
fn default_retry_base_delay() -> u64 {
    1000
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            messages_per_second: default_messages_per_second(),
            max_retries: default_send_retries(),
            retry_base_delay_ms: default_retry_base_delay(),
        }
    }
}

/// Telegram channel configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NudgeConfig::default();
        assert_eq!(config.environment, "development");
        assert!(!config.is_production());
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.queue.backoff_base_secs, 5);
        assert_eq!(config.dispatcher.messages_per_second, 25);
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml = r#"
            environment = "production"

            [queue]
            concurrency = 8

            [telegram]
            bot_token = "123:abc"
            enabled = true
        "#;
        let config: NudgeConfig = toml::from_str(toml).unwrap();
        assert!(config.is_production());
        assert_eq!(config.queue.concurrency, 8);
        // Untouched sections keep their defaults
        assert_eq!(config.queue.poll_interval_ms, 1000);
        assert_eq!(config.dispatcher.max_retries, 3);
        assert!(config.telegram.enabled);
    }
}
