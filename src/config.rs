//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use chrono_tz::Tz;

use crate::error::ConfigError;

/// Maximum automatic retries for a failed message-lane run.
pub const MAX_RETRIES: u32 = 5;

/// Base delay for message-lane retry backoff; doubles per attempt.
pub const BASE_RETRY_MS: u64 = 5_000;

/// Delay between a task container's last output and the cooperative close.
pub const TASK_CLOSE_DELAY_MS: u64 = 10_000;

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Global cap on concurrently running containers across all groups.
    pub max_concurrent_containers: usize,
    /// Task-scheduler tick interval.
    pub scheduler_poll_interval: Duration,
    /// Idle timeout consumed by the container runtime (not by the core).
    pub idle_timeout: Duration,
    /// IANA timezone used to evaluate cron expressions.
    pub timezone: Tz,
    /// Group folder whose containers run with `is_main = true`.
    pub main_group_folder: String,
    /// Root directory for the IPC layout.
    pub data_dir: PathBuf,
    /// Display name of the assistant; its own messages are excluded from
    /// prompts.
    pub assistant_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_containers: 2,
            scheduler_poll_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(300),
            timezone: chrono_tz::UTC,
            main_group_folder: "main".to_string(),
            data_dir: PathBuf::from("data"),
            assistant_name: "assistant".to_string(),
        }
    }
}

impl Config {
    /// Build a Config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_concurrent_containers = read_parsed(
            "MAX_CONCURRENT_CONTAINERS",
            defaults.max_concurrent_containers,
        )?;
        if max_concurrent_containers < 1 {
            return Err(ConfigError::InvalidValue {
                key: "MAX_CONCURRENT_CONTAINERS".to_string(),
                message: "must be >= 1".to_string(),
            });
        }

        let poll_ms = read_parsed(
            "SCHEDULER_POLL_INTERVAL",
            defaults.scheduler_poll_interval.as_millis() as u64,
        )?;
        let idle_ms = read_parsed("IDLE_TIMEOUT", defaults.idle_timeout.as_millis() as u64)?;

        let timezone = match std::env::var("TIMEZONE") {
            Ok(name) => name
                .parse::<Tz>()
                .map_err(|_| ConfigError::UnknownTimezone(name))?,
            Err(_) => defaults.timezone,
        };

        Ok(Self {
            max_concurrent_containers,
            scheduler_poll_interval: Duration::from_millis(poll_ms),
            idle_timeout: Duration::from_millis(idle_ms),
            timezone,
            main_group_folder: std::env::var("MAIN_GROUP_FOLDER")
                .unwrap_or(defaults.main_group_folder),
            data_dir: std::env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            assistant_name: std::env::var("ASSISTANT_NAME").unwrap_or(defaults.assistant_name),
        })
    }

    /// Whether the given group folder runs as the main group.
    pub fn is_main_folder(&self, folder: &str) -> bool {
        folder == self.main_group_folder
    }
}

fn read_parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("could not parse '{raw}'"),
        }),
        Err(_) => Ok(default),
    }
}
