use crate::env;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Errors while loading or saving configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Cannot serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Scheduler tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Tick interval while nothing changes
    pub idle_interval_ms: u64,
    /// Worker priorities are re-balanced every N-th tick
    pub priority_rebalance_ticks: u32,
    /// Top-level tasks running longer than this get the lowest priority
    pub long_running_threshold_secs: u64,
    /// Added to the weight sum when averaging subtask progress
    pub progress_weight_epsilon: f32,
    /// Period of the message-loop thread's cancellation check
    pub message_loop_timer_ms: u64,
    pub resources: ResourcePoolConfig,
}

/// Resource pool contents
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ResourcePoolConfig {
    /// Capacity of the thread resource; defaults to available parallelism
    pub max_threads: Option<usize>,
    pub resources: Vec<ResourceSpec>,
}

/// One custom counting resource
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceSpec {
    pub id: String,
    pub capacity: usize,
    pub name: Option<String>,
    pub suffix: Option<String>,
}

impl ResourceSpec {
    pub fn new(id: impl Into<String>, capacity: usize) -> Self {
        Self {
            id: id.into(),
            capacity,
            name: None,
            suffix: None,
        }
    }
}

impl ResourcePoolConfig {
    pub fn thread_count(&self) -> usize {
        self.max_threads
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(env::DEFAULT_THREAD_COUNT)
            })
            .max(1)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_interval_ms: env::DEFAULT_IDLE_INTERVAL_MS,
            priority_rebalance_ticks: env::DEFAULT_PRIORITY_REBALANCE_TICKS,
            long_running_threshold_secs: env::DEFAULT_LONG_RUNNING_THRESHOLD_SECS,
            progress_weight_epsilon: env::DEFAULT_PROGRESS_WEIGHT_EPSILON,
            message_loop_timer_ms: env::DEFAULT_MESSAGE_LOOP_TIMER_MS,
            resources: ResourcePoolConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn long_running_threshold(&self) -> Duration {
        Duration::from_secs(self.long_running_threshold_secs)
    }

    pub fn message_loop_timer(&self) -> Duration {
        Duration::from_millis(self.message_loop_timer_ms.max(1))
    }

    /// Load from TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Save to TOML file
    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.idle_interval(), Duration::from_millis(100));
        assert_eq!(config.priority_rebalance_ticks, 10);
        assert_eq!(config.long_running_threshold(), Duration::from_secs(60));
        assert!(config.resources.thread_count() >= 1);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = SchedulerConfig::from_toml_str(
            r#"
            idle_interval_ms = 25

            [resources]
            max_threads = 3

            [[resources.resources]]
            id = "memory"
            capacity = 1024
            suffix = "Mb"
            "#,
        )
        .unwrap();

        assert_eq!(config.idle_interval_ms, 25);
        assert_eq!(config.priority_rebalance_ticks, 10);
        assert_eq!(config.resources.thread_count(), 3);
        assert_eq!(config.resources.resources[0].suffix.as_deref(), Some("Mb"));
    }

    #[test]
    fn test_toml_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cotask.toml");
        let mut config = SchedulerConfig::default();
        config.resources.resources.push(ResourceSpec::new("gpu", 2));
        config.to_toml_file(&path).unwrap();

        let loaded = SchedulerConfig::from_toml_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_invalid_toml() {
        let result = SchedulerConfig::from_toml_str("idle_interval_ms = \"soon\"");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
