//! AgentHub configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::domain::Priority;
use crate::memory::MemoryConfig;

/// Main AgentHub configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage locations
    pub storage: StorageConfig,

    /// Task defaults
    pub tasks: TasksConfig,

    /// Code-agent backend
    pub backend: BackendConfig,

    /// Worker loop tuning
    pub worker: WorkerConfig,

    /// Outbound notifications
    pub notify: NotifyConfig,

    /// Memory engine tuning
    pub memory: MemoryConfig,

    /// Chat session manager
    pub sessions: SessionsConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .agenthub.yml
        let local_config = PathBuf::from(".agenthub.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/agenthub/agenthub.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("agenthub").join("agenthub.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Resolve the data directory: configured path or the platform default
    pub fn data_dir(&self) -> PathBuf {
        self.storage
            .data_dir
            .clone()
            .unwrap_or_else(default_data_dir)
    }
}

/// Default data directory: `~/.config/agenthub`
pub fn default_data_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("agenthub")
}

/// Storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory root; default ~/.config/agenthub
    #[serde(rename = "data-dir")]
    pub data_dir: Option<PathBuf>,
}

/// Task defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TasksConfig {
    /// Priority for tasks created without one
    #[serde(rename = "default-priority")]
    pub default_priority: Priority,

    /// Task-level restart budget after workflow failure
    #[serde(rename = "max-retries")]
    pub max_retries: u32,

    /// Per-node backend call timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            default_priority: Priority::Medium,
            max_retries: 3,
            timeout_ms: 30 * 60 * 1000,
        }
    }
}

/// Code-agent backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend type (currently only "process")
    #[serde(rename = "type")]
    pub backend_type: String,

    /// Agent binary invoked per call
    pub command: String,

    /// Model identifier passed through; empty uses the agent default
    pub model: String,

    /// Global cap on concurrent agent processes
    #[serde(rename = "max-concurrent-calls")]
    pub max_concurrent_calls: u32,

    /// Hard kill timeout per invocation in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    /// Parse the stdout event stream and surface deltas
    pub stream: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            backend_type: "process".to_string(),
            command: "claude".to_string(),
            model: String::new(),
            max_concurrent_calls: 5,
            timeout_ms: 30 * 60 * 1000,
            stream: true,
        }
    }
}

/// Worker loop tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Concurrent node executions per runner
    pub concurrency: usize,

    /// Queue poll interval in milliseconds
    #[serde(rename = "poll-interval-ms")]
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval_ms: 1_000,
        }
    }
}

/// Outbound notification configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub enabled: bool,

    /// Terminal task events POST here as JSON
    #[serde(rename = "webhook-url")]
    pub webhook_url: Option<String>,
}

/// Chat session manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// LRU capacity
    #[serde(rename = "max-sessions")]
    pub max_sessions: usize,

    /// Idle sessions older than this are purged
    #[serde(rename = "timeout-minutes")]
    pub timeout_minutes: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            timeout_minutes: 720,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.backend.backend_type, "process");
        assert_eq!(config.backend.command, "claude");
        assert_eq!(config.backend.max_concurrent_calls, 5);
        assert_eq!(config.tasks.default_priority, Priority::Medium);
        assert_eq!(config.worker.poll_interval_ms, 1_000);
        assert_eq!(config.sessions.max_sessions, 100);
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
storage:
  data-dir: /tmp/hub-data

tasks:
  default-priority: high
  max-retries: 5
  timeout-ms: 600000

backend:
  type: process
  command: my-agent
  model: sonnet
  max-concurrent-calls: 3
  timeout-ms: 120000
  stream: false

worker:
  concurrency: 4
  poll-interval-ms: 250

notify:
  enabled: true
  webhook-url: https://hooks.example.com/hub

memory:
  archive-threshold: 15
  delete-threshold: 8

sessions:
  max-sessions: 10
  timeout-minutes: 30
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.storage.data_dir, Some(PathBuf::from("/tmp/hub-data")));
        assert_eq!(config.tasks.default_priority, Priority::High);
        assert_eq!(config.tasks.max_retries, 5);
        assert_eq!(config.backend.command, "my-agent");
        assert_eq!(config.backend.model, "sonnet");
        assert!(!config.backend.stream);
        assert_eq!(config.worker.concurrency, 4);
        assert_eq!(config.notify.webhook_url.as_deref(), Some("https://hooks.example.com/hub"));
        assert_eq!(config.memory.archive_threshold, 15.0);
        assert_eq!(config.sessions.timeout_minutes, 30);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let yaml = r#"
backend:
  command: other-agent
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.backend.command, "other-agent");
        assert_eq!(config.backend.max_concurrent_calls, 5);
        assert_eq!(config.tasks.max_retries, 3);
    }

    #[test]
    fn test_data_dir_resolution() {
        let mut config = Config::default();
        assert!(config.data_dir().ends_with("agenthub"));

        config.storage.data_dir = Some(PathBuf::from("/custom"));
        assert_eq!(config.data_dir(), PathBuf::from("/custom"));
    }
}
