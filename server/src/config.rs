use std::env;
use std::path::PathBuf;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use marcus_core::context::ContextConfig;
use marcus_core::resilience::RetryPolicy;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub persistence: PersistenceConfig,
    pub context_cache: ContextCacheConfig,
    pub lease: LeaseConfig,
    pub event_bus: EventBusConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub classifier: ClassifierConfig,
    pub kanban: KanbanConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    /// Listen address for the tool-call HTTP server
    pub listen_addr: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: LogFormat,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
    Compact,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Embedded SQLite with WAL journaling
    Relational,
    /// JSON file per entry with atomic rename
    File,
    /// In-memory, for tests and ephemeral runs
    Memory,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PersistenceConfig {
    pub backend: BackendKind,
    /// Data location for the relational/file backends; defaults under the
    /// data directory
    pub path: Option<String>,
    /// Reader connections for the relational backend
    pub pool_size: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ContextCacheConfig {
    /// Max resident project contexts
    pub capacity: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LeaseConfig {
    pub default_ttl_seconds: i64,
    pub reclaim_interval_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EventBusConfig {
    pub history_size: usize,
    pub persist_events: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_seconds: f64,
    pub max_delay_seconds: f64,
    pub jitter: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ClassifierConfig {
    /// When false, assignment skips AI rescoring entirely
    pub enabled: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KanbanProvider {
    None,
    Planka,
    Github,
    Linear,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct KanbanConfig {
    pub provider: KanbanProvider,
    /// Provider credentials keyed by project id, forwarded to the
    /// provider client collaborator
    #[serde(default)]
    pub credentials: std::collections::HashMap<String, std::collections::HashMap<String, String>>,
}

impl Config {
    /// Load configuration: embedded defaults, then the optional config
    /// file (`MARCUS_CONFIG_PATH`), then `MARCUS__`-prefixed environment
    /// overrides.
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder().add_source(File::from_str(
            include_str!("../config/default.toml"),
            FileFormat::Toml,
        ));

        let file = config_file
            .map(String::from)
            .or_else(|| env::var("MARCUS_CONFIG_PATH").ok());
        if let Some(file) = file {
            builder = builder.add_source(File::with_name(&file).format(FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("MARCUS")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;
        let config: Config = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        Ok(config)
    }

    /// Base directory for persistence files and logs
    pub fn data_dir() -> PathBuf {
        if let Ok(dir) = env::var("MARCUS_DATA_DIR") {
            return PathBuf::from(dir);
        }
        if let Ok(xdg_data) = env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg_data).join("marcus");
        }
        let home = env::var("HOME")
            .or_else(|_| env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".marcus")
    }

    /// Resolved location of the persistence store
    pub fn persistence_path(&self) -> PathBuf {
        match &self.persistence.path {
            Some(path) => PathBuf::from(path),
            None => match self.persistence.backend {
                BackendKind::Relational => Self::data_dir().join("marcus.sqlite"),
                _ => Self::data_dir().join("store"),
            },
        }
    }

    /// Location of the append-only conversation log
    pub fn conversation_log_path(&self) -> PathBuf {
        Self::data_dir().join("conversation.jsonl")
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.listen_addr, self.server.port)
    }

    /// The retry policy applied to collaborator calls
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            StdDuration::from_secs_f64(self.retry.base_delay_seconds),
            StdDuration::from_secs_f64(self.retry.max_delay_seconds),
            self.retry.jitter,
        )
    }

    /// Project the server config onto the core context tunables
    pub fn context_config(&self) -> ContextConfig {
        ContextConfig {
            capacity: self.context_cache.capacity,
            lease_ttl: chrono::Duration::seconds(self.lease.default_ttl_seconds),
            reclaim_interval: StdDuration::from_secs(self.lease.reclaim_interval_seconds),
            event_history: self.event_bus.history_size,
            persist_events: self.event_bus.persist_events,
            breaker_failure_threshold: self.circuit_breaker.failure_threshold,
            breaker_recovery_timeout: StdDuration::from_secs(
                self.circuit_breaker.recovery_timeout_seconds,
            ),
            retry: self.retry_policy(),
        }
    }

    /// Validate the configuration; failures exit with code 2
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                anyhow::bail!(
                    "Invalid log level: {other}. Must be one of: trace, debug, info, warn, error"
                );
            }
        }

        if self.server.port == 0 {
            anyhow::bail!("Server port cannot be 0");
        }
        if self.context_cache.capacity == 0 {
            anyhow::bail!("context_cache.capacity must be greater than 0");
        }
        if self.persistence.pool_size == 0 {
            anyhow::bail!("persistence.pool_size must be greater than 0");
        }
        if self.lease.default_ttl_seconds <= 0 {
            anyhow::bail!("lease.default_ttl_seconds must be positive");
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.base_delay_seconds < 0.0 || self.retry.max_delay_seconds < 0.0 {
            anyhow::bail!("retry delays cannot be negative");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::load(None).expect("embedded default configuration must parse")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::default();
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.persistence.backend, BackendKind::Relational);
        assert_eq!(config.persistence.pool_size, 4);
        assert_eq!(config.context_cache.capacity, 10);
        assert_eq!(config.lease.default_ttl_seconds, 3600);
        assert_eq!(config.lease.reclaim_interval_seconds, 30);
        assert_eq!(config.event_bus.history_size, 1000);
        assert!(config.event_bus.persist_events);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.recovery_timeout_seconds, 60);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.retry.jitter);
        assert!(!config.classifier.enabled);
        assert_eq!(config.kanban.provider, KanbanProvider::None);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.context_cache.capacity = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.lease.default_ttl_seconds = -5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn context_config_projection() {
        let config = Config::default();
        let ctx = config.context_config();
        assert_eq!(ctx.capacity, 10);
        assert_eq!(ctx.lease_ttl, chrono::Duration::seconds(3600));
        assert_eq!(ctx.event_history, 1000);
        assert_eq!(ctx.breaker_failure_threshold, 5);
    }

    #[test]
    fn config_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("marcus.toml");
        std::fs::write(&path, "[server]\nport = 9100\n[context_cache]\ncapacity = 3\n").unwrap();

        let config = Config::load(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.context_cache.capacity, 3);
        // Untouched sections keep their defaults
        assert_eq!(config.lease.default_ttl_seconds, 3600);
    }
}
