// ABOUTME: Configuration structures for the ingestion coordination layer
// ABOUTME: Batching, operation lock timeouts, orphan file limits and logging, with env overrides

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{IngestError, Result};

/// Top-level configuration for ingestion coordination
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct IngestConfig {
    /// Change batching
    #[serde(default)]
    pub batcher: BatcherConfig,

    /// Operation lock
    #[serde(default)]
    pub lock: LockConfig,

    /// Orphan file tracking
    #[serde(default)]
    pub orphan: OrphanConfig,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Change batcher configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatcherConfig {
    /// Quiet period before a pending batch is flushed (default: 1000ms)
    #[serde(default = "default_batch_interval")]
    pub batch_interval_ms: u64,

    /// Pending-set size that forces an immediate flush (default: 100)
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

impl BatcherConfig {
    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_interval_ms: default_batch_interval(),
            max_batch_size: default_max_batch_size(),
        }
    }
}

/// Operation lock configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LockConfig {
    /// Timeout applied when an acquire does not specify one (default: 5 min).
    /// Zero disables the timeout for such operations.
    #[serde(default = "default_lock_timeout")]
    pub default_timeout_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_lock_timeout(),
        }
    }
}

/// Orphan file tracker configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrphanConfig {
    /// Hard cap on individually watched files (default: 100)
    #[serde(default = "default_max_files")]
    pub max_files: usize,

    /// Idle retention used by scheduled cleanup (default: 7 days)
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Mirror watch state into the persistence store (default: true)
    #[serde(default = "default_persist")]
    pub persist_to_store: bool,

    /// Scope under which watch state is persisted
    #[serde(default = "default_scope_id")]
    pub scope_id: String,
}

impl Default for OrphanConfig {
    fn default() -> Self {
        Self {
            max_files: default_max_files(),
            retention_days: default_retention_days(),
            persist_to_store: default_persist(),
            scope_id: default_scope_id(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Filter directive used when RUST_LOG is not set (default: "info")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Include the event target in formatted output
    #[serde(default = "default_with_target")]
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            with_target: default_with_target(),
        }
    }
}

impl IngestConfig {
    /// Parse a TOML document; missing sections fall back to defaults
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: IngestConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file, then apply environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let mut config: IngestConfig = toml::from_str(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        info!(
            target: "codegraph::ingest",
            path = %path.display(),
            "Loaded ingest configuration"
        );
        Ok(config)
    }

    /// Override values from `CODEGRAPH_*` environment variables
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse::<u64>("CODEGRAPH_INGEST_BATCH_INTERVAL_MS") {
            self.batcher.batch_interval_ms = v;
        }
        if let Some(v) = env_parse::<usize>("CODEGRAPH_INGEST_MAX_BATCH_SIZE") {
            self.batcher.max_batch_size = v;
        }
        if let Some(v) = env_parse::<u64>("CODEGRAPH_LOCK_TIMEOUT_MS") {
            self.lock.default_timeout_ms = v;
        }
        if let Some(v) = env_parse::<usize>("CODEGRAPH_ORPHAN_MAX_FILES") {
            self.orphan.max_files = v;
        }
        if let Some(v) = env_parse::<u32>("CODEGRAPH_ORPHAN_RETENTION_DAYS") {
            self.orphan.retention_days = v;
        }
        if let Ok(v) = std::env::var("CODEGRAPH_ORPHAN_PERSIST") {
            self.orphan.persist_to_store = matches!(v.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Ok(level) = std::env::var("CODEGRAPH_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.batcher.max_batch_size == 0 {
            return Err(IngestError::Config(
                "batcher.max_batch_size must be greater than zero".to_string(),
            ));
        }
        if self.batcher.batch_interval_ms == 0 {
            return Err(IngestError::Config(
                "batcher.batch_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.orphan.max_files == 0 {
            return Err(IngestError::Config(
                "orphan.max_files must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring invalid value for {}: {:?}", key, raw);
            None
        }
    }
}

// Default value functions
fn default_batch_interval() -> u64 {
    1000
}
fn default_max_batch_size() -> usize {
    100
}
fn default_lock_timeout() -> u64 {
    300_000
}
fn default_max_files() -> usize {
    100
}
fn default_retention_days() -> u32 {
    7
}
fn default_persist() -> bool {
    true
}
fn default_scope_id() -> String {
    "orphans".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_with_target() -> bool {
    true
}
