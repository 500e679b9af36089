//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/metricvault/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/metricvault/` (~/.config/metricvault/)
//! - Data: `$XDG_DATA_HOME/metricvault/` (~/.local/share/metricvault/)
//! - State/Logs: `$XDG_STATE_HOME/metricvault/` (~/.local/state/metricvault/)

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Destination store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Partition maintenance policy
    #[serde(default)]
    pub partitions: PartitionConfig,

    /// Bulk import defaults
    #[serde(default)]
    pub import: ImportConfig,

    /// Hybrid collector configuration
    #[serde(default)]
    pub collector: CollectorConfig,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

/// Destination store configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Override for the SQLite database file
    pub database_path: Option<PathBuf>,

    /// Tenant schema that imports and maintenance target
    #[serde(default = "default_schema")]
    pub schema: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            schema: default_schema(),
        }
    }
}

fn default_schema() -> String {
    "main".to_string()
}

/// Partition lifecycle policy
#[derive(Debug, Deserialize, Clone)]
pub struct PartitionConfig {
    /// Tables whose chunks are managed
    #[serde(default = "default_partition_tables")]
    pub tables: Vec<String>,

    /// Width of one chunk in hours
    #[serde(default = "default_chunk_interval_hours")]
    pub chunk_interval_hours: u32,

    /// Chunks whose range ended more than this many days ago get compressed
    #[serde(default = "default_compress_after_days")]
    pub compress_after_days: u32,

    /// Chunks whose range ended more than this many days ago get dropped
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Days of chunks created ahead of the write window
    #[serde(default = "default_precreate_days")]
    pub precreate_days: u32,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            tables: default_partition_tables(),
            chunk_interval_hours: default_chunk_interval_hours(),
            compress_after_days: default_compress_after_days(),
            retention_days: default_retention_days(),
            precreate_days: default_precreate_days(),
        }
    }
}

impl PartitionConfig {
    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.chunk_interval_hours == 0 {
            return Err(Error::Config(
                "partitions.chunk_interval_hours must be at least 1".to_string(),
            ));
        }
        if self.compress_after_days >= self.retention_days {
            return Err(Error::Config(
                "partitions.compress_after_days must be less than partitions.retention_days"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

fn default_partition_tables() -> Vec<String> {
    vec!["sessions".to_string(), "tool_metrics".to_string()]
}

fn default_chunk_interval_hours() -> u32 {
    24
}

fn default_compress_after_days() -> u32 {
    7
}

fn default_retention_days() -> u32 {
    90
}

fn default_precreate_days() -> u32 {
    7
}

/// Bulk import defaults
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ImportConfig {
    /// Records per batch
    #[serde(default = "default_import_batch_size")]
    pub batch_size: usize,

    /// Persist checkpoints while importing
    #[serde(default = "default_true")]
    pub checkpoint_enabled: bool,

    /// Batches between checkpoint writes
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,

    /// Directory for checkpoint files (defaults to the state dir)
    pub checkpoint_dir: Option<PathBuf>,

    /// Keep going after a batch has unrecoverable records
    #[serde(default)]
    pub continue_on_error: bool,

    /// Run the validator over a sample before writing
    #[serde(default = "default_true")]
    pub validate_before_insert: bool,

    /// Update existing rows on id conflict instead of failing
    #[serde(default = "default_true")]
    pub upsert: bool,

    /// Sessions sampled for pre-import validation
    #[serde(default = "default_validation_sample")]
    pub validation_sample: usize,

    /// Simulated per-batch latency in dry-run mode
    #[serde(default = "default_dry_run_batch_delay_ms")]
    pub dry_run_batch_delay_ms: u64,

    /// Records per entity re-read after import
    #[serde(default = "default_post_import_sample")]
    pub post_import_sample: usize,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: default_import_batch_size(),
            checkpoint_enabled: true,
            checkpoint_interval: default_checkpoint_interval(),
            checkpoint_dir: None,
            continue_on_error: false,
            validate_before_insert: true,
            upsert: true,
            validation_sample: default_validation_sample(),
            dry_run_batch_delay_ms: default_dry_run_batch_delay_ms(),
            post_import_sample: default_post_import_sample(),
        }
    }
}

impl ImportConfig {
    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config(
                "import.batch_size must be at least 1".to_string(),
            ));
        }
        if self.checkpoint_enabled && self.checkpoint_interval == 0 {
            return Err(Error::Config(
                "import.checkpoint_interval must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Checkpoint directory, falling back to the state dir
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.checkpoint_dir
            .clone()
            .unwrap_or_else(|| Config::state_dir().join("checkpoints"))
    }
}

fn default_true() -> bool {
    true
}

fn default_import_batch_size() -> usize {
    100
}

fn default_checkpoint_interval() -> usize {
    10
}

fn default_validation_sample() -> usize {
    1000
}

fn default_dry_run_batch_delay_ms() -> u64 {
    50
}

fn default_post_import_sample() -> usize {
    10
}

/// How the collector replicates to the remote store
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Local log plus remote replication
    #[default]
    Hybrid,
    /// Never contact the remote
    LocalOnly,
    /// Remote replication is the primary path; the local log is still written
    RemoteOnly,
}

/// Hybrid collector configuration
///
/// When enabled with an endpoint, events are replicated to the remote
/// store in addition to the local append-only logs.
#[derive(Debug, Deserialize, Clone)]
pub struct CollectorConfig {
    /// Enable/disable remote replication
    #[serde(default)]
    pub enabled: bool,

    /// Remote API base URL (e.g., `https://metrics.example.com/api`)
    pub endpoint: Option<String>,

    /// Bearer credential for the remote API
    pub api_key: Option<String>,

    /// Tenant identifier sent with every request
    pub tenant_id: Option<String>,

    /// Directory for local logs, queue and status files
    pub data_dir: Option<PathBuf>,

    /// Initial replication mode
    #[serde(default)]
    pub mode: SyncMode,

    /// Upper bound for one replication request
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,

    /// Latency above which the remote is treated as unavailable
    #[serde(default = "default_fallback_threshold_ms")]
    pub fallback_threshold_ms: u64,

    /// Consecutive failures before the remote is considered unreachable
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Attempts before a queued event is dropped
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    /// Seconds between retry cycles
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,

    /// Queued events retried per cycle
    #[serde(default = "default_retry_batch_size")]
    pub retry_batch_size: usize,

    /// Queue length that triggers trimming
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Queue length kept after trimming (most recent items)
    #[serde(default = "default_queue_trim_to")]
    pub queue_trim_to: usize,

    /// Minimum seconds between health probes
    #[serde(default = "default_health_probe_interval_secs")]
    pub health_probe_interval_secs: u64,

    /// Seconds between failover recovery attempts
    #[serde(default = "default_recovery_interval_secs")]
    pub recovery_interval_secs: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            api_key: None,
            tenant_id: None,
            data_dir: None,
            mode: SyncMode::default(),
            sync_timeout_ms: default_sync_timeout_ms(),
            fallback_threshold_ms: default_fallback_threshold_ms(),
            failure_threshold: default_failure_threshold(),
            max_retry_attempts: default_max_retry_attempts(),
            retry_interval_secs: default_retry_interval_secs(),
            retry_batch_size: default_retry_batch_size(),
            queue_capacity: default_queue_capacity(),
            queue_trim_to: default_queue_trim_to(),
            health_probe_interval_secs: default_health_probe_interval_secs(),
            recovery_interval_secs: default_recovery_interval_secs(),
        }
    }
}

impl CollectorConfig {
    /// Check if remote replication is properly configured and enabled
    pub fn is_ready(&self) -> bool {
        self.enabled
            && self.mode != SyncMode::LocalOnly
            && self.endpoint.is_some()
            && self.api_key.is_some()
            && self.tenant_id.is_some()
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.queue_trim_to == 0 || self.queue_trim_to > self.queue_capacity {
            return Err(Error::Config(
                "collector.queue_trim_to must be between 1 and collector.queue_capacity"
                    .to_string(),
            ));
        }
        if self.retry_batch_size == 0 {
            return Err(Error::Config(
                "collector.retry_batch_size must be at least 1".to_string(),
            ));
        }

        if !self.enabled {
            return Ok(());
        }

        if self.endpoint.is_none() {
            return Err(Error::Config(
                "collector.endpoint is required when collector is enabled".to_string(),
            ));
        }
        if self.api_key.is_none() {
            return Err(Error::Config(
                "collector.api_key is required when collector is enabled".to_string(),
            ));
        }
        if self.tenant_id.is_none() {
            return Err(Error::Config(
                "collector.tenant_id is required when collector is enabled".to_string(),
            ));
        }
        Ok(())
    }

    /// Local data directory, falling back to the data dir
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| Config::data_dir().join("collector"))
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn fallback_threshold(&self) -> Duration {
        Duration::from_millis(self.fallback_threshold_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn health_probe_interval(&self) -> Duration {
        Duration::from_secs(self.health_probe_interval_secs)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_secs)
    }
}

fn default_sync_timeout_ms() -> u64 {
    5000
}

fn default_fallback_threshold_ms() -> u64 {
    1000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_retry_interval_secs() -> u64 {
    30
}

fn default_retry_batch_size() -> usize {
    10
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_queue_trim_to() -> usize {
    900
}

fn default_health_probe_interval_secs() -> u64 {
    60
}

fn default_recovery_interval_secs() -> u64 {
    30
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.partitions.validate()?;
        self.import.validate()?;
        self.collector.validate()?;
        crate::db::schema::validate_identifier(&self.store.schema)?;
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/metricvault/config.toml` (~/.config/metricvault/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("metricvault").join("config.toml")
    }

    /// Returns the data directory path (for the SQLite database)
    ///
    /// `$XDG_DATA_HOME/metricvault/` (~/.local/share/metricvault/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("metricvault")
    }

    /// Returns the state directory path (for logs and checkpoints)
    ///
    /// `$XDG_STATE_HOME/metricvault/` (~/.local/state/metricvault/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("metricvault")
    }

    /// Returns the database file path, honoring `store.database_path`
    ///
    /// `$XDG_DATA_HOME/metricvault/metrics.db` (~/.local/share/metricvault/metrics.db)
    pub fn database_path(&self) -> PathBuf {
        self.store
            .database_path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("metrics.db"))
    }

    /// Database file holding one attached tenant schema
    ///
    /// `$XDG_DATA_HOME/metricvault/tenants/<schema>.db`
    pub fn tenant_database_path(schema: &str) -> PathBuf {
        Self::data_dir().join("tenants").join(format!("{}.db", schema))
    }

    /// Log file of one binary, before the rotation date suffix
    ///
    /// `$XDG_STATE_HOME/metricvault/logs/<tool>.log`
    pub fn log_path(tool: &str) -> PathBuf {
        Self::state_dir()
            .join("logs")
            .join(crate::logging::log_file_name(tool))
    }

    /// Pin the XDG variables to their defaults when unset, so every path
    /// helper resolves the same way for child processes.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }
        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }
        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}
