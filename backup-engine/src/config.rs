//! Configuration management for the backup engine.
//!
//! Loaded once at startup from a TOML file, then environment variables, then
//! command-line flags. The resulting value is immutable and shared by `Arc`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::sync::checksum::ChecksumAlgorithm;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    pub pipeline: PipelineConfig,
    pub retry: RetryConfig,
    pub database: DatabaseConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Version string of the application whose data is backed up
    pub app_version: String,

    /// Working directory for the catalog copy and temporary dumps
    /// (system temp dir when unset)
    pub work_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Root of the library tree
    pub library_root: PathBuf,

    /// File or directory names skipped during the scan
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// A directory acting as the bucket root
    Local,
    /// Google Cloud Storage
    Gcs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationConfig {
    pub backend: BackendKind,

    /// Bucket name (gcs)
    pub bucket: String,

    /// Bucket root directory (local)
    pub root: Option<PathBuf>,

    /// API endpoint (gcs)
    pub endpoint: String,

    /// Environment variable holding the bearer token (gcs)
    pub token_env: String,

    /// Storage class applied to uploaded objects
    pub storage_class: Option<String>,

    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,

    /// Connect timeout in seconds
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of upload workers
    pub workers: usize,

    /// Queue capacity is `workers * queue_multiplier`
    pub queue_multiplier: usize,

    /// Content checksum algorithm
    pub checksum: ChecksumAlgorithm,

    /// Flush the catalog every this many processed files
    pub checkpoint_interval: u64,

    /// Seconds between progress log lines (0 disables)
    pub progress_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per remote operation, first one included
    pub max_attempts: u32,

    /// Delay before the first retry; doubles for each later one
    pub base_delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub enabled: bool,

    /// Dump program; connection parameters come from the environment
    pub command: String,

    pub args: Vec<String>,

    /// Number of dumps kept remotely
    pub retention_count: usize,

    /// Dumps older than this are deleted regardless of count
    pub retention_max_age_days: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Compact,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    pub format: LogFormat,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            app_version: "unknown".to_string(),
            work_dir: None,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            library_root: PathBuf::from("/usr/src/app/upload"),
            exclude: Vec::new(),
        }
    }
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Gcs,
            bucket: String::new(),
            root: None,
            endpoint: "https://storage.googleapis.com".to_string(),
            token_env: "GCS_ACCESS_TOKEN".to_string(),
            storage_class: Some("ARCHIVE".to_string()),
            request_timeout_secs: 3600,
            connect_timeout_secs: 30,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_multiplier: 10,
            checksum: ChecksumAlgorithm::Sha256,
            checkpoint_interval: 1000,
            progress_interval_secs: 30,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_secs: 2,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: "pg_dump".to_string(),
            args: vec![
                "--no-owner".to_string(),
                "--no-acl".to_string(),
                "--clean".to_string(),
                "--if-exists".to_string(),
            ],
            retention_count: 5,
            retention_max_age_days: None,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Apply overrides from the process environment (and `.env`, if present).
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        let _ = dotenvy::dotenv();
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("LIBRARY_PATH") {
            self.source.library_root = PathBuf::from(v);
        }
        // Older deployments set GCS_* and IMMICH_VERSION; the BACKUP_* names win.
        if let Some(v) = lookup("BACKUP_BUCKET").or_else(|| lookup("GCS_BUCKET")) {
            self.destination.bucket = v;
        }
        if let Some(v) = lookup("BACKUP_STORAGE_CLASS").or_else(|| lookup("GCS_STORAGE_CLASS")) {
            self.destination.storage_class = Some(v).filter(|s| !s.is_empty());
        }
        if let Some(v) = lookup("BACKUP_APP_VERSION").or_else(|| lookup("IMMICH_VERSION")) {
            self.engine.app_version = v;
        }
        if let Some(v) = lookup("BACKUP_LOG_LEVEL") {
            self.log.level = v;
        }
        if let Some(v) = lookup("BACKUP_WORKERS") {
            self.pipeline.workers = parse_env("BACKUP_WORKERS", v)?;
        }
        if let Some(v) = lookup("DB_BACKUP_RETENTION") {
            self.database.retention_count = parse_env("DB_BACKUP_RETENTION", v)?;
        }
        Ok(())
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.library_root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("source.library_root is empty".into()));
        }
        if self.pipeline.workers == 0 {
            return Err(ConfigError::Invalid("pipeline.workers must be at least 1".into()));
        }
        if self.pipeline.queue_multiplier == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.queue_multiplier must be at least 1".into(),
            ));
        }
        if self.pipeline.checkpoint_interval == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.checkpoint_interval must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        match self.destination.backend {
            BackendKind::Gcs if self.destination.bucket.is_empty() => {
                return Err(ConfigError::Invalid("destination.bucket is required".into()));
            }
            BackendKind::Local if self.destination.root.is_none() => {
                return Err(ConfigError::Invalid(
                    "destination.root is required for the local backend".into(),
                ));
            }
            _ => {}
        }
        if self.database.enabled {
            if self.database.command.is_empty() {
                return Err(ConfigError::Invalid("database.command is empty".into()));
            }
            if self.database.retention_count == 0 {
                return Err(ConfigError::Invalid(
                    "database.retention_count must be at least 1".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn queue_capacity(&self) -> usize {
        self.pipeline.workers * self.pipeline.queue_multiplier
    }

    pub fn work_dir(&self) -> PathBuf {
        self.engine
            .work_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.destination.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.destination.connect_timeout_secs)
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { name, value })
}
