//! Application Configuration
//!
//! This module provides configuration management for the engine,
//! supporting YAML configuration files with sensible defaults and a few
//! environment overrides.

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use log::{info, warn};

use crate::error::{EngineError, Result};
use crate::safe_path::join_under;

const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// Storage backend kinds a storage definition can use
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    Mock,
}

impl Default for BackendKind {
    fn default() -> Self {
        BackendKind::Local
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" | "localfs" | "fs" => Ok(BackendKind::Local),
            "mock" => Ok(BackendKind::Mock),
            _ => Err(format!("Unknown backend kind: {}", s)),
        }
    }
}

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub archive: ArchiveConfig,
    pub requests: RequestsConfig,
    pub scheduler: SchedulerConfig,
    pub bus: BusConfig,
    pub storages: Vec<StorageDefinition>,
    pub logging: LoggingConfig,
}

/// HTTP intake configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
}

/// Ledger database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database file path
    pub db_path: String,
    /// Enable WAL mode
    pub wal_mode: bool,
    /// How long a writer waits for the database lock
    pub busy_timeout_ms: u64,
}

/// Package closing thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// `archive.max.size.in.ko`: a package closes once its size exceeds this
    #[serde(rename = "max.size.in.ko")]
    pub max_size_in_ko: u64,
    /// `archive.max.age.in.hours`: a package closes once it is older than this
    #[serde(rename = "max.age.in.hours")]
    pub max_age_in_hours: u64,
}

impl ArchiveConfig {
    /// Size threshold in bytes (1 ko = 1000 bytes).
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_in_ko.saturating_mul(1000)
    }

    pub fn max_age(&self) -> chrono::Duration {
        chrono::Duration::hours(self.max_age_in_hours as i64)
    }
}

/// Ledger request configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestsConfig {
    /// `requests.expiration.in.hours`: TODO requests older than this are failed
    #[serde(rename = "expiration.in.hours")]
    pub expiration_in_hours: u64,
}

impl RequestsConfig {
    pub fn expiration(&self) -> chrono::Duration {
        chrono::Duration::hours(self.expiration_in_hours as i64)
    }
}

/// Periodic driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// Tick interval in seconds
    pub interval_secs: u64,
    /// Number of rows handled per transactional pass
    pub page_size: usize,
    /// Lease time-to-live in seconds
    pub lease_ttl_secs: u64,
}

/// In-process message bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Number of batches buffered per subscriber
    pub capacity: usize,
}

/// One configured storage and the backend serving it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageDefinition {
    pub name: String,
    #[serde(default)]
    pub kind: BackendKind,
    #[serde(default = "default_base_path")]
    pub base_path: String,
    /// Store requests for this storage are aggregated into packages
    #[serde(default)]
    pub packaging: bool,
    /// Root of the predicted URLs of packaged files
    #[serde(default)]
    pub archive_parent_url: Option<String>,
    /// Maximum number of files per working subset
    #[serde(default = "default_subset_size")]
    pub subset_size: usize,
    /// Local backends only read `file://` origins below this directory
    #[serde(default)]
    pub origin_root: Option<String>,
}

impl StorageDefinition {
    /// Directory holding this storage's files.
    pub fn root(&self) -> PathBuf {
        Path::new(&self.base_path).join(&self.name)
    }

    /// Directory the packages of `subdirectory` are written to.
    pub fn parent_path_for(&self, subdirectory: &str) -> Result<String> {
        let path = join_under(&self.root(), subdirectory)?;
        Ok(path.to_string_lossy().into_owned())
    }

    /// URL prefix of the files packaged under `subdirectory`.
    pub fn parent_url_for(&self, subdirectory: &str) -> String {
        let base = match &self.archive_parent_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("file://{}", self.root().to_string_lossy().trim_end_matches('/')),
        };
        let subdirectory = subdirectory.trim_matches('/');
        if subdirectory.is_empty() {
            base
        } else {
            format!("{}/{}", base, subdirectory)
        }
    }
}

fn default_base_path() -> String {
    "./data/storages".to_string()
}

fn default_subset_size() -> usize {
    100
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Path to the log4rs configuration file
    pub config_file: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9720,
            workers: 4,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            db_path: "./data/ledger.sqlite".to_string(),
            wal_mode: true,
            busy_timeout_ms: 5000,
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            max_size_in_ko: 10_000,
            max_age_in_hours: 12,
        }
    }
}

impl Default for RequestsConfig {
    fn default() -> Self {
        Self {
            expiration_in_hours: 72,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            page_size: 500,
            lease_ttl_secs: 120,
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            config_file: "server_log.yaml".to_string(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            archive: ArchiveConfig::default(),
            requests: RequestsConfig::default(),
            scheduler: SchedulerConfig::default(),
            bus: BusConfig::default(),
            storages: Vec::new(),
            logging: LoggingConfig::default(),
        }
    }
}

fn env_number(name: &str) -> Option<u64> {
    match env::var(name) {
        Ok(value) => match value.trim().parse::<u64>() {
            Ok(number) => {
                info!("Using {} from environment: {}", name, number);
                Some(number)
            }
            Err(e) => {
                warn!("Invalid {} in environment: {}. Keeping configured value.", name, e);
                None
            }
        },
        Err(_) => None,
    }
}

impl AppConfig {
    /// Load configuration from `ENGINE_CONFIG` or `config.yaml`, using
    /// defaults if no file is found.
    pub fn load() -> Result<Self> {
        let config_path = env::var("ENGINE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        let mut config = if Path::new(&config_path).exists() {
            let config = Self::from_file(&config_path)?;
            info!("Loaded configuration from {}", config_path);
            config
        } else {
            warn!("Config file {} not found, using defaults", config_path);
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Apply `ARCHIVE_MAX_SIZE_IN_KO`, `ARCHIVE_MAX_AGE_IN_HOURS` and `ENGINE_DB_FILE`.
    pub fn apply_env_overrides(&mut self) {
        if let Some(size) = env_number("ARCHIVE_MAX_SIZE_IN_KO") {
            self.archive.max_size_in_ko = size;
        }
        if let Some(age) = env_number("ARCHIVE_MAX_AGE_IN_HOURS") {
            self.archive.max_age_in_hours = age;
        }
        if let Ok(path) = env::var("ENGINE_DB_FILE") {
            info!("Using database path from environment: {}", path);
            self.database.db_path = path;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.page_size == 0 {
            return Err(EngineError::Config("scheduler.page_size must be positive".into()));
        }
        let mut names = std::collections::HashSet::new();
        for storage in &self.storages {
            if storage.name.trim().is_empty() {
                return Err(EngineError::Config("storage name must not be empty".into()));
            }
            if !names.insert(storage.name.as_str()) {
                return Err(EngineError::Config(format!("storage {} is defined twice", storage.name)));
            }
            if storage.subset_size == 0 {
                return Err(EngineError::Config(format!("storage {} has a zero subset_size", storage.name)));
            }
        }
        Ok(())
    }
}
