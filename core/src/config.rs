use std::{collections::HashMap, fs::File, io::Read, path::Path};

use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::{
    bulk::{ChunkPlanner, InsertOptions},
    clock::{Clock, ClockError, DEFAULT_UTC_OFFSET},
    database::postgres::client::PostgresOptions,
};

fn default_chunk_size() -> usize {
    ChunkPlanner::DEFAULT_CHUNK_SIZE
}

fn default_max_parallelism() -> usize {
    InsertOptions::DEFAULT_MAX_PARALLELISM
}

fn default_timezone() -> String {
    DEFAULT_UTC_OFFSET.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_pool_size() -> u32 {
    PostgresOptions::default().pool_size
}

fn default_table_lock() -> bool {
    true
}

/// Tuning and mapping options, usually read from a YAML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Rows per bulk insert chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Chunks loading at the same time during a bulk insert.
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,

    /// UTC offset used for the timestamps the repository writes, as `+HH:MM`.
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// `error`, `warn`, `info`, `debug`, `trace` or `off`.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    #[serde(default)]
    pub disable_ssl: bool,

    /// Take a table lock before each bulk insert chunk.
    #[serde(default = "default_table_lock")]
    pub table_lock: bool,

    /// Row type name to table name.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tables: HashMap<String, String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            chunk_size: default_chunk_size(),
            max_parallelism: default_max_parallelism(),
            timezone: default_timezone(),
            log_level: default_log_level(),
            pool_size: default_pool_size(),
            disable_ssl: false,
            table_lock: default_table_lock(),
            tables: HashMap::new(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Could not open file: {0}")]
    CouldNotOpenFile(#[from] std::io::Error),

    #[error("Could not parse config: {0}")]
    CouldNotParseConfig(#[from] serde_yaml::Error),

    #[error("{0}")]
    InvalidTimezone(#[from] ClockError),

    #[error("{0} must be at least 1")]
    MustBePositive(&'static str),

    #[error("Unknown log level {0}")]
    InvalidLogLevel(String),
}

impl SyncConfig {
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::MustBePositive("chunk_size"));
        }
        if self.max_parallelism == 0 {
            return Err(ConfigError::MustBePositive("max_parallelism"));
        }
        if self.pool_size == 0 {
            return Err(ConfigError::MustBePositive("pool_size"));
        }
        Clock::from_offset_str(&self.timezone)?;
        self.log_level()?;
        Ok(())
    }

    pub fn log_level(&self) -> Result<LevelFilter, ConfigError> {
        self.log_level.parse().map_err(|_| ConfigError::InvalidLogLevel(self.log_level.clone()))
    }

    pub fn clock(&self) -> Result<Clock, ConfigError> {
        Ok(Clock::from_offset_str(&self.timezone)?)
    }

    pub fn insert_options(&self) -> InsertOptions {
        InsertOptions {
            chunk_size: self.chunk_size,
            max_parallelism: self.max_parallelism,
            table_lock: self.table_lock,
        }
    }

    pub fn postgres_options(&self) -> PostgresOptions {
        PostgresOptions { pool_size: self.pool_size, disable_ssl: self.disable_ssl }
    }
}

pub fn read_config(file_path: &Path) -> Result<SyncConfig, ConfigError> {
    let mut file = File::open(file_path)?;
    let mut contents = String::new();

    file.read_to_string(&mut contents)?;

    SyncConfig::from_yaml_str(&contents)
}
