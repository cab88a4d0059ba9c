// Configuration module - loaded once at startup (cold path)
// Plain key=value file: blank lines and # comments skipped, unknown keys
// ignored with a warning, malformed numbers fatal.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::{KvError, Result};

// ==================== Configuration ====================

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Number of map shards; fixed at construction.
    pub num_segments: usize,
    /// Advisory initial per-shard capacity.
    pub initial_bucket_size: usize,
    pub wal_file: PathBuf,
    /// Advisory capacity of the WAL append buffer.
    pub wal_buffer_size: usize,
    /// Force every appended record to stable storage before replying.
    pub sync_wal: bool,
    pub server_port: u16,
    pub max_key_size: usize,
    pub max_value_size: usize,
    pub max_connections: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_segments: 64,
            initial_bucket_size: 16,
            wal_file: PathBuf::from("kv_store.wal"),
            wal_buffer_size: 8192,
            sync_wal: true,
            server_port: 6379,
            max_key_size: 1024,
            max_value_size: 65536,
            max_connections: 1000,
        }
    }
}

// ==================== Loading ====================

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let contents = fs::read_to_string(path)
            .map_err(|e| KvError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config = Self::parse(&contents)?;
        config.validate()?;
        Ok(config)
    }

    fn parse(contents: &str) -> Result<Config> {
        let mut config = Config::default();

        for raw in contents.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!(line, "skipping config line without '='");
                continue;
            };
            let key = key.trim();
            let value = value.trim();

            match key {
                "num_segments" => config.num_segments = parse_number(key, value)?,
                "initial_bucket_size" => config.initial_bucket_size = parse_number(key, value)?,
                "wal_file" => config.wal_file = PathBuf::from(value),
                "wal_buffer_size" => config.wal_buffer_size = parse_number(key, value)?,
                "sync_wal" => config.sync_wal = value == "true" || value == "1",
                "server_port" => config.server_port = parse_number(key, value)?,
                "max_key_size" => config.max_key_size = parse_number(key, value)?,
                "max_value_size" => config.max_value_size = parse_number(key, value)?,
                "max_connections" => config.max_connections = parse_number(key, value)?,
                _ => warn!(key, "ignoring unknown config key"),
            }
        }

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.num_segments == 0 {
            return Err(KvError::Config("num_segments must be greater than 0".into()));
        }
        if self.server_port == 0 {
            return Err(KvError::Config("server_port must be greater than 0".into()));
        }
        if self.max_key_size == 0 {
            return Err(KvError::Config("max_key_size must be greater than 0".into()));
        }
        if self.max_value_size == 0 {
            return Err(KvError::Config(
                "max_value_size must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| KvError::Config(format!("invalid value '{}' for {}", value, key)))
}
