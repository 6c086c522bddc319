//! Configuration types for Rowkeep
//!
//! This module defines configuration structures used across components.
//! Every section deserializes with defaults so a partial TOML file works.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration for a Rowkeep node
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Cache sharding and eviction
    pub cache: CacheConfig,
    /// Binlog durability
    pub binlog: BinlogConfig,
    /// SQL store
    pub sql: SqlConfig,
    /// Logging
    pub logging: LoggingConfig,
}

impl NodeConfig {
    /// Check invariants the engine relies on
    pub fn validate(&self) -> crate::Result<()> {
        if self.cache.shard_count == 0 {
            return Err(crate::Error::Configuration(
                "cache.shard_count must be at least 1".into(),
            ));
        }
        if self.sql.connections == 0 {
            return Err(crate::Error::Configuration(
                "sql.connections must be at least 1".into(),
            ));
        }
        if self.binlog.prefix.is_empty() || self.binlog.prefix.contains('/') {
            return Err(crate::Error::Configuration(format!(
                "invalid binlog prefix: {:?}",
                self.binlog.prefix
            )));
        }
        if self.binlog.flush_interval_ms == 0 || self.cache.evict_interval_ms == 0 {
            return Err(crate::Error::Configuration(
                "timer intervals must be positive".into(),
            ));
        }
        if self.binlog.snapshot_batch == 0 {
            return Err(crate::Error::Configuration(
                "binlog.snapshot_batch must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of independent shards
    pub shard_count: usize,
    /// Resident records per shard before eviction kicks in
    pub max_records_per_shard: usize,
    /// Eviction check period in milliseconds
    pub evict_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            shard_count: 16,
            max_records_per_shard: 10_000,
            evict_interval_ms: 1000,
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub const fn evict_interval(&self) -> Duration {
        Duration::from_millis(self.evict_interval_ms)
    }
}

/// Binlog configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BinlogConfig {
    /// Directory holding binlog files
    pub dir: PathBuf,
    /// File name prefix, files are named `{prefix}_{index}.bin`
    pub prefix: String,
    /// Maximum time an entry waits in the buffer
    pub flush_interval_ms: u64,
    /// Buffered entries that force a flush
    pub flush_count: usize,
    /// Entries in the current file that trigger a snapshot
    pub max_entry_count: u64,
    /// Bytes in the current file that trigger a snapshot
    pub max_file_size: u64,
    /// Records written per lock hold while snapshotting
    pub snapshot_batch: usize,
}

impl Default for BinlogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/lib/rowkeep/binlog"),
            prefix: "binlog".to_string(),
            flush_interval_ms: 10,
            flush_count: 200,
            max_entry_count: 100_000,
            max_file_size: 256 * 1024 * 1024, // 256 MB
            snapshot_batch: 128,
        }
    }
}

impl BinlogConfig {
    #[must_use]
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Path of the binlog file with the given index
    #[must_use]
    pub fn file_path(&self, index: u64) -> PathBuf {
        self.dir.join(format!("{}_{index}.bin", self.prefix))
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// SQL store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SqlConfig {
    /// SQLite database file
    pub path: PathBuf,
    /// Worker connections; commands are routed by key hash
    pub connections: usize,
    /// Commands drained from a worker queue per batch
    pub batch_size: usize,
    /// How long a connection waits on a locked database
    pub busy_timeout_ms: u64,
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/rowkeep/rowkeep.db"),
            connections: 4,
            batch_size: 256,
            busy_timeout_ms: 5000,
        }
    }
}

impl SqlConfig {
    #[must_use]
    pub const fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
