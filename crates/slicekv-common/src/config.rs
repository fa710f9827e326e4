//! Store configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::types::MAX_FILES;

/// Cache and IO budget for a whole store.
///
/// Callers size this for the store as one unit; the open path divides
/// it into per-shard portions, so none of these fields describe a
/// single shard.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Total bytes of resident data across all shards.
    pub max_size: u64,
    /// Unflushed bytes at which writes are considered backlogged.
    pub max_dirty_size: u64,
    /// Unflushed bytes at which a shard snapshots itself to disk.
    pub flush_dirty_size: u64,
    /// Relative scheduling weight for reads.
    pub io_priority_reads: u32,
    /// Relative scheduling weight for writes.
    pub io_priority_writes: u32,
    /// Pending deletions at which a shard snapshots itself to disk.
    pub delete_queue_limit: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 256 * 1024 * 1024,
            max_dirty_size: 128 * 1024 * 1024,
            flush_dirty_size: 64 * 1024 * 1024,
            io_priority_reads: 64,
            io_priority_writes: 64,
            delete_queue_limit: 10_000,
        }
    }
}

/// Everything needed to format or open a store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backing data files. Order matters: shards stripe across these by
    /// position, so an open must list the same files in the same order
    /// as the create that formatted them.
    pub files: Vec<PathBuf>,
    pub cache: CacheConfig,
    /// How often operation counters are written back to the store.
    pub stat_persist_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            cache: CacheConfig::default(),
            stat_persist_interval_ms: 1000,
        }
    }
}

impl StoreConfig {
    pub fn with_files(files: Vec<PathBuf>) -> Self {
        Self {
            files,
            ..Self::default()
        }
    }

    /// Panics on structurally unusable configuration. A store cannot
    /// limp along with zero files, so this is not a recoverable error.
    pub fn validate(&self) {
        assert!(!self.files.is_empty(), "store requires at least one file");
        assert!(
            self.files.len() <= MAX_FILES,
            "store supports at most {} files, got {}",
            MAX_FILES,
            self.files.len(),
        );
    }

    pub fn stat_persist_interval(&self) -> Duration {
        Duration::from_millis(self.stat_persist_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_cache_config_is_flushable() {
        let cache = CacheConfig::default();
        assert!(cache.flush_dirty_size <= cache.max_dirty_size);
        assert!(cache.max_dirty_size <= cache.max_size);
        assert!(cache.delete_queue_limit > 0);
    }

    #[test]
    fn test_with_files_keeps_defaults() {
        let config = StoreConfig::with_files(vec![PathBuf::from("/tmp/a")]);
        assert_eq!(config.files.len(), 1);
        assert_eq!(config.cache, CacheConfig::default());
        assert_eq!(config.stat_persist_interval(), Duration::from_millis(1000));
        config.validate();
    }

    #[test]
    #[should_panic(expected = "at least one file")]
    fn test_validate_rejects_empty_file_list() {
        StoreConfig::default().validate();
    }

    #[test]
    #[should_panic(expected = "at most")]
    fn test_validate_rejects_too_many_files() {
        let files = (0..=MAX_FILES)
            .map(|i| PathBuf::from(format!("/tmp/f{i}")))
            .collect();
        StoreConfig::with_files(files).validate();
    }
}
