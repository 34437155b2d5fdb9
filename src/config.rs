//! Storage configuration for a single partition.
//!
//! A [`StorageConfig`] is built once per partition through
//! [`StorageConfig::builder`], validated up front and immutable afterwards.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::ConfigError;
use crate::storage::log::{DESCRIPTOR_SIZE, RECORD_HEADER_SIZE};
use crate::traits::SnapshotStore;

/// Default maximum segment size (64MB)
pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// Default maximum entry payload size (4MB)
pub const DEFAULT_MAX_ENTRY_SIZE: usize = 4 * 1024 * 1024;

/// Default free disk space to keep before refusing appends (100MB)
pub const DEFAULT_FREE_DISK_SPACE_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Default number of entries between two sparse index points
pub const DEFAULT_JOURNAL_INDEX_DENSITY: u64 = 100;

/// Smallest accepted segment: a descriptor plus one empty record.
pub const MIN_SEGMENT_SIZE: u64 = (DESCRIPTOR_SIZE + RECORD_HEADER_SIZE) as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageLevel {
    /// Meta state is written to disk on every change.
    #[default]
    Disk,
    /// Meta state lives in memory only; used by ephemeral and test nodes.
    Memory,
}

#[derive(Clone)]
pub struct StorageConfig {
    prefix: String,
    storage_level: StorageLevel,
    directory: PathBuf,
    max_segment_size: u64,
    max_entry_size: usize,
    free_disk_space_threshold: u64,
    flush_explicitly: bool,
    flush_interval: Duration,
    retain_stale_snapshots: bool,
    journal_index_density: u64,
    snapshot_store: Option<Arc<dyn SnapshotStore>>,
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("prefix", &self.prefix)
            .field("storage_level", &self.storage_level)
            .field("directory", &self.directory)
            .field("max_segment_size", &self.max_segment_size)
            .field("max_entry_size", &self.max_entry_size)
            .field("free_disk_space_threshold", &self.free_disk_space_threshold)
            .field("flush_explicitly", &self.flush_explicitly)
            .field("flush_interval", &self.flush_interval)
            .field("retain_stale_snapshots", &self.retain_stale_snapshots)
            .field("journal_index_density", &self.journal_index_density)
            .field("snapshot_store", &self.snapshot_store.is_some())
            .finish()
    }
}

impl StorageConfig {
    pub fn builder() -> StorageConfigBuilder {
        StorageConfigBuilder::default()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn storage_level(&self) -> StorageLevel {
        self.storage_level
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn max_segment_size(&self) -> u64 {
        self.max_segment_size
    }

    pub fn max_entry_size(&self) -> usize {
        self.max_entry_size
    }

    pub fn free_disk_space_threshold(&self) -> u64 {
        self.free_disk_space_threshold
    }

    pub fn flush_explicitly(&self) -> bool {
        self.flush_explicitly
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    pub fn retain_stale_snapshots(&self) -> bool {
        self.retain_stale_snapshots
    }

    pub fn journal_index_density(&self) -> u64 {
        self.journal_index_density
    }

    pub fn snapshot_store(&self) -> Option<&Arc<dyn SnapshotStore>> {
        self.snapshot_store.as_ref()
    }

    /// Options for the segmented journal bound to this configuration.
    pub fn journal_options(&self) -> JournalOptions {
        JournalOptions {
            name: self.prefix.clone(),
            dir: self.directory.clone(),
            max_segment_size: self.max_segment_size,
            max_entry_size: self.max_entry_size,
            index_density: self.journal_index_density,
            flush_explicitly: self.flush_explicitly,
        }
    }
}

pub struct StorageConfigBuilder {
    prefix: String,
    storage_level: StorageLevel,
    directory: PathBuf,
    max_segment_size: u64,
    max_entry_size: usize,
    free_disk_space_threshold: u64,
    flush_explicitly: bool,
    flush_interval: Duration,
    retain_stale_snapshots: bool,
    journal_index_density: u64,
    snapshot_store: Option<Arc<dyn SnapshotStore>>,
}

impl Default for StorageConfigBuilder {
    fn default() -> Self {
        Self {
            prefix: "raft".to_string(),
            storage_level: StorageLevel::Disk,
            directory: PathBuf::from("./data"),
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            max_entry_size: DEFAULT_MAX_ENTRY_SIZE,
            free_disk_space_threshold: DEFAULT_FREE_DISK_SPACE_THRESHOLD,
            flush_explicitly: true,
            flush_interval: Duration::from_secs(1),
            retain_stale_snapshots: false,
            journal_index_density: DEFAULT_JOURNAL_INDEX_DENSITY,
            snapshot_store: None,
        }
    }
}

impl StorageConfigBuilder {
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_storage_level(mut self, level: StorageLevel) -> Self {
        self.storage_level = level;
        self
    }

    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = directory.into();
        self
    }

    pub fn with_max_segment_size(mut self, size: u64) -> Self {
        self.max_segment_size = size;
        self
    }

    pub fn with_max_entry_size(mut self, size: usize) -> Self {
        self.max_entry_size = size;
        self
    }

    pub fn with_free_disk_space_threshold(mut self, bytes: u64) -> Self {
        self.free_disk_space_threshold = bytes;
        self
    }

    pub fn with_flush_explicitly(mut self, flush_explicitly: bool) -> Self {
        self.flush_explicitly = flush_explicitly;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_retain_stale_snapshots(mut self, retain: bool) -> Self {
        self.retain_stale_snapshots = retain;
        self
    }

    pub fn with_journal_index_density(mut self, density: u64) -> Self {
        self.journal_index_density = density;
        self
    }

    pub fn with_snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshot_store = Some(store);
        self
    }

    /// Validate the parameters. Performs no I/O.
    pub fn build(self) -> Result<StorageConfig, ConfigError> {
        if self.prefix.is_empty() {
            return Err(ConfigError::EmptyPrefix);
        }
        if self.prefix.contains(['/', '\\']) {
            return Err(ConfigError::InvalidPrefix(self.prefix));
        }
        if self.max_segment_size <= MIN_SEGMENT_SIZE {
            return Err(ConfigError::SegmentSizeTooSmall {
                size: self.max_segment_size,
                min: MIN_SEGMENT_SIZE,
            });
        }
        if self.max_entry_size == 0 {
            return Err(ConfigError::InvalidMaxEntrySize);
        }
        if self.journal_index_density == 0 {
            return Err(ConfigError::InvalidIndexDensity);
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::InvalidFlushInterval);
        }

        Ok(StorageConfig {
            prefix: self.prefix,
            storage_level: self.storage_level,
            directory: self.directory,
            max_segment_size: self.max_segment_size,
            max_entry_size: self.max_entry_size,
            free_disk_space_threshold: self.free_disk_space_threshold,
            flush_explicitly: self.flush_explicitly,
            flush_interval: self.flush_interval,
            retain_stale_snapshots: self.retain_stale_snapshots,
            journal_index_density: self.journal_index_density,
            snapshot_store: self.snapshot_store,
        })
    }
}

/// Configuration options for the segmented journal
#[derive(Clone, Debug)]
pub struct JournalOptions {
    /// Journal name, used as the segment file name prefix
    pub name: String,
    /// Directory for storing segment files
    pub dir: PathBuf,
    /// Maximum segment size in bytes, descriptor included
    pub max_segment_size: u64,
    /// Maximum payload size of a single entry
    pub max_entry_size: usize,
    /// Every `index_density`-th position is recorded in the sparse index
    pub index_density: u64,
    /// Whether to fsync before acknowledging an append
    pub flush_explicitly: bool,
}

impl Default for JournalOptions {
    fn default() -> Self {
        Self {
            name: "raft".to_string(),
            dir: PathBuf::from("./data"),
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            max_entry_size: DEFAULT_MAX_ENTRY_SIZE,
            index_density: DEFAULT_JOURNAL_INDEX_DENSITY,
            flush_explicitly: true,
        }
    }
}

impl JournalOptions {
    /// Create options with a custom directory.
    pub fn with_dir<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }
}
