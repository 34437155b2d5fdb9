//! Storage of a single Raft partition.
//!
//! [`RaftStorage`] binds a validated [`StorageConfig`] to its directory and
//! hands out the partition's journal, meta store and snapshot store. It also
//! owns the directory lock and the free disk space check.
//!
//! # Directory Structure
//!
//! ```text
//! {directory}/
//! ├── .{prefix}.lock          # owner id of the directory
//! ├── {prefix}-{id}.log       # journal segments
//! ├── {prefix}.meta           # term, vote, last flushed position
//! ├── {prefix}.conf           # last cluster configuration
//! └── {prefix}-snapshots/     # FileSnapshotStore
//! ```

pub mod compaction;
pub mod lock;
pub mod log;
pub mod meta;
pub mod snapshot;

use std::{fs, path::PathBuf};

use tracing::{debug, info, warn};

use crate::{
    config::StorageConfig,
    traits::StorageResult,
};

use self::{
    lock::StorageLock,
    log::{JournalActorOptions, ManagedJournal, SegmentedJournal, list_segment_files},
    meta::{MetaStore, conf_file_name, meta_file_name},
    snapshot::{FileSnapshotStore, SnapshotStoreOptions},
};

pub struct RaftStorage {
    config: StorageConfig,
    lock: StorageLock,
}

impl RaftStorage {
    /// Bind `config` to its directory, creating the directory if needed.
    pub fn new(config: StorageConfig) -> StorageResult<Self> {
        fs::create_dir_all(config.directory())?;
        let lock = StorageLock::new(config.directory(), config.prefix());
        info!(
            "Storage {} initialized in {:?}",
            config.prefix(),
            config.directory()
        );
        Ok(Self { config, lock })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn snapshot_directory(&self) -> PathBuf {
        self.config
            .directory()
            .join(format!("{}-snapshots", self.config.prefix()))
    }

    /// Open the journal, recovering whatever is on disk.
    pub fn open_log(&self) -> StorageResult<SegmentedJournal> {
        SegmentedJournal::open(self.config.journal_options())
    }

    /// Open the journal and move it into its own task.
    /// Must be called from within a tokio runtime.
    pub fn open_managed_log(&self) -> StorageResult<ManagedJournal> {
        let journal = self.open_log()?;
        let options = JournalActorOptions {
            flush_interval: self.config.flush_interval(),
            ..Default::default()
        };
        let (journal, _) = ManagedJournal::start(journal, options);
        Ok(journal)
    }

    pub fn open_meta_store(&self) -> StorageResult<MetaStore> {
        MetaStore::open(
            self.config.directory(),
            self.config.prefix(),
            self.config.storage_level(),
        )
    }

    pub fn open_snapshot_store(&self) -> StorageResult<FileSnapshotStore> {
        FileSnapshotStore::open(SnapshotStoreOptions {
            retain_stale_snapshots: self.config.retain_stale_snapshots(),
            ..SnapshotStoreOptions::with_dir(self.snapshot_directory())
        })
    }

    /// Remove every segment file of this journal. Best effort: failures are
    /// logged and skipped.
    pub fn delete_log(&self) {
        let files = match list_segment_files(self.config.directory(), self.config.prefix()) {
            Ok(files) => files,
            Err(e) => {
                warn!("Failed to list segments of {}: {}", self.config.prefix(), e);
                return;
            }
        };
        for (_, path) in files {
            remove_file_best_effort(&path);
        }
        info!("Deleted log {}", self.config.prefix());
    }

    /// Remove the meta and configuration files. Best effort.
    pub fn delete_meta_store(&self) {
        let dir = self.config.directory();
        for name in [
            meta_file_name(self.config.prefix()),
            conf_file_name(self.config.prefix()),
        ] {
            remove_file_best_effort(&dir.join(format!("{}.tmp", name)));
            remove_file_best_effort(&dir.join(name));
        }
        info!("Deleted meta store {}", self.config.prefix());
    }

    /// Delete the configured snapshot store and the local snapshot
    /// directory. Best effort.
    pub async fn delete_snapshot_store(&self) {
        if let Some(store) = self.config.snapshot_store() {
            if let Err(e) = store.delete().await {
                warn!("Failed to delete snapshot store of {}: {}", self.config.prefix(), e);
            }
        }
        let dir = self.snapshot_directory();
        if dir.exists() {
            if let Err(e) = fs::remove_dir_all(&dir) {
                warn!("Failed to delete snapshot directory {:?}: {}", dir, e);
            }
        }
        info!("Deleted snapshot store {}", self.config.prefix());
    }

    /// Take the directory lock for `owner`. Re-entrant for the same owner.
    pub fn lock(&self, owner: &str) -> StorageResult<()> {
        self.lock.acquire(owner)
    }

    /// Release the directory lock, whoever holds it.
    pub fn unlock(&self) {
        self.lock.release()
    }

    pub fn available_disk_space(&self) -> StorageResult<u64> {
        Ok(fs2::available_space(self.config.directory())?)
    }

    /// Whether more than the configured threshold of disk space is free.
    /// Callers check this before appending; the journal itself does not.
    pub fn has_free_disk_space(&self) -> StorageResult<bool> {
        let available = self.available_disk_space()?;
        let threshold = self.config.free_disk_space_threshold();
        if available < threshold {
            warn!(
                "Free disk space in {:?} is {} bytes, below the threshold of {} bytes",
                self.config.directory(),
                available,
                threshold
            );
        }
        Ok(available >= threshold)
    }
}

fn remove_file_best_effort(path: &std::path::Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Deleted {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to delete {:?}: {}", path, e),
    }
}
