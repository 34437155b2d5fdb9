//! File-based snapshot store.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::StorageError;
use crate::traits::{SnapshotStore, StorageResult};
use crate::{Position, Term};

const META_FILE: &str = "meta.json";
const DATA_FILE: &str = "data.bin";
const CHECKSUM_FILE: &str = "checksum.sha256";
const PENDING_EXT: &str = "tmp";

/// Snapshot metadata, stored as `meta.json` next to the data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub id: String,
    /// Last journal position covered by the snapshot.
    pub processed_position: Position,
    pub term: Term,
    /// SHA256 checksum of the data file.
    pub checksum: String,
    /// Size of the data file in bytes.
    pub size: u64,
    /// Creation time in ms since epoch.
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    pub data: Vec<u8>,
}

/// Snapshot store configuration options.
#[derive(Debug, Clone)]
pub struct SnapshotStoreOptions {
    /// Directory holding one sub-directory per snapshot.
    pub dir: PathBuf,
    /// Keep snapshots superseded by a newer one.
    pub retain_stale_snapshots: bool,
    /// Whether to verify checksums when loading snapshots.
    pub verify_checksum: bool,
    /// Whether to sync data to disk after writes.
    pub sync_on_write: bool,
}

impl Default for SnapshotStoreOptions {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/snapshots"),
            retain_stale_snapshots: false,
            verify_checksum: true,
            sync_on_write: true,
        }
    }
}

impl SnapshotStoreOptions {
    /// Create options with a custom directory.
    pub fn with_dir<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }
}

/// Snapshot store keeping every snapshot in its own directory:
///
/// ```text
/// {dir}/
/// ├── {position}-{term}/
/// │   ├── meta.json
/// │   ├── data.bin
/// │   └── checksum.sha256
/// └── {position}-{term}.tmp/   # pending, removed on open
/// ```
///
/// A snapshot is written to a pending directory and renamed into place, so a
/// crash never leaves a half-written snapshot visible. Subscribers are told
/// about every snapshot that becomes the latest.
#[derive(Clone)]
pub struct FileSnapshotStore {
    options: SnapshotStoreOptions,
    latest: Arc<watch::Sender<Option<SnapshotMetadata>>>,
}

impl FileSnapshotStore {
    pub fn open(options: SnapshotStoreOptions) -> StorageResult<Self> {
        fs::create_dir_all(&options.dir)?;

        let purged = Self::purge_pending(&options.dir)?;
        if purged > 0 {
            warn!(
                "Removed {} pending snapshots left behind in {:?}",
                purged, options.dir
            );
        }

        let latest = Self::scan(&options.dir)?.pop();
        info!(
            "FileSnapshotStore opened in {:?}, latest snapshot: {:?}",
            options.dir,
            latest.as_ref().map(|m| &m.id)
        );

        let (tx, _) = watch::channel(latest);
        Ok(Self {
            options,
            latest: Arc::new(tx),
        })
    }

    pub fn snapshot_id(processed_position: Position, term: Term) -> String {
        format!("{}-{}", processed_position, term)
    }

    pub fn options(&self) -> &SnapshotStoreOptions {
        &self.options
    }

    /// Latest persisted snapshot.
    pub fn latest(&self) -> Option<SnapshotMetadata> {
        self.latest.borrow().clone()
    }

    /// Receiver notified whenever a newer snapshot is persisted.
    pub fn subscribe(&self) -> watch::Receiver<Option<SnapshotMetadata>> {
        self.latest.subscribe()
    }

    /// Calculate SHA256 checksum of data.
    pub(crate) fn calculate_checksum(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        format!("{:x}", hasher.finalize())
    }

    fn snapshot_dir(&self, id: &str) -> PathBuf {
        self.options.dir.join(id)
    }

    /// All complete snapshots, oldest first.
    pub fn list(&self) -> StorageResult<Vec<SnapshotMetadata>> {
        Self::scan(&self.options.dir)
    }

    fn scan(dir: &Path) -> StorageResult<Vec<SnapshotMetadata>> {
        let mut snapshots = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_dir() || path.extension().is_some_and(|ext| ext == PENDING_EXT) {
                continue;
            }
            match Self::read_meta(&path) {
                Ok(meta) => snapshots.push(meta),
                Err(e) => warn!("Ignoring unreadable snapshot {:?}: {}", path, e),
            }
        }
        snapshots.sort_by_key(|m| (m.processed_position, m.term));
        Ok(snapshots)
    }

    fn read_meta(snapshot_dir: &Path) -> StorageResult<SnapshotMetadata> {
        let content = fs::read_to_string(snapshot_dir.join(META_FILE))?;
        serde_json::from_str(&content).map_err(StorageError::serialization)
    }

    fn purge_pending(dir: &Path) -> StorageResult<usize> {
        let mut purged = 0;
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() && path.extension().is_some_and(|ext| ext == PENDING_EXT) {
                fs::remove_dir_all(&path)?;
                purged += 1;
            }
        }
        Ok(purged)
    }

    fn write_file(&self, path: &Path, content: &[u8]) -> StorageResult<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(content)?;
        if self.options.sync_on_write {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Write a snapshot atomically and publish it when it is the newest.
    fn persist_blocking(
        &self,
        processed_position: Position,
        term: Term,
        data: &[u8],
    ) -> StorageResult<SnapshotMetadata> {
        let id = Self::snapshot_id(processed_position, term);
        let final_dir = self.snapshot_dir(&id);
        if final_dir.exists() {
            debug!("Snapshot {} already exists", id);
            return Self::read_meta(&final_dir);
        }

        let checksum = Self::calculate_checksum(data);
        let meta = SnapshotMetadata {
            id: id.clone(),
            processed_position,
            term,
            checksum: checksum.clone(),
            size: data.len() as u64,
            created_at: crate::cluster_config::now_millis(),
        };
        let meta_json = serde_json::to_string_pretty(&meta).map_err(StorageError::serialization)?;

        let pending_dir = self.options.dir.join(format!("{}.{}", id, PENDING_EXT));
        if pending_dir.exists() {
            fs::remove_dir_all(&pending_dir)?;
        }
        fs::create_dir_all(&pending_dir)?;

        self.write_file(&pending_dir.join(DATA_FILE), data)?;
        self.write_file(&pending_dir.join(META_FILE), meta_json.as_bytes())?;
        self.write_file(&pending_dir.join(CHECKSUM_FILE), checksum.as_bytes())?;

        fs::rename(&pending_dir, &final_dir).map_err(|e| {
            let _ = fs::remove_dir_all(&pending_dir);
            e
        })?;
        if self.options.sync_on_write {
            File::open(&self.options.dir)?.sync_all()?;
        }

        info!(
            "Snapshot persisted: id={}, processed_position={}, size={}",
            id,
            processed_position,
            data.len()
        );

        let is_newer = self
            .latest()
            .is_none_or(|latest| (processed_position, term) > (latest.processed_position, latest.term));
        if is_newer {
            self.latest.send_replace(Some(meta.clone()));
            if !self.options.retain_stale_snapshots {
                self.purge_stale()?;
            }
        }

        Ok(meta)
    }

    /// Persist `data` as the snapshot covering the journal up to
    /// `processed_position`.
    pub async fn persist(
        &self,
        processed_position: Position,
        term: Term,
        data: Vec<u8>,
    ) -> StorageResult<SnapshotMetadata> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.persist_blocking(processed_position, term, &data))
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))?
    }

    fn load_blocking(&self, id: &str) -> StorageResult<Snapshot> {
        let dir = self.snapshot_dir(id);
        if !dir.join(META_FILE).exists() || !dir.join(DATA_FILE).exists() {
            return Err(StorageError::SnapshotNotFound(id.to_string()));
        }

        let metadata = Self::read_meta(&dir)?;
        let mut data = Vec::with_capacity(metadata.size as usize);
        File::open(dir.join(DATA_FILE))?.read_to_end(&mut data)?;

        if self.options.verify_checksum && Self::calculate_checksum(&data) != metadata.checksum {
            error!("Snapshot checksum verification failed for {}", id);
            return Err(StorageError::SnapshotCorrupted(id.to_string()));
        }

        debug!(
            "Snapshot loaded: id={}, processed_position={}",
            id, metadata.processed_position
        );
        Ok(Snapshot { metadata, data })
    }

    pub async fn load(&self, id: &str) -> StorageResult<Snapshot> {
        let store = self.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || store.load_blocking(&id))
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))?
    }

    /// Remove every snapshot older than the latest. Returns how many were
    /// removed.
    pub fn purge_stale(&self) -> StorageResult<usize> {
        let Some(latest) = self.latest() else {
            return Ok(0);
        };

        let mut removed = 0;
        for meta in self.list()? {
            if meta.id == latest.id {
                continue;
            }
            if let Err(e) = fs::remove_dir_all(self.snapshot_dir(&meta.id)) {
                warn!("Failed to delete stale snapshot {}: {}", meta.id, e);
                continue;
            }
            debug!("Deleted stale snapshot {}", meta.id);
            removed += 1;
        }
        Ok(removed)
    }

    fn delete_blocking(&self) -> StorageResult<()> {
        if self.options.dir.exists() {
            fs::remove_dir_all(&self.options.dir)?;
        }
        self.latest.send_replace(None);
        info!("Snapshot store {:?} deleted", self.options.dir);
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn latest_snapshot(&self) -> StorageResult<Option<SnapshotMetadata>> {
        Ok(self.latest())
    }

    async fn delete(&self) -> StorageResult<()> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.delete_blocking())
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))?
    }
}
