//! Persisted consensus metadata.
//!
//! Two small files per prefix:
//! - `{prefix}.meta`: term, vote and last flushed position, bincode encoded
//!   behind a crc32 checksum
//! - `{prefix}.conf`: the last cluster configuration as JSON
//!
//! Every mutation replaces the file through write, fsync and rename, so a
//! crash leaves either the old or the new content on disk.

use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use bincode::{Decode, Encode};
use tracing::{debug, info};

use crate::{
    MemberId, Position, Term, cluster_config::ClusterConfig, config::StorageLevel,
    error::StorageError, traits::StorageResult,
};

const META_FILE_EXT: &str = "meta";
const CONF_FILE_EXT: &str = "conf";

pub fn meta_file_name(prefix: &str) -> String {
    format!("{}.{}", prefix, META_FILE_EXT)
}

pub fn conf_file_name(prefix: &str) -> String {
    format!("{}.{}", prefix, CONF_FILE_EXT)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
struct MetaRecord {
    term: Term,
    voted_for: Option<MemberId>,
    last_flushed_position: Position,
}

pub struct MetaStore {
    storage_level: StorageLevel,
    meta_path: PathBuf,
    conf_path: PathBuf,
    meta: MetaRecord,
    configuration: Option<ClusterConfig>,
}

impl MetaStore {
    /// Open the meta store of `prefix` in `dir`, loading persisted state.
    /// With `StorageLevel::Memory` nothing is read or written.
    pub fn open(dir: &Path, prefix: &str, storage_level: StorageLevel) -> StorageResult<Self> {
        let mut store = Self {
            storage_level,
            meta_path: dir.join(meta_file_name(prefix)),
            conf_path: dir.join(conf_file_name(prefix)),
            meta: MetaRecord::default(),
            configuration: None,
        };

        if storage_level == StorageLevel::Disk {
            fs::create_dir_all(dir)?;
            store.meta = Self::load_meta(&store.meta_path)?;
            store.configuration = Self::load_configuration(&store.conf_path)?;
            info!(
                "Loaded meta store {:?}: term={}, voted_for={:?}, configuration position={:?}",
                store.meta_path,
                store.meta.term,
                store.meta.voted_for,
                store.configuration.as_ref().map(|c| c.position)
            );
        }

        Ok(store)
    }

    pub fn storage_level(&self) -> StorageLevel {
        self.storage_level
    }

    /// Current term, 0 if none was ever stored.
    pub fn term(&self) -> Term {
        self.meta.term
    }

    /// Store a new term. Terms never go backwards; moving to a higher term
    /// clears the vote.
    pub fn set_term(&mut self, term: Term) -> StorageResult<()> {
        if term < self.meta.term {
            return Err(StorageError::TermRegression {
                current: self.meta.term,
                requested: term,
            });
        }
        if term == self.meta.term {
            return Ok(());
        }

        let mut meta = self.meta.clone();
        meta.term = term;
        meta.voted_for = None;
        self.store_meta(meta)
    }

    pub fn voted_for(&self) -> Option<&MemberId> {
        self.meta.voted_for.as_ref()
    }

    /// Record the vote cast in the current term.
    pub fn set_voted_for(&mut self, voted_for: Option<MemberId>) -> StorageResult<()> {
        if self.meta.voted_for == voted_for {
            return Ok(());
        }
        let mut meta = self.meta.clone();
        meta.voted_for = voted_for;
        self.store_meta(meta)
    }

    /// Store term and vote with a single write.
    pub fn set_term_and_vote(&mut self, term: Term, voted_for: Option<MemberId>) -> StorageResult<()> {
        if term < self.meta.term {
            return Err(StorageError::TermRegression {
                current: self.meta.term,
                requested: term,
            });
        }
        let mut meta = self.meta.clone();
        meta.term = term;
        meta.voted_for = voted_for;
        self.store_meta(meta)
    }

    pub fn last_flushed_position(&self) -> Position {
        self.meta.last_flushed_position
    }

    pub fn set_last_flushed_position(&mut self, position: Position) -> StorageResult<()> {
        if self.meta.last_flushed_position == position {
            return Ok(());
        }
        let mut meta = self.meta.clone();
        meta.last_flushed_position = position;
        self.store_meta(meta)
    }

    pub fn configuration(&self) -> Option<&ClusterConfig> {
        self.configuration.as_ref()
    }

    pub fn set_configuration(&mut self, configuration: ClusterConfig) -> StorageResult<()> {
        if self.storage_level == StorageLevel::Disk {
            let json =
                serde_json::to_vec_pretty(&configuration).map_err(StorageError::serialization)?;
            write_atomic(&self.conf_path, &json)?;
        }
        debug!(
            "Stored configuration at position {} with {} voters",
            configuration.position,
            configuration.voters.len()
        );
        self.configuration = Some(configuration);
        Ok(())
    }

    fn store_meta(&mut self, meta: MetaRecord) -> StorageResult<()> {
        if self.storage_level == StorageLevel::Disk {
            write_atomic(&self.meta_path, &encode_meta(&meta)?)?;
        }
        debug!(
            "Stored meta: term={}, voted_for={:?}, last_flushed_position={}",
            meta.term, meta.voted_for, meta.last_flushed_position
        );
        self.meta = meta;
        Ok(())
    }

    fn load_meta(path: &Path) -> StorageResult<MetaRecord> {
        if !path.exists() {
            return Ok(MetaRecord::default());
        }
        decode_meta(&fs::read(path)?)
    }

    fn load_configuration(path: &Path) -> StorageResult<Option<ClusterConfig>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read(path)?;
        serde_json::from_slice(&content)
            .map(Some)
            .map_err(StorageError::serialization)
    }
}

// Meta file layout: | crc u32 | bincode(MetaRecord) |

fn encode_meta(meta: &MetaRecord) -> StorageResult<Vec<u8>> {
    let body = bincode::encode_to_vec(meta, bincode::config::standard())
        .map_err(StorageError::serialization)?;
    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

fn decode_meta(data: &[u8]) -> StorageResult<MetaRecord> {
    if data.len() < 4 {
        return Err(StorageError::Serialization(format!(
            "meta file truncated to {} bytes",
            data.len()
        )));
    }
    let (crc, body) = data.split_at(4);
    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(crc);
    if crc32fast::hash(body) != u32::from_le_bytes(crc_bytes) {
        return Err(StorageError::Serialization(
            "meta file checksum mismatch".to_string(),
        ));
    }
    let (meta, _) = bincode::decode_from_slice(body, bincode::config::standard())
        .map_err(StorageError::serialization)?;
    Ok(meta)
}

/// Replace `path` with `content`: write a sibling temp file, fsync, rename,
/// then fsync the directory.
pub(crate) fn write_atomic(path: &Path, content: &[u8]) -> StorageResult<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("meta");
    let tmp_path = path.with_file_name(format!("{}.tmp", file_name));

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)?;
    file.write_all(content)?;
    file.sync_all()?;
    fs::rename(&tmp_path, path)?;

    if let Some(dir) = path.parent() {
        File::open(dir)?.sync_all()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir, level: StorageLevel) -> MetaStore {
        MetaStore::open(dir.path(), "raft-1", level).unwrap()
    }

    #[test]
    fn test_defaults() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, StorageLevel::Disk);
        assert_eq!(store.term(), 0);
        assert_eq!(store.voted_for(), None);
        assert_eq!(store.last_flushed_position(), 0);
        assert!(store.configuration().is_none());
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = open(&dir, StorageLevel::Disk);
            store.set_term(3).unwrap();
            store.set_voted_for(Some("node-2".to_string())).unwrap();
            store.set_last_flushed_position(42).unwrap();
            store
                .set_configuration(ClusterConfig::simple(
                    ["node-1".to_string(), "node-2".to_string()],
                    7,
                    3,
                ))
                .unwrap();
        }

        let store = open(&dir, StorageLevel::Disk);
        assert_eq!(store.term(), 3);
        assert_eq!(store.voted_for().map(String::as_str), Some("node-2"));
        assert_eq!(store.last_flushed_position(), 42);
        let config = store.configuration().unwrap();
        assert_eq!(config.position, 7);
        assert!(config.is_voter("node-1"));
        assert!(!dir.path().join("raft-1.meta.tmp").exists());
    }

    #[test]
    fn test_term_never_goes_back() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir, StorageLevel::Disk);
        store.set_term_and_vote(5, Some("node-1".to_string())).unwrap();

        let err = store.set_term(4).unwrap_err();
        assert!(matches!(
            err,
            StorageError::TermRegression {
                current: 5,
                requested: 4
            }
        ));

        // Same term keeps the vote, a higher term clears it.
        store.set_term(5).unwrap();
        assert!(store.voted_for().is_some());
        store.set_term(6).unwrap();
        assert!(store.voted_for().is_none());
    }

    #[test]
    fn test_memory_level_writes_nothing() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = open(&dir, StorageLevel::Memory);
            store.set_term(9).unwrap();
            store.set_configuration(ClusterConfig::empty()).unwrap();
            assert_eq!(store.term(), 9);
        }
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
        assert_eq!(open(&dir, StorageLevel::Disk).term(), 0);
    }

    #[test]
    fn test_damaged_meta_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = open(&dir, StorageLevel::Disk);
            store.set_term(2).unwrap();
        }
        let path = dir.path().join("raft-1.meta");
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            MetaStore::open(dir.path(), "raft-1", StorageLevel::Disk),
            Err(StorageError::Serialization(_))
        ));
    }
}
