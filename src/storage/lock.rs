//! Advisory directory lock.
//!
//! The lock is a file holding the owner id as text. It only guards against
//! two local processes opening the same partition directory: there is no
//! lease, the content is compared on every call, and nothing renews it.

use std::{
    fs::{self, OpenOptions},
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use tracing::{debug, warn};

use crate::{error::StorageError, traits::StorageResult};

pub fn lock_file_name(prefix: &str) -> String {
    format!(".{}.lock", prefix)
}

static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct StorageLock {
    path: PathBuf,
}

impl StorageLock {
    pub fn new(dir: &Path, prefix: &str) -> Self {
        Self {
            path: dir.join(lock_file_name(prefix)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the lock for `owner`. Succeeds when the lock file did not exist
    /// or already holds exactly `owner`; fails for any other owner.
    ///
    /// The owner is written to a staging file first and hard-linked into
    /// place, so the lock file never exists without its content.
    pub fn acquire(&self, owner: &str) -> StorageResult<()> {
        let staged = self.staging_path();
        let linked = stage(&staged, owner).and_then(|_| fs::hard_link(&staged, &self.path));
        if let Err(e) = fs::remove_file(&staged) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to remove staged lock {:?}: {}", staged, e);
            }
        }

        match linked {
            Ok(()) => {
                debug!("Acquired storage lock {:?} for {}", self.path, owner);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&self.path)?;
                if holder == owner {
                    return Ok(());
                }
                warn!(
                    "Storage lock {:?} is held by {:?}, rejecting {:?}",
                    self.path, holder, owner
                );
                Err(StorageError::Locked {
                    path: self.path.clone(),
                    owner: holder,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn staging_path(&self) -> PathBuf {
        let seq = STAGING_SEQ.fetch_add(1, Ordering::Relaxed);
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{}-{}.tmp", std::process::id(), seq));
        PathBuf::from(name)
    }

    /// Current holder, if any.
    pub fn owner(&self) -> Option<String> {
        fs::read_to_string(&self.path).ok()
    }

    /// Delete the lock file regardless of its owner. Failures are ignored.
    pub fn release(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Released storage lock {:?}", self.path),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove storage lock {:?}: {}", self.path, e),
        }
    }
}

fn stage(path: &Path, owner: &str) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    file.write_all(owner.as_bytes())?;
    file.sync_all()
}
