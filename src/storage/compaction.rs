//! Snapshot-driven log compaction.
//!
//! The journal never decides on its own what it may forget. Once a snapshot
//! covers position `P`, every segment lying entirely below `P` is redundant
//! and the compactor asks the journal task to drop it. Compaction always
//! goes to the latest snapshot, whether or not stale snapshots are retained.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    Position,
    error::StorageError,
    storage::{log::ManagedJournal, snapshot::SnapshotMetadata},
    traits::{SnapshotStore, StorageResult},
};

pub struct LogCompactor {
    journal: ManagedJournal,
    snapshot_store: Arc<dyn SnapshotStore>,
    compacted_up_to: Position,
}

impl LogCompactor {
    pub fn new(journal: ManagedJournal, snapshot_store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            journal,
            snapshot_store,
            compacted_up_to: 0,
        }
    }

    /// Highest snapshot boundary compacted to so far.
    pub fn compacted_up_to(&self) -> Position {
        self.compacted_up_to
    }

    /// A snapshot now covers `position`: drop the segments below it.
    /// Returns the number of deleted segments.
    pub async fn on_snapshot_persisted(&mut self, position: Position) -> StorageResult<usize> {
        if position <= self.compacted_up_to {
            debug!(
                "Snapshot at {} is not beyond the last compaction at {}",
                position, self.compacted_up_to
            );
            return Ok(0);
        }

        let removed = self.journal.compact(position).await?;
        self.compacted_up_to = position;
        Ok(removed)
    }

    /// Compact up to the latest snapshot known to the snapshot store.
    pub async fn compact_to_latest(&mut self) -> StorageResult<usize> {
        match self.snapshot_store.latest_snapshot().await? {
            Some(snapshot) => self.on_snapshot_persisted(snapshot.processed_position).await,
            None => Ok(0),
        }
    }

    /// Compact every time `snapshots` publishes a new snapshot. Returns when
    /// the sender is dropped or the journal is closed.
    pub async fn run(mut self, mut snapshots: watch::Receiver<Option<SnapshotMetadata>>) {
        loop {
            let latest = snapshots.borrow_and_update().clone();
            if let Some(snapshot) = latest {
                match self.on_snapshot_persisted(snapshot.processed_position).await {
                    Ok(0) => {}
                    Ok(removed) => info!(
                        "Compacted {} segments after snapshot {}",
                        removed, snapshot.id
                    ),
                    Err(StorageError::Closed) => break,
                    Err(e) => warn!(
                        "Failed to compact journal after snapshot {}: {}",
                        snapshot.id, e
                    ),
                }
            }

            if snapshots.changed().await.is_err() {
                break;
            }
        }
        debug!("Log compactor stopped at position {}", self.compacted_up_to);
    }
}
