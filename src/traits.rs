use async_trait::async_trait;

use crate::error::{ReplicationError, StorageError};
use crate::replication::{ReplicationRequest, ReplicationResponse};
use crate::storage::snapshot::SnapshotMetadata;

pub type StorageResult<T> = Result<T, StorageError>;
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// The application-side snapshot store. The journal never creates snapshots;
/// it only asks for the latest one to decide how far it may compact.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Latest persisted snapshot, if any.
    async fn latest_snapshot(&self) -> StorageResult<Option<SnapshotMetadata>>;

    /// Remove every snapshot owned by this store.
    async fn delete(&self) -> StorageResult<()>;
}

/// Transport used by a lagging follower to pull entries from a peer.
#[async_trait]
pub trait ReplicationClient: Send + Sync {
    async fn replicate(&self, request: ReplicationRequest) -> ReplicationResult<ReplicationResponse>;
}
