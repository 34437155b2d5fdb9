//! Durable log storage and catch-up replication for a Raft partition.
//!
//! The journal is a sequence of fixed-capacity segment files holding
//! checksummed, position-addressed records. A single task owns the write
//! path; readers and replication handlers share a read-only view of it.

pub mod cluster_config;
pub mod config;
pub mod error;
pub mod replication;
pub mod storage;
pub mod traits;

/// Journal position, starting at 1.
pub type Position = u64;
/// Raft term.
pub type Term = u64;
pub type MemberId = String;

pub use cluster_config::ClusterConfig;
pub use config::{JournalOptions, StorageConfig, StorageConfigBuilder, StorageLevel};
pub use error::{ConfigError, Error, ErrorHandler, ErrorSeverity, ReplicationError, StorageError};
pub use replication::{
    ReplicationAppender, ReplicationOptions, ReplicationRequest, ReplicationRequestHandler,
    ReplicationResponse,
};
pub use storage::{
    RaftStorage,
    compaction::LogCompactor,
    lock::StorageLock,
    log::{JournalReader, JournalRecord, JournalView, ManagedJournal, SegmentedJournal},
    meta::MetaStore,
    snapshot::{FileSnapshotStore, SnapshotMetadata},
};
pub use traits::{ReplicationClient, ReplicationResult, SnapshotStore, StorageResult};
