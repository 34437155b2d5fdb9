use std::path::PathBuf;

use thiserror::Error;

use crate::Position;

/// Top-level error type
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Replication error: {0}")]
    Replication(#[from] ReplicationError),
}

/// Invalid construction parameters. Raised by `StorageConfigBuilder::build`
/// before any I/O happens.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Storage prefix must not be empty")]
    EmptyPrefix,

    #[error("Storage prefix {0:?} must not contain path separators")]
    InvalidPrefix(String),

    #[error("Max segment size {size} must be greater than {min} bytes")]
    SegmentSizeTooSmall { size: u64, min: u64 },

    #[error("Max entry size must be greater than 0")]
    InvalidMaxEntrySize,

    #[error("Journal index density must be greater than 0")]
    InvalidIndexDensity,

    #[error("Flush interval must be greater than 0")]
    InvalidFlushInterval,
}

/// Storage related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage directory {path:?} is locked by {owner:?}")]
    Locked { path: PathBuf, owner: String },

    /// A segment failed structural validation during recovery or read.
    #[error("Corrupted segment {segment} at offset {offset}: {reason}")]
    Corrupted {
        segment: u64,
        offset: u64,
        reason: String,
    },

    #[error("Entry of {size} bytes exceeds max entry size of {max} bytes")]
    EntryTooLarge { size: usize, max: usize },

    #[error("Record of {size} bytes does not fit into an empty segment of {capacity} bytes")]
    SegmentOverflow { size: u64, capacity: u64 },

    #[error("Expected position {expected}, got {actual}")]
    InvalidPosition { expected: Position, actual: Position },

    #[error("Term {requested} is lower than the persisted term {current}")]
    TermRegression { current: u64, requested: u64 },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Snapshot {0} not found")]
    SnapshotNotFound(String),

    #[error("Snapshot {0} failed checksum verification")]
    SnapshotCorrupted(String),

    #[error("Journal is closed")]
    Closed,
}

impl StorageError {
    pub(crate) fn corrupted(segment: u64, offset: u64, reason: impl Into<String>) -> Self {
        StorageError::Corrupted {
            segment,
            offset,
            reason: reason.into(),
        }
    }

    pub(crate) fn serialization(err: impl std::fmt::Display) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Errors raised while applying or serving replicated entries
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// The leader no longer has the requested position; a snapshot
    /// transfer is the only way to catch up.
    #[error("Position {0:?} is not available on the leader, snapshot transfer required")]
    SnapshotRequired(Option<Position>),

    #[error("Replicated entry {actual} does not continue the local log at {expected}")]
    Inconsistent { expected: Position, actual: Position },

    #[error("Replicated entry at offset {offset} failed checksum validation")]
    InvalidChecksum { offset: usize },

    #[error("Malformed replication payload: {0}")]
    MalformedPayload(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Stop using the storage; requires operator action or a rebuild from snapshot.
    Fatal,
    /// The caller may react (compact, retry later, fall back to snapshot).
    Recoverable,
    /// Only worth a log line.
    Ignorable,
}

pub trait ErrorHandler {
    fn severity(&self) -> ErrorSeverity;
    fn context(&self) -> String;
}

impl ErrorHandler for ConfigError {
    fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::Fatal
    }

    fn context(&self) -> String {
        format!("Invalid storage configuration: {}", self)
    }
}

impl ErrorHandler for StorageError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            StorageError::Io(_) => ErrorSeverity::Recoverable,
            StorageError::Locked { .. } => ErrorSeverity::Fatal,
            StorageError::Corrupted { .. } => ErrorSeverity::Fatal,
            StorageError::EntryTooLarge { .. } => ErrorSeverity::Recoverable,
            StorageError::SegmentOverflow { .. } => ErrorSeverity::Recoverable,
            StorageError::InvalidPosition { .. } => ErrorSeverity::Fatal,
            StorageError::TermRegression { .. } => ErrorSeverity::Recoverable,
            StorageError::Serialization(_) => ErrorSeverity::Fatal,
            StorageError::SnapshotNotFound(_) => ErrorSeverity::Recoverable,
            StorageError::SnapshotCorrupted(_) => ErrorSeverity::Recoverable,
            StorageError::Closed => ErrorSeverity::Ignorable,
        }
    }

    fn context(&self) -> String {
        match self {
            StorageError::Io(e) => format!("IO error: {}", e),
            StorageError::Corrupted { segment, .. } => {
                format!("Segment {} is corrupted and must be rebuilt", segment)
            }
            other => other.to_string(),
        }
    }
}

impl ErrorHandler for ReplicationError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            ReplicationError::SnapshotRequired(_) => ErrorSeverity::Recoverable,
            ReplicationError::Inconsistent { .. } => ErrorSeverity::Fatal,
            ReplicationError::InvalidChecksum { .. } => ErrorSeverity::Recoverable,
            ReplicationError::MalformedPayload(_) => ErrorSeverity::Recoverable,
            ReplicationError::Transport(_) => ErrorSeverity::Recoverable,
            ReplicationError::Storage(e) => e.severity(),
        }
    }

    fn context(&self) -> String {
        match self {
            ReplicationError::Inconsistent { expected, actual } => format!(
                "Local log diverged from leader (expected {}, got {}); resync from snapshot",
                expected, actual
            ),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corruption_is_fatal() {
        let err = StorageError::corrupted(3, 128, "bad checksum");
        assert_eq!(err.severity(), ErrorSeverity::Fatal);
        assert!(err.to_string().contains("segment 3"));
    }

    #[test]
    fn test_replication_inconsistency_is_fatal_but_snapshot_required_is_not() {
        let inconsistent = ReplicationError::Inconsistent {
            expected: 5,
            actual: 7,
        };
        assert_eq!(inconsistent.severity(), ErrorSeverity::Fatal);

        let snapshot = ReplicationError::SnapshotRequired(Some(3));
        assert_eq!(snapshot.severity(), ErrorSeverity::Recoverable);
    }

    #[test]
    fn test_storage_error_converts_into_top_level_error() {
        let err: Error = StorageError::Closed.into();
        assert!(matches!(err, Error::Storage(StorageError::Closed)));
    }
}
