//! Snapshot storage.
//!
//! The journal never produces snapshots. This store is where the application
//! persists them, and it tells the compactor how far the journal may be
//! trimmed.
//!
//! # Features
//!
//! - Atomic snapshot writes using a pending directory and rename
//! - Checksum verification for data integrity
//! - Optional retention of superseded snapshots
//! - Change notification for the latest snapshot

mod store;


pub use store::{FileSnapshotStore, Snapshot, SnapshotMetadata, SnapshotStoreOptions};
