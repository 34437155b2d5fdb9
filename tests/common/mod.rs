//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::path::Path;

use raft_journal::{
    JournalOptions, StorageConfig,
    storage::log::{JournalActorOptions, ManagedJournal, SegmentedJournal},
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn storage_config(dir: &Path, max_segment_size: u64) -> StorageConfig {
    StorageConfig::builder()
        .with_prefix("raft")
        .with_directory(dir)
        .with_max_segment_size(max_segment_size)
        .with_max_entry_size(1024)
        .with_journal_index_density(4)
        .with_free_disk_space_threshold(0)
        .build()
        .unwrap()
}

pub fn journal_options(dir: &Path, max_segment_size: u64) -> JournalOptions {
    storage_config(dir, max_segment_size).journal_options()
}

pub fn open_journal(dir: &Path, max_segment_size: u64) -> SegmentedJournal {
    SegmentedJournal::open(journal_options(dir, max_segment_size)).unwrap()
}

pub fn start_journal(dir: &Path, max_segment_size: u64) -> ManagedJournal {
    let journal = open_journal(dir, max_segment_size);
    ManagedJournal::start(journal, JournalActorOptions::default()).0
}

/// Deterministic payload of `len` bytes for `position`.
pub fn payload(position: u64, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (position as usize * 31 + i * 7) as u8)
        .collect()
}

pub fn fill(journal: &mut SegmentedJournal, count: u64, len: usize) {
    for _ in 0..count {
        let position = journal.next_position();
        journal.append(1, &payload(position, len)).unwrap();
    }
}
