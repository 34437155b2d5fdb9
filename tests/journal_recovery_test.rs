mod common;

use std::fs::{self, OpenOptions};
use std::io::Write;

use raft_journal::StorageError;
use raft_journal::storage::log::{DESCRIPTOR_SIZE, RECORD_HEADER_SIZE, encode_record};
use tempfile::TempDir;

use common::{fill, init_tracing, journal_options, open_journal, payload};

#[test]
fn test_positions_increase_by_one() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut journal = open_journal(dir.path(), 512);

    let mut previous = journal.last_position();
    for len in [0usize, 1, 50, 300, 7, 120, 76, 0, 200] {
        let position = journal.append(1, &vec![9u8; len]).unwrap();
        assert_eq!(position, previous + 1);
        previous = position;
    }

    journal.reset(42).unwrap();
    assert_eq!(journal.append(2, b"restart").unwrap(), 42);
    assert_eq!(journal.append(2, b"restart").unwrap(), 43);
}

#[test]
fn test_ten_entries_fill_three_segments_and_survive_restart() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    // 76 payload bytes + 24 header bytes = 100 bytes per record,
    // four records per 512 byte segment.
    let payload_len = 100 - RECORD_HEADER_SIZE;
    {
        let mut journal = open_journal(dir.path(), 512);
        fill(&mut journal, 10, payload_len);

        let segments = journal.segments();
        assert_eq!(segments.len(), 3);
        for segment in &segments[..segments.len() - 1] {
            assert!(segment.sealed);
            assert!(segment.size <= 512);
            assert!(fs::metadata(&segment.path).unwrap().len() <= 512);
        }
        assert!(!segments[2].sealed);
        journal.close().unwrap();
    }

    let journal = open_journal(dir.path(), 512);
    assert_eq!(journal.segment_count(), 3);
    assert_eq!(journal.first_position(), 1);
    assert_eq!(journal.last_position(), 10);

    let records: Vec<_> = journal.open_reader().map(|r| r.unwrap()).collect();
    assert_eq!(records.len(), 10);
    for (i, record) in records.iter().enumerate() {
        let position = i as u64 + 1;
        assert_eq!(record.position, position);
        assert_eq!(record.payload, payload(position, payload_len));
    }
}

#[test]
fn test_rollover_yields_sealed_segments_within_bounds() {
    let dir = TempDir::new().unwrap();
    let mut journal = open_journal(dir.path(), 512);
    fill(&mut journal, 10, 100);

    let segments = journal.segments();
    assert!(segments.len() >= 2);
    let (active, sealed) = segments.split_last().unwrap();
    assert!(!active.sealed);
    for segment in sealed {
        assert!(segment.sealed);
        assert!(segment.size <= segment.max_size);
    }

    // Segments are contiguous.
    for pair in segments.windows(2) {
        assert_eq!(pair[0].last_position.unwrap() + 1, pair[1].first_position);
    }
}

#[test]
fn test_round_trip_with_varied_payloads() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut expected = Vec::new();
    {
        let mut journal = open_journal(dir.path(), 1024);
        for position in 1..=200u64 {
            let data = payload(position, (position as usize * 13) % 300);
            let term = 1 + position / 50;
            assert_eq!(journal.append(term, &data).unwrap(), position);
            expected.push((position, term, data));
        }
    }

    let journal = open_journal(dir.path(), 1024);
    let actual: Vec<_> = journal
        .open_reader()
        .map(|r| {
            let r = r.unwrap();
            (r.position, r.term, r.payload)
        })
        .collect();
    assert_eq!(actual, expected);

    // Random access lands on the right entry, indexed or not.
    for position in [1, 3, 4, 5, 99, 100, 101, 200] {
        let record = journal.read_from(position).next().unwrap().unwrap();
        assert_eq!(record.position, position);
        assert_eq!(record.payload, expected[position as usize - 1].2);
    }
}

#[test]
fn test_torn_tail_is_truncated_on_recovery() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let last_path = {
        let mut journal = open_journal(dir.path(), 512);
        fill(&mut journal, 7, 60);
        journal.segments().last().unwrap().path.clone()
    };

    // Half a record, as if the process died mid-write.
    let frame = encode_record(8, 1, &payload(8, 60));
    let mut file = OpenOptions::new().append(true).open(&last_path).unwrap();
    file.write_all(&frame[..frame.len() / 2]).unwrap();
    drop(file);

    let mut journal = open_journal(dir.path(), 512);
    assert_eq!(journal.last_position(), 7);
    assert_eq!(journal.append(1, &payload(8, 60)).unwrap(), 8);

    let positions: Vec<_> = journal.open_reader().map(|r| r.unwrap().position).collect();
    assert_eq!(positions, (1..=8).collect::<Vec<_>>());
}

#[test]
fn test_damaged_last_record_is_dropped() {
    let dir = TempDir::new().unwrap();
    let last_path = {
        let mut journal = open_journal(dir.path(), 4096);
        fill(&mut journal, 5, 40);
        journal.segments().last().unwrap().path.clone()
    };

    let mut bytes = fs::read(&last_path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    fs::write(&last_path, bytes).unwrap();

    let journal = open_journal(dir.path(), 4096);
    assert_eq!(journal.last_position(), 4);
}

#[test]
fn test_corrupt_non_last_segment_is_fatal() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let first_path = {
        let mut journal = open_journal(dir.path(), 512);
        fill(&mut journal, 10, 76);
        assert!(journal.segment_count() >= 2);
        journal.segments()[0].path.clone()
    };

    let mut bytes = fs::read(&first_path).unwrap();
    bytes[DESCRIPTOR_SIZE + RECORD_HEADER_SIZE + 3] ^= 0xff;
    fs::write(&first_path, bytes).unwrap();

    let result = raft_journal::SegmentedJournal::open(journal_options(dir.path(), 512));
    assert!(matches!(
        result,
        Err(StorageError::Corrupted { segment: 1, .. })
    ));
}

#[test]
fn test_missing_segment_breaks_continuity() {
    let dir = TempDir::new().unwrap();
    let middle_path = {
        let mut journal = open_journal(dir.path(), 512);
        fill(&mut journal, 10, 76);
        assert_eq!(journal.segment_count(), 3);
        journal.segments()[1].path.clone()
    };
    fs::remove_file(middle_path).unwrap();

    let result = raft_journal::SegmentedJournal::open(journal_options(dir.path(), 512));
    assert!(matches!(result, Err(StorageError::Corrupted { .. })));
}

#[test]
fn test_half_created_last_segment_is_discarded() {
    let dir = TempDir::new().unwrap();
    {
        let mut journal = open_journal(dir.path(), 512);
        fill(&mut journal, 6, 76);
        assert_eq!(journal.segment_count(), 2);
    }
    // Crash while creating segment 3: the descriptor never made it to disk.
    fs::write(dir.path().join("raft-3.log"), [0u8; 10]).unwrap();

    let mut journal = open_journal(dir.path(), 512);
    assert_eq!(journal.segment_count(), 2);
    assert_eq!(journal.last_position(), 6);
    assert!(!dir.path().join("raft-3.log").exists());
    fill(&mut journal, 4, 76);
    assert_eq!(journal.last_position(), 10);
}

#[test]
fn test_zeroed_descriptor_of_last_segment_is_discarded() {
    let dir = TempDir::new().unwrap();
    {
        let mut journal = open_journal(dir.path(), 512);
        fill(&mut journal, 6, 76);
    }
    fs::write(dir.path().join("raft-3.log"), [0u8; DESCRIPTOR_SIZE]).unwrap();

    let journal = open_journal(dir.path(), 512);
    assert_eq!(journal.segment_count(), 2);
    assert_eq!(journal.last_position(), 6);
    assert!(!dir.path().join("raft-3.log").exists());
}

#[test]
fn test_damaged_descriptor_of_last_segment_is_fatal() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = {
        let mut journal = open_journal(dir.path(), 4096);
        fill(&mut journal, 3, 40);
        assert_eq!(journal.last_flushed_position(), 3);
        journal.segments()[0].path.clone()
    };

    // One bit of the creation timestamp.
    let mut bytes = fs::read(&path).unwrap();
    bytes[33] ^= 0x01;
    fs::write(&path, &bytes).unwrap();

    let result = raft_journal::SegmentedJournal::open(journal_options(dir.path(), 4096));
    assert!(matches!(
        result,
        Err(StorageError::Corrupted { segment: 1, .. })
    ));
    // The acknowledged entries are still on disk, untouched.
    assert_eq!(fs::read(&path).unwrap(), bytes);
}

#[test]
fn test_truncate_and_compact_survive_restart() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    {
        let mut journal = open_journal(dir.path(), 512);
        fill(&mut journal, 20, 76);
        journal.truncate_after(14).unwrap();
        let removed = journal.compact(9).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(journal.first_position(), 9);
    }

    let mut journal = open_journal(dir.path(), 512);
    assert_eq!(journal.first_position(), 9);
    assert_eq!(journal.last_position(), 14);
    assert_eq!(journal.append(3, b"next").unwrap(), 15);

    let positions: Vec<_> = journal.open_reader().map(|r| r.unwrap().position).collect();
    assert_eq!(positions, (9..=15).collect::<Vec<_>>());
}

#[test]
fn test_reader_is_bounded_at_creation() {
    let dir = TempDir::new().unwrap();
    let mut journal = open_journal(dir.path(), 512);
    fill(&mut journal, 5, 76);

    let mut reader = journal.open_reader();
    fill(&mut journal, 10, 76);

    let positions: Vec<_> = reader.by_ref().map(|r| r.unwrap().position).collect();
    assert_eq!(positions, vec![1, 2, 3, 4, 5]);

    // Rewinding restarts from the first entry and takes a fresh bound.
    reader.rewind();
    assert_eq!(reader.upper_bound(), 15);
    assert_eq!(reader.count(), 15);

    // A reader opened later sees across the rollover.
    assert_eq!(journal.read_from(3).count(), 13);
}
