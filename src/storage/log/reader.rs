use std::sync::Arc;

use parking_lot::RwLock;

use crate::{Position, error::StorageError, traits::StorageResult};

use super::{
    descriptor::DESCRIPTOR_SIZE,
    entry::{JournalRecord, RecordHeader, decode_record},
    journal::JournalState,
    segment::LogSegment,
};

/// Forward reader over the journal.
///
/// A reader is bounded by the last durable position at the time it was
/// positioned, so iteration always terminates and never exposes an entry
/// that could vanish in a crash. It holds its current segment
/// by `Arc` and follows rollover by looking up the next segment id, never
/// blocking the writer. Call [`JournalReader::rewind`] or
/// [`JournalReader::seek`] to iterate again.
pub struct JournalReader {
    state: Arc<RwLock<JournalState>>,
    segment: Option<Arc<LogSegment>>,
    offset: u64,
    start: Position,
    next_position: Position,
    upper_bound: Position,
}

impl JournalReader {
    pub(crate) fn new(state: Arc<RwLock<JournalState>>, position: Position) -> Self {
        let mut reader = Self {
            state,
            segment: None,
            offset: DESCRIPTOR_SIZE as u64,
            start: position,
            next_position: position,
            upper_bound: 0,
        };
        reader.seek(position);
        reader
    }

    /// Position the reader at `position`. Positions below the first entry
    /// start at the first entry.
    pub fn seek(&mut self, position: Position) {
        let state = self.state.read();
        let position = position.max(state.first_position());
        self.start = position;
        self.next_position = position;
        self.upper_bound = state.durable_position();

        match state.locate(position) {
            Some((segment, offset)) => {
                self.segment = Some(segment);
                self.offset = offset;
            }
            None => {
                self.segment = None;
                self.offset = DESCRIPTOR_SIZE as u64;
            }
        }
    }

    /// Seek back to where this reader was last positioned.
    pub fn rewind(&mut self) {
        self.seek(self.start);
    }

    /// Never return entries beyond `position`.
    pub fn limit_to(&mut self, position: Position) {
        self.upper_bound = self.upper_bound.min(position);
    }

    /// Position of the entry the next call returns.
    pub fn next_position(&self) -> Position {
        self.next_position
    }

    /// Last position this reader will return.
    pub fn upper_bound(&self) -> Position {
        self.upper_bound
    }

    pub fn has_next(&self) -> bool {
        self.segment.is_some() && self.next_position <= self.upper_bound
    }

    /// The next record in its on-disk framing, checksum verified.
    pub fn next_frame(&mut self) -> StorageResult<Option<Vec<u8>>> {
        loop {
            if self.next_position > self.upper_bound {
                return Ok(None);
            }
            let Some(segment) = self.segment.clone() else {
                return Ok(None);
            };

            let Some(frame) = segment.read_frame_at(self.offset)? else {
                match self.state.read().segment_after(segment.id()) {
                    Some(next) => {
                        self.segment = Some(next);
                        self.offset = DESCRIPTOR_SIZE as u64;
                        continue;
                    }
                    None => return Ok(None),
                }
            };

            let header = RecordHeader::decode(&frame).map_err(|e| {
                StorageError::corrupted(segment.id(), self.offset, e.to_string())
            })?;
            self.offset += frame.len() as u64;

            if header.position < self.next_position {
                // Scanning forward from a sparse index point.
                continue;
            }
            if header.position != self.next_position {
                return Err(StorageError::corrupted(
                    segment.id(),
                    self.offset - frame.len() as u64,
                    format!(
                        "expected position {}, found {}",
                        self.next_position, header.position
                    ),
                ));
            }

            self.next_position += 1;
            return Ok(Some(frame));
        }
    }

    fn stop(&mut self) {
        self.segment = None;
    }
}

impl Iterator for JournalReader {
    type Item = StorageResult<JournalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_frame() {
            Ok(Some(frame)) => match decode_record(&frame) {
                Ok(record) => Some(Ok(record)),
                Err(e) => {
                    self.stop();
                    Some(Err(StorageError::corrupted(0, 0, e.to_string())))
                }
            },
            Ok(None) => None,
            Err(e) => {
                self.stop();
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::JournalOptions;
    use crate::storage::log::SegmentedJournal;
    use tempfile::TempDir;

    fn create_test_journal(entries: u64) -> (SegmentedJournal, TempDir) {
        create_journal(entries, true)
    }

    fn create_journal(entries: u64, flush_explicitly: bool) -> (SegmentedJournal, TempDir) {
        let dir = TempDir::new().unwrap();
        let options = JournalOptions {
            name: "reader".to_string(),
            dir: dir.path().to_path_buf(),
            max_segment_size: 512,
            max_entry_size: 256,
            index_density: 5,
            flush_explicitly,
        };
        let mut journal = SegmentedJournal::open(options).unwrap();
        for i in 1..=entries {
            journal.append(1, format!("entry-{}", i).as_bytes()).unwrap();
        }
        (journal, dir)
    }

    #[test]
    fn test_read_from_middle_across_segments() {
        let (journal, _dir) = create_test_journal(40);
        assert!(journal.segment_count() > 1);

        let positions: Vec<_> = journal.read_from(17).map(|r| r.unwrap().position).collect();
        assert_eq!(positions, (17..=40).collect::<Vec<_>>());
    }

    #[test]
    fn test_reader_is_bounded_at_seek_time() {
        let (mut journal, _dir) = create_test_journal(5);
        let mut reader = journal.open_reader();
        journal.append(1, b"late").unwrap();

        assert_eq!(reader.by_ref().count(), 5);
        assert!(reader.next().is_none());

        reader.rewind();
        assert_eq!(reader.count(), 6);
    }

    #[test]
    fn test_reader_stops_at_flushed_position() {
        let (mut journal, _dir) = create_journal(3, false);
        assert_eq!(journal.last_flushed_position(), 0);

        let mut reader = journal.read_from(1);
        assert_eq!(reader.upper_bound(), 0);
        assert!(reader.next().is_none());

        journal.flush().unwrap();
        reader.rewind();
        assert_eq!(reader.upper_bound(), 3);
        assert_eq!(reader.count(), 3);

        // Rollover seals, and sealing makes the older segment durable.
        for _ in 0..30 {
            journal.append(1, b"more entries to force a rollover").unwrap();
        }
        assert!(journal.segment_count() > 1);
        let durable = journal.last_flushed_position();
        assert!(durable > 3 && durable < journal.last_position());
        assert_eq!(journal.open_reader().count() as u64, durable);
    }

    #[test]
    fn test_seek_after_rollover() {
        let (mut journal, _dir) = create_test_journal(3);
        let mut reader = journal.open_reader();
        assert_eq!(reader.next().unwrap().unwrap().position, 1);

        for _ in 0..30 {
            journal.append(1, b"more entries to force a rollover").unwrap();
        }
        reader.seek(2);
        let positions: Vec<_> = reader.map(|r| r.unwrap().position).collect();
        assert_eq!(positions.first(), Some(&2));
        assert_eq!(positions.last(), Some(&33));
    }

    #[test]
    fn test_limit_and_out_of_range() {
        let (journal, _dir) = create_test_journal(10);

        let mut reader = journal.read_from(3);
        reader.limit_to(6);
        assert_eq!(reader.upper_bound(), 6);
        assert_eq!(reader.count(), 4);

        assert_eq!(journal.read_from(11).count(), 0);
        // Below the first position the reader starts at the first entry.
        assert_eq!(journal.read_from(0).next().unwrap().unwrap().position, 1);
    }

    #[test]
    fn test_next_frame_returns_raw_records() {
        let (journal, _dir) = create_test_journal(2);
        let mut reader = journal.open_reader();
        let frame = reader.next_frame().unwrap().unwrap();
        let record = crate::storage::log::entry::decode_record(&frame).unwrap();
        assert_eq!(record.payload, b"entry-1");
        assert_eq!(reader.next_position(), 2);
    }
}
