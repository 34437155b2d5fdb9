//! Segmented journal.
//!
//! The journal owns an ordered list of segments, the last of which is the
//! only writable one, plus a sparse index used to seek. Segment list and index
//! live behind a shared lock so readers on other threads can follow the log
//! while the owner appends:
//! - Rollover seals the active segment before a new one is created
//! - Recovery replays every segment and cuts a torn tail off the last one
//! - Compaction removes whole segments below a snapshot boundary

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::{
    Position, Term, config::JournalOptions, error::StorageError, traits::StorageResult,
};

use super::{
    descriptor::DESCRIPTOR_SIZE,
    entry::{RECORD_HEADER_SIZE, RecordError, decode_frame, encode_record},
    index::SparseIndex,
    reader::JournalReader,
    segment::{LogSegment, SegmentInfo},
};

/// Segment file extension
const SEGMENT_FILE_EXT: &str = ".log";

/// File name of segment `id` of the journal called `name`.
pub fn segment_file_name(name: &str, id: u64) -> String {
    format!("{}-{}{}", name, id, SEGMENT_FILE_EXT)
}

/// Segment id encoded in `file_name`, if it is a segment of journal `name`.
pub fn parse_segment_id(name: &str, file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix(name)?
        .strip_prefix('-')?
        .strip_suffix(SEGMENT_FILE_EXT)?
        .parse()
        .ok()
}

/// Segment files of journal `name` in `dir`, ordered by id.
pub fn list_segment_files(dir: &Path, name: &str) -> StorageResult<Vec<(u64, PathBuf)>> {
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(id) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| parse_segment_id(name, n))
        {
            files.push((id, path));
        }
    }
    files.sort_by_key(|(id, _)| *id);
    Ok(files)
}

/// Segment list and index shared between the writer and its readers.
pub(crate) struct JournalState {
    pub(crate) segments: Vec<Arc<LogSegment>>,
    pub(crate) index: SparseIndex,
    /// Highest position known to be fsynced
    pub(crate) flushed_position: Position,
}

impl JournalState {
    pub(crate) fn first_position(&self) -> Position {
        self.segments.first().map_or(1, |s| s.first_position())
    }

    pub(crate) fn next_position(&self) -> Position {
        self.segments.last().map_or(1, |s| s.next_position())
    }

    pub(crate) fn last_position(&self) -> Position {
        self.next_position().saturating_sub(1)
    }

    /// Last position readers may see: written and fsynced.
    pub(crate) fn durable_position(&self) -> Position {
        self.flushed_position.min(self.last_position())
    }

    /// Segment holding `position` and an offset to start scanning from.
    pub(crate) fn locate(&self, position: Position) -> Option<(Arc<LogSegment>, u64)> {
        let idx = self
            .segments
            .partition_point(|s| s.first_position() <= position)
            .checked_sub(1)?;
        let segment = &self.segments[idx];
        if !segment.contains(position) {
            return None;
        }
        let offset = self
            .index
            .lookup(position)
            .filter(|info| info.segment_id == segment.id())
            .map_or(DESCRIPTOR_SIZE as u64, |info| info.offset);
        Some((segment.clone(), offset))
    }

    pub(crate) fn segment_after(&self, id: u64) -> Option<Arc<LogSegment>> {
        self.segments.iter().find(|s| s.id() > id).cloned()
    }
}

/// Read-only handle on a journal, cheap to clone and safe to use from any
/// thread. Used by readers and the replication handler.
#[derive(Clone)]
pub struct JournalView {
    state: Arc<RwLock<JournalState>>,
}

impl JournalView {
    pub fn first_position(&self) -> Position {
        self.state.read().first_position()
    }

    pub fn last_position(&self) -> Position {
        self.state.read().last_position()
    }

    /// Last fsynced position. Readers and replication never go past it.
    pub fn durable_position(&self) -> Position {
        self.state.read().durable_position()
    }

    pub fn next_position(&self) -> Position {
        self.state.read().next_position()
    }

    pub fn is_empty(&self) -> bool {
        let state = self.state.read();
        state.first_position() == state.next_position()
    }

    /// Whether `position` is currently stored in the journal.
    pub fn contains(&self, position: Position) -> bool {
        let state = self.state.read();
        position >= state.first_position() && position < state.next_position()
    }

    pub fn segments(&self) -> Vec<SegmentInfo> {
        self.state.read().segments.iter().map(|s| s.info()).collect()
    }

    /// Reader positioned at `position`, bounded by the current durable position.
    pub fn read_from(&self, position: Position) -> JournalReader {
        JournalReader::new(self.state.clone(), position)
    }

    pub fn open_reader(&self) -> JournalReader {
        let first = self.first_position();
        self.read_from(first)
    }
}

/// Statistics about the journal's on-disk footprint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalStats {
    /// Total size of all segments in bytes
    pub total_size: u64,
    /// Active segment size in bytes
    pub active_segment_size: u64,
    /// Number of sealed segments
    pub sealed_segment_count: usize,
    /// Total size of sealed segments
    pub sealed_segments_size: u64,
    /// Maximum segment size before rollover
    pub max_segment_size: u64,
    pub first_position: Position,
    pub last_position: Position,
    pub last_flushed_position: Position,
}

impl JournalStats {
    /// Format as human-readable string
    pub fn to_human_readable(&self) -> String {
        format!(
            "positions: {}..={} (flushed {}), total: {}, active: {}, sealed: {} segments ({}), max_segment: {}",
            self.first_position,
            self.last_position,
            self.last_flushed_position,
            Self::format_bytes(self.total_size),
            Self::format_bytes(self.active_segment_size),
            self.sealed_segment_count,
            Self::format_bytes(self.sealed_segments_size),
            Self::format_bytes(self.max_segment_size),
        )
    }

    fn format_bytes(bytes: u64) -> String {
        const KB: u64 = 1024;
        const MB: u64 = KB * 1024;
        const GB: u64 = MB * 1024;

        if bytes >= GB {
            format!("{:.2}GB", bytes as f64 / GB as f64)
        } else if bytes >= MB {
            format!("{:.2}MB", bytes as f64 / MB as f64)
        } else if bytes >= KB {
            format!("{:.2}KB", bytes as f64 / KB as f64)
        } else {
            format!("{}B", bytes)
        }
    }
}

/// Append-only, position-addressable log made of size-bounded segments.
///
/// All mutation goes through `&mut self`, so exactly one owner writes.
pub struct SegmentedJournal {
    options: JournalOptions,
    state: Arc<RwLock<JournalState>>,
    next_segment_id: u64,
    closed: bool,
}

impl SegmentedJournal {
    /// Open the journal in `options.dir`, recovering existing segments or
    /// creating the first one.
    pub fn open(options: JournalOptions) -> StorageResult<Self> {
        fs::create_dir_all(&options.dir)?;

        let mut index = SparseIndex::new(options.index_density);
        let segments = Self::load_or_create_segments(&options, &mut index)?;
        let next_segment_id = segments.last().map_or(1, |s| s.id() + 1);

        let mut state = JournalState {
            segments,
            index,
            flushed_position: 0,
        };
        let last_position = state.last_position();
        state.flushed_position = last_position;

        info!(
            "Opened journal {}: segments={}, first_position={}, last_position={}, dir={:?}",
            options.name,
            state.segments.len(),
            state.first_position(),
            last_position,
            options.dir
        );

        Ok(Self {
            options,
            state: Arc::new(RwLock::new(state)),
            next_segment_id,
            closed: false,
        })
    }

    fn load_or_create_segments(
        options: &JournalOptions,
        index: &mut SparseIndex,
    ) -> StorageResult<Vec<Arc<LogSegment>>> {
        let files = list_segment_files(&options.dir, &options.name)?;
        let count = files.len();
        let mut segments: Vec<Arc<LogSegment>> = Vec::with_capacity(count);

        for (i, (id, path)) in files.into_iter().enumerate() {
            let is_last = i + 1 == count;

            let descriptor = match LogSegment::read_descriptor(&path) {
                Ok(descriptor) => descriptor,
                Err(StorageError::Corrupted { offset, reason, .. }) => {
                    if is_last && LogSegment::is_unwritten(&path)? {
                        // Crash while the segment was being created.
                        warn!(
                            "Deleting last segment {:?} with unwritten descriptor: {}",
                            path, reason
                        );
                        fs::remove_file(&path)?;
                        continue;
                    }
                    return Err(StorageError::Corrupted {
                        segment: id,
                        offset,
                        reason,
                    });
                }
                Err(e) => return Err(e),
            };

            if descriptor.id != id {
                return Err(StorageError::corrupted(
                    id,
                    0,
                    format!("file name says segment {}, descriptor says {}", id, descriptor.id),
                ));
            }
            if descriptor.max_size != options.max_segment_size {
                warn!(
                    "Segment {} was created with max size {}, configured max size is {}",
                    id, descriptor.max_size, options.max_segment_size
                );
            }
            if let Some(previous) = segments.last() {
                if descriptor.first_position != previous.next_position() {
                    return Err(StorageError::corrupted(
                        id,
                        0,
                        format!(
                            "segment starts at position {}, previous segment ends before {}",
                            descriptor.first_position,
                            previous.next_position()
                        ),
                    ));
                }
                if !previous.is_sealed() {
                    warn!("Segment {} is followed by another segment but not sealed", previous.id());
                }
            }

            let segment = LogSegment::open(path, descriptor, is_last, |position, offset| {
                index.index(position, id, offset)
            })?;
            segments.push(Arc::new(segment));
        }

        match segments.last() {
            None => {
                let path = options.dir.join(segment_file_name(&options.name, 1));
                let segment = LogSegment::create(path, 1, 1, options.max_segment_size)?;
                segments.push(Arc::new(segment));
            }
            Some(last) if last.is_sealed() => last.unseal()?,
            Some(_) => {}
        }

        Ok(segments)
    }

    pub fn options(&self) -> &JournalOptions {
        &self.options
    }

    pub fn view(&self) -> JournalView {
        JournalView {
            state: self.state.clone(),
        }
    }

    pub fn first_position(&self) -> Position {
        self.state.read().first_position()
    }

    /// Position of the last entry, or `first_position() - 1` when empty.
    pub fn last_position(&self) -> Position {
        self.state.read().last_position()
    }

    pub fn next_position(&self) -> Position {
        self.state.read().next_position()
    }

    pub fn is_empty(&self) -> bool {
        self.first_position() == self.next_position()
    }

    /// Highest position known to be fsynced.
    pub fn last_flushed_position(&self) -> Position {
        self.state.read().flushed_position
    }

    pub fn segment_count(&self) -> usize {
        self.state.read().segments.len()
    }

    pub fn segments(&self) -> Vec<SegmentInfo> {
        self.state.read().segments.iter().map(|s| s.info()).collect()
    }

    pub fn stats(&self) -> JournalStats {
        let state = self.state.read();
        let active_segment_size = state.segments.last().map_or(0, |s| s.size());
        let total_size: u64 = state.segments.iter().map(|s| s.size()).sum();

        JournalStats {
            total_size,
            active_segment_size,
            sealed_segment_count: state.segments.len().saturating_sub(1),
            sealed_segments_size: total_size - active_segment_size,
            max_segment_size: self.options.max_segment_size,
            first_position: state.first_position(),
            last_position: state.last_position(),
            last_flushed_position: state.flushed_position,
        }
    }

    /// Append an entry and return its position. Flushes before returning
    /// when `flush_explicitly` is set.
    pub fn append(&mut self, term: Term, payload: &[u8]) -> StorageResult<Position> {
        let position = self.append_unflushed(term, payload)?;
        if self.options.flush_explicitly {
            self.flush()?;
        }
        Ok(position)
    }

    /// Append without the explicit flush; callers batching several appends
    /// flush once at the end.
    pub(crate) fn append_unflushed(&mut self, term: Term, payload: &[u8]) -> StorageResult<Position> {
        self.ensure_open()?;
        if payload.len() > self.options.max_entry_size {
            return Err(StorageError::EntryTooLarge {
                size: payload.len(),
                max: self.options.max_entry_size,
            });
        }

        let position = self.next_position();
        let frame = encode_record(position, term, payload);
        self.write_frame(&frame, position)?;
        Ok(position)
    }

    /// Append an already framed record received from a peer. The record must
    /// carry exactly the next position.
    pub fn append_frame(&mut self, frame: &[u8]) -> StorageResult<Position> {
        self.ensure_open()?;
        let (header, frame) = decode_frame(frame).map_err(|e| match e {
            RecordError::InvalidChecksum => {
                StorageError::corrupted(0, 0, "replicated record failed checksum validation")
            }
            other => StorageError::corrupted(0, 0, format!("replicated record: {}", other)),
        })?;

        let expected = self.next_position();
        if header.position != expected {
            return Err(StorageError::InvalidPosition {
                expected,
                actual: header.position,
            });
        }
        self.check_frame_size(frame.len())?;

        self.write_frame(frame, header.position)?;
        Ok(header.position)
    }

    /// Reject a framed record this journal can never store, whatever the
    /// active segment currently holds.
    pub fn check_frame_size(&self, frame_len: usize) -> StorageResult<()> {
        let payload_len = frame_len.saturating_sub(RECORD_HEADER_SIZE);
        if payload_len > self.options.max_entry_size {
            return Err(StorageError::EntryTooLarge {
                size: payload_len,
                max: self.options.max_entry_size,
            });
        }
        let capacity = self.segment_capacity();
        if frame_len as u64 > capacity {
            return Err(StorageError::SegmentOverflow {
                size: frame_len as u64,
                capacity,
            });
        }
        Ok(())
    }

    fn segment_capacity(&self) -> u64 {
        self.options.max_segment_size.saturating_sub(DESCRIPTOR_SIZE as u64)
    }

    fn write_frame(&mut self, frame: &[u8], position: Position) -> StorageResult<()> {
        let len = frame.len() as u64;
        let mut active = self.active();

        if len > active.remaining() {
            let capacity = self.segment_capacity();
            if len > capacity {
                return Err(StorageError::SegmentOverflow {
                    size: len,
                    capacity,
                });
            }
            self.roll_over()?;
            active = self.active();
        }

        let offset = active.append(frame, position)?;
        self.state.write().index.index(position, active.id(), offset);
        Ok(())
    }

    fn active(&self) -> Arc<LogSegment> {
        let state = self.state.read();
        // A journal always holds at least one segment.
        state.segments[state.segments.len() - 1].clone()
    }

    /// Seal the active segment and start a new one after it.
    fn roll_over(&mut self) -> StorageResult<()> {
        let active = self.active();
        active.seal()?;
        self.set_flushed_position(active.next_position() - 1);

        let id = self.next_segment_id;
        let segment = LogSegment::create(
            self.segment_path(id),
            id,
            active.next_position(),
            self.options.max_segment_size,
        )?;
        self.next_segment_id += 1;
        self.state.write().segments.push(Arc::new(segment));

        info!("Rolled journal {} over to segment {}", self.options.name, id);
        Ok(())
    }

    fn segment_path(&self, id: u64) -> PathBuf {
        self.options.dir.join(segment_file_name(&self.options.name, id))
    }

    /// Remove every entry after `position`.
    pub fn truncate_after(&mut self, position: Position) -> StorageResult<()> {
        self.ensure_open()?;
        if position >= self.last_position() {
            return Ok(());
        }
        let position = position.max(self.first_position().saturating_sub(1));

        let (removed, boundary, scan_from) = {
            let mut state = self.state.write();
            let mut removed = Vec::new();
            while state.segments.len() > 1
                && state
                    .segments
                    .last()
                    .is_some_and(|s| s.first_position() > position)
            {
                if let Some(segment) = state.segments.pop() {
                    removed.push(segment);
                }
            }

            let boundary = state.segments[state.segments.len() - 1].clone();
            let scan_from = state
                .index
                .lookup(position + 1)
                .filter(|info| info.segment_id == boundary.id())
                .map_or(DESCRIPTOR_SIZE as u64, |info| info.offset);
            state.index.truncate_after(position);
            (removed, boundary, scan_from)
        };

        for segment in removed {
            segment.delete()?;
        }
        boundary.truncate_after(position, scan_from)?;
        boundary.unseal()?;

        {
            let mut state = self.state.write();
            state.flushed_position = state.flushed_position.min(position);
        }
        info!(
            "Truncated journal {} after position {}",
            self.options.name, position
        );
        Ok(())
    }

    /// Delete every sealed segment whose entries all lie below `up_to`.
    /// The active segment is never removed. Returns the number of deleted
    /// segments.
    pub fn compact(&mut self, up_to: Position) -> StorageResult<usize> {
        self.ensure_open()?;

        let removed: Vec<Arc<LogSegment>> = {
            let mut state = self.state.write();
            let mut count = 0;
            while count + 1 < state.segments.len()
                && state.segments[count].next_position() <= up_to
            {
                count += 1;
            }
            let removed: Vec<_> = state.segments.drain(..count).collect();
            let first = state.first_position();
            state.index.compact_before(first);
            removed
        };

        if removed.is_empty() {
            debug!(
                "Nothing to compact in journal {} below position {}",
                self.options.name, up_to
            );
            return Ok(0);
        }

        for segment in &removed {
            if let Err(e) = segment.delete() {
                warn!("Failed to delete compacted segment {:?}: {}", segment.path(), e);
            }
        }

        info!(
            "Compacted journal {} up to position {}: removed {} segments, first_position={}",
            self.options.name,
            up_to,
            removed.len(),
            self.first_position()
        );
        Ok(removed.len())
    }

    /// Drop all entries and restart the journal at `next_position`.
    pub fn reset(&mut self, next_position: Position) -> StorageResult<()> {
        self.ensure_open()?;
        let next_position = next_position.max(1);

        let removed: Vec<Arc<LogSegment>> = {
            let mut state = self.state.write();
            state.index.clear();
            state.segments.drain(..).collect()
        };
        for segment in &removed {
            segment.delete()?;
        }

        let id = self.next_segment_id;
        let segment = LogSegment::create(
            self.segment_path(id),
            id,
            next_position,
            self.options.max_segment_size,
        )?;
        self.next_segment_id += 1;
        {
            let mut state = self.state.write();
            state.segments.push(Arc::new(segment));
            state.flushed_position = next_position - 1;
        }

        info!(
            "Reset journal {} to position {}",
            self.options.name, next_position
        );
        Ok(())
    }

    /// Fsync the active segment. Sealed segments are already durable.
    pub fn flush(&mut self) -> StorageResult<()> {
        if self.closed {
            return Ok(());
        }
        let last_position = self.last_position();
        if last_position == self.last_flushed_position() {
            return Ok(());
        }
        self.active().flush()?;
        self.set_flushed_position(last_position);
        Ok(())
    }

    fn set_flushed_position(&self, position: Position) {
        let mut state = self.state.write();
        state.flushed_position = state.flushed_position.max(position);
    }

    pub fn read_from(&self, position: Position) -> JournalReader {
        self.view().read_from(position)
    }

    pub fn open_reader(&self) -> JournalReader {
        self.view().open_reader()
    }

    pub fn close(&mut self) -> StorageResult<()> {
        if self.closed {
            return Ok(());
        }
        self.flush()?;
        self.closed = true;
        info!("Closed journal {}", self.options.name);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

impl Drop for SegmentedJournal {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close journal {}: {}", self.options.name, e);
        }
    }
}
