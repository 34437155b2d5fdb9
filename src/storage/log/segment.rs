use std::{
    fs::{self, File, OpenOptions},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::{Position, error::StorageError, traits::StorageResult};

use super::{
    descriptor::{DESCRIPTOR_SIZE, SegmentDescriptor},
    entry::{RECORD_HEADER_SIZE, RecordError, RecordHeader, decode_frame},
};

/// Summary of a segment, as reported by `SegmentedJournal::segments`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    pub id: u64,
    pub path: PathBuf,
    pub first_position: Position,
    pub last_position: Option<Position>,
    pub size: u64,
    pub max_size: u64,
    pub created_at: u64,
    pub sealed: bool,
}

/// A file-backed, size-bounded chunk of the journal.
///
/// Only the owning journal writes to a segment. Writes land beyond the
/// committed length first and are published by advancing `committed`, so
/// readers on other threads never observe a partially written record.
pub struct LogSegment {
    path: PathBuf,
    file: File,
    descriptor: RwLock<SegmentDescriptor>,
    committed: AtomicU64,
    next_position: AtomicU64,
    sealed: AtomicBool,
}

impl LogSegment {
    /// Create a new, empty segment file and persist its descriptor.
    pub fn create(
        path: PathBuf,
        id: u64,
        first_position: Position,
        max_size: u64,
    ) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let descriptor = SegmentDescriptor::new(
            id,
            first_position,
            max_size,
            crate::cluster_config::now_millis(),
        );
        file.write_all_at(&descriptor.encode(), 0)?;
        file.sync_all().map_err(|e| {
            warn!("Failed to sync new segment {:?}: {}", path, e);
            e
        })?;

        info!(
            "Created new segment: id={}, first_position={}, path={:?}",
            id, first_position, path
        );

        Ok(Self {
            path,
            file,
            descriptor: RwLock::new(descriptor),
            committed: AtomicU64::new(DESCRIPTOR_SIZE as u64),
            next_position: AtomicU64::new(first_position),
            sealed: AtomicBool::new(false),
        })
    }

    /// Read and validate only the descriptor of a segment file.
    pub fn read_descriptor(path: &Path) -> StorageResult<SegmentDescriptor> {
        let file = File::open(path)?;
        let len = file.metadata()?.len() as usize;
        let mut buf = vec![0u8; DESCRIPTOR_SIZE.min(len)];
        file.read_exact_at(&mut buf, 0)?;

        SegmentDescriptor::decode(&buf)
            .map_err(|e| StorageError::corrupted(0, 0, format!("{:?}: {}", path, e)))
    }

    /// Whether a crash interrupted the creation of this file: it is shorter
    /// than a descriptor or its descriptor block is still zeroed. Records are
    /// only written after the descriptor is synced, so such a file holds none.
    pub fn is_unwritten(path: &Path) -> StorageResult<bool> {
        let file = File::open(path)?;
        if (file.metadata()?.len() as usize) < DESCRIPTOR_SIZE {
            return Ok(true);
        }
        let mut buf = [0u8; DESCRIPTOR_SIZE];
        file.read_exact_at(&mut buf, 0)?;
        Ok(buf.iter().all(|b| *b == 0))
    }

    /// Open an existing segment and replay its records.
    ///
    /// `on_record` is called with `(position, offset)` for every valid record.
    /// When `allow_torn_tail` is set, an incomplete or damaged trailing record
    /// is cut off; otherwise any structural problem is reported as corruption.
    pub fn open(
        path: PathBuf,
        descriptor: SegmentDescriptor,
        allow_torn_tail: bool,
        mut on_record: impl FnMut(Position, u64),
    ) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let file_len = file.metadata()?.len();
        let id = descriptor.id;

        if file_len > descriptor.max_size && !allow_torn_tail {
            return Err(StorageError::corrupted(
                id,
                file_len,
                format!(
                    "segment length {} exceeds its max size {}",
                    file_len, descriptor.max_size
                ),
            ));
        }

        let mut offset = DESCRIPTOR_SIZE as u64;
        let mut next_position = descriptor.first_position;
        let mut header_buf = [0u8; RECORD_HEADER_SIZE];
        let mut torn: Option<String> = None;

        while offset < file_len {
            if file_len - offset < RECORD_HEADER_SIZE as u64 {
                torn = Some("incomplete record header".to_string());
                break;
            }
            file.read_exact_at(&mut header_buf, offset)?;

            let header = match RecordHeader::decode(&header_buf) {
                Ok(h) => h,
                Err(RecordError::Empty) => {
                    torn = Some("zeroed record header".to_string());
                    break;
                }
                Err(e) => {
                    torn = Some(format!("unreadable record header: {}", e));
                    break;
                }
            };

            let framed_len = header.framed_len() as u64;
            if offset + framed_len > file_len {
                torn = Some(format!(
                    "record at position {} announces {} bytes, only {} left",
                    header.position,
                    framed_len,
                    file_len - offset
                ));
                break;
            }

            let mut frame = vec![0u8; framed_len as usize];
            file.read_exact_at(&mut frame, offset)?;
            if let Err(e) = decode_frame(&frame) {
                torn = Some(format!("record at position {}: {}", header.position, e));
                break;
            }

            if header.position != next_position {
                torn = Some(format!(
                    "expected position {}, found {}",
                    next_position, header.position
                ));
                break;
            }

            on_record(header.position, offset);
            next_position += 1;
            offset += framed_len;
        }

        if let Some(reason) = torn {
            if !allow_torn_tail {
                return Err(StorageError::corrupted(id, offset, reason));
            }
            warn!(
                "Truncating torn tail of segment {} at offset {} ({} bytes dropped): {}",
                id,
                offset,
                file_len - offset,
                reason
            );
            file.set_len(offset)?;
            file.sync_all()?;
        }

        let last_position = next_position - 1;
        if descriptor.sealed && descriptor.last_position != last_position {
            let reason = format!(
                "sealed at position {}, but records end at {}",
                descriptor.last_position, last_position
            );
            if !allow_torn_tail {
                return Err(StorageError::corrupted(id, offset, reason));
            }
            warn!("Segment {}: {}", id, reason);
        }

        debug!(
            "Loaded segment: id={}, first_position={}, last_position={}, size={}",
            id, descriptor.first_position, last_position, offset
        );

        Ok(Self {
            path,
            file,
            sealed: AtomicBool::new(descriptor.sealed),
            descriptor: RwLock::new(descriptor),
            committed: AtomicU64::new(offset),
            next_position: AtomicU64::new(next_position),
        })
    }

    pub fn id(&self) -> u64 {
        self.descriptor.read().id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn first_position(&self) -> Position {
        self.descriptor.read().first_position
    }

    pub fn next_position(&self) -> Position {
        self.next_position.load(Ordering::Acquire)
    }

    pub fn last_position(&self) -> Option<Position> {
        let next = self.next_position();
        (next > self.first_position()).then(|| next - 1)
    }

    pub fn is_empty(&self) -> bool {
        self.last_position().is_none()
    }

    pub fn contains(&self, position: Position) -> bool {
        position >= self.first_position() && position < self.next_position()
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    pub fn max_size(&self) -> u64 {
        self.descriptor.read().max_size
    }

    /// Bytes visible to readers, descriptor included.
    pub fn size(&self) -> u64 {
        self.committed.load(Ordering::Acquire)
    }

    pub fn remaining(&self) -> u64 {
        self.max_size().saturating_sub(self.size())
    }

    pub fn descriptor(&self) -> SegmentDescriptor {
        *self.descriptor.read()
    }

    pub fn info(&self) -> SegmentInfo {
        let descriptor = self.descriptor();
        SegmentInfo {
            id: descriptor.id,
            path: self.path.clone(),
            first_position: descriptor.first_position,
            last_position: self.last_position(),
            size: self.size(),
            max_size: descriptor.max_size,
            created_at: descriptor.created_at,
            sealed: self.is_sealed(),
        }
    }

    /// Write one framed record at the end of the segment and publish it.
    /// Returns the offset the record was written at.
    pub(crate) fn append(&self, frame: &[u8], position: Position) -> StorageResult<u64> {
        let offset = self.committed.load(Ordering::Acquire);
        self.file.write_all_at(frame, offset).map_err(|e| {
            warn!("Failed to write record {} to segment {}: {}", position, self.id(), e);
            e
        })?;

        self.committed
            .store(offset + frame.len() as u64, Ordering::Release);
        self.next_position.store(position + 1, Ordering::Release);
        Ok(offset)
    }

    pub fn flush(&self) -> StorageResult<()> {
        self.file.sync_data().map_err(|e| {
            warn!("Failed to sync log segment file data: {}", e);
            e.into()
        })
    }

    /// Flush, then mark the segment read-only in its on-disk descriptor.
    pub(crate) fn seal(&self) -> StorageResult<()> {
        self.flush()?;
        let bytes = {
            let mut descriptor = self.descriptor.write();
            descriptor.sealed = true;
            descriptor.last_position = self.next_position().saturating_sub(1);
            descriptor.encode()
        };
        self.file.write_all_at(&bytes, 0)?;
        self.file.sync_data()?;
        self.sealed.store(true, Ordering::Release);

        info!(
            "Sealed segment: id={}, last_position={:?}, size={}",
            self.id(),
            self.last_position(),
            self.size()
        );
        Ok(())
    }

    /// Reopen a sealed segment for writing, after a truncation made it the
    /// tail of the journal again.
    pub(crate) fn unseal(&self) -> StorageResult<()> {
        if !self.is_sealed() {
            return Ok(());
        }
        let bytes = {
            let mut descriptor = self.descriptor.write();
            descriptor.sealed = false;
            descriptor.encode()
        };
        self.file.write_all_at(&bytes, 0)?;
        self.file.sync_data()?;
        self.sealed.store(false, Ordering::Release);
        debug!("Unsealed segment {}", self.id());
        Ok(())
    }

    /// Drop every record after `position`, scanning from `scan_from`, the
    /// offset of a record at or before `position + 1`.
    pub(crate) fn truncate_after(&self, position: Position, scan_from: u64) -> StorageResult<()> {
        if position + 1 >= self.next_position() {
            return Ok(());
        }

        let cut = if position < self.first_position() {
            DESCRIPTOR_SIZE as u64
        } else {
            let mut offset = scan_from.max(DESCRIPTOR_SIZE as u64);
            loop {
                let Some(frame) = self.read_frame_at(offset)? else {
                    return Err(StorageError::corrupted(
                        self.id(),
                        offset,
                        format!("position {} not found while truncating", position + 1),
                    ));
                };
                let header = RecordHeader::decode(&frame)
                    .map_err(|e| StorageError::corrupted(self.id(), offset, e.to_string()))?;
                if header.position > position {
                    break offset;
                }
                offset += frame.len() as u64;
            }
        };

        self.committed.store(cut, Ordering::Release);
        self.next_position
            .store(position.max(self.first_position() - 1) + 1, Ordering::Release);
        self.file.set_len(cut)?;
        self.file.sync_data()?;

        debug!(
            "Truncated segment {} after position {} at offset {}",
            self.id(),
            position,
            cut
        );
        Ok(())
    }

    /// Read the framed record at `offset`. Returns `None` at or beyond the
    /// committed length.
    pub fn read_frame_at(&self, offset: u64) -> StorageResult<Option<Vec<u8>>> {
        let committed = self.size();
        if offset + RECORD_HEADER_SIZE as u64 > committed {
            return Ok(None);
        }

        let mut header_buf = [0u8; RECORD_HEADER_SIZE];
        self.file.read_exact_at(&mut header_buf, offset)?;
        let header = RecordHeader::decode(&header_buf).map_err(|e| {
            StorageError::corrupted(self.id(), offset, format!("record header: {}", e))
        })?;

        let framed_len = header.framed_len() as u64;
        if offset + framed_len > committed {
            return Ok(None);
        }

        let mut frame = vec![0u8; framed_len as usize];
        self.file.read_exact_at(&mut frame, offset)?;
        decode_frame(&frame).map_err(|e| {
            StorageError::corrupted(
                self.id(),
                offset,
                format!("record at position {}: {}", header.position, e),
            )
        })?;
        Ok(Some(frame))
    }

    /// Remove the segment file. Open handles held by readers stay readable.
    pub(crate) fn delete(&self) -> StorageResult<()> {
        fs::remove_file(&self.path)?;
        info!("Deleted segment: id={}, path={:?}", self.id(), self.path);
        Ok(())
    }
}
