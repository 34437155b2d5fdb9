use crate::Position;

/// Location of an indexed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexInfo {
    pub position: Position,
    pub segment_id: u64,
    pub offset: u64,
}

/// Sparse position -> (segment, offset) index.
///
/// Only every `density`-th position is recorded; a lookup returns the closest
/// indexed record at or before the requested position and the caller scans
/// forward from there.
#[derive(Debug)]
pub struct SparseIndex {
    density: u64,
    entries: Vec<IndexInfo>,
}

impl SparseIndex {
    pub fn new(density: u64) -> Self {
        Self {
            density: density.max(1),
            entries: Vec::new(),
        }
    }

    pub fn density(&self) -> u64 {
        self.density
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record the location of `position` if it falls on the index grid.
    /// Positions must be indexed in increasing order.
    pub fn index(&mut self, position: Position, segment_id: u64, offset: u64) {
        if position % self.density != 0 {
            return;
        }
        if self
            .entries
            .last()
            .is_some_and(|last| last.position >= position)
        {
            return;
        }
        self.entries.push(IndexInfo {
            position,
            segment_id,
            offset,
        });
    }

    /// Closest indexed record at or before `position`.
    pub fn lookup(&self, position: Position) -> Option<IndexInfo> {
        let idx = self.entries.partition_point(|e| e.position <= position);
        idx.checked_sub(1).map(|i| self.entries[i])
    }

    /// Forget every indexed position greater than `position`.
    pub fn truncate_after(&mut self, position: Position) {
        let keep = self.entries.partition_point(|e| e.position <= position);
        self.entries.truncate(keep);
    }

    /// Forget every indexed position lower than `position`.
    pub fn compact_before(&mut self, position: Position) {
        let drop = self.entries.partition_point(|e| e.position < position);
        self.entries.drain(..drop);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
