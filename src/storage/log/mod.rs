//! Segmented journal storage.
//!
//! # Module Structure
//!
//! - `entry`: record framing and checksums
//! - `descriptor`: fixed-size segment header
//! - `segment`: a single segment file
//! - `index`: sparse position index
//! - `journal`: segment lifecycle, recovery, truncation and compaction
//! - `reader`: forward readers that follow segment rollover
//! - `store`: the single-owner journal task

mod descriptor;
mod entry;
mod index;
mod journal;
mod reader;
mod segment;
mod store;


pub use descriptor::{
    DESCRIPTOR_SIZE, DescriptorError, SEGMENT_MAGIC, SEGMENT_VERSION_V1, SegmentDescriptor,
};

pub use entry::{
    FrameIter, JournalRecord, RECORD_HEADER_SIZE, RecordError, RecordHeader, decode_frame,
    decode_record, encode_record,
};

pub use index::{IndexInfo, SparseIndex};

pub use journal::{
    JournalStats, JournalView, SegmentedJournal, list_segment_files, parse_segment_id,
    segment_file_name,
};

pub use reader::JournalReader;

pub use segment::{LogSegment, SegmentInfo};

pub use store::{JournalActorOptions, JournalOp, ManagedJournal};
