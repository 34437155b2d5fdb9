use crate::{Position, Term};
use thiserror::Error;

// Record layout (little endian):
// | payload_len u32 | crc u32 | position u64 | term u64 | payload ... |
// crc covers position, term and payload.

pub const RECORD_HEADER_SIZE: usize = 24;

/// A single entry of the journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
    pub position: Position,
    pub term: Term,
    pub payload: Vec<u8>,
}

impl JournalRecord {
    pub fn new(position: Position, term: Term, payload: Vec<u8>) -> Self {
        Self {
            position,
            term,
            payload,
        }
    }

    /// On-disk size of this record, header included.
    pub fn framed_len(&self) -> usize {
        RECORD_HEADER_SIZE + self.payload.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_record(self.position, self.term, &self.payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub length: u32,
    pub crc: u32,
    pub position: Position,
    pub term: Term,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecordError {
    /// Fewer bytes than the header or the announced payload.
    #[error("record is incomplete")]
    Incomplete,
    /// An all-zero header: nothing was ever written here.
    #[error("record header is empty")]
    Empty,
    /// Bytes are present but do not match their checksum.
    #[error("record checksum mismatch")]
    InvalidChecksum,
}

impl RecordHeader {
    pub fn framed_len(&self) -> usize {
        RECORD_HEADER_SIZE + self.length as usize
    }

    pub fn decode(data: &[u8]) -> Result<Self, RecordError> {
        if data.len() < RECORD_HEADER_SIZE {
            return Err(RecordError::Incomplete);
        }
        if data[..RECORD_HEADER_SIZE].iter().all(|b| *b == 0) {
            return Err(RecordError::Empty);
        }

        let length = u32::from_le_bytes(read_array(&data[0..4]));
        let crc = u32::from_le_bytes(read_array(&data[4..8]));
        let position = u64::from_le_bytes(read_array(&data[8..16]));
        let term = u64::from_le_bytes(read_array(&data[16..24]));

        Ok(Self {
            length,
            crc,
            position,
            term,
        })
    }
}

pub fn encode_record(position: Position, term: Term, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&[0u8; 4]);
    buf.extend_from_slice(&position.to_le_bytes());
    buf.extend_from_slice(&term.to_le_bytes());
    buf.extend_from_slice(payload);

    let crc = crc32fast::hash(&buf[8..]);
    buf[4..8].copy_from_slice(&crc.to_le_bytes());
    buf
}

/// Decode and checksum-verify one framed record from the start of `data`.
/// Returns the header and the full framed bytes of the record.
pub fn decode_frame(data: &[u8]) -> Result<(RecordHeader, &[u8]), RecordError> {
    let header = RecordHeader::decode(data)?;
    let end = header.framed_len();
    if data.len() < end {
        return Err(RecordError::Incomplete);
    }

    let frame = &data[..end];
    if crc32fast::hash(&frame[8..]) != header.crc {
        return Err(RecordError::InvalidChecksum);
    }
    Ok((header, frame))
}

pub fn decode_record(data: &[u8]) -> Result<JournalRecord, RecordError> {
    let (header, frame) = decode_frame(data)?;
    Ok(JournalRecord {
        position: header.position,
        term: header.term,
        payload: frame[RECORD_HEADER_SIZE..].to_vec(),
    })
}

/// Iterates the framed records packed back to back in `data`.
pub struct FrameIter<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> FrameIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Byte offset of the next frame.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl<'a> Iterator for FrameIter<'a> {
    type Item = Result<(RecordHeader, &'a [u8]), RecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }
        let result = decode_frame(&self.data[self.offset..]);
        match &result {
            Ok((header, _)) => self.offset += header.framed_len(),
            Err(_) => self.offset = self.data.len(),
        }
        Some(result)
    }
}

fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}
