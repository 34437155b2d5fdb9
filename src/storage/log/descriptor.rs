use crate::Position;
use thiserror::Error;

// Segment descriptor, first DESCRIPTOR_SIZE bytes of every segment file:
// | magic u32 | version u32 | id u64 | first_position u64 | max_size u64 |
// | created_at u64 | flags u32 | reserved u32 | last_position u64 |
// | reserved u32 | crc u32 |

pub const DESCRIPTOR_SIZE: usize = 64;

pub const SEGMENT_MAGIC: u32 = 0x4A52_4E4C;

pub const SEGMENT_VERSION_V1: u32 = 1;

const FLAG_SEALED: u32 = 0x1;

const CRC_OFFSET: usize = DESCRIPTOR_SIZE - 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
    pub id: u64,
    pub version: u32,
    pub first_position: Position,
    pub max_size: u64,
    /// Creation time in ms since epoch
    pub created_at: u64,
    pub sealed: bool,
    /// Last position written before sealing; only meaningful when sealed.
    pub last_position: Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("descriptor truncated to {0} bytes")]
    Incomplete(usize),
    #[error("invalid magic {0:#x}")]
    InvalidMagic(u32),
    #[error("unsupported version {0}")]
    UnsupportedVersion(u32),
    #[error("descriptor checksum mismatch")]
    InvalidChecksum,
}

impl SegmentDescriptor {
    pub fn new(id: u64, first_position: Position, max_size: u64, created_at: u64) -> Self {
        Self {
            id,
            version: SEGMENT_VERSION_V1,
            first_position,
            max_size,
            created_at,
            sealed: false,
            last_position: first_position.saturating_sub(1),
        }
    }

    pub fn encode(&self) -> [u8; DESCRIPTOR_SIZE] {
        let mut buf = [0u8; DESCRIPTOR_SIZE];
        buf[0..4].copy_from_slice(&SEGMENT_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..16].copy_from_slice(&self.id.to_le_bytes());
        buf[16..24].copy_from_slice(&self.first_position.to_le_bytes());
        buf[24..32].copy_from_slice(&self.max_size.to_le_bytes());
        buf[32..40].copy_from_slice(&self.created_at.to_le_bytes());
        let flags = if self.sealed { FLAG_SEALED } else { 0 };
        buf[40..44].copy_from_slice(&flags.to_le_bytes());
        buf[48..56].copy_from_slice(&self.last_position.to_le_bytes());

        let crc = crc32fast::hash(&buf[..CRC_OFFSET]);
        buf[CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, DescriptorError> {
        if data.len() < DESCRIPTOR_SIZE {
            return Err(DescriptorError::Incomplete(data.len()));
        }

        let u32_at = |at: usize| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&data[at..at + 4]);
            u32::from_le_bytes(bytes)
        };
        let u64_at = |at: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&data[at..at + 8]);
            u64::from_le_bytes(bytes)
        };

        let magic = u32_at(0);
        if magic != SEGMENT_MAGIC {
            return Err(DescriptorError::InvalidMagic(magic));
        }
        if crc32fast::hash(&data[..CRC_OFFSET]) != u32_at(CRC_OFFSET) {
            return Err(DescriptorError::InvalidChecksum);
        }
        let version = u32_at(4);
        if version != SEGMENT_VERSION_V1 {
            return Err(DescriptorError::UnsupportedVersion(version));
        }

        Ok(Self {
            id: u64_at(8),
            version,
            first_position: u64_at(16),
            max_size: u64_at(24),
            created_at: u64_at(32),
            sealed: u32_at(40) & FLAG_SEALED != 0,
            last_position: u64_at(48),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_keeps_seal_state() {
        let mut descriptor = SegmentDescriptor::new(7, 101, 4096, 1_700_000_000_000);
        descriptor.sealed = true;
        descriptor.last_position = 150;

        let decoded = SegmentDescriptor::decode(&descriptor.encode()).unwrap();
        assert_eq!(decoded, descriptor);
    }

    #[test]
    fn test_descriptor_rejects_damage() {
        let descriptor = SegmentDescriptor::new(1, 1, 4096, 0);
        let mut bytes = descriptor.encode();

        assert_eq!(
            SegmentDescriptor::decode(&bytes[..10]),
            Err(DescriptorError::Incomplete(10))
        );

        bytes[20] ^= 0xff;
        assert_eq!(
            SegmentDescriptor::decode(&bytes),
            Err(DescriptorError::InvalidChecksum)
        );

        let zeroed = [0u8; DESCRIPTOR_SIZE];
        assert_eq!(
            SegmentDescriptor::decode(&zeroed),
            Err(DescriptorError::InvalidMagic(0))
        );
    }

    #[test]
    fn test_descriptor_errors_display() {
        assert_eq!(
            DescriptorError::Incomplete(10).to_string(),
            "descriptor truncated to 10 bytes"
        );
        assert_eq!(DescriptorError::InvalidMagic(0x2a).to_string(), "invalid magic 0x2a");
        assert_eq!(
            DescriptorError::InvalidChecksum.to_string(),
            "descriptor checksum mismatch"
        );
    }
}
