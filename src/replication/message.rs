use bincode::{Decode, Encode};
use tracing::warn;

use crate::{
    Position,
    error::ReplicationError,
    storage::log::{FrameIter, JournalRecord, RecordError},
    traits::ReplicationResult,
};

/// Catch-up request sent by a lagging replica.
///
/// `from_position` is exclusive unless `inclusive` is set; `None` asks for
/// the log from its first stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct ReplicationRequest {
    pub from_position: Option<Position>,
    pub to_position: Position,
    pub inclusive: bool,
}

impl ReplicationRequest {
    /// Everything from the first stored entry up to `to_position`.
    pub fn from_start(to_position: Position) -> Self {
        Self {
            from_position: None,
            to_position,
            inclusive: false,
        }
    }

    /// Entries after `from_position` up to `to_position`.
    pub fn after(from_position: Position, to_position: Position) -> Self {
        Self {
            from_position: Some(from_position),
            to_position,
            inclusive: false,
        }
    }

    /// Entries from `from_position` included up to `to_position`.
    pub fn including(from_position: Position, to_position: Position) -> Self {
        Self {
            from_position: Some(from_position),
            to_position,
            inclusive: true,
        }
    }

    pub fn encode(&self) -> ReplicationResult<Vec<u8>> {
        let config = bincode::config::standard();
        bincode::encode_to_vec(self, config)
            .map_err(|e| ReplicationError::MalformedPayload(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> ReplicationResult<Self> {
        let config = bincode::config::standard();
        let (request, _) = bincode::decode_from_slice(data, config).map_err(|e| {
            warn!("Failed to deserialize replication request: {}", e);
            ReplicationError::MalformedPayload(e.to_string())
        })?;
        Ok(request)
    }
}

/// Answer to a [`ReplicationRequest`].
///
/// `payload` holds the journal records exactly as framed on disk, so a
/// follower can append them without re-encoding.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ReplicationResponse {
    /// False when the requested start is no longer (or not yet) in the log.
    pub valid: bool,
    /// True when the response stopped at the size limit before the
    /// requested end.
    pub has_more_available: bool,
    /// Last position contained in `payload`.
    pub to_position: Position,
    pub payload: Vec<u8>,
}

impl ReplicationResponse {
    pub fn invalid() -> Self {
        Self {
            valid: false,
            has_more_available: false,
            to_position: 0,
            payload: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Decode every record of the payload.
    pub fn records(&self) -> ReplicationResult<Vec<JournalRecord>> {
        let mut iter = FrameIter::new(&self.payload);
        let mut records = Vec::new();
        loop {
            let offset = iter.offset();
            match iter.next() {
                None => break,
                Some(Ok((header, frame))) => records.push(JournalRecord::new(
                    header.position,
                    header.term,
                    frame[frame.len() - header.length as usize..].to_vec(),
                )),
                Some(Err(RecordError::InvalidChecksum)) => {
                    return Err(ReplicationError::InvalidChecksum { offset });
                }
                Some(Err(e)) => {
                    return Err(ReplicationError::MalformedPayload(format!(
                        "record at offset {}: {}",
                        offset, e
                    )));
                }
            }
        }
        Ok(records)
    }

    pub fn encode(&self) -> ReplicationResult<Vec<u8>> {
        let config = bincode::config::standard();
        bincode::encode_to_vec(self, config)
            .map_err(|e| ReplicationError::MalformedPayload(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> ReplicationResult<Self> {
        let config = bincode::config::standard();
        let (response, _) = bincode::decode_from_slice(data, config).map_err(|e| {
            warn!("Failed to deserialize replication response: {}", e);
            ReplicationError::MalformedPayload(e.to_string())
        })?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::log::encode_record;

    #[test]
    fn test_request_constructors() {
        assert_eq!(ReplicationRequest::from_start(9).from_position, None);
        assert!(!ReplicationRequest::after(3, 9).inclusive);
        assert!(ReplicationRequest::including(3, 9).inclusive);

        let request = ReplicationRequest::including(3, 9);
        let decoded = ReplicationRequest::decode(&request.encode().unwrap()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_response_records() {
        let mut payload = encode_record(4, 2, b"four");
        payload.extend(encode_record(5, 2, b"five"));
        let response = ReplicationResponse {
            valid: true,
            has_more_available: false,
            to_position: 5,
            payload,
        };

        let records = response.records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], JournalRecord::new(4, 2, b"four".to_vec()));
        assert_eq!(records[1].payload, b"five");
    }

    #[test]
    fn test_response_records_reports_damage() {
        let mut payload = encode_record(1, 1, b"one");
        let second = payload.len();
        payload.extend(encode_record(2, 1, b"two"));
        let last = payload.len() - 1;
        payload[last] ^= 0xff;

        let response = ReplicationResponse {
            valid: true,
            has_more_available: false,
            to_position: 2,
            payload,
        };
        assert!(matches!(
            response.records(),
            Err(ReplicationError::InvalidChecksum { offset }) if offset == second
        ));
    }

    #[test]
    fn test_invalid_response_is_empty() {
        let response = ReplicationResponse::invalid();
        assert!(!response.valid);
        assert!(!response.has_more_available);
        assert!(response.is_empty());
    }
}
