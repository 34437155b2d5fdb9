use tracing::{debug, info, warn};

use crate::{
    Position,
    error::ReplicationError,
    storage::log::{FrameIter, ManagedJournal, RecordError, SegmentedJournal},
    traits::{ReplicationClient, ReplicationResult},
};

use super::message::{ReplicationRequest, ReplicationResponse};

/// Append the records of `response` to the follower's journal and flush.
///
/// The whole payload is validated before anything is written: every record
/// must pass its checksum, fit the local size limits and continue the local
/// log without a gap. A
/// position mismatch means the logs diverged and is reported as
/// [`ReplicationError::Inconsistent`]. Returns the new last position.
pub fn append_replicated(
    journal: &mut SegmentedJournal,
    response: &ReplicationResponse,
) -> ReplicationResult<Position> {
    if !response.valid {
        return Err(ReplicationError::SnapshotRequired(Some(journal.last_position())));
    }

    let mut expected = journal.next_position();
    let mut frames = Vec::new();
    let mut iter = FrameIter::new(&response.payload);
    loop {
        let offset = iter.offset();
        match iter.next() {
            None => break,
            Some(Ok((header, frame))) => {
                if header.position != expected {
                    warn!(
                        "Replicated record at position {} does not continue the local log at {}",
                        header.position, expected
                    );
                    return Err(ReplicationError::Inconsistent {
                        expected,
                        actual: header.position,
                    });
                }
                journal.check_frame_size(frame.len())?;
                frames.push(frame);
                expected += 1;
            }
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

    if frames.is_empty() {
        return Ok(journal.last_position());
    }
    if expected - 1 != response.to_position {
        return Err(ReplicationError::MalformedPayload(format!(
            "payload ends at position {}, response claims {}",
            expected - 1,
            response.to_position
        )));
    }

    for frame in &frames {
        journal.append_frame(frame)?;
    }
    // Replicated entries are acknowledged to the leader, so they must be durable.
    journal.flush()?;

    debug!(
        "Appended {} replicated records, last_position={}",
        frames.len(),
        journal.last_position()
    );
    Ok(journal.last_position())
}

/// Follower side of the catch-up protocol: pulls entries from a peer and
/// appends them to the local journal.
pub struct ReplicationAppender<C> {
    client: C,
    journal: ManagedJournal,
}

impl<C: ReplicationClient> ReplicationAppender<C> {
    pub fn new(client: C, journal: ManagedJournal) -> Self {
        Self { client, journal }
    }

    pub fn journal(&self) -> &ManagedJournal {
        &self.journal
    }

    /// The request continuing the local log up to `target`.
    pub fn next_request(&self, target: Position) -> ReplicationRequest {
        let view = self.journal.view();
        if view.next_position() == 1 {
            ReplicationRequest::from_start(target)
        } else {
            ReplicationRequest::after(view.last_position(), target)
        }
    }

    /// Issue one request and append its result. Returns the new last
    /// position and whether the peer has more to send.
    pub async fn replicate_once(&self, target: Position) -> ReplicationResult<(Position, bool)> {
        let request = self.next_request(target);
        let response = self.client.replicate(request).await?;
        if !response.valid {
            info!(
                "Peer no longer holds position {:?}, snapshot transfer required",
                request.from_position
            );
            return Err(ReplicationError::SnapshotRequired(request.from_position));
        }

        let has_more = response.has_more_available;
        let position = self.journal.append_replicated(response).await?;
        Ok((position, has_more))
    }

    /// Replicate until the local log reaches `target` or the peer runs out
    /// of entries. Returns the last local position.
    pub async fn catch_up(&self, target: Position) -> ReplicationResult<Position> {
        loop {
            let last = self.journal.last_position();
            if last >= target {
                return Ok(last);
            }

            let (position, has_more) = self.replicate_once(target).await?;
            if position == last && !has_more {
                debug!(
                    "Peer has nothing beyond position {}, stopping catch-up before {}",
                    position, target
                );
                return Ok(position);
            }
        }
    }
}
