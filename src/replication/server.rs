use std::{io, sync::Arc};

use tokio::sync::Semaphore;
use tracing::debug;

use crate::{
    error::StorageError,
    storage::log::JournalView,
    traits::{ReplicationResult, StorageResult},
};

use super::message::{ReplicationRequest, ReplicationResponse};

/// Default upper bound on the payload of a single response (1MB)
pub const DEFAULT_MAX_RESPONSE_SIZE: usize = 1024 * 1024;

#[derive(Clone, Debug)]
pub struct ReplicationOptions {
    /// Max payload bytes per response. A single larger record is still sent
    /// on its own so replication always progresses.
    pub max_response_size: usize,
    /// Max number of requests read from disk concurrently
    pub max_io_threads: usize,
}

impl Default for ReplicationOptions {
    fn default() -> Self {
        Self {
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
            max_io_threads: 4,
        }
    }
}

/// Serves catch-up requests from a journal.
///
/// Requests are stateless: every call opens its own reader, so any number of
/// followers can be served concurrently without touching the writer.
#[derive(Clone)]
pub struct ReplicationRequestHandler {
    journal: JournalView,
    options: ReplicationOptions,
    io_semaphore: Arc<Semaphore>,
}

impl ReplicationRequestHandler {
    pub fn new(journal: JournalView, options: ReplicationOptions) -> Self {
        let io_semaphore = Arc::new(Semaphore::new(options.max_io_threads.max(1)));
        Self {
            journal,
            options,
            io_semaphore,
        }
    }

    pub fn options(&self) -> &ReplicationOptions {
        &self.options
    }

    /// Serve `request` on the blocking pool.
    pub async fn on_replication_request(
        &self,
        request: ReplicationRequest,
    ) -> ReplicationResult<ReplicationResponse> {
        let _permit = self
            .io_semaphore
            .acquire()
            .await
            .map_err(|_| StorageError::Closed)?;

        let handler = self.clone();
        let response = tokio::task::spawn_blocking(move || handler.handle(&request))
            .await
            .map_err(|e| StorageError::Io(io::Error::other(e)))??;
        Ok(response)
    }

    /// Serve `request` on the calling thread.
    pub fn handle(&self, request: &ReplicationRequest) -> StorageResult<ReplicationResponse> {
        let first = self.journal.first_position();
        let last = self.journal.durable_position();

        let start = match request.from_position {
            None => first,
            Some(from) if from < first || from > last => {
                debug!(
                    "Rejecting replication request from {}: log holds {}..={}",
                    from, first, last
                );
                return Ok(ReplicationResponse::invalid());
            }
            Some(from) if request.inclusive => from,
            Some(from) => from + 1,
        };
        let end = request.to_position.min(last);

        let mut reader = self.journal.read_from(start);
        if start <= end && reader.next_position() != start {
            // Compacted between the range check and opening the reader.
            return Ok(ReplicationResponse::invalid());
        }
        reader.limit_to(end);

        let mut payload = Vec::new();
        let mut to_position = (start - 1).min(request.to_position);
        let mut has_more_available = false;

        while let Some(frame) = reader.next_frame()? {
            if !payload.is_empty() && payload.len() + frame.len() > self.options.max_response_size
            {
                has_more_available = true;
                break;
            }
            payload.extend_from_slice(&frame);
            to_position += 1;
        }

        debug!(
            "Served replication request {:?}: positions {}..={}, {} bytes, has_more={}",
            request,
            start,
            to_position,
            payload.len(),
            has_more_available
        );

        Ok(ReplicationResponse {
            valid: true,
            has_more_available,
            to_position,
            payload,
        })
    }
}
