//! Catch-up replication between replicas of a partition.
//!
//! A lagging follower asks a peer for a position range; the peer answers with
//! the raw journal records of that range, bounded by a response size limit.
//! No cursor is kept on the serving side, so a follower resumes from any
//! position by reissuing the request.

mod appender;
mod message;
mod server;


pub use appender::{ReplicationAppender, append_replicated};
pub use message::{ReplicationRequest, ReplicationResponse};
pub use server::{DEFAULT_MAX_RESPONSE_SIZE, ReplicationOptions, ReplicationRequestHandler};
