mod common;

use std::collections::HashSet;

use async_trait::async_trait;
use raft_journal::{
    ReplicationAppender, ReplicationClient, ReplicationError, ReplicationOptions,
    ReplicationRequest, ReplicationRequestHandler, ReplicationResponse, ReplicationResult,
    storage::log::RECORD_HEADER_SIZE,
};
use tempfile::TempDir;

use common::{fill, init_tracing, open_journal, payload, start_journal};

const PAYLOAD_LEN: usize = 100 - RECORD_HEADER_SIZE;

fn unbounded() -> ReplicationOptions {
    ReplicationOptions {
        max_response_size: usize::MAX,
        ..Default::default()
    }
}

fn limited(records: usize) -> ReplicationOptions {
    ReplicationOptions {
        max_response_size: records * 100,
        ..Default::default()
    }
}

/// Client that sends every message through its wire encoding.
struct WireClient {
    handler: ReplicationRequestHandler,
}

#[async_trait]
impl ReplicationClient for WireClient {
    async fn replicate(&self, request: ReplicationRequest) -> ReplicationResult<ReplicationResponse> {
        let request = ReplicationRequest::decode(&request.encode()?)?;
        let response = self.handler.on_replication_request(request).await?;
        ReplicationResponse::decode(&response.encode()?)
    }
}

#[tokio::test]
async fn test_from_start_returns_whole_log() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut journal = open_journal(dir.path(), 512);
    fill(&mut journal, 10, PAYLOAD_LEN);

    let handler = ReplicationRequestHandler::new(journal.view(), unbounded());
    let response = handler
        .on_replication_request(ReplicationRequest::from_start(journal.last_position()))
        .await
        .unwrap();

    assert!(response.valid);
    assert!(!response.has_more_available);
    assert_eq!(response.to_position, 10);
    let records = response.records().unwrap();
    assert_eq!(records.len(), 10);
    for (i, record) in records.iter().enumerate() {
        let position = i as u64 + 1;
        assert_eq!(record.position, position);
        assert_eq!(record.payload, payload(position, PAYLOAD_LEN));
    }
}

#[tokio::test]
async fn test_same_range_twice_is_byte_identical() {
    let dir = TempDir::new().unwrap();
    let mut journal = open_journal(dir.path(), 512);
    fill(&mut journal, 25, PAYLOAD_LEN);

    let handler = ReplicationRequestHandler::new(journal.view(), limited(7));
    let request = ReplicationRequest::after(4, 20);
    let first = handler.on_replication_request(request).await.unwrap();
    let second = handler.on_replication_request(request).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.encode().unwrap(), second.encode().unwrap());
}

#[tokio::test]
async fn test_pagination_continues_without_gaps_or_duplicates() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut journal = open_journal(dir.path(), 512);
    fill(&mut journal, 30, PAYLOAD_LEN);

    let handler = ReplicationRequestHandler::new(journal.view(), limited(4));
    let target = 27;

    let first = handler
        .on_replication_request(ReplicationRequest::from_start(target))
        .await
        .unwrap();
    assert!(first.has_more_available);
    assert!(first.to_position < target);

    let mut positions: Vec<u64> = first.records().unwrap().iter().map(|r| r.position).collect();
    let mut to_position = first.to_position;
    let mut has_more = first.has_more_available;
    while has_more {
        let response = handler
            .on_replication_request(ReplicationRequest::after(to_position, target))
            .await
            .unwrap();
        assert!(response.valid);
        assert!(response.payload.len() <= 400);
        positions.extend(response.records().unwrap().iter().map(|r| r.position));
        to_position = response.to_position;
        has_more = response.has_more_available;
    }

    assert_eq!(to_position, target);
    assert_eq!(positions, (1..=target).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_inclusive_request_starts_at_from_position() {
    let dir = TempDir::new().unwrap();
    let mut journal = open_journal(dir.path(), 512);
    fill(&mut journal, 10, PAYLOAD_LEN);
    let handler = ReplicationRequestHandler::new(journal.view(), unbounded());

    let inclusive = handler.handle(&ReplicationRequest::including(5, 8)).unwrap();
    let exclusive = handler.handle(&ReplicationRequest::after(5, 8)).unwrap();

    let first = |r: &ReplicationResponse| r.records().unwrap()[0].position;
    assert_eq!(first(&inclusive), 5);
    assert_eq!(first(&exclusive), 6);
    assert_eq!(inclusive.to_position, 8);
    assert_eq!(exclusive.to_position, 8);
}

#[tokio::test]
async fn test_request_beyond_the_log() {
    let dir = TempDir::new().unwrap();
    let mut journal = open_journal(dir.path(), 512);
    fill(&mut journal, 10, PAYLOAD_LEN);
    let handler = ReplicationRequestHandler::new(journal.view(), unbounded());

    // Caught up: valid and empty.
    let response = handler.handle(&ReplicationRequest::after(10, 20)).unwrap();
    assert!(response.valid);
    assert!(response.is_empty());
    assert_eq!(response.to_position, 10);

    // Never existed.
    let response = handler.handle(&ReplicationRequest::after(11, 20)).unwrap();
    assert!(!response.valid);
    assert!(response.is_empty());
}

#[tokio::test]
async fn test_compacted_from_position_is_invalid() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut journal = open_journal(dir.path(), 512);
    fill(&mut journal, 20, PAYLOAD_LEN);
    assert_eq!(journal.compact(10).unwrap(), 2);
    assert_eq!(journal.first_position(), 9);

    let handler = ReplicationRequestHandler::new(journal.view(), unbounded());
    let response = handler
        .on_replication_request(ReplicationRequest::after(3, 20))
        .await
        .unwrap();
    assert!(!response.valid);
    assert!(!response.has_more_available);
    assert!(response.payload.is_empty());

    // The first stored position is still served.
    let response = handler.handle(&ReplicationRequest::including(9, 20)).unwrap();
    assert!(response.valid);
    assert_eq!(response.records().unwrap()[0].position, 9);
}

#[tokio::test]
async fn test_follower_catches_up_through_wire_client() {
    init_tracing();
    let leader_dir = TempDir::new().unwrap();
    let follower_dir = TempDir::new().unwrap();
    let leader = start_journal(leader_dir.path(), 512);
    for position in 1..=40 {
        leader.append(1, payload(position, PAYLOAD_LEN)).await.unwrap();
    }

    let client = WireClient {
        handler: leader.replication_handler(limited(6)),
    };
    let follower = start_journal(follower_dir.path(), 512);
    let appender = ReplicationAppender::new(client, follower.clone());

    assert_eq!(appender.catch_up(40).await.unwrap(), 40);

    let leader_records: Vec<_> = leader.open_reader().map(|r| r.unwrap()).collect();
    let follower_records: Vec<_> = follower.open_reader().map(|r| r.unwrap()).collect();
    assert_eq!(leader_records, follower_records);
    assert_eq!(follower.stats().await.unwrap().last_flushed_position, 40);

    // Leader moves on, follower resumes where it stopped.
    for position in 41..=45 {
        leader.append(2, payload(position, PAYLOAD_LEN)).await.unwrap();
    }
    assert_eq!(appender.catch_up(45).await.unwrap(), 45);
    assert_eq!(follower.read_from(45).next().unwrap().unwrap().term, 2);
}

#[tokio::test]
async fn test_follower_behind_compaction_needs_snapshot() {
    let leader_dir = TempDir::new().unwrap();
    let follower_dir = TempDir::new().unwrap();
    let leader = start_journal(leader_dir.path(), 512);
    for position in 1..=20 {
        leader.append(1, payload(position, PAYLOAD_LEN)).await.unwrap();
    }

    let follower = start_journal(follower_dir.path(), 512);
    let appender = ReplicationAppender::new(
        WireClient {
            handler: leader.replication_handler(limited(3)),
        },
        follower.clone(),
    );
    appender.replicate_once(20).await.unwrap();
    assert_eq!(follower.last_position(), 3);

    leader.compact(12).await.unwrap();
    let err = appender.catch_up(20).await.unwrap_err();
    assert!(matches!(err, ReplicationError::SnapshotRequired(Some(3))));

    // A snapshot covering position 12 was installed; the log restarts after it.
    follower.reset(13).await.unwrap();
    assert_eq!(appender.catch_up(20).await.unwrap(), 20);
}

#[tokio::test]
async fn test_concurrent_requests_while_leader_appends() {
    let dir = TempDir::new().unwrap();
    let leader = start_journal(dir.path(), 512);
    for position in 1..=10 {
        leader.append(1, payload(position, PAYLOAD_LEN)).await.unwrap();
    }
    let handler = leader.replication_handler(limited(5));

    let requests: Vec<_> = (1..=8u64)
        .map(|from| {
            let handler = handler.clone();
            let request = tokio::spawn(async move {
                handler
                    .on_replication_request(ReplicationRequest::after(from, u64::MAX))
                    .await
            });
            (from, request)
        })
        .collect();
    for position in 11..=30 {
        leader.append(1, payload(position, PAYLOAD_LEN)).await.unwrap();
    }

    for (from, request) in requests {
        let response = request.await.unwrap().unwrap();
        assert!(response.valid);
        let positions: Vec<_> = response.records().unwrap().iter().map(|r| r.position).collect();
        let expected: Vec<_> = (from + 1..=response.to_position).collect();
        assert_eq!(positions, expected);
        let unique: HashSet<_> = positions.iter().collect();
        assert_eq!(unique.len(), positions.len());
    }
}
