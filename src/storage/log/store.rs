//! Single-owner journal actor.
//!
//! One tokio task owns the [`SegmentedJournal`] and applies every mutation in
//! arrival order. Callers talk to it through a cloneable [`ManagedJournal`];
//! reads bypass the task entirely through a [`JournalView`].

use std::{io, time::Duration};

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{self, Interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    Position, Term,
    error::StorageError,
    replication::{
        ReplicationOptions, ReplicationRequestHandler, ReplicationResponse, append_replicated,
    },
    traits::{ReplicationResult, StorageResult},
};

use super::{
    journal::{JournalStats, JournalView, SegmentedJournal},
    reader::JournalReader,
    segment::SegmentInfo,
};

pub enum JournalOp {
    Append {
        term: Term,
        payload: Vec<u8>,
        response_tx: oneshot::Sender<StorageResult<Position>>,
    },
    AppendReplicated {
        response: ReplicationResponse,
        response_tx: oneshot::Sender<ReplicationResult<Position>>,
    },
    TruncateAfter {
        position: Position,
        response_tx: oneshot::Sender<StorageResult<()>>,
    },
    Compact {
        up_to: Position,
        response_tx: oneshot::Sender<StorageResult<usize>>,
    },
    Reset {
        next_position: Position,
        response_tx: oneshot::Sender<StorageResult<()>>,
    },
    Flush {
        response_tx: oneshot::Sender<StorageResult<Position>>,
    },
    Stats {
        response_tx: oneshot::Sender<JournalStats>,
    },
    Close {
        response_tx: oneshot::Sender<StorageResult<()>>,
    },
}

#[derive(Clone, Debug)]
pub struct JournalActorOptions {
    /// Max number of queued operations applied per wake-up
    pub batch_size: usize,
    /// Background flush period, used when the journal does not flush
    /// explicitly on every append
    pub flush_interval: Duration,
}

impl Default for JournalActorOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_secs(1),
        }
    }
}

/// Handle on a journal owned by a background task.
#[derive(Clone)]
pub struct ManagedJournal {
    view: JournalView,
    op_sender: mpsc::UnboundedSender<JournalOp>,
}

impl ManagedJournal {
    /// Move `journal` into a new task and return a handle to it.
    pub fn start(journal: SegmentedJournal, options: JournalActorOptions) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let view = journal.view();
        let handle = tokio::spawn(run(journal, rx, options));
        (
            Self {
                view,
                op_sender: tx,
            },
            handle,
        )
    }

    async fn request<T>(
        &self,
        op: impl FnOnce(oneshot::Sender<T>) -> JournalOp,
    ) -> StorageResult<T> {
        let (tx, rx) = oneshot::channel();
        self.op_sender.send(op(tx)).map_err(|_| {
            warn!("Failed to send journal request: journal task stopped");
            StorageError::Closed
        })?;

        rx.await.map_err(|e| {
            warn!("Failed to receive journal response: {}", e);
            StorageError::Closed
        })
    }

    pub async fn append(&self, term: Term, payload: Vec<u8>) -> StorageResult<Position> {
        self.request(|response_tx| JournalOp::Append {
            term,
            payload,
            response_tx,
        })
        .await?
    }

    /// Apply a replication response received from the leader.
    pub async fn append_replicated(
        &self,
        response: ReplicationResponse,
    ) -> ReplicationResult<Position> {
        self.request(|response_tx| JournalOp::AppendReplicated {
            response,
            response_tx,
        })
        .await?
    }

    pub async fn truncate_after(&self, position: Position) -> StorageResult<()> {
        self.request(|response_tx| JournalOp::TruncateAfter {
            position,
            response_tx,
        })
        .await?
    }

    pub async fn compact(&self, up_to: Position) -> StorageResult<usize> {
        self.request(|response_tx| JournalOp::Compact { up_to, response_tx })
            .await?
    }

    pub async fn reset(&self, next_position: Position) -> StorageResult<()> {
        self.request(|response_tx| JournalOp::Reset {
            next_position,
            response_tx,
        })
        .await?
    }

    /// Flush and return the last flushed position.
    pub async fn flush(&self) -> StorageResult<Position> {
        self.request(|response_tx| JournalOp::Flush { response_tx })
            .await?
    }

    pub async fn stats(&self) -> StorageResult<JournalStats> {
        self.request(|response_tx| JournalOp::Stats { response_tx })
            .await
    }

    /// Flush and stop the journal task. Later requests fail with
    /// `StorageError::Closed`.
    pub async fn close(&self) -> StorageResult<()> {
        self.request(|response_tx| JournalOp::Close { response_tx })
            .await?
    }

    pub fn view(&self) -> JournalView {
        self.view.clone()
    }

    pub fn first_position(&self) -> Position {
        self.view.first_position()
    }

    pub fn last_position(&self) -> Position {
        self.view.last_position()
    }

    pub fn segments(&self) -> Vec<SegmentInfo> {
        self.view.segments()
    }

    pub fn read_from(&self, position: Position) -> JournalReader {
        self.view.read_from(position)
    }

    pub fn open_reader(&self) -> JournalReader {
        self.view.open_reader()
    }

    pub fn replication_handler(&self, options: ReplicationOptions) -> ReplicationRequestHandler {
        ReplicationRequestHandler::new(self.view(), options)
    }
}

async fn run(
    mut journal: SegmentedJournal,
    mut receiver: mpsc::UnboundedReceiver<JournalOp>,
    options: JournalActorOptions,
) {
    let batch_size = options.batch_size.max(1);
    let mut flush_timer = if journal.options().flush_explicitly {
        None
    } else {
        let mut interval = time::interval(options.flush_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(interval)
    };

    loop {
        let mut buf = Vec::with_capacity(batch_size);
        tokio::select! {
            size = receiver.recv_many(&mut buf, batch_size) => {
                if size == 0 {
                    debug!("Journal receiver closed");
                    break;
                }
                if !process_ops(&mut journal, buf) {
                    break;
                }
            }
            _ = tick(&mut flush_timer) => {
                if let Err(e) = journal.flush() {
                    warn!("Background flush of journal {} failed: {}", journal.options().name, e);
                }
            }
        }
    }

    if let Err(e) = journal.close() {
        warn!("Failed to close journal {}: {}", journal.options().name, e);
    }
    info!("Journal task for {} stopped", journal.options().name);
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

type PendingAppend = (oneshot::Sender<StorageResult<Position>>, StorageResult<Position>);

/// Apply one batch in order. Consecutive appends share a single flush.
/// Returns false once the journal was closed.
fn process_ops(journal: &mut SegmentedJournal, ops: Vec<JournalOp>) -> bool {
    let mut pending: Vec<PendingAppend> = Vec::new();
    let mut running = true;

    for op in ops {
        match op {
            JournalOp::Append {
                term,
                payload,
                response_tx,
            } => {
                let result = journal.append_unflushed(term, &payload);
                pending.push((response_tx, result));
            }
            other => {
                complete_appends(journal, &mut pending);
                running &= apply(journal, other);
            }
        }
    }

    complete_appends(journal, &mut pending);
    running
}

fn apply(journal: &mut SegmentedJournal, op: JournalOp) -> bool {
    match op {
        JournalOp::Append {
            term,
            payload,
            response_tx,
        } => {
            let _ = response_tx.send(journal.append(term, &payload));
        }
        JournalOp::AppendReplicated {
            response,
            response_tx,
        } => {
            let _ = response_tx.send(append_replicated(journal, &response));
        }
        JournalOp::TruncateAfter {
            position,
            response_tx,
        } => {
            let _ = response_tx.send(journal.truncate_after(position));
        }
        JournalOp::Compact { up_to, response_tx } => {
            let _ = response_tx.send(journal.compact(up_to));
        }
        JournalOp::Reset {
            next_position,
            response_tx,
        } => {
            let _ = response_tx.send(journal.reset(next_position));
        }
        JournalOp::Flush { response_tx } => {
            let result = journal.flush().map(|_| journal.last_flushed_position());
            let _ = response_tx.send(result);
        }
        JournalOp::Stats { response_tx } => {
            let _ = response_tx.send(journal.stats());
        }
        JournalOp::Close { response_tx } => {
            let _ = response_tx.send(journal.close());
            return false;
        }
    }
    true
}

fn complete_appends(journal: &mut SegmentedJournal, pending: &mut Vec<PendingAppend>) {
    if pending.is_empty() {
        return;
    }

    let flush_error = if journal.options().flush_explicitly && pending.iter().any(|(_, r)| r.is_ok())
    {
        journal.flush().err()
    } else {
        None
    };

    for (response_tx, result) in pending.drain(..) {
        let result = match (&flush_error, result) {
            (Some(e), Ok(_)) => Err(StorageError::Io(io::Error::other(format!(
                "flush failed: {}",
                e
            )))),
            (_, result) => result,
        };
        let _ = response_tx.send(result);
    }
}
