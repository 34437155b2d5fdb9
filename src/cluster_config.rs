use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{MemberId, Position, Term};

/// Cluster membership as last committed to the log. The meta store keeps the
/// most recent one so a restarting replica knows its peers before replaying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Position of the log entry that introduced this configuration.
    pub position: Position,
    /// Term in which the configuration was written.
    pub term: Term,
    /// Wall clock time (ms since epoch) the configuration was created.
    pub time: u64,
    pub voters: BTreeSet<MemberId>,
    pub learners: BTreeSet<MemberId>,
    /// Previous voter set while a joint configuration is in effect.
    pub old_voters: Option<BTreeSet<MemberId>>,
}

impl ClusterConfig {
    pub fn empty() -> Self {
        Self {
            position: 0,
            term: 0,
            time: 0,
            voters: BTreeSet::new(),
            learners: BTreeSet::new(),
            old_voters: None,
        }
    }

    pub fn simple(voters: impl IntoIterator<Item = MemberId>, position: Position, term: Term) -> Self {
        Self {
            position,
            term,
            time: now_millis(),
            voters: voters.into_iter().collect(),
            learners: BTreeSet::new(),
            old_voters: None,
        }
    }

    pub fn with_learners(
        voters: impl IntoIterator<Item = MemberId>,
        learners: impl IntoIterator<Item = MemberId>,
        position: Position,
        term: Term,
    ) -> Self {
        Self {
            learners: learners.into_iter().collect(),
            ..Self::simple(voters, position, term)
        }
    }

    /// Joint configuration: `old_voters` and the new `voters` both hold quorum.
    pub fn joint(
        old_voters: impl IntoIterator<Item = MemberId>,
        new_voters: impl IntoIterator<Item = MemberId>,
        position: Position,
        term: Term,
    ) -> Self {
        Self {
            old_voters: Some(old_voters.into_iter().collect()),
            ..Self::simple(new_voters, position, term)
        }
    }

    pub fn is_joint(&self) -> bool {
        self.old_voters.is_some()
    }

    pub fn is_voter(&self, id: &str) -> bool {
        self.voters.contains(id)
            || self
                .old_voters
                .as_ref()
                .is_some_and(|old| old.contains(id))
    }

    pub fn is_learner(&self, id: &str) -> bool {
        self.learners.contains(id)
    }

    pub fn members(&self) -> BTreeSet<MemberId> {
        let mut all = self.voters.clone();
        if let Some(old) = &self.old_voters {
            all.extend(old.iter().cloned());
        }
        all.extend(self.learners.iter().cloned());
        all
    }

    /// A configuration must keep a voter majority reachable and may not list
    /// the same member as voter and learner.
    pub fn is_valid(&self) -> bool {
        if self.voters.is_empty() {
            return false;
        }
        if self.old_voters.as_ref().is_some_and(|old| old.is_empty()) {
            return false;
        }
        !self.learners.iter().any(|l| self.is_voter(l))
    }
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
