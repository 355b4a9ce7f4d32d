//! Per-round vote repositories with sender deduplication

use super::message::{CommitMsg, PrepareMsg};
use super::types::{ConsensusId, SenderId};
use parking_lot::RwLock;
use std::collections::HashMap;

/// A vote that can be stored per round and deduplicated by sender.
pub trait Vote: Clone + Send + Sync {
    fn consensus_id(&self) -> &ConsensusId;
    fn sender_id(&self) -> &SenderId;
}

impl Vote for PrepareMsg {
    fn consensus_id(&self) -> &ConsensusId {
        &self.consensus_id
    }

    fn sender_id(&self) -> &SenderId {
        &self.sender_id
    }
}

impl Vote for CommitMsg {
    fn consensus_id(&self) -> &ConsensusId {
        &self.consensus_id
    }

    fn sender_id(&self) -> &SenderId {
        &self.sender_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Appended; carries the round's distinct-sender count afterwards.
    Stored(usize),
    /// The sender already voted in this round; the first vote is kept.
    Duplicate,
    /// Empty sender id; nothing stored.
    InvalidSender,
}

/// Append-only vote collections keyed by round.
///
/// One lock guards the whole map so the sender check and the append are a
/// single atomic step.
pub struct VoteStore<V: Vote> {
    votes: RwLock<HashMap<ConsensusId, Vec<V>>>,
}

pub type PrepareMsgRepository = VoteStore<PrepareMsg>;
pub type CommitMsgRepository = VoteStore<CommitMsg>;

impl<V: Vote> Default for VoteStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Vote> VoteStore<V> {
    pub fn new() -> Self {
        VoteStore {
            votes: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, vote: V) -> InsertOutcome {
        if vote.sender_id().is_empty() {
            return InsertOutcome::InvalidSender;
        }

        let mut votes = self.votes.write();
        let round = votes.entry(vote.consensus_id().clone()).or_default();
        if round.iter().any(|v| v.sender_id() == vote.sender_id()) {
            return InsertOutcome::Duplicate;
        }

        round.push(vote);
        InsertOutcome::Stored(round.len())
    }

    /// Snapshot of a round's votes in arrival order; empty if unknown.
    pub fn find_by_consensus_id(&self, id: &ConsensusId) -> Vec<V> {
        self.votes.read().get(id).cloned().unwrap_or_default()
    }

    pub fn count(&self, id: &ConsensusId) -> usize {
        self.votes.read().get(id).map_or(0, Vec::len)
    }

    pub fn delete_all(&self, id: &ConsensusId) {
        self.votes.write().remove(id);
    }

    /// Number of rounds currently holding votes.
    pub fn round_count(&self) -> usize {
        self.votes.read().len()
    }
}
