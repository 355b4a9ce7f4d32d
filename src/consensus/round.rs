//! Three-phase agreement state machine for a single round

use super::message::{CommitMsg, ConsensusMessage, PrePrepareMsg, PrepareMsg};
use super::types::{ConsensusId, SenderId};
use super::vote_store::{CommitMsgRepository, InsertOutcome, PrepareMsgRepository};
use crate::blockchain::{Block, BlockPool, PoolError};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum ConsensusError {
    /// Commit quorum was reached but the block pool refused the block.
    /// The round stays `Committed`; `outbound` still has to be published.
    Finalize {
        consensus_id: ConsensusId,
        source: PoolError,
        outbound: Vec<ConsensusMessage>,
    },
}

impl ConsensusError {
    /// Takes the votes that were produced before the failure.
    pub fn take_outbound(&mut self) -> Vec<ConsensusMessage> {
        match self {
            ConsensusError::Finalize { outbound, .. } => std::mem::take(outbound),
        }
    }
}

impl std::fmt::Display for ConsensusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsensusError::Finalize {
                consensus_id,
                source,
                ..
            } => write!(f, "Round {} could not finalize: {}", consensus_id, source),
        }
    }
}

impl std::error::Error for ConsensusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConsensusError::Finalize { source, .. } => Some(source),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Created,
    PrePrepared,
    Prepared,
    Committed,
    Finalized,
    Discarded,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Finalized | Phase::Discarded)
    }
}

/// Collaborators shared by every round of one coordinator.
pub struct RoundContext {
    pub local_id: SenderId,
    pub quorum: usize,
    pub prepares: Arc<PrepareMsgRepository>,
    pub commits: Arc<CommitMsgRepository>,
    pub pool: Arc<dyn BlockPool>,
}

/// What a round produced while handling one input.
#[derive(Debug, Default)]
pub struct RoundStep {
    pub outbound: Vec<ConsensusMessage>,
    pub finalized: Option<Block>,
}

pub struct ConsensusRound {
    id: ConsensusId,
    phase: Phase,
    proposal: Option<Block>,
    proposer: Option<SenderId>,
    created_at: Instant,
    closed_at: Option<Instant>,
    ctx: Arc<RoundContext>,
}

impl ConsensusRound {
    pub(crate) fn new(id: ConsensusId, ctx: Arc<RoundContext>) -> Self {
        ConsensusRound {
            id,
            phase: Phase::Created,
            proposal: None,
            proposer: None,
            created_at: Instant::now(),
            closed_at: None,
            ctx,
        }
    }

    pub fn id(&self) -> &ConsensusId {
        &self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The block fixed by the PrePrepare, if one has arrived.
    pub fn proposal(&self) -> Option<&Block> {
        self.proposal.as_ref()
    }

    pub fn proposer(&self) -> Option<&SenderId> {
        self.proposer.as_ref()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the round reached `Finalized` or `Discarded`.
    pub fn closed_at(&self) -> Option<Instant> {
        self.closed_at
    }

    pub fn prepare_count(&self) -> usize {
        self.ctx.prepares.count(&self.id)
    }

    /// Prepares that vote for the fixed proposal. Zero before PrePrepare.
    pub fn matching_prepare_count(&self) -> usize {
        let Some(proposal) = &self.proposal else {
            return 0;
        };
        self.ctx
            .prepares
            .find_by_consensus_id(&self.id)
            .iter()
            .filter(|vote| vote.proposed_block == *proposal)
            .count()
    }

    pub fn commit_count(&self) -> usize {
        self.ctx.commits.count(&self.id)
    }

    pub(crate) fn pre_prepare(&mut self, msg: PrePrepareMsg) -> Result<RoundStep, ConsensusError> {
        if self.phase != Phase::Created {
            debug!(
                consensus_id = %self.id,
                sender = %msg.sender_id,
                phase = ?self.phase,
                "Round: ignoring extra PrePrepare"
            );
            return Ok(RoundStep::default());
        }

        info!(
            consensus_id = %self.id,
            proposer = %msg.sender_id,
            height = msg.proposed_block.height(),
            "Round: block proposal fixed"
        );
        self.proposal = Some(msg.proposed_block);
        self.proposer = Some(msg.sender_id);
        self.phase = Phase::PrePrepared;

        let mut outbound = Vec::new();
        if let Some(prepare) = self.local_prepare() {
            outbound.push(prepare);
        }
        self.advance(outbound)
    }

    pub(crate) fn record_prepare(&mut self, msg: PrepareMsg) -> Result<RoundStep, ConsensusError> {
        if let Some(proposal) = &self.proposal {
            if msg.proposed_block != *proposal {
                warn!(
                    consensus_id = %self.id,
                    sender = %msg.sender_id,
                    hash = %msg.proposed_block.hash(),
                    "Round: Prepare for a different block does not count"
                );
            }
        }
        let sender = msg.sender_id.clone();
        let outcome = self.ctx.prepares.insert(msg);
        self.log_insert("Prepare", &sender, outcome);
        self.advance(Vec::new())
    }

    pub(crate) fn record_commit(&mut self, msg: CommitMsg) -> Result<RoundStep, ConsensusError> {
        let sender = msg.sender_id.clone();
        let outcome = self.ctx.commits.insert(msg);
        self.log_insert("Commit", &sender, outcome);
        self.advance(Vec::new())
    }

    /// Re-evaluates quorum from the current phase. Votes keep accumulating in
    /// `Created`, but nothing moves until a block has been fixed. Only
    /// Prepares for the fixed block count toward the prepare quorum.
    pub(crate) fn advance(
        &mut self,
        mut outbound: Vec<ConsensusMessage>,
    ) -> Result<RoundStep, ConsensusError> {
        let mut finalized = None;

        loop {
            match self.phase {
                Phase::PrePrepared if self.matching_prepare_count() >= self.ctx.quorum => {
                    self.phase = Phase::Prepared;
                    info!(consensus_id = %self.id, votes = self.matching_prepare_count(), "Round: prepare quorum reached");
                    if let Some(commit) = self.local_commit() {
                        outbound.push(commit);
                    }
                }
                Phase::Prepared if self.commit_count() >= self.ctx.quorum => {
                    self.phase = Phase::Committed;
                    info!(consensus_id = %self.id, votes = self.commit_count(), "Round: commit quorum reached");
                }
                Phase::Committed => {
                    let Some(block) = self.proposal.clone() else {
                        break;
                    };
                    if let Err(source) = self.ctx.pool.add(block.clone()) {
                        warn!(consensus_id = %self.id, error = %source, "Round: block pool rejected block");
                        return Err(ConsensusError::Finalize {
                            consensus_id: self.id.clone(),
                            source,
                            outbound,
                        });
                    }
                    self.release_votes();
                    self.close(Phase::Finalized);
                    info!(consensus_id = %self.id, height = block.height(), "Round: finalized");
                    finalized = Some(block);
                }
                _ => break,
            }
        }

        Ok(RoundStep {
            outbound,
            finalized,
        })
    }

    /// Abandons the round. Returns `false` if it was already terminal; vote
    /// entries are released either way.
    pub(crate) fn discard(&mut self) -> bool {
        self.release_votes();
        if self.phase.is_terminal() {
            return false;
        }
        info!(consensus_id = %self.id, phase = ?self.phase, "Round: discarded");
        self.close(Phase::Discarded);
        true
    }

    fn close(&mut self, phase: Phase) {
        self.phase = phase;
        self.closed_at = Some(Instant::now());
    }

    fn release_votes(&self) {
        self.ctx.prepares.delete_all(&self.id);
        self.ctx.commits.delete_all(&self.id);
    }

    fn local_prepare(&self) -> Option<ConsensusMessage> {
        if self.ctx.local_id.is_empty() {
            return None;
        }
        let block = self.proposal.clone()?;
        Some(ConsensusMessage::Prepare(PrepareMsg {
            consensus_id: self.id.clone(),
            sender_id: self.ctx.local_id.clone(),
            proposed_block: block,
        }))
    }

    fn local_commit(&self) -> Option<ConsensusMessage> {
        if self.ctx.local_id.is_empty() {
            return None;
        }
        Some(ConsensusMessage::Commit(CommitMsg {
            consensus_id: self.id.clone(),
            sender_id: self.ctx.local_id.clone(),
        }))
    }

    fn log_insert(&self, kind: &str, sender: &SenderId, outcome: InsertOutcome) {
        match outcome {
            InsertOutcome::Stored(count) => {
                debug!(consensus_id = %self.id, kind, sender = %sender, count, "Round: vote stored")
            }
            InsertOutcome::Duplicate => {
                debug!(consensus_id = %self.id, kind, sender = %sender, "Round: duplicate vote dropped")
            }
            InsertOutcome::InvalidSender => {
                debug!(consensus_id = %self.id, kind, "Round: vote without sender dropped")
            }
        }
    }
}
