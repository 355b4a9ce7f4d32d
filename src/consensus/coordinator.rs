//! Routes proposals and votes to in-flight rounds and reaps finished ones

use super::message::{ConsensusMessage, PrePrepareMsg};
use super::round::{ConsensusError, ConsensusRound, Phase, RoundContext, RoundStep};
use super::types::{ConsensusId, SenderId};
use super::vote_store::{CommitMsgRepository, PrepareMsgRepository};
use crate::blockchain::{Block, BlockPool};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteStatus {
    /// Handed to the round.
    Accepted,
    /// Malformed input (empty sender); nothing stored.
    Dropped,
    /// A proposal for a round that already has one.
    Duplicate,
    /// The round already finished, or was collected and is remembered as
    /// such.
    Late,
}

#[derive(Debug)]
pub struct RouteOutcome {
    pub status: RouteStatus,
    pub consensus_id: Option<ConsensusId>,
    pub phase: Option<Phase>,
    /// Votes this node should publish (and apply to itself).
    pub outbound: Vec<ConsensusMessage>,
    /// Present when this call finalized the round.
    pub finalized: Option<Block>,
}

impl RouteOutcome {
    pub(crate) fn dropped() -> Self {
        RouteOutcome {
            status: RouteStatus::Dropped,
            consensus_id: None,
            phase: None,
            outbound: Vec::new(),
            finalized: None,
        }
    }

    fn without_step(status: RouteStatus, id: ConsensusId, phase: Phase) -> Self {
        RouteOutcome {
            status,
            consensus_id: Some(id),
            phase: Some(phase),
            outbound: Vec::new(),
            finalized: None,
        }
    }

    fn collected(id: ConsensusId) -> Self {
        RouteOutcome {
            status: RouteStatus::Late,
            consensus_id: Some(id),
            phase: None,
            outbound: Vec::new(),
            finalized: None,
        }
    }

    fn accepted(id: ConsensusId, phase: Phase, step: RoundStep) -> Self {
        RouteOutcome {
            status: RouteStatus::Accepted,
            consensus_id: Some(id),
            phase: Some(phase),
            outbound: step.outbound,
            finalized: step.finalized,
        }
    }
}

type SharedRound = Arc<Mutex<ConsensusRound>>;

/// How many collected round ids are remembered to reject retransmissions.
pub const COLLECTED_HISTORY: usize = 8192;

/// Bounded FIFO set of round ids that were garbage collected.
struct Tombstones {
    ids: HashSet<ConsensusId>,
    order: VecDeque<ConsensusId>,
    capacity: usize,
}

impl Tombstones {
    fn new(capacity: usize) -> Self {
        Tombstones {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn contains(&self, id: &ConsensusId) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: ConsensusId) {
        if self.capacity == 0 || !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// Live rounds plus the ids of rounds already collected. Both sit behind
/// one lock so a collected id can never be recreated as a shell.
struct RoundTable {
    live: HashMap<ConsensusId, SharedRound>,
    collected: Tombstones,
}

/// Owns every in-flight round of this node.
///
/// The map lock is only held to find or insert a round; each round has its
/// own lock so unrelated rounds never contend.
pub struct ConsensusCoordinator {
    rounds: RwLock<RoundTable>,
    ctx: Arc<RoundContext>,
    gc_grace: Duration,
}

impl ConsensusCoordinator {
    pub fn new(
        local_id: SenderId,
        quorum: usize,
        gc_grace: Duration,
        pool: Arc<dyn BlockPool>,
    ) -> Self {
        Self::with_history(local_id, quorum, gc_grace, pool, COLLECTED_HISTORY)
    }

    /// Like [`ConsensusCoordinator::new`] with an explicit bound on the
    /// remembered collected ids.
    pub fn with_history(
        local_id: SenderId,
        quorum: usize,
        gc_grace: Duration,
        pool: Arc<dyn BlockPool>,
        history: usize,
    ) -> Self {
        ConsensusCoordinator {
            rounds: RwLock::new(RoundTable {
                live: HashMap::new(),
                collected: Tombstones::new(history),
            }),
            ctx: Arc::new(RoundContext {
                local_id,
                quorum,
                prepares: Arc::new(PrepareMsgRepository::new()),
                commits: Arc::new(CommitMsgRepository::new()),
                pool,
            }),
            gc_grace,
        }
    }

    pub fn local_id(&self) -> &SenderId {
        &self.ctx.local_id
    }

    pub fn quorum(&self) -> usize {
        self.ctx.quorum
    }

    pub fn prepare_votes(&self) -> &PrepareMsgRepository {
        &self.ctx.prepares
    }

    pub fn commit_votes(&self) -> &CommitMsgRepository {
        &self.ctx.commits
    }

    /// Starts a round for `block` proposed by `sender_id`.
    ///
    /// A round that only holds early votes adopts the proposal; a round that
    /// already has one is left untouched.
    pub fn route_proposal(
        &self,
        block: Block,
        sender_id: SenderId,
    ) -> Result<RouteOutcome, ConsensusError> {
        if sender_id.is_empty() {
            return Ok(RouteOutcome::dropped());
        }

        let id = ConsensusId::for_block(&block);
        let Some(round) = self.locate_or_create(&id) else {
            debug!(consensus_id = %id, "Coordinator: proposal for collected round ignored");
            return Ok(RouteOutcome::collected(id));
        };
        let mut round = round.lock();
        if round.phase() != Phase::Created {
            debug!(consensus_id = %id, "Coordinator: duplicate proposal ignored");
            return Ok(RouteOutcome::without_step(RouteStatus::Duplicate, id, round.phase()));
        }

        let pre_prepare = PrePrepareMsg {
            consensus_id: id.clone(),
            sender_id,
            proposed_block: block,
        };
        let mut step = round.pre_prepare(pre_prepare.clone())?;
        step.outbound.insert(0, ConsensusMessage::PrePrepare(pre_prepare));
        Ok(RouteOutcome::accepted(id, round.phase(), step))
    }

    /// Delivers an inbound message to its round, creating a shell round for
    /// ids not seen yet.
    pub fn route_vote(&self, message: ConsensusMessage) -> Result<RouteOutcome, ConsensusError> {
        if message.sender_id().is_empty() {
            debug!(consensus_id = %message.consensus_id(), "Coordinator: message without sender dropped");
            return Ok(RouteOutcome::dropped());
        }

        let id = message.consensus_id().clone();
        let Some(round) = self.locate_or_create(&id) else {
            debug!(consensus_id = %id, "Coordinator: message for collected round ignored");
            return Ok(RouteOutcome::collected(id));
        };
        let mut round = round.lock();
        if round.phase().is_terminal() {
            debug!(consensus_id = %id, phase = ?round.phase(), "Coordinator: late message ignored");
            return Ok(RouteOutcome::without_step(RouteStatus::Late, id, round.phase()));
        }

        let step = match message {
            ConsensusMessage::PrePrepare(msg) => round.pre_prepare(msg)?,
            ConsensusMessage::Prepare(msg) => round.record_prepare(msg)?,
            ConsensusMessage::Commit(msg) => round.record_commit(msg)?,
        };
        Ok(RouteOutcome::accepted(id, round.phase(), step))
    }

    /// Re-attempts handing a `Committed` round's block to the pool.
    pub fn retry_finalize(&self, id: &ConsensusId) -> Result<Option<Block>, ConsensusError> {
        let Some(round) = self.get(id) else {
            return Ok(None);
        };
        let mut round = round.lock();
        if round.phase() != Phase::Committed {
            return Ok(None);
        }
        Ok(round.advance(Vec::new())?.finalized)
    }

    /// Abandons a round. Unknown or already finished rounds are a no-op.
    pub fn discard(&self, id: &ConsensusId) -> bool {
        match self.get(id) {
            Some(round) => round.lock().discard(),
            None => false,
        }
    }

    /// Discards every unfinished round created more than `max_age` ago.
    pub fn discard_stale(&self, max_age: Duration) -> Vec<ConsensusId> {
        let now = Instant::now();
        self.snapshot()
            .into_iter()
            .filter_map(|(id, round)| {
                let mut round = round.lock();
                let stale = now.saturating_duration_since(round.created_at()) >= max_age;
                (stale && round.discard()).then_some(id)
            })
            .collect()
    }

    /// Removes terminal rounds whose grace period ended before `now` and
    /// remembers their ids so retransmissions are answered as `Late`.
    ///
    /// Round locks are taken on a snapshot; the map lock is only held for
    /// the removal itself.
    pub fn collect_garbage(&self, now: Instant) -> usize {
        let expired: Vec<ConsensusId> = self
            .snapshot()
            .into_iter()
            .filter(|(_, round)| {
                let round = round.lock();
                match round.closed_at() {
                    Some(closed_at) if round.phase().is_terminal() => {
                        now.saturating_duration_since(closed_at) >= self.gc_grace
                    }
                    _ => false,
                }
            })
            .map(|(id, _)| id)
            .collect();

        if expired.is_empty() {
            return 0;
        }

        // Terminal rounds never leave their phase, so the decision above
        // still holds once the write lock is taken.
        let mut table = self.rounds.write();
        let mut removed = 0;
        for id in expired {
            if table.live.remove(&id).is_some() {
                table.collected.insert(id);
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, remaining = table.live.len(), "Coordinator: collected finished rounds");
        }
        removed
    }

    /// Number of collected round ids currently remembered.
    pub fn collected_count(&self) -> usize {
        self.rounds.read().collected.len()
    }

    pub fn phase(&self, id: &ConsensusId) -> Option<Phase> {
        self.get(id).map(|round| round.lock().phase())
    }

    pub fn round_count(&self) -> usize {
        self.rounds.read().live.len()
    }

    fn get(&self, id: &ConsensusId) -> Option<SharedRound> {
        self.rounds.read().live.get(id).cloned()
    }

    fn snapshot(&self) -> Vec<(ConsensusId, SharedRound)> {
        self.rounds
            .read()
            .live
            .iter()
            .map(|(id, round)| (id.clone(), round.clone()))
            .collect()
    }

    /// `None` when the id belongs to a round that was already collected.
    fn locate_or_create(&self, id: &ConsensusId) -> Option<SharedRound> {
        if let Some(round) = self.get(id) {
            return Some(round);
        }
        let mut table = self.rounds.write();
        if table.collected.contains(id) {
            return None;
        }
        let ctx = self.ctx.clone();
        let round = table.live.entry(id.clone()).or_insert_with(|| {
            debug!(consensus_id = %id, "Coordinator: round created");
            Arc::new(Mutex::new(ConsensusRound::new(id.clone(), ctx)))
        });
        Some(round.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::{BlockPoolModel, BLOCK_QUEUED_AID};
    use crate::consensus::message::{CommitMsg, PrepareMsg};
    use crate::eventstore::{EventJournal, MemoryJournal};

    fn coordinator(quorum: usize, gc_grace: Duration) -> ConsensusCoordinator {
        let pool = Arc::new(BlockPoolModel::new(Arc::new(MemoryJournal::new())));
        ConsensusCoordinator::new(SenderId::from("self"), quorum, gc_grace, pool)
    }

    fn block(height: u64) -> Block {
        Block::new(height, format!("hash_{}", height - 1), b"tx".to_vec(), 1234567890)
    }

    fn commit(id: &ConsensusId, sender: &str) -> ConsensusMessage {
        ConsensusMessage::Commit(CommitMsg {
            consensus_id: id.clone(),
            sender_id: SenderId::from(sender),
        })
    }

    #[test]
    fn test_route_proposal_emits_pre_prepare_and_prepare() {
        let coordinator = coordinator(3, Duration::from_secs(30));

        let outcome = coordinator
            .route_proposal(block(1), SenderId::from("self"))
            .unwrap();

        assert_eq!(outcome.status, RouteStatus::Accepted);
        assert_eq!(outcome.phase, Some(Phase::PrePrepared));
        assert_eq!(outcome.outbound.len(), 2);
        assert!(matches!(outcome.outbound[0], ConsensusMessage::PrePrepare(_)));
        assert!(matches!(outcome.outbound[1], ConsensusMessage::Prepare(_)));
    }

    #[test]
    fn test_duplicate_proposal_is_noop() {
        let coordinator = coordinator(3, Duration::from_secs(30));
        coordinator.route_proposal(block(1), SenderId::from("self")).unwrap();

        let outcome = coordinator
            .route_proposal(block(1), SenderId::from("other"))
            .unwrap();

        assert_eq!(outcome.status, RouteStatus::Duplicate);
        assert!(outcome.outbound.is_empty());
        assert_eq!(coordinator.round_count(), 1);
    }

    #[test]
    fn test_unknown_round_gets_shell() {
        let coordinator = coordinator(3, Duration::from_secs(30));
        let id = ConsensusId::from("early");

        let outcome = coordinator.route_vote(commit(&id, "A")).unwrap();

        assert_eq!(outcome.status, RouteStatus::Accepted);
        assert_eq!(coordinator.phase(&id), Some(Phase::Created));
        assert_eq!(coordinator.commit_votes().count(&id), 1);
    }

    #[test]
    fn test_empty_sender_dropped_without_creating_round() {
        let coordinator = coordinator(3, Duration::from_secs(30));

        let outcome = coordinator
            .route_vote(commit(&ConsensusId::from("r1"), ""))
            .unwrap();

        assert_eq!(outcome.status, RouteStatus::Dropped);
        assert_eq!(coordinator.round_count(), 0);
    }

    #[test]
    fn test_late_votes_are_not_stored() {
        let coordinator = coordinator(3, Duration::from_secs(30));
        let id = ConsensusId::from("r1");
        coordinator.route_vote(commit(&id, "A")).unwrap();
        assert!(coordinator.discard(&id));

        let outcome = coordinator.route_vote(commit(&id, "B")).unwrap();

        assert_eq!(outcome.status, RouteStatus::Late);
        assert_eq!(coordinator.commit_votes().count(&id), 0);
    }

    #[test]
    fn test_collect_garbage_respects_grace_period() {
        let coordinator = coordinator(3, Duration::from_secs(60));
        let id = ConsensusId::from("r1");
        coordinator.route_vote(commit(&id, "A")).unwrap();
        coordinator.route_vote(commit(&ConsensusId::from("r2"), "A")).unwrap();
        coordinator.discard(&id);

        assert_eq!(coordinator.collect_garbage(Instant::now()), 0);
        assert_eq!(
            coordinator.collect_garbage(Instant::now() + Duration::from_secs(61)),
            1
        );
        assert_eq!(coordinator.phase(&id), None);
        assert_eq!(coordinator.round_count(), 1);
    }

    #[test]
    fn test_discard_stale_skips_finished_rounds() {
        let coordinator = coordinator(3, Duration::from_secs(60));
        let finished = ConsensusId::from("done");
        coordinator.route_vote(commit(&finished, "A")).unwrap();
        coordinator.discard(&finished);
        coordinator.route_vote(commit(&ConsensusId::from("open"), "A")).unwrap();

        let discarded = coordinator.discard_stale(Duration::ZERO);

        assert_eq!(discarded, vec![ConsensusId::from("open")]);
    }

    #[test]
    fn test_prepare_from_shell_adopted_by_proposal() {
        let coordinator = coordinator(2, Duration::from_secs(30));
        let proposed = block(2);
        let id = ConsensusId::for_block(&proposed);
        for sender in ["A", "B"] {
            coordinator
                .route_vote(ConsensusMessage::Prepare(PrepareMsg {
                    consensus_id: id.clone(),
                    sender_id: SenderId::from(sender),
                    proposed_block: proposed.clone(),
                }))
                .unwrap();
        }

        let outcome = coordinator
            .route_proposal(proposed, SenderId::from("leader"))
            .unwrap();

        assert_eq!(outcome.status, RouteStatus::Accepted);
        assert_eq!(outcome.phase, Some(Phase::Prepared));
        assert!(matches!(outcome.outbound.last(), Some(ConsensusMessage::Commit(_))));
    }

    fn prepare(id: &ConsensusId, sender: &str, block: &Block) -> ConsensusMessage {
        ConsensusMessage::Prepare(PrepareMsg {
            consensus_id: id.clone(),
            sender_id: SenderId::from(sender),
            proposed_block: block.clone(),
        })
    }

    #[test]
    fn test_collected_round_rejects_retransmissions() {
        let journal = Arc::new(MemoryJournal::new());
        let pool = Arc::new(BlockPoolModel::new(journal.clone()));
        let coordinator =
            ConsensusCoordinator::new(SenderId::from("self"), 1, Duration::from_secs(1), pool);
        let proposed = block(3);
        let id = ConsensusId::for_block(&proposed);

        coordinator.route_proposal(proposed.clone(), SenderId::from("leader")).unwrap();
        coordinator.route_vote(prepare(&id, "A", &proposed)).unwrap();
        let outcome = coordinator.route_vote(commit(&id, "A")).unwrap();
        assert_eq!(outcome.finalized, Some(proposed.clone()));

        let removed = coordinator.collect_garbage(Instant::now() + Duration::from_secs(5));
        assert_eq!(removed, 1);
        assert_eq!(coordinator.collected_count(), 1);

        let late = coordinator.route_vote(commit(&id, "B")).unwrap();
        assert_eq!(late.status, RouteStatus::Late);
        assert_eq!(coordinator.round_count(), 0);
        assert_eq!(coordinator.commit_votes().count(&id), 0);

        let replayed = coordinator
            .route_proposal(proposed.clone(), SenderId::from("leader"))
            .unwrap();
        assert_eq!(replayed.status, RouteStatus::Late);
        coordinator.route_vote(prepare(&id, "A", &proposed)).unwrap();

        assert_eq!(coordinator.round_count(), 0);
        assert_eq!(journal.load(BLOCK_QUEUED_AID).unwrap().len(), 1);
    }

    #[test]
    fn test_collected_history_is_bounded() {
        let pool = Arc::new(BlockPoolModel::new(Arc::new(MemoryJournal::new())));
        let coordinator = ConsensusCoordinator::with_history(
            SenderId::from("self"),
            3,
            Duration::ZERO,
            pool,
            1,
        );
        let first = ConsensusId::from("r1");
        let second = ConsensusId::from("r2");
        for id in [&first, &second] {
            coordinator.route_vote(commit(id, "A")).unwrap();
            coordinator.discard(id);
            coordinator.collect_garbage(Instant::now());
        }

        assert_eq!(coordinator.collected_count(), 1);
        assert_eq!(
            coordinator.route_vote(commit(&second, "B")).unwrap().status,
            RouteStatus::Late
        );
        assert_eq!(
            coordinator.route_vote(commit(&first, "B")).unwrap().status,
            RouteStatus::Accepted
        );
        assert_eq!(coordinator.round_count(), 1);
    }

    #[test]
    fn test_routing_proceeds_while_collector_waits_on_busy_round() {
        let coordinator = Arc::new(coordinator(3, Duration::ZERO));
        let busy = ConsensusId::from("busy");
        coordinator.route_vote(commit(&busy, "A")).unwrap();
        let done = ConsensusId::from("done");
        coordinator.route_vote(commit(&done, "A")).unwrap();
        coordinator.discard(&done);

        let round = coordinator.get(&busy).unwrap();
        let guard = round.lock();
        let collector = {
            let coordinator = coordinator.clone();
            std::thread::spawn(move || coordinator.collect_garbage(Instant::now()))
        };
        std::thread::sleep(Duration::from_millis(20));

        let routed = coordinator
            .route_vote(commit(&ConsensusId::from("r3"), "A"))
            .unwrap();
        assert_eq!(routed.status, RouteStatus::Accepted);

        drop(guard);
        assert_eq!(collector.join().unwrap(), 1);
        assert_eq!(coordinator.phase(&busy), Some(Phase::Created));
        assert_eq!(coordinator.phase(&done), None);
    }
}
