//! Event-sourced flag telling whether block synchronization is running.
//!
//! The state is never mutated directly: a transition is journaled under
//! [`BC_SYNC_STATE_AID`] first and then applied through the reducer, so the
//! current value can always be rebuilt by replaying the journal from empty.

use super::events::{LedgerEvent, BC_SYNC_STATE_AID};
use super::BlockHeight;
use crate::eventstore::{EventJournal, JournalResult};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing { target_height: BlockHeight },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockSyncState {
    status: SyncStatus,
}

impl BlockSyncState {
    pub fn id(&self) -> &'static str {
        BC_SYNC_STATE_AID
    }

    pub fn status(&self) -> SyncStatus {
        self.status
    }

    pub fn is_progress(&self) -> bool {
        matches!(self.status, SyncStatus::Syncing { .. })
    }

    /// Pure reducer over every `LedgerEvent`.
    pub fn apply(self, event: &LedgerEvent) -> Self {
        match event {
            LedgerEvent::BlockSyncStarted { target_height } => BlockSyncState {
                status: SyncStatus::Syncing {
                    target_height: *target_height,
                },
            },
            LedgerEvent::BlockSyncCompleted { .. } => BlockSyncState {
                status: SyncStatus::Idle,
            },
            // Pool admissions do not touch the sync flag.
            LedgerEvent::BlockQueued { .. } => self,
        }
    }

    pub fn replay<'a>(events: impl IntoIterator<Item = &'a LedgerEvent>) -> Self {
        events
            .into_iter()
            .fold(BlockSyncState::default(), |state, event| state.apply(event))
    }
}

/// Journals sync transitions and keeps the folded state in memory.
pub struct SyncStateRecorder {
    journal: Arc<dyn EventJournal>,
    state: RwLock<BlockSyncState>,
}

impl SyncStateRecorder {
    /// Rebuilds the current state from the journal.
    pub fn restore(journal: Arc<dyn EventJournal>) -> JournalResult<Self> {
        let history = journal.load(BC_SYNC_STATE_AID)?;
        let state = BlockSyncState::replay(history.iter().map(|stored| &stored.event));
        Ok(SyncStateRecorder {
            journal,
            state: RwLock::new(state),
        })
    }

    pub fn current(&self) -> BlockSyncState {
        *self.state.read()
    }

    pub fn begin(&self, target_height: BlockHeight) -> JournalResult<BlockSyncState> {
        self.record(LedgerEvent::BlockSyncStarted { target_height })
    }

    pub fn finish(&self, height: BlockHeight) -> JournalResult<BlockSyncState> {
        self.record(LedgerEvent::BlockSyncCompleted { height })
    }

    fn record(&self, event: LedgerEvent) -> JournalResult<BlockSyncState> {
        let mut state = self.state.write();
        self.journal.save(BC_SYNC_STATE_AID, &event)?;
        *state = state.apply(&event);
        info!(status = ?state.status(), "BlockSync: state changed");
        Ok(*state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::Block;
    use crate::eventstore::MemoryJournal;

    #[test]
    fn test_reducer_transitions() {
        let state = BlockSyncState::default();
        assert!(!state.is_progress());

        let state = state.apply(&LedgerEvent::BlockSyncStarted { target_height: 12 });
        assert_eq!(state.status(), SyncStatus::Syncing { target_height: 12 });

        let state = state.apply(&LedgerEvent::BlockSyncCompleted { height: 12 });
        assert_eq!(state.status(), SyncStatus::Idle);
    }

    #[test]
    fn test_block_queued_leaves_state_unchanged() {
        let syncing = BlockSyncState::default()
            .apply(&LedgerEvent::BlockSyncStarted { target_height: 3 });
        let block = Block::new(1, "0000_genesis", vec![], 0);

        assert_eq!(syncing.apply(&LedgerEvent::block_queued(block)), syncing);
    }

    #[test]
    fn test_replay_from_empty() {
        let events = vec![
            LedgerEvent::BlockSyncStarted { target_height: 5 },
            LedgerEvent::BlockSyncCompleted { height: 5 },
            LedgerEvent::BlockSyncStarted { target_height: 9 },
        ];

        let state = BlockSyncState::replay(&events);
        assert!(state.is_progress());
        assert_eq!(BlockSyncState::replay(std::iter::empty()), BlockSyncState::default());
    }

    #[test]
    fn test_recorder_restores_from_journal() {
        let journal = Arc::new(MemoryJournal::new());
        let recorder = SyncStateRecorder::restore(journal.clone()).unwrap();

        recorder.begin(20).unwrap();
        assert!(recorder.current().is_progress());

        let restored = SyncStateRecorder::restore(journal.clone()).unwrap();
        assert_eq!(restored.current(), recorder.current());

        recorder.finish(20).unwrap();
        let restored = SyncStateRecorder::restore(journal.clone()).unwrap();
        assert!(!restored.current().is_progress());
        assert_eq!(journal.load(BC_SYNC_STATE_AID).unwrap().len(), 2);
    }
}
