//! Block staging pool with an audited admission trail

use super::events::{LedgerEvent, BLOCK_QUEUED_AID};
use super::{Block, BlockHeight};
use crate::eventstore::{EventJournal, JournalError, JournalResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum PoolError {
    /// The queuing event could not be recorded; the block was not admitted.
    Journal(JournalError),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Journal(e) => write!(f, "Block queued event not recorded: {}", e),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<JournalError> for PoolError {
    fn from(err: JournalError) -> Self {
        PoolError::Journal(err)
    }
}

pub type PoolResult<T> = Result<T, PoolError>;

pub trait BlockPool: Send + Sync {
    /// Stores `block` under its height (last writer wins) and records
    /// exactly one `BlockQueued` event before returning.
    fn add(&self, block: Block) -> PoolResult<()>;

    fn get(&self, height: BlockHeight) -> Option<Block>;

    /// Removes the entry. Deletions are not journaled.
    fn delete(&self, height: BlockHeight);
}

pub struct BlockPoolModel {
    pool: RwLock<HashMap<BlockHeight, Block>>,
    journal: Arc<dyn EventJournal>,
}

impl BlockPoolModel {
    pub fn new(journal: Arc<dyn EventJournal>) -> Self {
        BlockPoolModel {
            pool: RwLock::new(HashMap::new()),
            journal,
        }
    }

    pub fn len(&self) -> usize {
        self.pool.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.read().is_empty()
    }

    /// Heights currently staged, ascending.
    pub fn heights(&self) -> Vec<BlockHeight> {
        let mut heights: Vec<_> = self.pool.read().keys().copied().collect();
        heights.sort_unstable();
        heights
    }
}

impl BlockPool for BlockPoolModel {
    fn add(&self, block: Block) -> PoolResult<()> {
        let height = block.height();

        // The write lock spans the journal write so no reader sees a block
        // without its event, and a failed write leaves the map untouched.
        let mut pool = self.pool.write();
        let event = LedgerEvent::block_queued(block.clone());
        let sequence = self.journal.save(BLOCK_QUEUED_AID, &event).map_err(|e| {
            warn!(height, error = %e, "BlockPool: failed to record block queued event");
            PoolError::from(e)
        })?;

        if pool.insert(height, block).is_some() {
            debug!(height, "BlockPool: replaced staged block");
        }
        info!(height, sequence, "BlockPool: block queued");
        Ok(())
    }

    fn get(&self, height: BlockHeight) -> Option<Block> {
        self.pool.read().get(&height).cloned()
    }

    fn delete(&self, height: BlockHeight) {
        if self.pool.write().remove(&height).is_some() {
            debug!(height, "BlockPool: block removed");
        }
    }
}

/// Every block ever queued, in admission order, rebuilt from the journal.
pub fn replay_queued_blocks(journal: &dyn EventJournal) -> JournalResult<Vec<Block>> {
    Ok(journal
        .load(BLOCK_QUEUED_AID)?
        .into_iter()
        .filter_map(|stored| match stored.event {
            LedgerEvent::BlockQueued { block } => Some(block),
            _ => None,
        })
        .collect())
}
