//! Domain events recorded in the event journal

use super::{Block, BlockHeight};
use serde::{Deserialize, Serialize};

/// Aggregate id of the block pool's event stream.
pub const BLOCK_QUEUED_AID: &str = "BLOCK_QUEUED_AID";

/// Aggregate id of the block synchronization state.
pub const BC_SYNC_STATE_AID: &str = "BC_SYNC_STATE_AID";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum LedgerEvent {
    /// A block was admitted to the block pool.
    BlockQueued { block: Block },
    /// Catch-up with the rest of the cluster began.
    BlockSyncStarted { target_height: BlockHeight },
    /// Catch-up finished at the given height.
    BlockSyncCompleted { height: BlockHeight },
}

impl LedgerEvent {
    pub fn block_queued(block: Block) -> Self {
        LedgerEvent::BlockQueued { block }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            LedgerEvent::BlockQueued { .. } => "BlockQueued",
            LedgerEvent::BlockSyncStarted { .. } => "BlockSyncStarted",
            LedgerEvent::BlockSyncCompleted { .. } => "BlockSyncCompleted",
        }
    }
}
