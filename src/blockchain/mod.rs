//! Block value type and the staging pool that holds agreed blocks.
//!
//! ## Structure
//! - `pool.rs` - `BlockPool` trait and the journaled `BlockPoolModel`
//! - `events.rs` - domain events written to the event journal
//! - `sync_state.rs` - event-sourced block synchronization flag

pub mod events;
pub mod pool;
pub mod sync_state;

pub use events::{LedgerEvent, BC_SYNC_STATE_AID, BLOCK_QUEUED_AID};
pub use pool::{replay_queued_blocks, BlockPool, BlockPoolModel, PoolError, PoolResult};
pub use sync_state::{BlockSyncState, SyncStateRecorder, SyncStatus};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub type BlockHeight = u64;

/// Immutable block as seen by the agreement core.
///
/// Only the height is interpreted here; everything else is forwarded as-is
/// to the storage layer once agreement is reached.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Block {
    height: BlockHeight,
    timestamp: i64,
    payload: Vec<u8>,
    previous_hash: String,
    hash: String,
}

impl Block {
    pub fn new(
        height: BlockHeight,
        previous_hash: impl Into<String>,
        payload: Vec<u8>,
        timestamp: i64,
    ) -> Self {
        let previous_hash = previous_hash.into();
        let hash = Self::digest(height, timestamp, &payload, &previous_hash);
        Block {
            height,
            timestamp,
            payload,
            previous_hash,
            hash,
        }
    }

    fn digest(height: BlockHeight, timestamp: i64, payload: &[u8], previous_hash: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(height.to_be_bytes());
        hasher.update(timestamp.to_be_bytes());
        hasher.update(payload);
        hasher.update(previous_hash.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn height(&self) -> BlockHeight {
        self.height
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Hash of the predecessor block.
    pub fn previous_hash(&self) -> &str {
        &self.previous_hash
    }

    /// SHA-256 content digest, hex encoded.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Recomputes the digest and compares it with the carried one.
    pub fn verify_hash(&self) -> bool {
        Self::digest(self.height, self.timestamp, &self.payload, &self.previous_hash) == self.hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_hash_calculation() {
        let block = Block::new(1, "0000_genesis", b"tx-1".to_vec(), 1234567890);

        assert_eq!(block.hash().len(), 64);
        assert!(block.verify_hash());
    }

    #[test]
    fn test_block_hash_consistency() {
        let block1 = Block::new(1, "0000_genesis", b"tx-1".to_vec(), 1234567890);
        let block2 = block1.clone();

        assert_eq!(block1.hash(), block2.hash());
        assert_eq!(block1, block2);
    }

    #[test]
    fn test_block_hash_covers_predecessor() {
        let block1 = Block::new(2, "hash_a", b"tx".to_vec(), 1234567890);
        let block2 = Block::new(2, "hash_b", b"tx".to_vec(), 1234567890);

        assert_ne!(block1.hash(), block2.hash());
    }

    #[test]
    fn test_tampered_block_fails_verification() {
        let block = Block::new(3, "0000_genesis", b"original".to_vec(), 1234567890);
        let mut json: serde_json::Value = serde_json::to_value(&block).unwrap();
        json["payload"] = serde_json::json!([1, 2, 3]);

        let tampered: Block = serde_json::from_value(json).unwrap();
        assert!(!tampered.verify_hash());
    }
}
