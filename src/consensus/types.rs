//! Identifiers shared by messages, vote stores and rounds

use crate::blockchain::Block;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one agreement round; fixed once the round starts.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ConsensusId(String);

impl ConsensusId {
    pub fn new(id: impl Into<String>) -> Self {
        ConsensusId(id.into())
    }

    /// Round id for a proposed block: `"<height>:<hash>"`.
    pub fn for_block(block: &Block) -> Self {
        ConsensusId(format!("{}:{}", block.height(), block.hash()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsensusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConsensusId {
    fn from(id: &str) -> Self {
        ConsensusId::new(id)
    }
}

/// Peer that sent a vote. An empty id marks an invalid vote.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[serde(transparent)]
pub struct SenderId(String);

impl SenderId {
    pub fn new(id: impl Into<String>) -> Self {
        SenderId(id.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SenderId {
    fn from(id: &str) -> Self {
        SenderId::new(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consensus_id_for_block() {
        let block = Block::new(4, "hash_3", b"data".to_vec(), 1234567890);
        let id = ConsensusId::for_block(&block);

        assert!(id.as_str().starts_with("4:"));
        assert!(id.as_str().ends_with(block.hash()));
        assert_eq!(id, ConsensusId::for_block(&block.clone()));
    }

    #[test]
    fn test_sender_id_empty() {
        assert!(SenderId::default().is_empty());
        assert!(!SenderId::from("A").is_empty());
    }

    #[test]
    fn test_ids_serialize_as_plain_strings() {
        let json = serde_json::to_string(&ConsensusId::from("r1")).unwrap();
        assert_eq!(json, "\"r1\"");
    }
}
