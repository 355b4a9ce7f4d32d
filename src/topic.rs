//! Publication topics used between the node and its transport

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// A PrePrepare, Prepare or Commit for the other peers.
    ConsensusMessagePublish,
    /// A block that reached agreement and sits in the block pool.
    BlockConfirm,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Topic::ConsensusMessagePublish => "ConsensusMessagePublishEvent",
            Topic::BlockConfirm => "BlockConfirmEvent",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names() {
        assert_eq!(Topic::ConsensusMessagePublish.to_string(), "ConsensusMessagePublishEvent");
        assert_eq!(Topic::BlockConfirm.to_string(), "BlockConfirmEvent");
    }
}
