//! Vote messages and their wire encoding

use super::types::{ConsensusId, SenderId};
use crate::blockchain::Block;
use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub enum CodecError {
    Json(serde_json::Error),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Json(e) => write!(f, "Message codec error: {}", e),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        CodecError::Json(err)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    PrePrepare,
    Prepare,
    Commit,
}

/// Proposer's broadcast of the candidate block for a round.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PrePrepareMsg {
    pub consensus_id: ConsensusId,
    pub sender_id: SenderId,
    pub proposed_block: Block,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PrepareMsg {
    pub consensus_id: ConsensusId,
    pub sender_id: SenderId,
    pub proposed_block: Block,
}

/// Carries no block: it is already fixed by the prepare phase.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CommitMsg {
    pub consensus_id: ConsensusId,
    pub sender_id: SenderId,
}

impl PrePrepareMsg {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl PrepareMsg {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl CommitMsg {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Self-describing envelope exchanged with the transport.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ConsensusMessage {
    PrePrepare(PrePrepareMsg),
    Prepare(PrepareMsg),
    Commit(CommitMsg),
}

impl ConsensusMessage {
    pub fn msg_type(&self) -> MessageType {
        match self {
            ConsensusMessage::PrePrepare(_) => MessageType::PrePrepare,
            ConsensusMessage::Prepare(_) => MessageType::Prepare,
            ConsensusMessage::Commit(_) => MessageType::Commit,
        }
    }

    pub fn consensus_id(&self) -> &ConsensusId {
        match self {
            ConsensusMessage::PrePrepare(msg) => &msg.consensus_id,
            ConsensusMessage::Prepare(msg) => &msg.consensus_id,
            ConsensusMessage::Commit(msg) => &msg.consensus_id,
        }
    }

    pub fn sender_id(&self) -> &SenderId {
        match self {
            ConsensusMessage::PrePrepare(msg) => &msg.sender_id,
            ConsensusMessage::Prepare(msg) => &msg.sender_id,
            ConsensusMessage::Commit(msg) => &msg.sender_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl From<PrePrepareMsg> for ConsensusMessage {
    fn from(msg: PrePrepareMsg) -> Self {
        ConsensusMessage::PrePrepare(msg)
    }
}

impl From<PrepareMsg> for ConsensusMessage {
    fn from(msg: PrepareMsg) -> Self {
        ConsensusMessage::Prepare(msg)
    }
}

impl From<CommitMsg> for ConsensusMessage {
    fn from(msg: CommitMsg) -> Self {
        ConsensusMessage::Commit(msg)
    }
}
