//! Three-phase Byzantine agreement on the next block
//!
//! ## Structure
//! - `types.rs` - round and sender identifiers
//! - `message.rs` - PrePrepare / Prepare / Commit messages and wire codec
//! - `vote_store.rs` - per-round vote repositories with sender dedup
//! - `round.rs` - the per-round state machine
//! - `coordinator.rs` - routing, discard and garbage collection of rounds
//! - `tests.rs` - cross-component scenarios

pub use coordinator::{ConsensusCoordinator, RouteOutcome, RouteStatus};
pub use message::{CodecError, CommitMsg, ConsensusMessage, MessageType, PrePrepareMsg, PrepareMsg};
pub use round::{ConsensusError, ConsensusRound, Phase};
pub use types::{ConsensusId, SenderId};
pub use vote_store::{CommitMsgRepository, InsertOutcome, PrepareMsgRepository, Vote, VoteStore};

pub mod coordinator;
pub mod message;
pub mod round;
pub mod types;
pub mod vote_store;
