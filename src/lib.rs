//! Agreement core of a ledger node: three-phase Byzantine agreement on the
//! next block, vote repositories, and the journaled block pool that receives
//! agreed blocks.

pub mod blockchain;
pub mod config;
pub mod consensus;
pub mod eventstore;
pub mod logger;
pub mod node;
pub mod topic;

pub use blockchain::{Block, BlockHeight, BlockPool, BlockPoolModel};
pub use config::NodeConfig;
pub use consensus::{ConsensusCoordinator, ConsensusId, ConsensusMessage, Phase, SenderId};
pub use eventstore::{EventJournal, MemoryJournal, SqliteJournal};
