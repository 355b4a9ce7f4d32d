//! Append-only event journal used to make state transitions replayable.

mod sqlite;

pub use sqlite::SqliteJournal;

use crate::blockchain::LedgerEvent;
use chrono::prelude::*;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Custom error type for journal operations
#[derive(Debug)]
pub enum JournalError {
    Sqlite(rusqlite::Error),
    Serialization(String),
    Unavailable(String),
}

impl std::fmt::Display for JournalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JournalError::Sqlite(e) => write!(f, "SQLite error: {}", e),
            JournalError::Serialization(e) => write!(f, "Serialization error: {}", e),
            JournalError::Unavailable(e) => write!(f, "Journal unavailable: {}", e),
        }
    }
}

impl std::error::Error for JournalError {}

impl From<rusqlite::Error> for JournalError {
    fn from(err: rusqlite::Error) -> Self {
        JournalError::Sqlite(err)
    }
}

impl From<serde_json::Error> for JournalError {
    fn from(err: serde_json::Error) -> Self {
        JournalError::Serialization(err.to_string())
    }
}

pub type JournalResult<T> = Result<T, JournalError>;

/// An event as persisted, with its position in the journal.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub sequence: u64,
    pub aggregate_id: String,
    pub event_type: String,
    pub recorded_at: i64,
    pub event: LedgerEvent,
}

/// Write side and replay side of the journal.
///
/// `save` must only return `Ok` once the event is durably recorded; callers
/// treat an error as "the transition did not happen".
pub trait EventJournal: Send + Sync {
    /// Appends `event` to the stream of `aggregate_id`, returning its sequence.
    fn save(&self, aggregate_id: &str, event: &LedgerEvent) -> JournalResult<u64>;

    /// All events of one aggregate, in append order.
    fn load(&self, aggregate_id: &str) -> JournalResult<Vec<StoredEvent>>;
}

/// Process-local journal, mostly for tests and single-node runs.
#[derive(Default)]
pub struct MemoryJournal {
    events: RwLock<Vec<StoredEvent>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

impl EventJournal for MemoryJournal {
    fn save(&self, aggregate_id: &str, event: &LedgerEvent) -> JournalResult<u64> {
        let mut events = self.events.write();
        let sequence = events.len() as u64 + 1;
        events.push(StoredEvent {
            sequence,
            aggregate_id: aggregate_id.to_string(),
            event_type: event.event_type().to_string(),
            recorded_at: Utc::now().timestamp_millis(),
            event: event.clone(),
        });
        Ok(sequence)
    }

    fn load(&self, aggregate_id: &str) -> JournalResult<Vec<StoredEvent>> {
        Ok(self
            .events
            .read()
            .iter()
            .filter(|e| e.aggregate_id == aggregate_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::{Block, BLOCK_QUEUED_AID};

    #[test]
    fn test_memory_journal_sequences() {
        let journal = MemoryJournal::new();
        assert!(journal.is_empty());

        let block = Block::new(1, "0000_genesis", vec![1], 0);
        let first = journal
            .save(BLOCK_QUEUED_AID, &LedgerEvent::block_queued(block))
            .unwrap();
        let second = journal
            .save("other", &LedgerEvent::BlockSyncCompleted { height: 1 })
            .unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(journal.len(), 2);
    }

    #[test]
    fn test_memory_journal_load_filters_by_aggregate() {
        let journal = MemoryJournal::new();
        journal
            .save("a", &LedgerEvent::BlockSyncStarted { target_height: 3 })
            .unwrap();
        journal
            .save("b", &LedgerEvent::BlockSyncStarted { target_height: 4 })
            .unwrap();
        journal
            .save("a", &LedgerEvent::BlockSyncCompleted { height: 3 })
            .unwrap();

        let events = journal.load("a").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "BlockSyncStarted");
        assert_eq!(events[1].event_type, "BlockSyncCompleted");
        assert!(journal.load("missing").unwrap().is_empty());
    }

    #[test]
    fn test_journal_error_display() {
        let error = JournalError::Unavailable("disk full".to_string());
        let error_str = format!("{}", error);
        assert!(error_str.contains("unavailable"));
        assert!(error_str.contains("disk full"));
    }
}
