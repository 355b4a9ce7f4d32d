use super::{EventJournal, JournalResult, StoredEvent};
use crate::blockchain::LedgerEvent;
use chrono::prelude::*;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::sync::Arc;
use tracing::{debug, info};

/// SQLite-backed journal. Each `save` is a single INSERT, so an event is
/// either fully recorded or not at all.
pub struct SqliteJournal {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJournal {
    /// Opens (or creates) the journal at `path` and ensures the schema.
    pub fn open(path: &str) -> JournalResult<Self> {
        let journal = SqliteJournal {
            conn: Arc::new(Mutex::new(Connection::open(path)?)),
        };
        journal.init()?;
        info!(path, "Journal: opened SQLite event journal");
        Ok(journal)
    }

    pub fn open_in_memory() -> JournalResult<Self> {
        let journal = SqliteJournal {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        };
        journal.init()?;
        Ok(journal)
    }

    fn init(&self) -> JournalResult<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS events (
                sequence      INTEGER PRIMARY KEY AUTOINCREMENT,
                aggregate_id  TEXT NOT NULL,
                event_type    TEXT NOT NULL,
                payload_json  TEXT NOT NULL,
                recorded_at   INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_aggregate_id ON events(aggregate_id)",
            [],
        )?;

        Ok(())
    }

    /// Total number of events across all aggregates.
    pub fn event_count(&self) -> JournalResult<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

impl EventJournal for SqliteJournal {
    fn save(&self, aggregate_id: &str, event: &LedgerEvent) -> JournalResult<u64> {
        let payload_json = serde_json::to_string(event)?;
        let conn = self.conn.lock();

        conn.execute(
            "INSERT INTO events (aggregate_id, event_type, payload_json, recorded_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                aggregate_id,
                event.event_type(),
                payload_json,
                Utc::now().timestamp_millis()
            ],
        )?;

        let sequence = conn.last_insert_rowid() as u64;
        debug!(aggregate_id, sequence, event_type = event.event_type(), "Journal: event saved");
        Ok(sequence)
    }

    fn load(&self, aggregate_id: &str) -> JournalResult<Vec<StoredEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT sequence, aggregate_id, event_type, payload_json, recorded_at
             FROM events WHERE aggregate_id = ? ORDER BY sequence ASC",
        )?;

        let rows = stmt.query_map([aggregate_id], |row| {
            let sequence: i64 = row.get(0)?;
            let aggregate_id: String = row.get(1)?;
            let event_type: String = row.get(2)?;
            let payload_json: String = row.get(3)?;
            let recorded_at: i64 = row.get(4)?;
            Ok((sequence, aggregate_id, event_type, payload_json, recorded_at))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (sequence, aggregate_id, event_type, payload_json, recorded_at) = row?;
            let event: LedgerEvent = serde_json::from_str(&payload_json)?;
            events.push(StoredEvent {
                sequence: sequence as u64,
                aggregate_id,
                event_type,
                recorded_at,
                event,
            });
        }
        Ok(events)
    }
}
