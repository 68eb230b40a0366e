// 🗄️ SQLite Journal - durable, ordered copy of the ledger + audit trail
//
// ledger_entries: one row per record, `seq` = insertion order (activity tie-break)
// events:         audit trail, one row per committed mutation
//
// Only records are persisted. Balances and totals are always recomputed.

use crate::error::LedgerResult;
use crate::records::LedgerEntry;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

/// Audit trail event ("every change is an event")
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

pub fn setup_database(conn: &Connection) -> LedgerResult<()> {
    // WAL for crash recovery; in-memory databases silently keep "memory"
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS ledger_entries (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            entry_id TEXT UNIQUE NOT NULL,
            kind TEXT NOT NULL,
            date TEXT NOT NULL,
            amount_kg REAL NOT NULL,
            payload TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_entries_kind ON ledger_entries(kind)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp)",
        [],
    )?;

    Ok(())
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> LedgerResult<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> LedgerResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> LedgerResult<Self> {
        setup_database(&conn)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write entries and their audit events in one SQLite transaction.
    /// Nothing is visible unless every row lands.
    pub fn append(&self, entries: &[LedgerEntry], events: &[Event]) -> LedgerResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        for entry in entries {
            let payload = serde_json::to_string(entry)?;
            tx.execute(
                "INSERT INTO ledger_entries (entry_id, kind, date, amount_kg, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    entry.id(),
                    entry.kind(),
                    entry.date().to_rfc3339(),
                    entry.amount_kg(),
                    payload,
                ],
            )?;
        }

        for event in events {
            insert_event(&tx, event)?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Every entry in insertion order
    pub fn load_entries(&self) -> LedgerResult<Vec<LedgerEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT payload FROM ledger_entries ORDER BY seq ASC")?;

        let payloads = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut entries = Vec::with_capacity(payloads.len());
        for payload in payloads {
            entries.push(serde_json::from_str(&payload)?);
        }

        Ok(entries)
    }

    pub fn entry_count(&self) -> LedgerResult<i64> {
        let conn = self.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM ledger_entries", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn events_for_entity(&self, entity_type: &str, entity_id: &str) -> LedgerResult<Vec<Event>> {
        let conn = self.lock();
        get_events_for_entity(&conn, entity_type, entity_id)
    }
}

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> LedgerResult<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific entity, newest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> LedgerResult<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC, id DESC",
    )?;

    let rows = stmt
        .query_map(params![entity_type, entity_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut events = Vec::with_capacity(rows.len());
    for (event_id, timestamp, event_type, entity_type, entity_id, data, actor) in rows {
        let timestamp = match DateTime::parse_from_rfc3339(&timestamp) {
            Ok(dt) => dt.with_timezone(&Utc),
            Err(err) => {
                tracing::warn!(%event_id, %timestamp, %err, "skipping event with unreadable timestamp");
                continue;
            }
        };

        events.push(Event {
            event_id,
            timestamp,
            event_type,
            entity_type,
            entity_id,
            data: serde_json::from_str(&data)?,
            actor,
        });
    }

    Ok(events)
}
