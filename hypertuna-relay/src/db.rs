//! Sqlite persistence for group metadata and message history.
//!
//! Persistence failures never break the relay: callers go through
//! [`Db::with`]-style helpers that log and continue.

use rusqlite::{params, Connection, OptionalExtension};

use hypertuna_sdk::event::Event;

use crate::group::GroupMetadata;

pub struct Db {
    conn: Connection,
}

impl Db {
    pub fn open(path: &str) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_memory() -> rusqlite::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> rusqlite::Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS groups (
                group_id   TEXT PRIMARY KEY,
                metadata   TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS messages (
                event_id   TEXT PRIMARY KEY,
                group_id   TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                event      TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_group
                ON messages (group_id, created_at, event_id);",
        )?;
        Ok(Self { conn })
    }

    pub fn upsert_group(&self, group_id: &str, metadata: &GroupMetadata) -> rusqlite::Result<()> {
        let json = serde_json::to_string(metadata).expect("metadata serializes");
        self.conn.execute(
            "INSERT INTO groups (group_id, metadata, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(group_id) DO UPDATE SET metadata = ?2, updated_at = ?3",
            params![group_id, json, metadata.created_at as i64],
        )?;
        Ok(())
    }

    pub fn load_groups(&self) -> rusqlite::Result<Vec<(String, GroupMetadata)>> {
        let mut stmt = self.conn.prepare("SELECT group_id, metadata FROM groups")?;
        let rows = stmt.query_map([], |row| {
            let group_id: String = row.get(0)?;
            let json: String = row.get(1)?;
            Ok((group_id, json))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (group_id, json) = row?;
            match serde_json::from_str(&json) {
                Ok(metadata) => out.push((group_id, metadata)),
                Err(e) => tracing::warn!(group = %group_id, "unreadable stored metadata: {e}"),
            }
        }
        Ok(out)
    }

    pub fn delete_group(&self, group_id: &str) -> rusqlite::Result<()> {
        self.conn
            .execute("DELETE FROM messages WHERE group_id = ?1", params![group_id])?;
        self.conn
            .execute("DELETE FROM groups WHERE group_id = ?1", params![group_id])?;
        Ok(())
    }

    pub fn insert_message(&self, group_id: &str, event: &Event) -> rusqlite::Result<()> {
        let json = serde_json::to_string(event).expect("event serializes");
        self.conn.execute(
            "INSERT OR IGNORE INTO messages (event_id, group_id, created_at, event)
             VALUES (?1, ?2, ?3, ?4)",
            params![event.id, group_id, event.created_at as i64, json],
        )?;
        Ok(())
    }

    /// The newest `limit` messages of a group, returned in ascending
    /// `(created_at, id)` order.
    pub fn load_messages(&self, group_id: &str, limit: usize) -> rusqlite::Result<Vec<Event>> {
        let mut stmt = self.conn.prepare(
            "SELECT event FROM (
                 SELECT event, created_at, event_id FROM messages
                 WHERE group_id = ?1
                 ORDER BY created_at DESC, event_id DESC LIMIT ?2
             ) ORDER BY created_at ASC, event_id ASC",
        )?;
        let rows = stmt.query_map(params![group_id, limit as i64], |row| {
            row.get::<_, String>(0)
        })?;
        let mut out = Vec::new();
        for row in rows {
            let json = row?;
            match serde_json::from_str(&json) {
                Ok(event) => out.push(event),
                Err(e) => tracing::warn!(group = %group_id, "unreadable stored event: {e}"),
            }
        }
        Ok(out)
    }

    pub fn message_count(&self, group_id: &str) -> rusqlite::Result<u64> {
        let count: Option<i64> = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE group_id = ?1",
                params![group_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hypertuna_sdk::event::EventBuilder;
    use hypertuna_sdk::Keys;

    fn message(group: &str, text: &str, ts: u64) -> Event {
        EventBuilder::group_message(group, text)
            .unwrap()
            .sign_at(&Keys::generate(), ts)
            .unwrap()
    }

    #[test]
    fn group_metadata_roundtrip() {
        let db = Db::open_memory().unwrap();
        let metadata = GroupMetadata {
            name: "testers".into(),
            about: "a group".into(),
            is_public: true,
            is_open: false,
            file_sharing: true,
            swarm_id: Some("aa".repeat(32)),
            transport_url: Some("wss://host/npub/testers".into()),
            created_at: 42,
        };
        db.upsert_group("g1", &metadata).unwrap();
        let loaded = db.load_groups().unwrap();
        assert_eq!(loaded, vec![("g1".to_string(), metadata.clone())]);

        // Upsert replaces.
        let newer = GroupMetadata {
            created_at: 43,
            ..metadata
        };
        db.upsert_group("g1", &newer).unwrap();
        assert_eq!(db.load_groups().unwrap()[0].1.created_at, 43);
    }

    #[test]
    fn messages_ordered_and_deduplicated() {
        let db = Db::open_memory().unwrap();
        let m1 = message("g1", "first", 10);
        let m2 = message("g1", "second", 20);
        db.insert_message("g1", &m2).unwrap();
        db.insert_message("g1", &m1).unwrap();
        db.insert_message("g1", &m1).unwrap(); // duplicate id ignored

        let loaded = db.load_messages("g1", 100).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, m1.id);
        assert_eq!(loaded[1].id, m2.id);
        assert_eq!(db.message_count("g1").unwrap(), 2);
    }

    #[test]
    fn load_limit_keeps_newest() {
        let db = Db::open_memory().unwrap();
        for ts in 0..10 {
            db.insert_message("g1", &message("g1", &format!("m{ts}"), ts))
                .unwrap();
        }
        let loaded = db.load_messages("g1", 3).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[0].created_at, 7);
        assert_eq!(loaded[2].created_at, 9);
    }

    #[test]
    fn delete_group_drops_messages() {
        let db = Db::open_memory().unwrap();
        db.upsert_group("g1", &GroupMetadata::default()).unwrap();
        db.insert_message("g1", &message("g1", "x", 1)).unwrap();
        db.delete_group("g1").unwrap();
        assert!(db.load_groups().unwrap().is_empty());
        assert_eq!(db.message_count("g1").unwrap(), 0);
    }
}
