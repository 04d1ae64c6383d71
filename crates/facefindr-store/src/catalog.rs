//! SQLite photo catalog: events and the photos uploaded for them.

use crate::StoreError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Bucket holding this event's photos.
    pub fn bucket(&self) -> String {
        event_bucket(self.id)
    }
}

pub fn event_bucket(event_id: i64) -> String {
    format!("event-{event_id}")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Photo {
    pub id: i64,
    pub event_id: i64,
    pub object_key: String,
    pub is_processed: bool,
    pub created_at: DateTime<Utc>,
}

/// Where a photo's bytes live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoLocation {
    pub event_id: i64,
    pub bucket: String,
    pub object_key: String,
}

fn apply_pragmas(conn: &Connection) -> Result<(), StoreError> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(())
}

fn apply_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS events (
  id INTEGER PRIMARY KEY,
  name TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_name ON events(name);

CREATE TABLE IF NOT EXISTS photos (
  id INTEGER PRIMARY KEY,
  event_id INTEGER NOT NULL,
  object_key TEXT NOT NULL,
  is_processed INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL,
  FOREIGN KEY(event_id) REFERENCES events(id),
  UNIQUE(event_id, object_key)
);

CREATE INDEX IF NOT EXISTS idx_photos_event ON photos(event_id);
"#,
    )?;
    Ok(())
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        id: row.get("id")?,
        name: row.get("name")?,
        created_at: row.get("created_at")?,
    })
}

fn row_to_photo(row: &Row<'_>) -> rusqlite::Result<Photo> {
    Ok(Photo {
        id: row.get("id")?,
        event_id: row.get("event_id")?,
        object_key: row.get("object_key")?,
        is_processed: row.get("is_processed")?,
        created_at: row.get("created_at")?,
    })
}

/// Catalog handle. The connection is serialized behind a mutex so the
/// catalog can be shared with the engine thread.
pub struct PhotoCatalog {
    conn: Mutex<Connection>,
}

impl PhotoCatalog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        apply_pragmas(&conn)?;
        apply_schema(&conn)?;
        tracing::debug!(path = %path.display(), "opened photo catalog");
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        apply_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn create_event(&self, name: &str) -> Result<Event, StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::InvalidName(name.to_string()));
        }
        let created_at = Utc::now();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO events (name, created_at) VALUES (?1, ?2)",
            params![name, created_at],
        )?;
        let event = Event {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            created_at,
        };
        tracing::info!(event_id = event.id, name, "event created");
        Ok(event)
    }

    /// Newest first, optionally filtered by a name substring.
    pub fn list_events(&self, search: Option<&str>) -> Result<Vec<Event>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, created_at FROM events
             WHERE ?1 IS NULL OR instr(name, ?1) > 0
             ORDER BY created_at DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![search], row_to_event)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn event(&self, event_id: i64) -> Result<Event, StoreError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, created_at FROM events WHERE id = ?1",
            params![event_id],
            row_to_event,
        )
        .optional()?
        .ok_or(StoreError::EventNotFound(event_id))
    }

    pub fn add_photo(&self, event_id: i64, object_key: &str) -> Result<Photo, StoreError> {
        let created_at = Utc::now();
        let conn = self.conn.lock();
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM events WHERE id = ?1)",
            params![event_id],
            |r| r.get(0),
        )?;
        if !exists {
            return Err(StoreError::EventNotFound(event_id));
        }
        conn.execute(
            "INSERT INTO photos (event_id, object_key, is_processed, created_at) VALUES (?1, ?2, 0, ?3)",
            params![event_id, object_key, created_at],
        )?;
        let photo = Photo {
            id: conn.last_insert_rowid(),
            event_id,
            object_key: object_key.to_string(),
            is_processed: false,
            created_at,
        };
        tracing::debug!(photo_id = photo.id, event_id, object_key, "photo cataloged");
        Ok(photo)
    }

    /// Photos of one event in upload order.
    pub fn photos_for_event(&self, event_id: i64) -> Result<Vec<Photo>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, event_id, object_key, is_processed, created_at
             FROM photos WHERE event_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![event_id], row_to_photo)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn resolve(&self, photo_id: i64) -> Result<PhotoLocation, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT event_id, object_key FROM photos WHERE id = ?1",
                params![photo_id],
                |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?)),
            )
            .optional()?;
        let (event_id, object_key) = row.ok_or(StoreError::PhotoNotFound(photo_id))?;
        Ok(PhotoLocation {
            event_id,
            bucket: event_bucket(event_id),
            object_key,
        })
    }

    pub fn mark_processed(&self, photo_id: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE photos SET is_processed = 1 WHERE id = ?1",
            params![photo_id],
        )?;
        if n == 0 {
            return Err(StoreError::PhotoNotFound(photo_id));
        }
        Ok(())
    }
}
