//! Snapshot persistence for the cache.
//!
//! The cache itself lives in memory. A `SnapshotStore` lets a process save
//! successful entries on shutdown and warm the cache with them on the next
//! start. Restored entries come back stale, so the first read serves them and
//! revalidates.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::debug;

use crate::error::PersistError;
use crate::key::QueryKey;

/// One saved entry.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedEntry {
  pub key: QueryKey,
  pub data: Value,
  pub updated_at: DateTime<Utc>,
}

/// Trait for snapshot storage backends.
pub trait SnapshotStore: Send + Sync {
  /// Every saved entry.
  fn load(&self) -> Result<Vec<PersistedEntry>, PersistError>;

  /// Replace the saved entries with `entries`.
  fn save(&self, entries: &[PersistedEntry]) -> Result<(), PersistError>;

  /// Drop every saved entry.
  fn clear(&self) -> Result<(), PersistError>;
}

/// Storage implementation that doesn't persist anything.
pub struct NoopSnapshotStore;

impl SnapshotStore for NoopSnapshotStore {
  fn load(&self) -> Result<Vec<PersistedEntry>, PersistError> {
    Ok(Vec::new())
  }

  fn save(&self, _entries: &[PersistedEntry]) -> Result<(), PersistError> {
    Ok(())
  }

  fn clear(&self) -> Result<(), PersistError> {
    Ok(())
  }
}

/// SQLite-backed snapshot storage.
pub struct SqliteSnapshotStore {
  conn: Mutex<Connection>,
}

impl SqliteSnapshotStore {
  /// Open the database at the default location.
  pub fn open() -> Result<Self, PersistError> {
    Self::open_at(&Self::default_path()?)
  }

  pub fn open_at(path: &Path) -> Result<Self, PersistError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|source| PersistError::Io {
        path: parent.display().to_string(),
        source,
      })?;
    }
    Self::with_connection(Connection::open(path)?)
  }

  pub fn open_in_memory() -> Result<Self, PersistError> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  /// `<data dir>/pondok/cache.db`
  pub fn default_path() -> Result<PathBuf, PersistError> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| PersistError::Io {
        path: "~/.local/share".to_string(),
        source: std::io::Error::new(
          std::io::ErrorKind::NotFound,
          "could not determine data directory",
        ),
      })?;
    Ok(data_dir.join("pondok").join("cache.db"))
  }

  fn with_connection(conn: Connection) -> Result<Self, PersistError> {
    conn.execute_batch(SNAPSHOT_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }
}

const SNAPSHOT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS query_snapshots (
    key_hash TEXT PRIMARY KEY,
    canonical_key TEXT NOT NULL,
    kind TEXT NOT NULL,
    data BLOB NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_query_snapshots_kind ON query_snapshots(kind);
"#;

impl SnapshotStore for SqliteSnapshotStore {
  fn load(&self) -> Result<Vec<PersistedEntry>, PersistError> {
    let conn = self.conn.lock();
    let mut stmt = conn.prepare(
      "SELECT canonical_key, data, updated_at FROM query_snapshots ORDER BY updated_at",
    )?;
    let rows = stmt.query_map([], |row| {
      Ok((
        row.get::<_, String>(0)?,
        row.get::<_, Vec<u8>>(1)?,
        row.get::<_, String>(2)?,
      ))
    })?;

    let mut entries = Vec::new();
    for row in rows {
      let (canonical, data, updated_at) = row?;
      let key = QueryKey::parse(&canonical)?;
      let data = serde_json::from_slice(&data)?;
      let updated_at = match DateTime::parse_from_rfc3339(&updated_at) {
        Ok(ts) => ts.with_timezone(&Utc),
        Err(err) => {
          debug!(key = %key, error = %err, "skipping snapshot with bad timestamp");
          continue;
        }
      };
      entries.push(PersistedEntry {
        key,
        data,
        updated_at,
      });
    }
    Ok(entries)
  }

  fn save(&self, entries: &[PersistedEntry]) -> Result<(), PersistError> {
    let mut conn = self.conn.lock();
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM query_snapshots", [])?;
    {
      let mut stmt = tx.prepare(
        "INSERT OR REPLACE INTO query_snapshots (key_hash, canonical_key, kind, data, updated_at)
         VALUES (?, ?, ?, ?, ?)",
      )?;
      for entry in entries {
        stmt.execute(params![
          entry.key.cache_hash(),
          entry.key.canonical(),
          entry.key.kind(),
          serde_json::to_vec(&entry.data)?,
          entry.updated_at.to_rfc3339(),
        ])?;
      }
    }
    tx.commit()?;
    debug!(count = entries.len(), "snapshots saved");
    Ok(())
  }

  fn clear(&self) -> Result<(), PersistError> {
    self.conn.lock().execute("DELETE FROM query_snapshots", [])?;
    Ok(())
  }
}
