//! SQLite connection object shared by the durable store and the response cache.
//!
//! The connection is opened lazily on first access and the open is idempotent:
//! schema creation only runs when `PRAGMA user_version` is behind, inside an
//! IMMEDIATE transaction, so several processes opening the same file at once
//! end up on the same schema version.

pub mod schema;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};

/// How long a connection waits on another process's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
enum Location {
  File(PathBuf),
  Memory,
}

/// Database connection wrapper with an explicit open/close lifecycle.
pub struct Database {
  location: Location,
  conn: Mutex<Option<Connection>>,
}

impl Database {
  /// Describe a database file without touching the disk.
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      location: Location::File(path.into()),
      conn: Mutex::new(None),
    }
  }

  /// A private in-memory database. Closing it discards its contents.
  pub fn in_memory() -> Self {
    Self {
      location: Location::Memory,
      conn: Mutex::new(None),
    }
  }

  pub fn path(&self) -> Option<&Path> {
    match &self.location {
      Location::File(p) => Some(p),
      Location::Memory => None,
    }
  }

  /// Open the connection if it is not open yet.
  pub fn open(&self) -> Result<()> {
    let mut guard = self.lock()?;
    if guard.is_none() {
      *guard = Some(self.connect()?);
    }
    Ok(())
  }

  /// Close the connection. The next access reopens it.
  pub fn close(&self) -> Result<()> {
    let mut guard = self.lock()?;
    if let Some(conn) = guard.take() {
      conn.close().map_err(|(_, e)| SyncError::from(e))?;
      debug!("Store connection closed");
    }
    Ok(())
  }

  pub fn is_open(&self) -> bool {
    self.lock().map(|g| g.is_some()).unwrap_or(false)
  }

  /// Run `f` against the open connection, opening it first if needed.
  pub fn with_conn<R>(&self, f: impl FnOnce(&mut Connection) -> Result<R>) -> Result<R> {
    let mut guard = self.lock()?;
    if guard.is_none() {
      *guard = Some(self.connect()?);
    }
    let conn = guard
      .as_mut()
      .ok_or_else(|| SyncError::StorageUnavailable("store connection missing".into()))?;
    f(conn)
  }

  pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
    self.with_conn(|conn| {
      let value = conn
        .query_row("SELECT value FROM meta WHERE key = ?", params![key], |row| {
          row.get(0)
        })
        .optional()?;
      Ok(value)
    })
  }

  pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
    self.with_conn(|conn| {
      conn.execute(
        "INSERT INTO meta (key, value) VALUES (?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
      )?;
      Ok(())
    })
  }

  fn lock(&self) -> Result<MutexGuard<'_, Option<Connection>>> {
    self
      .conn
      .lock()
      .map_err(|e| SyncError::StorageUnavailable(format!("Lock poisoned: {}", e)))
  }

  fn connect(&self) -> Result<Connection> {
    let mut conn = match &self.location {
      Location::File(path) => {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
          std::fs::create_dir_all(parent).map_err(|e| {
            SyncError::StorageUnavailable(format!(
              "Failed to create store directory {}: {}",
              parent.display(),
              e
            ))
          })?;
        }

        let conn = Connection::open(path).map_err(|e| {
          SyncError::StorageUnavailable(format!(
            "Failed to open store at {}: {}",
            path.display(),
            e
          ))
        })?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn
      }
      Location::Memory => Connection::open_in_memory()?,
    };

    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    run_migrations(&mut conn)?;

    debug!(location = ?self.location, "Store connection opened");
    Ok(conn)
  }
}

/// Create the schema if the file is behind SCHEMA_VERSION.
fn run_migrations(conn: &mut Connection) -> Result<()> {
  let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

  let version: i32 = tx.query_row("PRAGMA user_version", [], |row| row.get(0))?;
  if version < schema::SCHEMA_VERSION {
    tx.execute_batch(schema::SCHEMA)?;
    tx.execute_batch(&format!("PRAGMA user_version = {}", schema::SCHEMA_VERSION))?;
    info!(from = version, to = schema::SCHEMA_VERSION, "Store schema created");
  } else if version > schema::SCHEMA_VERSION {
    warn!(
      found = version,
      expected = schema::SCHEMA_VERSION,
      "Store schema is newer than this build"
    );
  }

  tx.commit()?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  #[test]
  fn test_open_is_lazy_and_idempotent() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("store.db");
    let db = Database::new(&path);

    assert!(!db.is_open());
    assert!(!path.exists());

    db.open().unwrap();
    db.open().unwrap();
    assert!(db.is_open());
    assert!(path.exists());
  }

  #[test]
  fn test_first_access_opens() {
    let db = Database::in_memory();
    db.set_meta("k", "v").unwrap();
    assert!(db.is_open());
    assert_eq!(db.get_meta("k").unwrap(), Some("v".to_string()));
    assert_eq!(db.get_meta("missing").unwrap(), None);
  }

  #[test]
  fn test_reopen_keeps_file_contents() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.db");

    let db = Database::new(&path);
    db.set_meta("generation", "v2").unwrap();
    db.close().unwrap();
    assert!(!db.is_open());

    assert_eq!(db.get_meta("generation").unwrap(), Some("v2".to_string()));
  }

  #[test]
  fn test_two_handles_converge_on_schema() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.db");

    let a = Database::new(&path);
    let b = Database::new(&path);
    a.open().unwrap();
    b.open().unwrap();

    let version: i32 = b
      .with_conn(|conn| Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?))
      .unwrap();
    assert_eq!(version, schema::SCHEMA_VERSION);

    a.set_meta("k", "from-a").unwrap();
    assert_eq!(b.get_meta("k").unwrap(), Some("from-a".to_string()));
  }
}
