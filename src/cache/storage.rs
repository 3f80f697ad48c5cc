//! SQLite implementation of the response cache.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::traits::{CacheKey, CachedResponse, ResponseCache};
use crate::db::Database;
use crate::error::{Result, SyncError};
use crate::net::Response;

const ACTIVE_GENERATION_KEY: &str = "active_generation";

pub struct SqliteResponseCache {
  db: Arc<Database>,
}

impl SqliteResponseCache {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

impl ResponseCache for SqliteResponseCache {
  fn lookup(&self, cache_name: &str, key: &CacheKey) -> Result<Option<CachedResponse>> {
    let row: Option<(u16, String, Vec<u8>, String)> = self.db.with_conn(|conn| {
      Ok(
        conn
          .query_row(
            "SELECT status, headers, body, cached_at FROM cache_entries
             WHERE cache_name = ? AND request_key = ?",
            params![cache_name, key.cache_hash()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
          )
          .optional()?,
      )
    })?;

    let Some((status, headers, body, cached_at)) = row else {
      return Ok(None);
    };

    let headers: BTreeMap<String, String> = serde_json::from_str(&headers).map_err(|e| {
      SyncError::StorageUnavailable(format!("Corrupt cached headers for {}: {}", key, e))
    })?;

    Ok(Some(CachedResponse {
      response: Response {
        status,
        headers,
        body,
      },
      cached_at: parse_datetime(&cached_at)?,
    }))
  }

  fn store(&self, cache_name: &str, key: &CacheKey, response: &Response) -> Result<()> {
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| SyncError::StorageUnavailable(format!("Failed to serialize headers: {}", e)))?;

    self.db.with_conn(|conn| {
      let tx = conn.transaction()?;
      tx.execute(
        "INSERT OR IGNORE INTO caches (name) VALUES (?)",
        params![cache_name],
      )?;
      tx.execute(
        "INSERT INTO cache_entries (cache_name, request_key, method, url, status, headers, body, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))
         ON CONFLICT(cache_name, request_key) DO UPDATE SET
           status = excluded.status,
           headers = excluded.headers,
           body = excluded.body,
           cached_at = excluded.cached_at",
        params![
          cache_name,
          key.cache_hash(),
          key.method(),
          key.url(),
          response.status,
          headers,
          response.body
        ],
      )?;
      tx.commit()?;
      Ok(())
    })
  }

  fn open_cache(&self, cache_name: &str) -> Result<()> {
    self.db.with_conn(|conn| {
      conn.execute(
        "INSERT OR IGNORE INTO caches (name) VALUES (?)",
        params![cache_name],
      )?;
      Ok(())
    })
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    self.db.with_conn(|conn| {
      let mut stmt = conn.prepare("SELECT name FROM caches ORDER BY name")?;
      let names = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
      Ok(names)
    })
  }

  fn delete_cache(&self, cache_name: &str) -> Result<bool> {
    self.db.with_conn(|conn| {
      let tx = conn.transaction()?;
      tx.execute(
        "DELETE FROM cache_entries WHERE cache_name = ?",
        params![cache_name],
      )?;
      let removed = tx.execute("DELETE FROM caches WHERE name = ?", params![cache_name])?;
      tx.commit()?;
      Ok(removed > 0)
    })
  }

  fn active_generation(&self) -> Result<Option<String>> {
    self.db.get_meta(ACTIVE_GENERATION_KEY)
  }

  fn set_active_generation(&self, version: &str) -> Result<()> {
    self.db.set_meta(ACTIVE_GENERATION_KEY, version)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| SyncError::StorageUnavailable(format!("Failed to parse datetime '{}': {}", s, e)))
}
