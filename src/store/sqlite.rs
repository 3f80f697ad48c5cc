//! SQLite implementation of the keyed store.

use rusqlite::{params, OptionalExtension, Transaction};
use std::sync::Arc;

use super::traits::{decode, encode, KeyedStore, Storable};
use crate::db::Database;
use crate::error::Result;

pub struct SqliteStore {
  db: Arc<Database>,
}

impl SqliteStore {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

fn write_record(
  tx: &Transaction<'_>,
  store: &str,
  id: &str,
  data: &[u8],
  indexes: &[(&'static str, String)],
) -> Result<()> {
  tx.execute(
    "INSERT INTO records (store, id, data, written_at)
     VALUES (?, ?, ?, datetime('now'))
     ON CONFLICT(store, id) DO UPDATE SET data = excluded.data, written_at = excluded.written_at",
    params![store, id, data],
  )?;

  tx.execute(
    "DELETE FROM record_indexes WHERE store = ? AND id = ?",
    params![store, id],
  )?;

  for (name, value) in indexes {
    tx.execute(
      "INSERT OR REPLACE INTO record_indexes (store, index_name, value, id)
       VALUES (?, ?, ?, ?)",
      params![store, name, value, id],
    )?;
  }

  Ok(())
}

fn remove_record(tx: &Transaction<'_>, store: &str, id: &str) -> Result<bool> {
  tx.execute(
    "DELETE FROM record_indexes WHERE store = ? AND id = ?",
    params![store, id],
  )?;
  let removed = tx.execute(
    "DELETE FROM records WHERE store = ? AND id = ?",
    params![store, id],
  )?;
  Ok(removed > 0)
}

impl KeyedStore for SqliteStore {
  fn get<T: Storable>(&self, store: &str, id: &str) -> Result<Option<T>> {
    let data: Option<Vec<u8>> = self.db.with_conn(|conn| {
      Ok(
        conn
          .query_row(
            "SELECT data FROM records WHERE store = ? AND id = ?",
            params![store, id],
            |row| row.get(0),
          )
          .optional()?,
      )
    })?;

    data.map(|d| decode(store, &d)).transpose()
  }

  fn put<T: Storable>(&self, store: &str, record: &T) -> Result<()> {
    let id = record.key();
    let data = encode(store, record)?;
    let indexes = record.index_values();

    self.db.with_conn(|conn| {
      let tx = conn.transaction()?;
      write_record(&tx, store, &id, &data, &indexes)?;
      tx.commit()?;
      Ok(())
    })
  }

  fn delete(&self, store: &str, id: &str) -> Result<bool> {
    self.db.with_conn(|conn| {
      let tx = conn.transaction()?;
      let removed = remove_record(&tx, store, id)?;
      tx.commit()?;
      Ok(removed)
    })
  }

  fn rekey<T: Storable>(&self, store: &str, old_id: &str, record: &T) -> Result<()> {
    let id = record.key();
    let data = encode(store, record)?;
    let indexes = record.index_values();

    self.db.with_conn(|conn| {
      let tx = conn.transaction()?;
      remove_record(&tx, store, old_id)?;
      write_record(&tx, store, &id, &data, &indexes)?;
      tx.commit()?;
      Ok(())
    })
  }

  fn query_by_index<T: Storable>(&self, store: &str, index: &str, value: &str) -> Result<Vec<T>> {
    let rows: Vec<Vec<u8>> = self.db.with_conn(|conn| {
      let mut stmt = conn.prepare(
        "SELECT r.data FROM records r
         INNER JOIN record_indexes i ON i.store = r.store AND i.id = r.id
         WHERE i.store = ? AND i.index_name = ? AND i.value = ?
         ORDER BY r.id",
      )?;
      let rows = stmt
        .query_map(params![store, index, value], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<Vec<u8>>>>()?;
      Ok(rows)
    })?;

    rows.iter().map(|data| decode(store, data)).collect()
  }

  fn list<T: Storable>(&self, store: &str) -> Result<Vec<T>> {
    let rows: Vec<Vec<u8>> = self.db.with_conn(|conn| {
      let mut stmt = conn.prepare("SELECT data FROM records WHERE store = ? ORDER BY id")?;
      let rows = stmt
        .query_map(params![store], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<Vec<u8>>>>()?;
      Ok(rows)
    })?;

    rows.iter().map(|data| decode(store, data)).collect()
  }

  fn stores(&self) -> Result<Vec<String>> {
    self.db.with_conn(|conn| {
      let mut stmt = conn.prepare("SELECT DISTINCT store FROM records ORDER BY store")?;
      let names = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
      Ok(names)
    })
  }
}
