use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::traits::{decode, encode, KeyedStore, Storable};
use crate::error::{Result, SyncError};

struct MemoryRecord {
  data: Vec<u8>,
  indexes: Vec<(&'static str, String)>,
}

type Stores = BTreeMap<String, BTreeMap<String, MemoryRecord>>;

/// Keyed store held entirely in memory.
///
/// Records are still serialized on write so that decode failures and
/// aliasing behave like the SQLite store. `set_unavailable(true)` makes every
/// call fail with `StorageUnavailable`; `fail_store` does the same for one
/// named store only.
#[derive(Default)]
pub struct MemoryStore {
  stores: Mutex<Stores>,
  unavailable: AtomicBool,
  failing: Mutex<BTreeSet<String>>,
}

impl MemoryStore {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set_unavailable(&self, unavailable: bool) {
    self.unavailable.store(unavailable, Ordering::SeqCst);
  }

  pub fn fail_store(&self, store: &str) {
    self
      .failing
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .insert(store.to_string());
  }

  fn lock_store(&self, store: &str) -> Result<MutexGuard<'_, Stores>> {
    let failing = self.failing.lock().unwrap_or_else(|e| e.into_inner());
    if failing.contains(store) {
      return Err(SyncError::StorageUnavailable(format!("store {} offline", store)));
    }
    drop(failing);
    self.lock()
  }

  fn lock(&self) -> Result<MutexGuard<'_, Stores>> {
    if self.unavailable.load(Ordering::SeqCst) {
      return Err(SyncError::StorageUnavailable("memory store offline".into()));
    }
    self
      .stores
      .lock()
      .map_err(|e| SyncError::StorageUnavailable(format!("Lock poisoned: {}", e)))
  }
}

impl KeyedStore for MemoryStore {
  fn get<T: Storable>(&self, store: &str, id: &str) -> Result<Option<T>> {
    let stores = self.lock_store(store)?;
    stores
      .get(store)
      .and_then(|records| records.get(id))
      .map(|r| decode(store, &r.data))
      .transpose()
  }

  fn put<T: Storable>(&self, store: &str, record: &T) -> Result<()> {
    let data = encode(store, record)?;
    let mut stores = self.lock_store(store)?;
    stores.entry(store.to_string()).or_default().insert(
      record.key(),
      MemoryRecord {
        data,
        indexes: record.index_values(),
      },
    );
    Ok(())
  }

  fn delete(&self, store: &str, id: &str) -> Result<bool> {
    let mut stores = self.lock_store(store)?;
    let removed = stores
      .get_mut(store)
      .map(|records| records.remove(id).is_some())
      .unwrap_or(false);
    stores.retain(|_, records| !records.is_empty());
    Ok(removed)
  }

  fn rekey<T: Storable>(&self, store: &str, old_id: &str, record: &T) -> Result<()> {
    let data = encode(store, record)?;
    let mut stores = self.lock_store(store)?;
    let records = stores.entry(store.to_string()).or_default();
    records.remove(old_id);
    records.insert(
      record.key(),
      MemoryRecord {
        data,
        indexes: record.index_values(),
      },
    );
    Ok(())
  }

  fn query_by_index<T: Storable>(&self, store: &str, index: &str, value: &str) -> Result<Vec<T>> {
    let stores = self.lock_store(store)?;
    let Some(records) = stores.get(store) else {
      return Ok(Vec::new());
    };

    records
      .values()
      .filter(|r| r.indexes.iter().any(|(name, v)| *name == index && v == value))
      .map(|r| decode(store, &r.data))
      .collect()
  }

  fn list<T: Storable>(&self, store: &str) -> Result<Vec<T>> {
    let stores = self.lock_store(store)?;
    match stores.get(store) {
      Some(records) => records.values().map(|r| decode(store, &r.data)).collect(),
      None => Ok(Vec::new()),
    }
  }

  fn stores(&self) -> Result<Vec<String>> {
    Ok(self.lock()?.keys().cloned().collect())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::{json, Value};

  #[derive(serde::Serialize, serde::Deserialize, Debug, PartialEq)]
  struct Note {
    id: String,
    body: Value,
  }

  impl Storable for Note {
    fn key(&self) -> String {
      self.id.clone()
    }

    fn index_values(&self) -> Vec<(&'static str, String)> {
      vec![("author", self.body["author"].as_str().unwrap_or("").to_string())]
    }
  }

  fn note(id: &str, author: &str) -> Note {
    Note {
      id: id.to_string(),
      body: json!({ "author": author }),
    }
  }

  #[test]
  fn test_put_query_delete() {
    let store = MemoryStore::new();
    store.put("notes", &note("n1", "amara")).unwrap();
    store.put("notes", &note("n2", "jo")).unwrap();

    let by_amara: Vec<Note> = store.query_by_index("notes", "author", "amara").unwrap();
    assert_eq!(by_amara, vec![note("n1", "amara")]);

    assert!(store.delete("notes", "n1").unwrap());
    assert_eq!(store.get::<Note>("notes", "n1").unwrap(), None);
    assert_eq!(store.stores().unwrap(), vec!["notes"]);

    store.delete("notes", "n2").unwrap();
    assert!(store.stores().unwrap().is_empty());
  }

  #[test]
  fn test_unavailable_fails_every_call() {
    let store = MemoryStore::new();
    store.put("notes", &note("n1", "amara")).unwrap();
    store.set_unavailable(true);

    assert!(matches!(
      store.get::<Note>("notes", "n1"),
      Err(SyncError::StorageUnavailable(_))
    ));
    assert!(matches!(
      store.put("notes", &note("n2", "jo")),
      Err(SyncError::StorageUnavailable(_))
    ));

    store.set_unavailable(false);
    assert!(store.get::<Note>("notes", "n1").unwrap().is_some());
  }

  #[test]
  fn test_failing_store_is_isolated() {
    let store = MemoryStore::new();
    store.fail_store("notes");

    assert!(matches!(
      store.put("notes", &note("n1", "amara")),
      Err(SyncError::StorageUnavailable(_))
    ));
    store.put("drafts", &note("d1", "jo")).unwrap();
    assert!(store.get::<Note>("drafts", "d1").unwrap().is_some());
  }
}
