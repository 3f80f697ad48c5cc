//! Core traits for the durable keyed store.

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Result, SyncError};

/// A record that can live in a [`KeyedStore`].
pub trait Storable: Serialize + DeserializeOwned + Send + Sync {
  /// Primary key within its store.
  fn key(&self) -> String;

  /// Secondary index entries as (index name, value) pairs.
  fn index_values(&self) -> Vec<(&'static str, String)> {
    Vec::new()
  }
}

/// Transactional key/value store partitioned into named stores (one per
/// entity type).
///
/// Every call is its own transaction: a `put` writes the record and its index
/// rows together or not at all. Records come back in key order.
pub trait KeyedStore: Send + Sync {
  fn get<T: Storable>(&self, store: &str, id: &str) -> Result<Option<T>>;

  fn put<T: Storable>(&self, store: &str, record: &T) -> Result<()>;

  /// Returns whether a record was removed.
  fn delete(&self, store: &str, id: &str) -> Result<bool>;

  /// Atomically remove `old_id` and write `record` under its own key.
  fn rekey<T: Storable>(&self, store: &str, old_id: &str, record: &T) -> Result<()>;

  fn query_by_index<T: Storable>(&self, store: &str, index: &str, value: &str) -> Result<Vec<T>>;

  fn list<T: Storable>(&self, store: &str) -> Result<Vec<T>>;

  /// Names of the stores that currently hold at least one record.
  fn stores(&self) -> Result<Vec<String>>;
}

/// Internal stores are prefixed so they never collide with entity types.
pub fn is_internal_store(name: &str) -> bool {
  name.starts_with('_')
}

pub(crate) fn encode<T: Serialize>(store: &str, record: &T) -> Result<Vec<u8>> {
  serde_json::to_vec(record).map_err(|e| {
    SyncError::StorageUnavailable(format!("Failed to serialize record for {}: {}", store, e))
  })
}

pub(crate) fn decode<T: DeserializeOwned>(store: &str, data: &[u8]) -> Result<T> {
  serde_json::from_slice(data).map_err(|e| {
    SyncError::StorageUnavailable(format!("Corrupt record in {}: {}", store, e))
  })
}
