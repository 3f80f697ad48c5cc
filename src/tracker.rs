//! Sync-state tracking for locally editable entities.
//!
//! Every write of a [`DurableRecord`] goes through [`SyncTracker`], which sets
//! the sync status: user edits become `pending`, records written from a
//! successful replay become `synced`, records the server refused become
//! `conflict`. The status is a secondary index so pending and conflicting
//! records can be listed without scanning payloads.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::store::{is_internal_store, KeyedStore, Storable};
use crate::sync::InFlight;

/// Ids generated on this side before the server has assigned one.
pub const LOCAL_ID_PREFIX: &str = "local-";

const STATUS_INDEX: &str = "syncStatus";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
  Synced,
  Pending,
  Conflict,
}

impl SyncStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Synced => "synced",
      Self::Pending => "pending",
      Self::Conflict => "conflict",
    }
  }
}

impl fmt::Display for SyncStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Identifies one entity: its type (store name) and id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
  pub entity_type: String,
  pub id: String,
}

impl EntityRef {
  pub fn new(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
    Self {
      entity_type: entity_type.into(),
      id: id.into(),
    }
  }

  /// A fresh client-side id for an entity the server has not seen.
  pub fn new_local(entity_type: impl Into<String>) -> Self {
    Self::new(
      entity_type,
      format!("{}{}", LOCAL_ID_PREFIX, uuid::Uuid::new_v4()),
    )
  }

  pub fn with_id(&self, id: impl Into<String>) -> Self {
    Self::new(self.entity_type.clone(), id)
  }

  pub fn is_local(&self) -> bool {
    self.id.starts_with(LOCAL_ID_PREFIX)
  }
}

impl fmt::Display for EntityRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.entity_type, self.id)
  }
}

/// One locally editable entity, as stored on disk:
/// `{id, payload, syncStatus, lastModified}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurableRecord {
  pub id: String,
  pub payload: Value,
  pub sync_status: SyncStatus,
  /// Epoch milliseconds of the last local mutation
  pub last_modified: i64,
}

impl Storable for DurableRecord {
  fn key(&self) -> String {
    self.id.clone()
  }

  fn index_values(&self) -> Vec<(&'static str, String)> {
    vec![(STATUS_INDEX, self.sync_status.as_str().to_string())]
  }
}

/// A record together with the entity type it is stored under.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedRecord {
  pub entity_type: String,
  pub record: DurableRecord,
}

impl TrackedRecord {
  pub fn entity(&self) -> EntityRef {
    EntityRef::new(self.entity_type.clone(), self.record.id.clone())
  }
}

/// Id carried in a JSON payload, if any.
pub fn payload_id(payload: &Value) -> Option<String> {
  match payload.get("id")? {
    Value::String(s) if !s.is_empty() => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

pub struct SyncTracker<S: KeyedStore> {
  store: Arc<S>,
  inflight: Arc<InFlight>,
}

impl<S: KeyedStore> Clone for SyncTracker<S> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      inflight: Arc::clone(&self.inflight),
    }
  }
}

impl<S: KeyedStore> SyncTracker<S> {
  pub fn new(store: Arc<S>, inflight: Arc<InFlight>) -> Self {
    Self { store, inflight }
  }

  pub fn get(&self, entity: &EntityRef) -> Result<Option<DurableRecord>> {
    self.store.get(&entity.entity_type, &entity.id)
  }

  pub fn list(&self, entity_type: &str) -> Result<Vec<DurableRecord>> {
    self.store.list(entity_type)
  }

  /// Record a user edit. The record becomes (or stays) `pending`.
  pub fn save_local(&self, entity: &EntityRef, payload: Value) -> Result<DurableRecord> {
    let previous = self.get(entity)?;
    let record = DurableRecord {
      id: entity.id.clone(),
      payload,
      sync_status: SyncStatus::Pending,
      last_modified: next_timestamp(previous.as_ref()),
    };
    self.store.put(&entity.entity_type, &record)?;

    debug!(entity = %entity, "Local edit saved");
    Ok(record)
  }

  /// Shallow-merge `patch` into the stored payload, as a PATCH would.
  pub fn merge_local(&self, entity: &EntityRef, patch: Value) -> Result<DurableRecord> {
    let payload = match (self.get(entity)?.map(|r| r.payload), patch) {
      (Some(Value::Object(mut base)), Value::Object(changes)) => {
        base.extend(changes);
        Value::Object(base)
      }
      (_, patch) => patch,
    };
    self.save_local(entity, payload)
  }

  /// Mark an existing record `pending` without touching its payload.
  pub fn touch_pending(&self, entity: &EntityRef) -> Result<bool> {
    let Some(mut record) = self.get(entity)? else {
      return Ok(false);
    };
    record.last_modified = next_timestamp(Some(&record));
    record.sync_status = SyncStatus::Pending;
    self.store.put(&entity.entity_type, &record)?;
    Ok(true)
  }

  /// Replace the local record with the server's canonical version and mark
  /// it `synced`, re-keying it when the server assigned a different id.
  ///
  /// Returns false without writing when the record is gone or was edited
  /// again after `expected_last_modified`.
  pub fn apply_remote(
    &self,
    entity: &EntityRef,
    canonical: Option<Value>,
    expected_last_modified: Option<i64>,
  ) -> Result<bool> {
    let Some(current) = self.get(entity)? else {
      return Ok(false);
    };
    if expected_last_modified.is_some_and(|lm| lm != current.last_modified) {
      debug!(entity = %entity, "Newer local edit; keeping record pending");
      return Ok(false);
    }

    let payload = canonical.unwrap_or(current.payload);
    let id = payload_id(&payload).unwrap_or_else(|| entity.id.clone());
    let record = DurableRecord {
      id,
      payload,
      sync_status: SyncStatus::Synced,
      last_modified: current.last_modified,
    };

    if record.id == entity.id {
      self.store.put(&entity.entity_type, &record)?;
    } else {
      debug!(entity = %entity, server_id = %record.id, "Record re-keyed to server id");
      self.store.rekey(&entity.entity_type, &entity.id, &record)?;
    }
    Ok(true)
  }

  /// Move a record to a server-assigned id, keeping payload and status.
  pub fn rekey(&self, entity: &EntityRef, new_id: &str) -> Result<bool> {
    let Some(mut record) = self.get(entity)? else {
      return Ok(false);
    };
    record.id = new_id.to_string();
    if let Value::Object(map) = &mut record.payload {
      if map.contains_key("id") {
        map.insert("id".into(), Value::String(new_id.to_string()));
      }
    }
    self.store.rekey(&entity.entity_type, &entity.id, &record)?;
    Ok(true)
  }

  pub fn mark_synced(&self, entity: &EntityRef) -> Result<bool> {
    self.set_status(entity, SyncStatus::Synced)
  }

  /// Flag the record for manual resolution. The payload is left as is.
  pub fn mark_conflict(&self, entity: &EntityRef) -> Result<bool> {
    self.set_status(entity, SyncStatus::Conflict)
  }

  pub fn remove(&self, entity: &EntityRef) -> Result<bool> {
    self.store.delete(&entity.entity_type, &entity.id)
  }

  /// Pending records, excluding any the coordinator is replaying right now.
  pub fn list_pending(&self) -> Result<Vec<TrackedRecord>> {
    let records = self.list_status(SyncStatus::Pending)?;
    Ok(
      records
        .into_iter()
        .filter(|r| !self.inflight.contains(&r.entity().to_string()))
        .collect(),
    )
  }

  pub fn list_conflicts(&self) -> Result<Vec<TrackedRecord>> {
    self.list_status(SyncStatus::Conflict)
  }

  fn list_status(&self, status: SyncStatus) -> Result<Vec<TrackedRecord>> {
    let mut out = Vec::new();
    for entity_type in self.store.stores()? {
      if is_internal_store(&entity_type) {
        continue;
      }
      let records: Vec<DurableRecord> =
        self
          .store
          .query_by_index(&entity_type, STATUS_INDEX, status.as_str())?;
      out.extend(records.into_iter().map(|record| TrackedRecord {
        entity_type: entity_type.clone(),
        record,
      }));
    }
    Ok(out)
  }

  fn set_status(&self, entity: &EntityRef, status: SyncStatus) -> Result<bool> {
    let Some(mut record) = self.get(entity)? else {
      return Ok(false);
    };
    if record.sync_status != status {
      record.sync_status = status;
      self.store.put(&entity.entity_type, &record)?;
    }
    Ok(true)
  }
}

/// Wall-clock millis, forced past the previous edit so every local mutation
/// gets a distinct timestamp.
fn next_timestamp(previous: Option<&DurableRecord>) -> i64 {
  let now = Utc::now().timestamp_millis();
  match previous {
    Some(p) if p.last_modified >= now => p.last_modified + 1,
    _ => now,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::MemoryStore;
  use serde_json::json;

  fn tracker() -> SyncTracker<MemoryStore> {
    SyncTracker::new(Arc::new(MemoryStore::new()), Arc::new(InFlight::default()))
  }

  #[test]
  fn test_record_disk_shape() {
    let record = DurableRecord {
      id: "wf-1".into(),
      payload: json!({"name": "triage"}),
      sync_status: SyncStatus::Pending,
      last_modified: 1_700_000_000_000,
    };
    assert_eq!(
      serde_json::to_value(&record).unwrap(),
      json!({
        "id": "wf-1",
        "payload": {"name": "triage"},
        "syncStatus": "pending",
        "lastModified": 1_700_000_000_000i64
      })
    );
  }

  #[test]
  fn test_local_edits_are_pending() {
    let tracker = tracker();
    let entity = EntityRef::new("workflows", "wf-1");

    let first = tracker.save_local(&entity, json!({"name": "a"})).unwrap();
    tracker.mark_synced(&entity).unwrap();
    let second = tracker.save_local(&entity, json!({"name": "b"})).unwrap();

    assert_eq!(second.sync_status, SyncStatus::Pending);
    assert!(second.last_modified > first.last_modified);

    let pending = tracker.list_pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].entity(), entity);
    assert_eq!(pending[0].record.payload, json!({"name": "b"}));
  }

  #[test]
  fn test_conflict_keeps_payload() {
    let tracker = tracker();
    let entity = EntityRef::new("workflows", "wf-1");
    tracker.save_local(&entity, json!({"name": "mine"})).unwrap();

    assert!(tracker.mark_conflict(&entity).unwrap());

    let conflicts = tracker.list_conflicts().unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].record.payload, json!({"name": "mine"}));
    assert!(tracker.list_pending().unwrap().is_empty());
    assert!(!tracker.mark_conflict(&EntityRef::new("workflows", "nope")).unwrap());
  }

  #[test]
  fn test_apply_remote_rekeys_to_server_id() {
    let tracker = tracker();
    let local = EntityRef::new_local("workflows");
    let record = tracker.save_local(&local, json!({"name": "intake"})).unwrap();

    let applied = tracker
      .apply_remote(
        &local,
        Some(json!({"id": "workflows-7", "name": "intake", "version": 1})),
        Some(record.last_modified),
      )
      .unwrap();
    assert!(applied);

    assert!(tracker.get(&local).unwrap().is_none());
    let synced = tracker
      .get(&EntityRef::new("workflows", "workflows-7"))
      .unwrap()
      .unwrap();
    assert_eq!(synced.sync_status, SyncStatus::Synced);
    assert_eq!(synced.payload["version"], 1);
  }

  #[test]
  fn test_apply_remote_skips_superseded_edit() {
    let tracker = tracker();
    let entity = EntityRef::new("workflows", "wf-1");
    let sent = tracker.save_local(&entity, json!({"step": 1})).unwrap();
    tracker.save_local(&entity, json!({"step": 2})).unwrap();

    let applied = tracker
      .apply_remote(&entity, Some(json!({"id": "wf-1", "step": 1})), Some(sent.last_modified))
      .unwrap();

    assert!(!applied);
    let record = tracker.get(&entity).unwrap().unwrap();
    assert_eq!(record.payload, json!({"step": 2}));
    assert_eq!(record.sync_status, SyncStatus::Pending);
  }

  #[test]
  fn test_merge_local_is_shallow() {
    let tracker = tracker();
    let entity = EntityRef::new("patients", "p-3");
    tracker
      .save_local(&entity, json!({"name": "R. Osei", "ward": "2A"}))
      .unwrap();

    let merged = tracker.merge_local(&entity, json!({"ward": "ICU"})).unwrap();
    assert_eq!(merged.payload, json!({"name": "R. Osei", "ward": "ICU"}));
  }

  #[test]
  fn test_in_flight_records_hidden_from_pending() {
    let inflight = Arc::new(InFlight::default());
    let tracker = SyncTracker::new(Arc::new(MemoryStore::new()), Arc::clone(&inflight));
    let entity = EntityRef::new("workflows", "wf-1");
    tracker.save_local(&entity, json!({})).unwrap();

    let claim = inflight.try_claim(&entity.to_string()).unwrap();
    assert!(tracker.list_pending().unwrap().is_empty());

    drop(claim);
    assert_eq!(tracker.list_pending().unwrap().len(), 1);
  }

  #[test]
  fn test_storage_failure_is_surfaced() {
    let store = Arc::new(MemoryStore::new());
    let tracker = SyncTracker::new(Arc::clone(&store), Arc::new(InFlight::default()));
    store.set_unavailable(true);

    let err = tracker
      .save_local(&EntityRef::new("workflows", "wf-1"), json!({}))
      .unwrap_err();
    assert!(matches!(err, crate::error::SyncError::StorageUnavailable(_)));
  }
}
