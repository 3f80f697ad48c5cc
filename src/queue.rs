//! Durable queue of writes that could not reach the network.
//!
//! Entries live in the keyed store under an internal store name. Their ids
//! are UUIDv7, so key order is enqueue order and listing the store yields
//! FIFO order. The id doubles as the `Idempotency-Key` sent on replay.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::error::{Result, SyncError};
use crate::net::{Method, Request};
use crate::store::{KeyedStore, Storable};
use crate::tracker::{DurableRecord, EntityRef};

pub const QUEUE_STORE: &str = "_write_queue";

const ENTITY_INDEX: &str = "entity";
const IDEMPOTENCY_HEADER: &str = "idempotency-key";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedWriteRequest {
  pub id: String,
  pub method: Method,
  pub target: String,
  pub headers: BTreeMap<String, String>,
  pub body: Option<String>,
  /// Epoch milliseconds
  pub enqueued_at: i64,
  pub entity: Option<EntityRef>,
}

impl Storable for QueuedWriteRequest {
  fn key(&self) -> String {
    self.id.clone()
  }

  fn index_values(&self) -> Vec<(&'static str, String)> {
    self
      .entity
      .iter()
      .map(|e| (ENTITY_INDEX, e.to_string()))
      .collect()
  }
}

impl QueuedWriteRequest {
  /// Capture a mutation for later replay.
  pub fn capture(request: &Request, entity: Option<EntityRef>) -> Self {
    let id = uuid::Uuid::now_v7().to_string();
    let mut headers = request.headers.clone();
    headers
      .entry(IDEMPOTENCY_HEADER.to_string())
      .or_insert_with(|| id.clone());

    Self {
      id,
      method: request.method,
      target: request.url.to_string(),
      headers,
      body: request
        .body
        .as_deref()
        .map(|b| String::from_utf8_lossy(b).into_owned()),
      enqueued_at: Utc::now().timestamp_millis(),
      entity,
    }
  }

  /// Write that pushes a pending record with no queued request of its own:
  /// POST to the collection for ids the server has never seen, PUT otherwise.
  pub fn upsert(api_base: &Url, entity: &EntityRef, record: &DurableRecord) -> Result<Self> {
    let mut url = api_base.clone();
    {
      let mut segments = url.path_segments_mut().map_err(|_| {
        SyncError::StorageUnavailable(format!("API base {} cannot carry a path", api_base))
      })?;
      segments.pop_if_empty().push(&entity.entity_type);
      if !entity.is_local() {
        segments.push(&entity.id);
      }
    }

    let method = if entity.is_local() {
      Method::Post
    } else {
      Method::Put
    };
    let id = format!("{}@{}", entity, record.last_modified);

    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), "application/json".to_string());
    headers.insert(IDEMPOTENCY_HEADER.to_string(), id.clone());

    Ok(Self {
      id,
      method,
      target: url.to_string(),
      headers,
      body: Some(record.payload.to_string()),
      enqueued_at: record.last_modified,
      entity: Some(entity.clone()),
    })
  }

  /// Key of the FIFO lane this entry belongs to.
  pub fn lane(&self) -> String {
    match &self.entity {
      Some(e) => e.to_string(),
      None => format!("request/{}", self.id),
    }
  }

  pub fn to_request(&self) -> Result<Request> {
    let url = Url::parse(&self.target).map_err(|e| {
      SyncError::StorageUnavailable(format!("Corrupt queued target {}: {}", self.target, e))
    })?;

    let mut request = Request::new(self.method, url);
    request.headers = self.headers.clone();
    request.body = self.body.as_ref().map(|b| b.clone().into_bytes());
    Ok(request)
  }

  /// Point the entry at a server-assigned id.
  pub fn retarget(&mut self, old_id: &str, new_id: &str) {
    if let Ok(mut url) = Url::parse(&self.target) {
      let segments: Option<Vec<String>> = url.path_segments().map(|s| {
        s.map(|seg| {
          if seg == old_id {
            new_id.to_string()
          } else {
            seg.to_string()
          }
        })
        .collect()
      });
      if let Some(segments) = segments {
        if let Ok(mut path) = url.path_segments_mut() {
          path.clear().extend(segments.iter());
        }
        self.target = url.to_string();
      }
    }

    if let Some(entity) = &mut self.entity {
      if entity.id == old_id {
        entity.id = new_id.to_string();
      }
    }
  }
}

pub struct WriteQueue<S: KeyedStore> {
  store: Arc<S>,
}

impl<S: KeyedStore> Clone for WriteQueue<S> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
    }
  }
}

impl<S: KeyedStore> WriteQueue<S> {
  pub fn new(store: Arc<S>) -> Self {
    Self { store }
  }

  pub fn enqueue(&self, request: &Request, entity: Option<EntityRef>) -> Result<QueuedWriteRequest> {
    let entry = QueuedWriteRequest::capture(request, entity);
    self.store.put(QUEUE_STORE, &entry)?;

    debug!(id = %entry.id, method = %entry.method, target = %entry.target, "Write queued");
    Ok(entry)
  }

  /// All entries, oldest first.
  pub fn list(&self) -> Result<Vec<QueuedWriteRequest>> {
    self.store.list(QUEUE_STORE)
  }

  pub fn for_entity(&self, entity: &EntityRef) -> Result<Vec<QueuedWriteRequest>> {
    self
      .store
      .query_by_index(QUEUE_STORE, ENTITY_INDEX, &entity.to_string())
  }

  pub fn contains(&self, id: &str) -> Result<bool> {
    Ok(self.store.get::<QueuedWriteRequest>(QUEUE_STORE, id)?.is_some())
  }

  pub fn remove(&self, id: &str) -> Result<bool> {
    self.store.delete(QUEUE_STORE, id)
  }

  /// Rewrite every entry of `entity` to target `new_id`.
  pub fn retarget_entity(&self, entity: &EntityRef, new_id: &str) -> Result<usize> {
    let entries = self.for_entity(entity)?;
    for mut entry in entries.iter().cloned() {
      entry.retarget(&entity.id, new_id);
      self.store.put(QUEUE_STORE, &entry)?;
    }
    Ok(entries.len())
  }

  pub fn len(&self) -> Result<usize> {
    Ok(self.list()?.len())
  }
}
