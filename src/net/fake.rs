//! In-process stand-in for the dashboard API, used by tests.
//!
//! Entities live under `/api/<type>[/<id>]` and carry a `version` field. A
//! write whose body names a `version` other than the current one is answered
//! with 409. Writes are deduplicated by `Idempotency-Key`. Any other path is
//! served from the registered static assets.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{Method, Request, Response, Transport};
use crate::error::{Result, SyncError};

#[derive(Default)]
struct FakeState {
  assets: HashMap<String, Vec<u8>>,
  entities: BTreeMap<(String, String), Value>,
  next_id: u64,
  replies: HashMap<String, Response>,
  forced_status: Option<u16>,
  latency: Option<Duration>,
}

#[derive(Default)]
pub struct FakeRemote {
  state: Mutex<FakeState>,
  offline: AtomicBool,
  calls: AtomicUsize,
  applied: AtomicUsize,
}

impl FakeRemote {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set_online(&self, online: bool) {
    self.offline.store(!online, Ordering::SeqCst);
  }

  pub fn add_asset(&self, path: &str, body: &str) {
    let mut state = self.state.lock().unwrap();
    state
      .assets
      .insert(path.to_string(), body.as_bytes().to_vec());
  }

  /// Insert an entity as if another client had created it.
  pub fn seed(&self, entity_type: &str, entity: Value) {
    let id = id_of(&entity).expect("seeded entity needs an id");
    let mut state = self.state.lock().unwrap();
    state
      .entities
      .insert((entity_type.to_string(), id), entity);
  }

  pub fn entity(&self, entity_type: &str, id: &str) -> Option<Value> {
    let state = self.state.lock().unwrap();
    state
      .entities
      .get(&(entity_type.to_string(), id.to_string()))
      .cloned()
  }

  pub fn entity_count(&self, entity_type: &str) -> usize {
    let state = self.state.lock().unwrap();
    state
      .entities
      .keys()
      .filter(|(t, _)| t == entity_type)
      .count()
  }

  pub fn force_status(&self, status: Option<u16>) {
    self.state.lock().unwrap().forced_status = status;
  }

  pub fn set_latency(&self, latency: Duration) {
    self.state.lock().unwrap().latency = Some(latency);
  }

  /// Requests received, including ones that failed while offline.
  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  /// Writes that actually changed server state.
  pub fn applied(&self) -> usize {
    self.applied.load(Ordering::SeqCst)
  }

  fn handle_api(&self, state: &mut FakeState, request: &Request, rest: &str) -> Response {
    let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
    let key = request.header("idempotency-key").map(String::from);

    if let Some(reply) = key.as_ref().and_then(|k| state.replies.get(k)) {
      return reply.clone();
    }

    let response = match (request.method, segments.as_slice()) {
      (Method::Get, [entity_type]) => {
        let items: Vec<Value> = state
          .entities
          .iter()
          .filter(|((t, _), _)| t == entity_type)
          .map(|(_, v)| v.clone())
          .collect();
        return Response::json(200, &Value::Array(items));
      }
      (Method::Get, [entity_type, id]) => {
        return match state.entities.get(&(entity_type.to_string(), id.to_string())) {
          Some(v) => Response::json(200, v),
          None => Response::json(404, &json!({"error": "not found"})),
        };
      }
      (Method::Post, [entity_type]) => {
        state.next_id += 1;
        let id = format!("{}-{}", entity_type, state.next_id);
        let mut body = object_body(request);
        body.insert("id".into(), Value::String(id.clone()));
        body.insert("version".into(), json!(1));
        let canonical = Value::Object(body);
        state
          .entities
          .insert((entity_type.to_string(), id), canonical.clone());
        self.applied.fetch_add(1, Ordering::SeqCst);
        Response::json(201, &canonical)
      }
      (Method::Put | Method::Patch, [entity_type, id]) => {
        let entity_key = (entity_type.to_string(), id.to_string());
        let body = object_body(request);
        let current = state.entities.get(&entity_key).cloned();
        let current_version = current
          .as_ref()
          .and_then(|c| c["version"].as_u64())
          .unwrap_or(0);

        if let Some(base) = body.get("version").and_then(Value::as_u64) {
          if current.is_some() && base != current_version {
            return Response::json(
              409,
              &json!({"error": "version mismatch", "current": current}),
            );
          }
        }

        let mut next = match (request.method, current) {
          (Method::Patch, Some(Value::Object(existing))) => existing,
          _ => Map::new(),
        };
        next.extend(body);
        next.insert("id".into(), Value::String(id.to_string()));
        next.insert("version".into(), json!(current_version + 1));
        let canonical = Value::Object(next);
        state.entities.insert(entity_key, canonical.clone());
        self.applied.fetch_add(1, Ordering::SeqCst);
        Response::json(200, &canonical)
      }
      (Method::Delete, [entity_type, id]) => {
        match state
          .entities
          .remove(&(entity_type.to_string(), id.to_string()))
        {
          Some(_) => {
            self.applied.fetch_add(1, Ordering::SeqCst);
            Response::new(204, Vec::new())
          }
          None => Response::json(404, &json!({"error": "not found"})),
        }
      }
      _ => Response::json(404, &json!({"error": "no route"})),
    };

    if let Some(k) = key {
      state.replies.insert(k, response.clone());
    }
    response
  }
}

fn object_body(request: &Request) -> Map<String, Value> {
  match request.json_body() {
    Some(Value::Object(map)) => map,
    _ => Map::new(),
  }
}

fn id_of(entity: &Value) -> Option<String> {
  match &entity["id"] {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

#[async_trait]
impl Transport for FakeRemote {
  async fn send(&self, request: &Request) -> Result<Response> {
    self.calls.fetch_add(1, Ordering::SeqCst);

    let latency = self.state.lock().unwrap().latency;
    if let Some(latency) = latency {
      tokio::time::sleep(latency).await;
    }

    if self.offline.load(Ordering::SeqCst) {
      return Err(SyncError::NetworkUnreachable("fake remote offline".into()));
    }

    let mut state = self.state.lock().unwrap();
    if let Some(status) = state.forced_status {
      return Ok(Response::json(status, &json!({"error": "forced"})));
    }

    let path = request.url.path().to_string();
    if let Some(rest) = path.strip_prefix("/api/") {
      return Ok(self.handle_api(&mut state, request, rest));
    }

    Ok(match state.assets.get(&path) {
      Some(body) => Response::new(200, body.clone()).with_header("content-type", "text/html"),
      None => Response::new(404, b"not found".to_vec()),
    })
  }
}
