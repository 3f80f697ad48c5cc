//! Routing and the two caching strategies.

use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use super::Worker;
use crate::cache::{CacheKey, CacheTier, Fetched, ResponseSource};
use crate::error::Result;
use crate::net::{Method, Request, RequestMode, Response};
use crate::store::KeyedStore;
use crate::tracker::{payload_id, EntityRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Not intercepted
  Passthrough,
  /// Remote API: fresh data preferred, cache as offline fallback
  NetworkFirst,
  /// Shell and static assets
  CacheFirst,
}

impl Route {
  pub fn for_request(request: &Request, api_prefix: &str) -> Self {
    if !request.is_network_bound() {
      Self::Passthrough
    } else if request.url.path().starts_with(api_prefix) {
      Self::NetworkFirst
    } else if request.method.is_read() {
      Self::CacheFirst
    } else {
      // Non-API writes (e.g. form posts) are never cached or queued.
      Self::Passthrough
    }
  }
}

/// 503 for a read that has neither network nor cache.
pub fn offline_read() -> Response {
  Response::json(
    503,
    &json!({
      "message": "You are offline and this data is not cached",
      "offline": true
    }),
  )
}

/// 202 for a write stored locally for later replay.
pub fn queued_write() -> Response {
  Response::json(
    202,
    &json!({
      "message": "Saved offline; it will be sent when the connection returns",
      "offline": true,
      "queued": true
    }),
  )
}

pub fn service_unavailable() -> Response {
  Response::new(503, b"Service Unavailable".to_vec()).with_header("content-type", "text/plain")
}

/// Entity a mutation under the API prefix acts on: `<prefix><type>[/<id>]`.
/// The id comes from the path, then the JSON body; a POST without either
/// gets a fresh local id. Deeper paths address a sub-resource
/// (`/patients/p-1/notes`) and map to no entity.
pub fn entity_for(request: &Request, api_prefix: &str) -> Option<EntityRef> {
  let rest = request.url.path().strip_prefix(api_prefix)?;
  let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();

  match segments.as_slice() {
    [entity_type, id] => Some(EntityRef::new(*entity_type, *id)),
    [entity_type] => match request.json_body().as_ref().and_then(payload_id) {
      Some(id) => Some(EntityRef::new(*entity_type, id)),
      None if request.method == Method::Post => Some(EntityRef::new_local(*entity_type)),
      None => None,
    },
    _ => None,
  }
}

impl<S: KeyedStore> Worker<S> {
  pub(super) async fn network_first(&self, request: Request) -> Result<Fetched> {
    let key = CacheKey::for_request(&request);
    let api_cache = self.generation.cache_name(CacheTier::Api);

    match self.send(&request).await {
      Ok(response) => {
        if request.method == Method::Get && response.is_success() {
          if let Err(e) = self.cache.store(&api_cache, &key, &response) {
            warn!(key = %key, error = %e, "Failed to cache API response");
          }
        }
        Ok(Fetched::new(response, ResponseSource::Network))
      }
      Err(e) if request.method.is_read() => {
        debug!(key = %key, error = %e, "Network failed; trying cache");
        match self.cache.lookup(&api_cache, &key)? {
          Some(hit) => {
            debug!(key = %key, cached_at = %hit.cached_at, "Serving stale API response");
            Ok(Fetched::new(hit.response, ResponseSource::CacheFallback))
          }
          None => Ok(Fetched::new(offline_read(), ResponseSource::Offline)),
        }
      }
      Err(e) => {
        info!(method = %request.method, url = %request.url, error = %e, "Queuing write for sync");
        self.queue_write(&request)?;
        Ok(Fetched::new(queued_write(), ResponseSource::Queued))
      }
    }
  }

  pub(super) async fn cache_first(&self, request: Request) -> Result<Fetched> {
    let key = CacheKey::for_request(&request);
    let static_cache = self.generation.cache_name(CacheTier::Static);

    if let Some(hit) = self.cache.lookup(&static_cache, &key)? {
      return Ok(Fetched::new(hit.response, ResponseSource::Cache));
    }

    match self.send(&request).await {
      Ok(response) => {
        if request.method == Method::Get && response.is_success() {
          if let Err(e) = self.cache.store(&static_cache, &key, &response) {
            warn!(key = %key, error = %e, "Failed to cache asset");
          }
        }
        Ok(Fetched::new(response, ResponseSource::Network))
      }
      Err(e) => {
        debug!(key = %key, error = %e, "Asset unavailable");
        if request.mode == RequestMode::Navigate {
          let shell = CacheKey::for_request(&Request::get(self.options.app_shell.clone()));
          if let Some(hit) = self.cache.lookup(&static_cache, &shell)? {
            return Ok(Fetched::new(hit.response, ResponseSource::CacheFallback));
          }
        }
        Ok(Fetched::new(service_unavailable(), ResponseSource::Offline))
      }
    }
  }

  /// Queue the write and apply its effect to the local record. If the
  /// local effect cannot be stored the queue entry is taken back out.
  fn queue_write(&self, request: &Request) -> Result<()> {
    let entity = entity_for(request, &self.options.api_prefix);
    let entry = self.queue.enqueue(request, entity.clone())?;

    if let Some(entity) = &entity {
      if let Err(e) = self.apply_local(request, entity) {
        warn!(entity = %entity, error = %e, "Local edit failed; dropping queued write");
        if let Err(undo) = self.queue.remove(&entry.id) {
          error!(request = %entry.id, error = %undo, "Queued write left without its local edit");
        }
        return Err(e);
      }
    }

    self.request_sync();
    Ok(())
  }

  fn apply_local(&self, request: &Request, entity: &EntityRef) -> Result<()> {
    let body = request.json_body().filter(Value::is_object);
    match (request.method, body) {
      (Method::Delete, _) => {
        self.tracker.touch_pending(entity)?;
      }
      (Method::Patch, Some(patch)) => {
        self.tracker.merge_local(entity, patch)?;
      }
      (Method::Post | Method::Put, Some(payload)) => {
        self.tracker.save_local(entity, payload)?;
      }
      _ => {}
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use url::Url;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn test_routing() {
    let api = Request::get(url("https://ops.example.org/api/patients"));
    let shell = Request::get(url("https://ops.example.org/app.js"));
    let blob = Request::get(url("data:text/plain,hi"));
    let form = Request::new(Method::Post, url("https://ops.example.org/login"));

    assert_eq!(Route::for_request(&api, "/api/"), Route::NetworkFirst);
    assert_eq!(Route::for_request(&shell, "/api/"), Route::CacheFirst);
    assert_eq!(Route::for_request(&blob, "/api/"), Route::Passthrough);
    assert_eq!(Route::for_request(&form, "/api/"), Route::Passthrough);
  }

  #[test]
  fn test_entity_from_path_then_body() {
    let put = Request::new(Method::Put, url("https://h/api/beds/b-12"));
    assert_eq!(entity_for(&put, "/api/"), Some(EntityRef::new("beds", "b-12")));

    let post = Request::new(Method::Post, url("https://h/api/beds")).with_json(&json!({"id": 7}));
    assert_eq!(entity_for(&post, "/api/"), Some(EntityRef::new("beds", "7")));

    let fresh = Request::new(Method::Post, url("https://h/api/beds")).with_json(&json!({}));
    assert!(entity_for(&fresh, "/api/").unwrap().is_local());

    let bulk = Request::new(Method::Delete, url("https://h/api/beds"));
    assert_eq!(entity_for(&bulk, "/api/"), None);

    let note = Request::new(Method::Post, url("https://h/api/patients/p-1/notes"))
      .with_json(&json!({"id": "n-3", "text": "BP stable"}));
    assert_eq!(entity_for(&note, "/api/"), None);
  }

  #[test]
  fn test_synthetic_bodies() {
    assert_eq!(
      queued_write().json_body().unwrap(),
      json!({
        "message": "Saved offline; it will be sent when the connection returns",
        "offline": true,
        "queued": true
      })
    );
    let offline = offline_read();
    assert_eq!(offline.status, 503);
    assert_eq!(offline.json_body().unwrap()["offline"], true);
  }
}
