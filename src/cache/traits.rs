//! Core types for the response cache.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::Result;
use crate::net::{Request, Response};

/// Content class a cached response belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
  /// Application shell and static assets (cache-first)
  Static,
  /// Remote API reads (network-first)
  Api,
}

impl CacheTier {
  fn family(self) -> &'static str {
    match self {
      Self::Static => "static-assets",
      Self::Api => "api-responses",
    }
  }
}

/// Version-stamped cache names for one deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheGeneration {
  version: String,
}

impl CacheGeneration {
  pub fn new(version: impl Into<String>) -> Self {
    Self {
      version: version.into(),
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  /// e.g. "static-assets@v3"
  pub fn cache_name(&self, tier: CacheTier) -> String {
    format!("{}@{}", tier.family(), self.version)
  }

  /// Every cache name this generation owns.
  pub fn names(&self) -> [String; 2] {
    [
      self.cache_name(CacheTier::Static),
      self.cache_name(CacheTier::Api),
    ]
  }
}

/// Lookup key for a request: method plus URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
  method: String,
  url: String,
}

impl CacheKey {
  pub fn for_request(request: &Request) -> Self {
    let mut url = request.url.clone();
    url.set_fragment(None);
    Self {
      method: request.method.as_str().to_string(),
      url: url.to_string(),
    }
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  /// SHA256 hash for stable, fixed-length keys
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// A previously observed network result.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: Response,
  pub cached_at: DateTime<Utc>,
}

/// Named caches of responses, keyed by [`CacheKey`].
pub trait ResponseCache: Send + Sync {
  fn lookup(&self, cache_name: &str, key: &CacheKey) -> Result<Option<CachedResponse>>;

  /// Store (or overwrite) the entry, creating the cache if needed.
  fn store(&self, cache_name: &str, key: &CacheKey, response: &Response) -> Result<()>;

  /// Create an empty cache if it does not exist.
  fn open_cache(&self, cache_name: &str) -> Result<()>;

  fn cache_names(&self) -> Result<Vec<String>>;

  /// Delete a cache and all its entries. Returns whether it existed.
  fn delete_cache(&self, cache_name: &str) -> Result<bool>;

  /// Generation recorded by the last activation.
  fn active_generation(&self) -> Result<Option<String>>;

  fn set_active_generation(&self, version: &str) -> Result<()>;
}

/// Where a response handed to the application came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh from the network
  Network,
  /// Served from cache without trying the network
  Cache,
  /// Network failed; cached copy served (may be stale)
  CacheFallback,
  /// Mutation saved locally and queued for replay
  Queued,
  /// Network failed and nothing usable was cached
  Offline,
  /// Not intercepted
  Passthrough,
}

impl fmt::Display for ResponseSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let label = match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::CacheFallback => "cache (offline fallback)",
      Self::Queued => "queued for sync",
      Self::Offline => "offline",
      Self::Passthrough => "passthrough",
    };
    f.write_str(label)
  }
}

/// A response together with its source.
#[derive(Debug, Clone)]
pub struct Fetched {
  pub response: Response,
  pub source: ResponseSource,
}

impl Fetched {
  pub fn new(response: Response, source: ResponseSource) -> Self {
    Self { response, source }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::Method;
  use url::Url;

  #[test]
  fn test_generation_names() {
    let generation = CacheGeneration::new("v7");
    assert_eq!(generation.cache_name(CacheTier::Static), "static-assets@v7");
    assert_eq!(generation.cache_name(CacheTier::Api), "api-responses@v7");
  }

  #[test]
  fn test_key_ignores_fragment_but_not_method() {
    let url = Url::parse("https://ops.example.org/api/patients#top").unwrap();
    let get = CacheKey::for_request(&Request::get(url.clone()));
    let head = CacheKey::for_request(&Request::new(Method::Head, url));

    assert_eq!(get.url(), "https://ops.example.org/api/patients");
    assert_eq!(get.to_string(), "GET https://ops.example.org/api/patients");
    assert_ne!(get.cache_hash(), head.cache_hash());
    assert_eq!(get.cache_hash().len(), 64);
  }
}
