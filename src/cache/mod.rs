//! Versioned response caches.
//!
//! Responses are kept in named caches, one per tier and deployment
//! (`static-assets@<version>`, `api-responses@<version>`), so a new
//! deployment can drop every cache it does not own in one pass.

mod storage;
mod traits;

pub use storage::SqliteResponseCache;
pub use traits::{
  CacheGeneration, CacheKey, CacheTier, CachedResponse, Fetched, ResponseCache, ResponseSource,
};
