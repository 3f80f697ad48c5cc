//! Durable keyed store.
//!
//! A per-entity-type key/value store with secondary indexes. The SQLite
//! implementation survives restarts; the in-memory one backs tests.

#[cfg(test)]
mod memory;
mod sqlite;
mod traits;

#[cfg(test)]
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{is_internal_store, KeyedStore, Storable};
