//! Persistence backends.
//!
//! Two concerns share one backend:
//! - a key/value store holding whole serialized values (the pending mutation
//!   list, offline results)
//! - named cache buckets of responses keyed by request URL

mod memory;
mod sqlite;
mod traits;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{CacheStore, CachedResponse, KeyValueStore};
