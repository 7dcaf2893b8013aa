//! Storage traits and the cached response record.

use chrono::{DateTime, Utc};
use color_eyre::Result;

use crate::net::FetchResponse;

/// Whole-value key/value persistence. Writes always replace the full value.
pub trait KeyValueStore: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<String>>;

  fn set(&self, key: &str, value: &str) -> Result<()>;

  fn remove(&self, key: &str) -> Result<()>;
}

/// A response stored in a cache bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
  pub response: FetchResponse,
  /// When the response was written to the bucket
  pub cached_at: DateTime<Utc>,
}

impl CachedResponse {
  pub fn new(response: FetchResponse) -> Self {
    Self {
      response,
      cached_at: Utc::now(),
    }
  }

  /// Time since the response was stored. Never negative.
  pub fn age(&self) -> chrono::Duration {
    (Utc::now() - self.cached_at).max(chrono::Duration::zero())
  }
}

/// Named buckets of cached responses keyed by request URL.
pub trait CacheStore: Send + Sync {
  fn get_entry(&self, bucket: &str, url: &str) -> Result<Option<CachedResponse>>;

  /// Insert or replace; concurrent writers to the same key are last-write-wins.
  fn put_entry(&self, bucket: &str, url: &str, entry: &CachedResponse) -> Result<()>;

  fn delete_entry(&self, bucket: &str, url: &str) -> Result<bool>;

  /// URLs and store times of every entry in a bucket.
  fn list_entries(&self, bucket: &str) -> Result<Vec<(String, DateTime<Utc>)>>;

  /// Names of every bucket holding at least one entry.
  fn bucket_names(&self) -> Result<Vec<String>>;

  /// Drop a whole bucket, returning how many entries it held.
  fn delete_bucket(&self, bucket: &str) -> Result<usize>;
}
